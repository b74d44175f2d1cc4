// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Best-effort teardown of the whole group.
//!
//! Every step is attempted no matter how the previous ones went: signal every worker, close the
//!   log, remove the channels. Nothing in here returns early or panics.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tracing::{debug, error, info, warn};

use crate::fork::is_sentinel;
use crate::procs::Lifecycle;
use crate::supervisor::SupervisorState;

/// Delivers the termination request to a worker
pub trait Terminate {
    fn terminate(&self, pid: Pid) -> nix::Result<()>;
}

/// Sends `SIGTERM`
#[derive(Clone, Copy, Debug, Default)]
pub struct Kill;

impl Terminate for Kill {
    fn terminate(&self, pid: Pid) -> nix::Result<()> {
        kill(pid, Signal::SIGTERM)
    }
}

impl<T: Terminate + ?Sized> Terminate for &T {
    fn terminate(&self, pid: Pid) -> nix::Result<()> {
        (**self).terminate(pid)
    }
}

/// What a teardown pass actually did
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TeardownReport {
    /// every pid a termination signal was attempted for
    pub signalled: Vec<Pid>,
    /// signals that failed for a reason other than the worker being gone already
    pub signal_failures: usize,
    pub log_closed: bool,
    /// channels that were unlinked in this pass
    pub channels_removed: Vec<PathBuf>,
    /// step failures of any kind, all of them logged
    pub failures: usize,
}

/// Tears down everything `state` tracks, see the module docs.
///
/// A second pass over the same state sends no signals and removes nothing, it only logs that
///   everything is already gone.
pub fn teardown<T: Terminate + ?Sized>(
    state: &mut SupervisorState,
    terminator: &T,
) -> TeardownReport {
    let mut report = TeardownReport::default();

    for process in state.processes_mut() {
        let role = process.role();
        let pid = process.pid();

        match process.state() {
            Lifecycle::Terminated => {
                debug!(%role, %pid, "already terminated");
                continue;
            }
            Lifecycle::FailedToStart => continue,
            Lifecycle::Requested | Lifecycle::Running if is_sentinel(pid) => {
                process.terminated();
                continue;
            }
            Lifecycle::Requested | Lifecycle::Running => (),
        }

        report.signalled.push(pid);
        match terminator.terminate(pid) {
            Ok(()) => info!(%role, %pid, "sent SIGTERM"),
            Err(Errno::ESRCH) => info!(%role, %pid, "already gone"),
            Err(e) => {
                error!(%role, %pid, "could not signal worker: {}", e);
                report.signal_failures += 1;
                report.failures += 1;
            }
        }

        process.terminated();
    }

    match state.log().close() {
        Ok(true) => report.log_closed = true,
        Ok(false) => info!("log file already closed"),
        Err(e) => {
            error!("{}", e);
            report.failures += 1;
        }
    }

    for channel in state.channels().persistent().iter() {
        if !channel.is_provisioned() {
            debug!(role = %channel.role(), "channel was never provisioned");
            continue;
        }

        match channel.remove() {
            Ok(true) => report.channels_removed.push(channel.path().to_path_buf()),
            Ok(false) => (),
            Err(e) => {
                error!("{}", e);
                report.failures += 1;
            }
        }
    }

    report
}

/// A one-shot latch, only the first trigger gets to run the teardown
#[derive(Clone, Debug, Default)]
pub struct ShutdownLatch {
    triggered: Arc<AtomicBool>,
}

impl ShutdownLatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` exactly once, for the first caller
    pub fn trigger(&self) -> bool {
        self.triggered
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::Acquire)
    }
}

/// Runs the teardown at most once, however many paths ask for it
#[derive(Debug)]
pub struct ShutdownManager<T: Terminate> {
    latch: ShutdownLatch,
    terminator: T,
}

impl<T: Terminate> ShutdownManager<T> {
    pub fn new(terminator: T) -> Self {
        Self {
            latch: ShutdownLatch::new(),
            terminator,
        }
    }

    /// `true` once any path has asked for the teardown
    pub fn is_triggered(&self) -> bool {
        self.latch.is_triggered()
    }

    /// Tears down the group if nothing did so before, `reason` is only logged
    pub fn shutdown(&self, state: &mut SupervisorState, reason: &str) -> Option<TeardownReport> {
        if !self.latch.trigger() {
            warn!(%reason, "teardown already triggered");
            return None;
        }

        info!(%reason, "tearing down");
        let report = teardown(state, &self.terminator);
        info!(
            signalled = report.signalled.len(),
            channels_removed = report.channels_removed.len(),
            failures = report.failures,
            "teardown complete"
        );

        Some(report)
    }
}
