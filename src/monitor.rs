// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Notices when a worker dies, and when the supervisor itself is asked to stop.
//!
//! The signal handlers only record that a signal arrived (tokio's signal driver does this), all of
//!   the reaping happens on the supervisor task after the notification has been observed.

use std::fmt;

use futures::future::{self, FutureExt};
use futures::select;
use nix::errno::Errno;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use tokio::signal::unix::{signal, Signal, SignalKind};
use tracing::{debug, error, warn};

use crate::fork::is_sentinel;
use crate::procs::{Lifecycle, ManagedProcess, Role};
use crate::Error;

/// A tracked worker that has terminated and been reaped
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Exit {
    pub role: Role,
    pub pid: Pid,
    pub status: WaitStatus,
}

impl fmt::Display for Exit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (pid {}) {}", self.role, self.pid, describe(&self.status))
    }
}

/// Human readable form of a wait status
pub fn describe(status: &WaitStatus) -> String {
    match status {
        WaitStatus::Exited(_, code) => format!("exited with status {}", code),
        WaitStatus::Signaled(_, signal, true) => {
            format!("was killed by {} (core dumped)", signal.as_str())
        }
        WaitStatus::Signaled(_, signal, false) => format!("was killed by {}", signal.as_str()),
        other => format!("changed state: {:?}", other),
    }
}

/// Wakes up whenever any child of the supervisor changes state
pub struct ChildMonitor {
    sigchld: Signal,
}

impl ChildMonitor {
    /// Must be registered before the first worker is launched, so no exit goes unnoticed
    pub fn register() -> Result<Self, Error> {
        Ok(Self {
            sigchld: signal(SignalKind::child())?,
        })
    }

    /// Completes after the next `SIGCHLD`, or right away if one arrived since the last call
    pub async fn notified(&mut self) {
        if self.sigchld.recv().await.is_none() {
            // the signal driver is gone, nothing will ever be delivered again
            future::pending::<()>().await;
        }
    }
}

/// Reaps every running worker that has terminated, without blocking.
///
/// Only the tracked pids are waited on, never `-1`, so children that are not workers are left
///   alone. Reaped workers are marked terminated.
pub fn reap(processes: &mut [ManagedProcess]) -> Vec<Exit> {
    let mut exits = Vec::new();

    for process in processes
        .iter_mut()
        .filter(|p| p.state() == Lifecycle::Running)
    {
        let role = process.role();
        let pid = process.pid();

        match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => (),
            Ok(status @ WaitStatus::Exited(..)) | Ok(status @ WaitStatus::Signaled(..)) => {
                process.terminated();

                let exit = Exit { role, pid, status };
                warn!(%role, %pid, "worker {}", describe(&status));
                exits.push(exit);
            }
            Ok(status) => debug!(%role, %pid, ?status, "worker changed state"),
            Err(Errno::ECHILD) => debug!(%role, %pid, "not a child of this process"),
            Err(e) => error!(%role, %pid, "waitpid failed: {}", e),
        }
    }

    exits
}

/// Collects whatever has already exited after teardown, so nothing lingers as a zombie
pub fn sweep(processes: &[ManagedProcess]) {
    for process in processes.iter().filter(|p| !is_sentinel(p.pid())) {
        match waitpid(process.pid(), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => {
                debug!(role = %process.role(), pid = %process.pid(), "still shutting down")
            }
            Ok(status) => debug!(role = %process.role(), "{}", describe(&status)),
            Err(e) => debug!(role = %process.role(), "nothing to reap: {}", e),
        }
    }
}

/// Signals asking the supervisor itself to stop
pub struct Interrupts {
    interrupt: Signal,
    terminate: Signal,
    quit: Signal,
}

impl Interrupts {
    pub fn register() -> Result<Self, Error> {
        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
            quit: signal(SignalKind::quit())?,
        })
    }

    /// Completes with the name of the first of SIGINT, SIGTERM or SIGQUIT to arrive
    pub async fn received(&mut self) -> &'static str {
        let Self {
            interrupt,
            terminate,
            quit,
        } = self;

        select! {
            _ = interrupt.recv().fuse() => "SIGINT",
            _ = terminate.recv().fuse() => "SIGTERM",
            _ = quit.recv().fuse() => "SIGQUIT",
        }
    }
}
