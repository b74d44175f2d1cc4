// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::io::{self, Write as _};

use futures::future::FutureExt;
use futures::{pin_mut, select};
use nix::unistd::Pid;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{debug, error, info, warn};

use crate::config::Topology;
use crate::fifo::Channels;
use crate::fork::{self, is_sentinel, ForkExec, Launch};
use crate::handoff;
use crate::log::LogArtifact;
use crate::monitor::{self, ChildMonitor, Exit, Interrupts};
use crate::procs::{
    Actuator, Axis, CommandConsole, InspectionConsole, Known, Lifecycle, ManagedProcess, Role,
    Watchdog, Worker,
};
use crate::shutdown::{Kill, ShutdownManager, TeardownReport, Terminate};
use crate::Error;

/// The only command the operator prompt understands
pub const QUIT: &str = "q";

const PROMPT: &str = "Insert 'q' to quit program: ";

/// Where the supervisor is in its lifecycle
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Provisioning,
    Launching,
    /// every worker was launched
    Running,
    /// at least one worker could not be launched, no operator commands are taken
    Degraded,
    ShuttingDown,
    Terminated,
}

/// Why the supervisor stopped
#[derive(Clone, Debug, PartialEq)]
pub enum Outcome {
    /// the operator asked to quit, or closed the input
    Quit,
    /// the supervisor itself received one of the stop signals
    Interrupted(&'static str),
    /// one or more workers terminated
    WorkerExited(Vec<Exit>),
    /// the topology could not be established
    Degraded,
}

impl Outcome {
    /// Process exit status for this outcome
    pub fn exit_code(&self) -> i32 {
        match self {
            Outcome::Quit | Outcome::Interrupted(_) => 0,
            Outcome::Degraded => 1,
            Outcome::WorkerExited(_) => 2,
        }
    }

    fn reason(&self) -> String {
        match self {
            Outcome::Quit => "operator quit".to_string(),
            Outcome::Interrupted(signal) => format!("received {}", signal),
            Outcome::WorkerExited(exits) => {
                let exits: Vec<String> = exits.iter().map(ToString::to_string).collect();
                exits.join(", ")
            }
            Outcome::Degraded => "could not create all child processes".to_string(),
        }
    }
}

/// Everything the supervisor owns: the workers, the log, and the channels
#[derive(Debug)]
pub struct SupervisorState {
    processes: Vec<ManagedProcess>,
    log: LogArtifact,
    channels: Channels,
    phase: Phase,
}

impl SupervisorState {
    pub fn new(log: LogArtifact, channels: Channels) -> Self {
        Self {
            processes: Vec::with_capacity(Role::ALL.len()),
            log,
            channels,
            phase: Phase::Provisioning,
        }
    }

    pub fn track(&mut self, process: ManagedProcess) {
        self.processes.push(process);
    }

    pub fn processes(&self) -> &[ManagedProcess] {
        &self.processes
    }

    pub(crate) fn processes_mut(&mut self) -> &mut [ManagedProcess] {
        &mut self.processes
    }

    pub fn process(&self, role: Role) -> Option<&ManagedProcess> {
        self.processes.iter().find(|p| p.role() == role)
    }

    pub fn log(&self) -> &LogArtifact {
        &self.log
    }

    pub fn channels(&self) -> &Channels {
        &self.channels
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    fn enter(&mut self, phase: Phase) {
        info!(from = ?self.phase, to = ?phase, "supervisor phase");
        self.phase = phase;
    }
}

enum Event {
    Line(io::Result<Option<String>>),
    ChildExited,
    Interrupted(&'static str),
}

enum HandoffEvent {
    Delivered(Result<(), Error>),
    ChildExited,
    Interrupted(&'static str),
}

/// Provisions, launches and supervises the fixed worker topology
pub struct Supervisor<L: Launch, T: Terminate> {
    topology: Topology,
    launcher: L,
    shutdown: ShutdownManager<T>,
    state: SupervisorState,
}

impl Supervisor<ForkExec, Kill> {
    /// Creates the channels, workers will be forked and terminated with `SIGTERM`
    pub fn provision(topology: Topology, log: LogArtifact) -> Self {
        let launcher = ForkExec::new(log.descriptor());
        Self::provision_with(topology, log, launcher, Kill)
    }
}

impl<L: Launch, T: Terminate> Supervisor<L, T> {
    /// Creates the channels, nothing is launched until [`Supervisor::run`]
    pub fn provision_with(
        topology: Topology,
        log: LogArtifact,
        launcher: L,
        terminator: T,
    ) -> Self {
        let channels = Channels::provision(&topology);

        Self {
            topology,
            launcher,
            shutdown: ShutdownManager::new(terminator),
            state: SupervisorState::new(log, channels),
        }
    }

    pub fn state(&self) -> &SupervisorState {
        &self.state
    }

    /// Launches the workers, takes operator commands from `input` and tears everything down.
    ///
    /// Returns once the group has been torn down, because the operator quit, a worker exited, the
    ///   supervisor was signalled, or the topology could not be established.
    pub async fn run<R>(&mut self, input: R) -> Result<Outcome, Error>
    where
        R: AsyncBufRead + Unpin,
    {
        let watchers = ChildMonitor::register()
            .and_then(|children| Interrupts::register().map(|interrupts| (children, interrupts)));
        let (mut children, mut interrupts) = match watchers {
            Ok(watchers) => watchers,
            Err(e) => {
                error!("could not register signal handlers: {}", e);
                self.shutdown("could not register signal handlers");
                return Err(e);
            }
        };

        let outcome = match self.launch_all(&mut children, &mut interrupts).await {
            None => {
                println!("All child processes created correctly.");
                self.command_loop(input, &mut children, &mut interrupts).await
            }
            Some(Outcome::Degraded) => {
                println!("Could not create all child processes.");
                Outcome::Degraded
            }
            Some(outcome) => outcome,
        };

        if let Outcome::WorkerExited(exits) = &outcome {
            println!();
            for exit in exits {
                println!(
                    "Child with pid {} has been terminated with status {}.",
                    exit.pid,
                    monitor::describe(&exit.status)
                );
            }
            println!("Check log file for details of eventual errors.");
        }

        self.shutdown(&outcome.reason());
        println!("All the resources have been cleaned up.");

        Ok(outcome)
    }

    /// Tears the group down, only the first call does anything
    pub fn shutdown(&mut self, reason: &str) -> Option<TeardownReport> {
        if self.shutdown.is_triggered() {
            debug!(%reason, "already torn down");
        } else {
            self.state.enter(Phase::ShuttingDown);
        }

        let report = self.shutdown.shutdown(&mut self.state, reason);
        if report.is_some() {
            monitor::sweep(self.state.processes());
            self.state.enter(Phase::Terminated);
        }

        report
    }

    /// Launches the group in dependency order.
    ///
    /// Returns `None` once every worker is running. A worker exit or a stop signal during the
    ///   launch sequence ends it early, the remaining workers are then never launched.
    async fn launch_all(
        &mut self,
        children: &mut ChildMonitor,
        interrupts: &mut Interrupts,
    ) -> Option<Outcome> {
        self.state.enter(Phase::Launching);

        let mut known = Known::new(self.state.log().descriptor());
        known.watchdog = self.spawn(&Watchdog, &known);
        known.actuator_x = self.spawn(&Actuator::new(Axis::X), &known);
        known.actuator_z = self.spawn(&Actuator::new(Axis::Z), &known);

        // consoles are told the watchdog pid only once it has its actuator pids
        let stopped = self.handoff(&known, children, interrupts).await;

        if stopped.is_none() {
            self.spawn(&CommandConsole, &known);
            self.spawn(&InspectionConsole, &known);
        }

        for process in self.state.processes() {
            println!("Process [{}] has id {}.", process.role(), process.pid());
        }
        println!();

        if stopped.is_some() {
            return stopped;
        }

        let complete = self
            .state
            .processes()
            .iter()
            .all(|p| p.state() != Lifecycle::FailedToStart);

        if complete {
            self.state.enter(Phase::Running);
            None
        } else {
            self.state.enter(Phase::Degraded);
            Some(Outcome::Degraded)
        }
    }

    fn spawn<W: Worker>(&mut self, worker: &W, known: &Known) -> Pid {
        let role = worker.role();
        let (executable, argv) = worker.command(&self.topology, self.state.channels(), known);
        let mut process = ManagedProcess::requested(role, argv);

        if worker.is_launchable(known) {
            let pid = self.launcher.launch(&executable, process.argv());
            if is_sentinel(pid) {
                error!(%role, %executable, "could not launch worker");
            } else {
                info!(%role, %pid, argv = ?process.argv(), "launched worker");
            }
            process.launched(pid);
        } else {
            warn!(%role, "not launched, a worker it depends on did not start");
            process.launched(fork::sentinel());
        }

        let pid = process.pid();
        self.state.track(process);
        pid
    }

    /// Hands the actuator pids to the watchdog, watching the group while waiting for it.
    ///
    /// Returns the outcome if a worker exited or the supervisor was signalled before the handoff
    ///   completed, the channel is retired in that case too.
    async fn handoff(
        &mut self,
        known: &Known,
        children: &mut ChildMonitor,
        interrupts: &mut Interrupts,
    ) -> Option<Outcome> {
        let channel = self.state.channels().handoff.clone();

        if is_sentinel(known.watchdog) {
            warn!("watchdog did not start, nothing will read the handoff channel");
            handoff::retire(&channel).ok();
            return None;
        }

        let pids = [known.actuator_x, known.actuator_z];
        if pids.iter().any(|pid| is_sentinel(*pid)) {
            warn!(?pids, "handing an incomplete set of actuator pids to the watchdog");
        }

        let timeout = self.topology.handoff_timeout;
        let delivery = async move { handoff::deliver(&channel, pids, timeout).await }.fuse();
        pin_mut!(delivery);

        let stopped = loop {
            let event = {
                let child = children.notified().fuse();
                let interrupt = interrupts.received().fuse();
                pin_mut!(child, interrupt);

                select! {
                    delivered = delivery => HandoffEvent::Delivered(delivered),
                    () = child => HandoffEvent::ChildExited,
                    signal = interrupt => HandoffEvent::Interrupted(signal),
                }
            };

            match event {
                HandoffEvent::Delivered(Ok(())) => break None,
                HandoffEvent::Delivered(Err(e)) => {
                    warn!("watchdog runs without actuator pids: {}", e);
                    break None;
                }
                HandoffEvent::ChildExited => {
                    let exits = monitor::reap(self.state.processes_mut());
                    if !exits.is_empty() {
                        break Some(Outcome::WorkerExited(exits));
                    }
                }
                HandoffEvent::Interrupted(signal) => {
                    info!(%signal, "supervisor signalled during the handoff");
                    break Some(Outcome::Interrupted(signal));
                }
            }
        };

        match stopped {
            Some(outcome) => {
                warn!("handoff abandoned, {}", outcome.reason());
                handoff::retire(&self.state.channels().handoff).ok();
                Some(outcome)
            }
            None => {
                // a notification may still be pending for a worker that died after the delivery
                let exits = monitor::reap(self.state.processes_mut());
                if exits.is_empty() {
                    None
                } else {
                    Some(Outcome::WorkerExited(exits))
                }
            }
        }
    }

    async fn command_loop<R>(
        &mut self,
        input: R,
        children: &mut ChildMonitor,
        interrupts: &mut Interrupts,
    ) -> Outcome
    where
        R: AsyncBufRead + Unpin,
    {
        let mut lines = input.lines();
        let mut prompt = true;

        loop {
            if prompt {
                print!("{}", PROMPT);
                io::stdout().flush().ok();
                prompt = false;
            }

            let event = {
                let line = lines.next_line().fuse();
                let child = children.notified().fuse();
                let interrupt = interrupts.received().fuse();
                pin_mut!(line, child, interrupt);

                select! {
                    line = line => Event::Line(line),
                    () = child => Event::ChildExited,
                    signal = interrupt => Event::Interrupted(signal),
                }
            };

            match event {
                Event::Line(Ok(Some(line))) => {
                    if line.trim() == QUIT {
                        return Outcome::Quit;
                    }

                    debug!(command = %line.trim(), "ignoring unknown command");
                    prompt = true;
                }
                Event::Line(Ok(None)) => {
                    info!("operator input closed");
                    return Outcome::Quit;
                }
                Event::Line(Err(e)) => {
                    error!("could not read operator input: {}", e);
                    return Outcome::Quit;
                }
                Event::ChildExited => {
                    let exits = monitor::reap(self.state.processes_mut());
                    if !exits.is_empty() {
                        return Outcome::WorkerExited(exits);
                    }
                }
                Event::Interrupted(signal) => {
                    info!(%signal, "supervisor signalled");
                    return Outcome::Interrupted(signal);
                }
            }
        }
    }
}
