// Copyright 2019 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

mod actuator;
mod console;
mod watchdog;

pub use actuator::{Actuator, Axis};
pub use console::{CommandConsole, InspectionConsole};
pub use watchdog::Watchdog;

use std::fmt;

use nix::unistd::Pid;

use crate::config::Topology;
use crate::fifo::Channels;
use crate::fork::{self, is_sentinel};

/// The fixed roles in the topology, in launch order
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Role {
    Watchdog,
    ActuatorX,
    ActuatorZ,
    CommandConsole,
    InspectionConsole,
}

impl Role {
    pub const ALL: [Role; 5] = [
        Role::Watchdog,
        Role::ActuatorX,
        Role::ActuatorZ,
        Role::CommandConsole,
        Role::InspectionConsole,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Role::Watchdog => Watchdog::NAME,
            Role::ActuatorX => "motor_x",
            Role::ActuatorZ => "motor_z",
            Role::CommandConsole => CommandConsole::NAME,
            Role::InspectionConsole => InspectionConsole::NAME,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Lifecycle {
    Requested,
    Running,
    Terminated,
    FailedToStart,
}

/// A worker tracked by the supervisor
#[derive(Clone, Debug)]
pub struct ManagedProcess {
    role: Role,
    pid: Pid,
    argv: Vec<String>,
    state: Lifecycle,
}

impl ManagedProcess {
    pub fn requested(role: Role, argv: Vec<String>) -> Self {
        Self {
            role,
            pid: fork::sentinel(),
            argv,
            state: Lifecycle::Requested,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    pub fn state(&self) -> Lifecycle {
        self.state
    }

    /// Records the result of the launch, the sentinel marks it as never started
    pub(crate) fn launched(&mut self, pid: Pid) {
        self.pid = pid;
        self.state = if is_sentinel(pid) {
            Lifecycle::FailedToStart
        } else {
            Lifecycle::Running
        };
    }

    pub(crate) fn terminated(&mut self) {
        self.state = match self.state {
            Lifecycle::Requested | Lifecycle::FailedToStart => Lifecycle::FailedToStart,
            Lifecycle::Running | Lifecycle::Terminated => Lifecycle::Terminated,
        };
    }
}

/// Identities that are only known once earlier workers have been launched
#[derive(Clone, Debug)]
pub struct Known {
    /// descriptor number of the shared log file
    pub log_fd: String,
    pub watchdog: Pid,
    pub actuator_x: Pid,
    pub actuator_z: Pid,
}

impl Known {
    pub fn new(log_fd: i32) -> Self {
        Self {
            log_fd: log_fd.to_string(),
            watchdog: fork::sentinel(),
            actuator_x: fork::sentinel(),
            actuator_z: fork::sentinel(),
        }
    }
}

/// What the supervisor needs to know to launch one kind of worker
pub trait Worker {
    fn role(&self) -> Role;

    /// The pids this worker is told about on its command line, all must be valid to launch it
    fn depends_on(&self, known: &Known) -> Vec<Pid>;

    /// The executable and its full argument vector, `argv[0]` included
    fn command(&self, topology: &Topology, channels: &Channels, known: &Known)
        -> (String, Vec<String>);

    /// `true` if every identity this worker depends on has been launched
    fn is_launchable(&self, known: &Known) -> bool {
        self.depends_on(known).into_iter().all(|pid| !is_sentinel(pid))
    }
}

/// Consoles run inside the configured terminal emulator, when there is one
fn wrapped(topology: &Topology, executable: &str, args: Vec<String>) -> (String, Vec<String>) {
    let mut argv = Vec::with_capacity(args.len() + 3);
    let terminal = topology
        .terminal
        .as_ref()
        .and_then(|terminal| terminal.split_first());
    let program = match terminal {
        Some((program, flags)) => {
            argv.push(program.clone());
            argv.extend(flags.iter().cloned());
            program.clone()
        }
        None => executable.to_string(),
    };

    argv.push(executable.to_string());
    argv.extend(args);
    (program, argv)
}
