// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use nix::unistd::Pid;

use crate::config::Topology;
use crate::fifo::Channels;
use crate::procs::{wrapped, Known, Role, Worker};

/// Operator console issuing commands to both actuators
///
/// Rules:
///   - runs in its own terminal
///   - writes to the command pipes of both axes
///   - argv: `[exe, log-fd, watchdog-pid, command-x-path, command-z-path]`
#[derive(Debug)]
pub struct CommandConsole;

impl CommandConsole {
    pub const NAME: &'static str = "command_console";
}

impl Worker for CommandConsole {
    fn role(&self) -> Role {
        Role::CommandConsole
    }

    fn depends_on(&self, known: &Known) -> Vec<Pid> {
        vec![known.watchdog]
    }

    fn command(
        &self,
        topology: &Topology,
        channels: &Channels,
        known: &Known,
    ) -> (String, Vec<String>) {
        let args = vec![
            known.log_fd.clone(),
            known.watchdog.to_string(),
            channels.command_x.arg(),
            channels.command_z.arg(),
        ];

        wrapped(topology, &topology.command_console, args)
    }
}

/// Operator console showing where both axes are, and able to stop or reset them
///
/// Rules:
///   - runs in its own terminal
///   - reads the inspect pipes of both axes
///   - signals the actuators directly, so it needs their pids
///   - argv: `[exe, log-fd, watchdog-pid, inspect-x-path, inspect-z-path, actuator-x-pid, actuator-z-pid]`
#[derive(Debug)]
pub struct InspectionConsole;

impl InspectionConsole {
    pub const NAME: &'static str = "inspection_console";
}

impl Worker for InspectionConsole {
    fn role(&self) -> Role {
        Role::InspectionConsole
    }

    fn depends_on(&self, known: &Known) -> Vec<Pid> {
        vec![known.watchdog, known.actuator_x, known.actuator_z]
    }

    fn command(
        &self,
        topology: &Topology,
        channels: &Channels,
        known: &Known,
    ) -> (String, Vec<String>) {
        let args = vec![
            known.log_fd.clone(),
            known.watchdog.to_string(),
            channels.inspect_x.arg(),
            channels.inspect_z.arg(),
            known.actuator_x.to_string(),
            known.actuator_z.to_string(),
        ];

        wrapped(topology, &topology.inspection_console, args)
    }
}
