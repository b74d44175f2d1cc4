// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use nix::unistd::Pid;

use crate::config::Topology;
use crate::fifo::{Channel, Channels};
use crate::procs::{Known, Role, Worker};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Axis {
    X,
    Z,
}

/// Drives one axis
///
/// Rules:
///   - one process per axis, both run the same executable
///   - reads commands from its command pipe, publishes its position on its inspect pipe
///   - argv: `[exe, log-fd, watchdog-pid, command-path, inspect-path]`
#[derive(Debug)]
pub struct Actuator {
    axis: Axis,
}

impl Actuator {
    pub fn new(axis: Axis) -> Self {
        Self { axis }
    }

    fn channels<'c>(&self, channels: &'c Channels) -> (&'c Channel, &'c Channel) {
        match self.axis {
            Axis::X => (&channels.command_x, &channels.inspect_x),
            Axis::Z => (&channels.command_z, &channels.inspect_z),
        }
    }
}

impl Worker for Actuator {
    fn role(&self) -> Role {
        match self.axis {
            Axis::X => Role::ActuatorX,
            Axis::Z => Role::ActuatorZ,
        }
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
        let (command, inspect) = self.channels(channels);
        let executable = topology.actuator.clone();
        let argv = vec![
            executable.clone(),
            known.log_fd.clone(),
            known.watchdog.to_string(),
            command.arg(),
            inspect.arg(),
        ];

        (executable, argv)
    }
}
