// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use nix::unistd::Pid;

use crate::config::Topology;
use crate::fifo::Channels;
use crate::procs::{Known, Role, Worker};

/// Watches the actuators for inactivity
///
/// Rules:
///   - started first, it depends on nothing
///   - reads the actuator pids once from the handoff pipe, which the supervisor then removes
///   - argv: `[exe, log-fd, handoff-path]`
#[derive(Debug)]
pub struct Watchdog;

impl Watchdog {
    pub const NAME: &'static str = "watchdog";
}

impl Worker for Watchdog {
    fn role(&self) -> Role {
        Role::Watchdog
    }

    fn depends_on(&self, _known: &Known) -> Vec<Pid> {
        Vec::new()
    }

    fn command(
        &self,
        topology: &Topology,
        channels: &Channels,
        known: &Known,
    ) -> (String, Vec<String>) {
        let executable = topology.watchdog.clone();
        let argv = vec![
            executable.clone(),
            known.log_fd.clone(),
            channels.handoff.arg(),
        ];

        (executable, argv)
    }
}
