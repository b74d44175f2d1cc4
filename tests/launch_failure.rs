// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A watchdog that cannot be executed stops the launch sequence while the handoff is pending.

use std::cell::RefCell;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::time::{Duration, Instant};

use nix::sys::wait::WaitStatus;
use nix::unistd::Pid;
use tokio::io::BufReader;

use gantry::config::Topology;
use gantry::fork::ForkExec;
use gantry::log::LogArtifact;
use gantry::procs::Role;
use gantry::shutdown::{Kill, Terminate};
use gantry::supervisor::{Outcome, Supervisor};

#[derive(Default)]
struct Recording {
    signalled: RefCell<Vec<Pid>>,
}

impl Terminate for Recording {
    fn terminate(&self, pid: Pid) -> nix::Result<()> {
        self.signalled.borrow_mut().push(pid);
        Kill.terminate(pid)
    }
}

#[tokio::test]
async fn test_watchdog_exec_failure_stops_the_launch() {
    let dir = tempfile::tempdir().expect("tempdir");
    let idle = dir.path().join("idle");
    fs::write(&idle, "#!/bin/sh\nexec sleep 30\n").expect("write script");
    fs::set_permissions(&idle, fs::Permissions::from_mode(0o755)).expect("chmod");
    let idle = idle.to_string_lossy().into_owned();

    let handoff_timeout = Duration::from_secs(10);
    let topology = Topology {
        log_file: dir.path().join("log_file.txt"),
        channel_dir: dir.path().to_path_buf(),
        watchdog: dir.path().join("no_such_watchdog").to_string_lossy().into_owned(),
        actuator: idle.clone(),
        command_console: idle.clone(),
        inspection_console: idle,
        terminal: None,
        handoff_timeout,
    };

    let log = LogArtifact::create(&topology.log_file).expect("log");
    let recorder = Recording::default();
    let launcher = ForkExec::new(log.descriptor());
    let mut supervisor = Supervisor::provision_with(topology, log, launcher, &recorder);

    let (input, _operator) = tokio::io::duplex(64);
    let started = Instant::now();
    let outcome = tokio::time::timeout(
        Duration::from_secs(20),
        supervisor.run(BufReader::new(input)),
    )
    .await
    .expect("supervisor stopped")
    .expect("supervisor ran");

    assert!(
        started.elapsed() < handoff_timeout / 2,
        "waited {:?} for the handoff",
        started.elapsed()
    );

    let exits = match &outcome {
        Outcome::WorkerExited(exits) => exits.clone(),
        other => panic!("unexpected outcome: {:?}", other),
    };
    assert_eq!(exits.len(), 1);
    assert_eq!(exits[0].role, Role::Watchdog);
    assert_eq!(exits[0].status, WaitStatus::Exited(exits[0].pid, 127));

    // the consoles are never launched
    assert!(supervisor.state().process(Role::CommandConsole).is_none());
    assert!(supervisor.state().process(Role::InspectionConsole).is_none());

    let actuators: Vec<Pid> = [Role::ActuatorX, Role::ActuatorZ]
        .iter()
        .map(|role| supervisor.state().process(*role).expect("tracked").pid())
        .collect();
    assert_eq!(*recorder.signalled.borrow(), actuators);

    assert!(!supervisor.state().channels().handoff.path().exists());
    for channel in supervisor.state().channels().persistent().iter() {
        assert!(!channel.path().exists(), "{} removed", channel.role());
    }

    let logged = fs::read_to_string(dir.path().join("log_file.txt")).expect("log");
    assert!(logged.contains("could not replace process image with"));
}
