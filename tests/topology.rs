// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Launch order, degraded startup and teardown, with scripted launches standing in for fork/exec.

use std::cell::RefCell;
use std::time::Duration;

use nix::unistd::Pid;

use gantry::config::Topology;
use gantry::fork::{self, Launch};
use gantry::log::LogArtifact;
use gantry::procs::{Lifecycle, Role};
use gantry::shutdown::Terminate;
use gantry::supervisor::{Outcome, Phase, Supervisor};

/// Hands out pids 101, 102, ... and fails the launches numbered in `fail`
struct Scripted {
    fail: Vec<usize>,
    attempts: usize,
}

impl Scripted {
    fn failing(fail: &[usize]) -> Self {
        Self {
            fail: fail.to_vec(),
            attempts: 0,
        }
    }
}

impl Launch for Scripted {
    fn launch(&mut self, _executable: &str, _argv: &[String]) -> Pid {
        self.attempts += 1;

        if self.fail.contains(&self.attempts) {
            fork::sentinel()
        } else {
            Pid::from_raw(100 + self.attempts as i32)
        }
    }
}

#[derive(Default)]
struct Recorder {
    signalled: RefCell<Vec<Pid>>,
}

impl Terminate for Recorder {
    fn terminate(&self, pid: Pid) -> nix::Result<()> {
        self.signalled.borrow_mut().push(pid);
        Ok(())
    }
}

fn topology(dir: &tempfile::TempDir) -> Topology {
    Topology {
        log_file: dir.path().join("log_file.txt"),
        channel_dir: dir.path().to_path_buf(),
        terminal: None,
        handoff_timeout: Duration::from_millis(50),
        ..Topology::default()
    }
}

fn pids(raw: &[i32]) -> Vec<Pid> {
    raw.iter().map(|pid| Pid::from_raw(*pid)).collect()
}

#[tokio::test]
async fn test_quit_tears_everything_down() {
    let dir = tempfile::tempdir().expect("tempdir");
    let topology = topology(&dir);
    let log = LogArtifact::create(&topology.log_file).expect("log");
    let recorder = Recorder::default();

    let launcher = Scripted::failing(&[]);
    let mut supervisor = Supervisor::provision_with(topology, log.clone(), launcher, &recorder);
    for channel in supervisor.state().channels().persistent().iter() {
        assert!(channel.path().exists(), "{} provisioned", channel.role());
    }

    let outcome = supervisor
        .run(&b"status\nq\n"[..])
        .await
        .expect("supervisor ran");

    assert_eq!(outcome, Outcome::Quit);
    assert_eq!(outcome.exit_code(), 0);
    assert_eq!(supervisor.state().phase(), Phase::Terminated);
    assert_eq!(*recorder.signalled.borrow(), pids(&[101, 102, 103, 104, 105]));

    let roles: Vec<Role> = supervisor
        .state()
        .processes()
        .iter()
        .map(|p| p.role())
        .collect();
    assert_eq!(roles, Role::ALL.to_vec());
    assert!(supervisor
        .state()
        .processes()
        .iter()
        .all(|p| p.state() == Lifecycle::Terminated));

    // the inspection console learns every pid on its command line
    let inspection = supervisor
        .state()
        .process(Role::InspectionConsole)
        .expect("tracked");
    assert_eq!(&inspection.argv()[2], "101");
    assert_eq!(&inspection.argv()[5..], &["102".to_string(), "103".to_string()]);

    assert!(!log.is_open());
    assert!(!supervisor.state().channels().handoff.path().exists());
    for channel in supervisor.state().channels().persistent().iter() {
        assert!(!channel.path().exists(), "{} removed", channel.role());
    }

    assert!(supervisor.shutdown("second request").is_none());
    assert_eq!(recorder.signalled.borrow().len(), 5);
}

#[tokio::test]
async fn test_failed_actuator_degrades() {
    let dir = tempfile::tempdir().expect("tempdir");
    let topology = topology(&dir);
    let log = LogArtifact::create(&topology.log_file).expect("log");
    let recorder = Recorder::default();

    // the third launch is actuator Z
    let mut supervisor =
        Supervisor::provision_with(topology, log, Scripted::failing(&[3]), &recorder);
    let outcome = supervisor.run(&b"q\n"[..]).await.expect("supervisor ran");

    assert_eq!(outcome, Outcome::Degraded);
    assert_eq!(outcome.exit_code(), 1);

    // the inspection console needs both actuators and is never launched
    assert_eq!(*recorder.signalled.borrow(), pids(&[101, 102, 104]));
    let inspection = supervisor
        .state()
        .process(Role::InspectionConsole)
        .expect("tracked");
    assert_eq!(inspection.state(), Lifecycle::FailedToStart);
    assert_eq!(
        supervisor
            .state()
            .process(Role::ActuatorZ)
            .map(|p| p.state()),
        Some(Lifecycle::FailedToStart)
    );

    for channel in supervisor.state().channels().persistent().iter() {
        assert!(!channel.path().exists(), "{} removed", channel.role());
    }
}

#[tokio::test]
async fn test_failed_watchdog_launches_nothing_else() {
    let dir = tempfile::tempdir().expect("tempdir");
    let topology = topology(&dir);
    let log = LogArtifact::create(&topology.log_file).expect("log");
    let recorder = Recorder::default();

    let mut supervisor =
        Supervisor::provision_with(topology, log, Scripted::failing(&[1]), &recorder);
    let outcome = supervisor.run(&b""[..]).await.expect("supervisor ran");

    assert_eq!(outcome, Outcome::Degraded);
    assert!(recorder.signalled.borrow().is_empty());
    assert_eq!(supervisor.state().processes().len(), 5);
    assert!(supervisor
        .state()
        .processes()
        .iter()
        .all(|p| p.state() == Lifecycle::FailedToStart));
    assert!(!supervisor.state().channels().handoff.path().exists());
}

#[tokio::test]
async fn test_closed_input_quits() {
    let dir = tempfile::tempdir().expect("tempdir");
    let topology = topology(&dir);
    let log = LogArtifact::create(&topology.log_file).expect("log");
    let recorder = Recorder::default();

    let mut supervisor =
        Supervisor::provision_with(topology, log, Scripted::failing(&[]), &recorder);
    let outcome = supervisor
        .run(&b"x\nquit\n"[..])
        .await
        .expect("supervisor ran");

    assert_eq!(outcome, Outcome::Quit);
    assert_eq!(recorder.signalled.borrow().len(), 5);
}
