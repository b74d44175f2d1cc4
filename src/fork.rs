// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::ffi::CString;
use std::os::unix::io::RawFd;

use nix::errno::Errno;
use nix::unistd::{execv, fork, ForkResult, Pid};
use tracing::{debug, error};

use crate::error::ErrorKind;
use crate::Error;

pub const NULL: RawFd = -1;
pub const STDERR: RawFd = 2;

/// Raw pid of a launch that did not produce a process
pub const SENTINEL: libc::pid_t = -1;

/// Exit status of a child whose exec failed, same as the shells use
const EXEC_FAILED: i32 = 127;

/// The pid standing in for a worker that was never started
pub fn sentinel() -> Pid {
    Pid::from_raw(SENTINEL)
}

pub fn is_sentinel(pid: Pid) -> bool {
    pid.as_raw() == SENTINEL
}

/// Starts a worker as a new process image
pub trait Launch {
    /// Launches `executable` with `argv` as its full argument vector, `argv[0]` included.
    ///
    /// Returns the pid of the new process, or [`sentinel`] if no process could be created.
    fn launch(&mut self, executable: &str, argv: &[String]) -> Pid;
}

/// Launches with `fork(2)` followed by `execv(2)`
#[derive(Debug)]
pub struct ForkExec {
    /// where an exec failure in the child is reported
    report_fd: RawFd,
}

impl ForkExec {
    /// Exec failures are written to `report_fd`, or stderr if it is [`NULL`]
    pub fn new(report_fd: RawFd) -> Self {
        let report_fd = if report_fd < 0 { STDERR } else { report_fd };
        Self { report_fd }
    }
}

impl Launch for ForkExec {
    fn launch(&mut self, executable: &str, argv: &[String]) -> Pid {
        let image = match Image::new(executable, argv) {
            Ok(image) => image,
            Err(e) => {
                error!(%executable, "{}", e);
                return sentinel();
            }
        };

        // only async-signal-safe calls happen in the child, everything it needs is prepared above
        match unsafe { fork() } {
            Ok(ForkResult::Parent { child }) => {
                debug!(%executable, pid = %child, "forked");
                child
            }
            Ok(ForkResult::Child) => image.exec(self.report_fd),
            Err(e) => {
                error!(%executable, "fork failed: {}", e);
                sentinel()
            }
        }
    }
}

/// Everything the child needs to replace itself, converted before forking
struct Image {
    path: CString,
    argv: Vec<CString>,
    failure: Vec<u8>,
}

impl Image {
    fn new(executable: &str, argv: &[String]) -> Result<Self, Error> {
        let path = CString::new(executable)
            .map_err(|_| ErrorKind::Launch(format!("nul byte in path {:?}", executable)))?;
        let argv = argv
            .iter()
            .map(|arg| {
                CString::new(arg.as_str())
                    .map_err(|_| ErrorKind::Launch(format!("nul byte in argument {:?}", arg)))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let failure = format!("could not replace process image with {}: ", executable).into_bytes();

        Ok(Self {
            path,
            argv,
            failure,
        })
    }

    /// Never returns to the caller, either the exec succeeds or the child exits
    fn exec(&self, report_fd: RawFd) -> ! {
        let errno = match execv(&self.path, &self.argv) {
            Ok(never) => match never {},
            Err(errno) => errno,
        };

        report(report_fd, &self.failure, errno);
        unsafe { libc::_exit(EXEC_FAILED) }
    }
}

/// Writes `prefix`, the errno description and a newline with nothing but `write(2)`
fn report(fd: RawFd, prefix: &[u8], errno: Errno) {
    let desc = errno.desc().as_bytes();
    for part in [prefix, desc, &b"\n"[..]].iter() {
        // failures are ignored, there is nowhere left to report them
        unsafe {
            libc::write(fd, part.as_ptr().cast(), part.len());
        }
    }
}
