// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The log file every process in the group appends to.
//!
//! Workers don't open the file by path, they inherit the supervisor's descriptor and are told its
//!   number on the command line. The supervisor writes its own `tracing` output into the same
//!   descriptor until teardown closes it.

use std::fs::File;
use std::io::{self, Write};
use std::os::unix::io::{FromRawFd, IntoRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use nix::fcntl::{open, OFlag};
use nix::sys::stat::Mode;
use nix::unistd::close;
use tracing_subscriber::fmt::MakeWriter;

use crate::error::ErrorKind;
use crate::fork::NULL;
use crate::Error;

const LOG_MODE: libc::mode_t = 0o666;

#[derive(Debug)]
struct Inner {
    path: PathBuf,
    raw_fd: RawFd,
    file: Mutex<Option<File>>,
}

/// Shared handle to the log artifact, cheap to clone
#[derive(Clone, Debug)]
pub struct LogArtifact {
    inner: Arc<Inner>,
}

impl LogArtifact {
    /// Creates or truncates the log file.
    ///
    /// The descriptor is opened without `O_CLOEXEC` so that every launched worker inherits it.
    pub fn create<P: Into<PathBuf>>(path: P) -> Result<Self, Error> {
        let path = path.into();
        let raw_fd = open(
            &path,
            OFlag::O_WRONLY | OFlag::O_CREAT | OFlag::O_TRUNC,
            Mode::from_bits_truncate(LOG_MODE),
        )
        .map_err(|e| ErrorKind::Provisioning(format!("log file {}: {}", path.display(), e)))?;

        // the fd was just opened and is owned by nothing else
        let file = unsafe { File::from_raw_fd(raw_fd) };
        Ok(Self::with_file(path, raw_fd, Some(file)))
    }

    /// An artifact for a log file that could not be created.
    ///
    /// Its descriptor is `-1` and everything written to it goes to stderr.
    pub fn detached<P: Into<PathBuf>>(path: P) -> Self {
        Self::with_file(path.into(), NULL, None)
    }

    fn with_file(path: PathBuf, raw_fd: RawFd, file: Option<File>) -> Self {
        Self {
            inner: Arc::new(Inner {
                path,
                raw_fd,
                file: Mutex::new(file),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// The descriptor number the workers write to, `-1` if the log could not be created
    pub fn descriptor(&self) -> RawFd {
        self.inner.raw_fd
    }

    pub fn is_open(&self) -> bool {
        self.lock().is_some()
    }

    /// Closes the descriptor, returns `false` if it was already closed
    pub fn close(&self) -> Result<bool, Error> {
        // the guard must be released before anything is logged, the subscriber writes through it
        let file = self.lock().take();
        let file = match file {
            Some(file) => file,
            None => return Ok(false),
        };

        close(file.into_raw_fd()).map_err(|e| {
            ErrorKind::Shutdown(format!(
                "could not close log file {}: {}",
                self.inner.path.display(),
                e
            ))
        })?;

        Ok(true)
    }

    fn lock(&self) -> MutexGuard<'_, Option<File>> {
        self.inner
            .file
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// A single formatted event on its way into the log file.
///
/// Events written after the file has been closed are discarded.
pub struct LogWriter {
    artifact: LogArtifact,
}

impl LogWriter {
    fn is_detached(&self) -> bool {
        self.artifact.descriptor() == NULL
    }
}

impl Write for LogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let detached = self.is_detached();
        let file = self.artifact.lock();
        match file.as_ref() {
            Some(mut file) => file.write(buf),
            None if detached => io::stderr().write(buf),
            None => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        let detached = self.is_detached();
        let file = self.artifact.lock();
        match file.as_ref() {
            Some(mut file) => file.flush(),
            None if detached => io::stderr().flush(),
            None => Ok(()),
        }
    }
}

impl<'a> MakeWriter<'a> for LogArtifact {
    type Writer = LogWriter;

    fn make_writer(&'a self) -> Self::Writer {
        LogWriter {
            artifact: self.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    #[test]
    fn test_create_truncates() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("log_file.txt");
        fs::write(&path, b"stale").expect("write");

        let log = LogArtifact::create(&path).expect("create");
        assert!(log.is_open());
        assert!(log.descriptor() > 2);
        assert_eq!(fs::read(&path).expect("read").len(), 0);
    }

    #[test]
    fn test_descriptor_is_inherited() {
        use nix::fcntl::{fcntl, FcntlArg, FdFlag};

        let dir = tempfile::tempdir().expect("tempdir");
        let log = LogArtifact::create(dir.path().join("log_file.txt")).expect("create");

        let flags = fcntl(log.descriptor(), FcntlArg::F_GETFD).expect("getfd");
        assert!(!FdFlag::from_bits_truncate(flags).contains(FdFlag::FD_CLOEXEC));
    }

    #[test]
    fn test_writer_and_close() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("log_file.txt");
        let log = LogArtifact::create(&path).expect("create");

        log.make_writer()
            .write_all(b"supervisor up\n")
            .expect("write");
        assert_eq!(fs::read_to_string(&path).expect("read"), "supervisor up\n");

        assert!(log.close().expect("close"));
        assert!(!log.is_open());
        assert!(!log.close().expect("second close"));

        log.make_writer().write_all(b"late line\n").expect("discarded");
        assert_eq!(fs::read_to_string(&path).expect("read"), "supervisor up\n");
    }

    #[test]
    fn test_create_failure() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("no").join("such").join("log_file.txt");

        let err = LogArtifact::create(&path).expect_err("parent is missing");
        assert!(matches!(err.kind(), ErrorKind::Provisioning(_)));

        let log = LogArtifact::detached(&path);
        assert_eq!(log.descriptor(), -1);
        assert!(!log.is_open());
        assert!(!log.close().expect("nothing to close"));
    }
}
