// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Named pipes shared between the workers, and typed ends for the ones the supervisor opens itself.

use std::fmt::{self, Debug};
use std::io;
use std::marker::PhantomData;
use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd, RawFd};
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::fcntl::{fcntl, open, FcntlArg, OFlag};
use nix::sys::stat::Mode;
use nix::unistd::{close, mkfifo, unlink};
use tracing::{debug, error, info, warn};

use crate::config::Topology;
use crate::error::ErrorKind;
use crate::Error;

/// Every channel is created readable and writable by anyone, subject to the umask
const CHANNEL_MODE: libc::mode_t = 0o666;

#[derive(Clone, Copy, Debug)]
pub struct Read;
#[derive(Clone, Copy, Debug)]
pub struct Write;

// A marker trait to designate the end of the fifo this represents
pub trait End: Clone + Copy + Debug {
    fn display() -> &'static str;

    fn flags() -> OFlag;
}

impl End for Read {
    fn display() -> &'static str {
        "Read"
    }

    fn flags() -> OFlag {
        OFlag::O_RDONLY
    }
}

impl End for Write {
    fn display() -> &'static str {
        "Write"
    }

    fn flags() -> OFlag {
        OFlag::O_WRONLY
    }
}

/// The fixed set of channels in the topology
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChannelRole {
    /// command console -> actuator X
    CommandX,
    /// command console -> actuator Z
    CommandZ,
    /// actuator X -> inspection console
    InspectX,
    /// actuator Z -> inspection console
    InspectZ,
    /// supervisor -> watchdog, removed right after the actuator pids are delivered
    Handoff,
}

impl ChannelRole {
    pub fn file_name(self) -> &'static str {
        match self {
            ChannelRole::CommandX => "cmd_motor_x",
            ChannelRole::CommandZ => "cmd_motor_z",
            ChannelRole::InspectX => "isp_motor_x",
            ChannelRole::InspectZ => "isp_motor_z",
            ChannelRole::Handoff => "master_watchdog",
        }
    }
}

impl fmt::Display for ChannelRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChannelRole::CommandX => "command-x",
            ChannelRole::CommandZ => "command-z",
            ChannelRole::InspectX => "inspect-x",
            ChannelRole::InspectZ => "inspect-z",
            ChannelRole::Handoff => "handoff",
        };

        f.write_str(name)
    }
}

/// A named pipe on the filesystem
#[derive(Clone, Debug)]
pub struct Channel {
    path: PathBuf,
    role: ChannelRole,
    provisioned: bool,
}

impl Channel {
    /// Creates the fifo at `path` unless it is already there.
    ///
    /// Never fails: a channel that could not be created is logged and returned unprovisioned,
    ///   the workers that depend on it will run degraded.
    pub fn ensure<P: Into<PathBuf>>(path: P, role: ChannelRole) -> Self {
        let path = path.into();
        let provisioned = match make_fifo(&path) {
            Ok(()) => {
                debug!(%role, path = %path.display(), "channel ready");
                true
            }
            Err(e) => {
                error!(%role, path = %path.display(), "could not create channel: {}", e);
                false
            }
        };

        Self {
            path,
            role,
            provisioned,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn role(&self) -> ChannelRole {
        self.role
    }

    pub fn is_provisioned(&self) -> bool {
        self.provisioned
    }

    /// The path as handed to the workers on their command line
    pub fn arg(&self) -> String {
        self.path.display().to_string()
    }

    /// Unlinks the fifo, returns `false` if it was already gone
    pub fn remove(&self) -> Result<bool, Error> {
        match unlink(&self.path) {
            Ok(()) => {
                debug!(role = %self.role, path = %self.path.display(), "channel removed");
                Ok(true)
            }
            Err(Errno::ENOENT) => {
                info!(role = %self.role, path = %self.path.display(), "channel already absent");
                Ok(false)
            }
            Err(e) => Err(ErrorKind::Shutdown(format!(
                "could not remove {} channel {}: {}",
                self.role,
                self.path.display(),
                e
            ))
            .into()),
        }
    }
}

fn make_fifo(path: &Path) -> Result<(), Error> {
    match mkfifo(path, Mode::from_bits_truncate(CHANNEL_MODE)) {
        Ok(()) | Err(Errno::EEXIST) => Ok(()),
        Err(e) => Err(ErrorKind::Provisioning(format!("mkfifo {}: {}", path.display(), e)).into()),
    }
}

/// Every channel of the topology, resolved against its channel directory
#[derive(Clone, Debug)]
pub struct Channels {
    pub command_x: Channel,
    pub command_z: Channel,
    pub inspect_x: Channel,
    pub inspect_z: Channel,
    pub handoff: Channel,
}

impl Channels {
    /// Provisions all channels, persistent ones first
    pub fn provision(topology: &Topology) -> Self {
        let ensure = |role| Channel::ensure(topology.channel_path(role), role);

        Self {
            command_x: ensure(ChannelRole::CommandX),
            command_z: ensure(ChannelRole::CommandZ),
            inspect_x: ensure(ChannelRole::InspectX),
            inspect_z: ensure(ChannelRole::InspectZ),
            handoff: ensure(ChannelRole::Handoff),
        }
    }

    /// The channels that live until teardown, i.e. all but the handoff
    pub fn persistent(&self) -> [&Channel; 4] {
        [
            &self.command_x,
            &self.command_z,
            &self.inspect_x,
            &self.inspect_z,
        ]
    }
}

/// One open end of a fifo, closed on drop
#[derive(Debug)]
pub struct FifoEnd<E: End> {
    raw_fd: RawFd,
    ghost: PhantomData<E>,
}

impl<E: End> FifoEnd<E> {
    /// Opens the fifo with `O_NONBLOCK`.
    ///
    /// For the write end this fails with `ENXIO` while nothing has the read end open.
    pub fn open_nonblocking(path: &Path) -> nix::Result<Self> {
        Self::open_with(path, OFlag::O_NONBLOCK)
    }

    fn open_with(path: &Path, extra: OFlag) -> nix::Result<Self> {
        let raw_fd = open(path, E::flags() | OFlag::O_CLOEXEC | extra, Mode::empty())?;

        // the fd was just opened and is owned by nothing else
        Ok(unsafe { Self::from_raw_fd(raw_fd) })
    }

    /// Clears `O_NONBLOCK` so that reads and writes wait for the peer
    pub fn set_blocking(&self) -> nix::Result<()> {
        let mut flags = OFlag::from_bits_truncate(fcntl(self.raw_fd, FcntlArg::F_GETFL)?);
        flags.remove(OFlag::O_NONBLOCK);
        fcntl(self.raw_fd, FcntlArg::F_SETFL(flags))?;
        Ok(())
    }

    /// Forget the fd so that drop does not close it
    pub fn forget(&mut self) {
        self.raw_fd = -1;
    }

    /// Closes the fd, reporting the failure that drop would only log
    pub fn close(&mut self) -> nix::Result<()> {
        if self.raw_fd < 0 {
            return Ok(());
        }

        let raw_fd = self.raw_fd;
        self.forget();
        close(raw_fd)
    }
}

impl<E: End> FromRawFd for FifoEnd<E> {
    unsafe fn from_raw_fd(raw_fd: RawFd) -> Self {
        Self {
            raw_fd,
            ghost: PhantomData,
        }
    }
}

impl<E: End> AsRawFd for FifoEnd<E> {
    fn as_raw_fd(&self) -> RawFd {
        self.raw_fd
    }
}

impl<E: End> IntoRawFd for FifoEnd<E> {
    fn into_raw_fd(mut self) -> RawFd {
        let raw_fd = self.raw_fd;
        self.forget();
        raw_fd
    }
}

impl<E: End> Drop for FifoEnd<E> {
    fn drop(&mut self) {
        match self.raw_fd {
            // don't implicitly close any of the std io
            0..=2 => return,
            // don't close -1, NULL
            i if i < 0 => return,
            _ => (),
        }

        debug!("closing fd: {} ({})", self.raw_fd, E::display());

        close(self.raw_fd)
            .map_err(|e| warn!("error closing file handle ({}): {}", self.raw_fd, e))
            .ok();
    }
}

impl io::Read for FifoEnd<Read> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        // the fd is owned by self and buf is valid for buf.len() bytes
        let len = unsafe { libc::read(self.raw_fd, buf.as_mut_ptr().cast(), buf.len()) };
        if len < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(len as usize)
    }
}

impl io::Write for FifoEnd<Write> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        // the fd is owned by self and buf is valid for buf.len() bytes
        let len = unsafe { libc::write(self.raw_fd, buf.as_ptr().cast(), buf.len()) };
        if len < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(len as usize)
    }

    fn flush(&mut self) -> io::Result<()> {
        // fifos are unbuffered
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read as _, Write as _};

    use super::*;

    #[test]
    fn test_ensure_is_idempotent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join(ChannelRole::CommandX.file_name());

        let first = Channel::ensure(&path, ChannelRole::CommandX);
        let second = Channel::ensure(&path, ChannelRole::CommandX);

        assert!(first.is_provisioned());
        assert!(second.is_provisioned());
        assert_eq!(second.path(), path.as_path());
    }

    #[test]
    fn test_ensure_failure_is_not_fatal() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("missing").join("cmd_motor_z");

        let channel = Channel::ensure(&path, ChannelRole::CommandZ);
        assert!(!channel.is_provisioned());
        assert!(!path.exists());
    }

    #[test]
    fn test_remove_twice() {
        let dir = tempfile::tempdir().expect("tempdir");
        let channel = Channel::ensure(dir.path().join("isp_motor_x"), ChannelRole::InspectX);

        assert!(channel.remove().expect("first remove"));
        assert!(!channel.remove().expect("second remove"));
        assert!(!channel.path().exists());
    }

    #[test]
    fn test_nonblocking_write_without_reader() {
        let dir = tempfile::tempdir().expect("tempdir");
        let channel = Channel::ensure(dir.path().join("master_watchdog"), ChannelRole::Handoff);

        let err = FifoEnd::<Write>::open_nonblocking(channel.path()).expect_err("no reader");
        assert_eq!(err, Errno::ENXIO);
    }

    #[test]
    fn test_ends_exchange_bytes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let channel = Channel::ensure(dir.path().join("cmd_motor_x"), ChannelRole::CommandX);

        let mut reader = FifoEnd::<Read>::open_nonblocking(channel.path()).expect("reader");
        let mut writer = FifoEnd::<Write>::open_nonblocking(channel.path()).expect("writer");
        writer.set_blocking().expect("blocking");

        writer.write_all(b"up").expect("write");
        writer.close().expect("close");

        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).expect("read");
        assert_eq!(buf, b"up");
    }

    #[test]
    fn test_provision_layout() {
        let dir = tempfile::tempdir().expect("tempdir");
        let topology = Topology {
            channel_dir: dir.path().to_path_buf(),
            ..Topology::default()
        };

        let channels = Channels::provision(&topology);
        for channel in channels.persistent().iter() {
            assert!(channel.is_provisioned(), "{} not provisioned", channel.role());
            assert!(channel.path().starts_with(dir.path()));
        }
        assert!(channels.handoff.is_provisioned());
        assert_eq!(
            channels.handoff.path(),
            dir.path().join("master_watchdog").as_path()
        );
    }
}
