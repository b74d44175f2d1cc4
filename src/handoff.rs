// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! One-shot delivery of the actuator pids to the watchdog.
//!
//! The wire format is the two pids as native-endian `pid_t`, actuator X first, without any header.
//!   The channel is unlinked as soon as the write end is closed, whether or not delivery succeeded.

use std::io::Write as _;
use std::mem;
use std::time::Duration;

use nix::errno::Errno;
use nix::unistd::Pid;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

use crate::error::ErrorKind;
use crate::fifo::{Channel, FifoEnd, Write};
use crate::Error;

/// How often the write end is retried while the watchdog has not opened its end yet
const POLL_INTERVAL: Duration = Duration::from_millis(20);

const PID_LEN: usize = mem::size_of::<libc::pid_t>();

/// Size of a complete handoff message
pub const MESSAGE_LEN: usize = 2 * PID_LEN;

/// The message as it goes over the wire
pub fn encode(pids: [Pid; 2]) -> [u8; MESSAGE_LEN] {
    let mut message = [0u8; MESSAGE_LEN];
    for (slot, pid) in message.chunks_exact_mut(PID_LEN).zip(pids.iter()) {
        slot.copy_from_slice(&pid.as_raw().to_ne_bytes());
    }

    message
}

/// The inverse of [`encode`], for readers of the channel
pub fn decode(message: &[u8; MESSAGE_LEN]) -> [Pid; 2] {
    let mut pids = [Pid::from_raw(0); 2];
    for (pid, slot) in pids.iter_mut().zip(message.chunks_exact(PID_LEN)) {
        let mut raw = [0u8; PID_LEN];
        raw.copy_from_slice(slot);
        *pid = Pid::from_raw(libc::pid_t::from_ne_bytes(raw));
    }

    pids
}

/// Writes `pids` (actuator X, then actuator Z) into the handoff channel and retires it.
///
/// Waits at most `timeout` for the watchdog to open the read end. Every failure is logged and
///   returned, the caller is expected to carry on degraded.
pub async fn deliver(channel: &Channel, pids: [Pid; 2], timeout: Duration) -> Result<(), Error> {
    let delivered = write_message(channel, pids, timeout).await;

    match &delivered {
        Ok(()) => info!(
            path = %channel.path().display(),
            actuator_x = %pids[0],
            actuator_z = %pids[1],
            "actuator pids handed to watchdog"
        ),
        Err(e) => error!(path = %channel.path().display(), "{}", e),
    }

    let retired = retire(channel);
    delivered.and(retired)
}

/// Removes the handoff channel so that nothing can open it again
pub fn retire(channel: &Channel) -> Result<(), Error> {
    match channel.remove() {
        Ok(_) => Ok(()),
        Err(e) => {
            error!(path = %channel.path().display(), "could not retire handoff channel: {}", e);
            Err(ErrorKind::Handoff(e.to_string()).into())
        }
    }
}

async fn write_message(channel: &Channel, pids: [Pid; 2], timeout: Duration) -> Result<(), Error> {
    if !channel.is_provisioned() {
        return Err(ErrorKind::Handoff(format!(
            "channel {} was never created",
            channel.path().display()
        ))
        .into());
    }

    let mut writer = rendezvous(channel, timeout).await?;
    writer
        .set_blocking()
        .map_err(|e| ErrorKind::Handoff(format!("could not clear O_NONBLOCK: {}", e)))?;

    writer
        .write_all(&encode(pids))
        .map_err(|e| ErrorKind::Handoff(format!("could not write pids: {}", e)))?;

    writer
        .close()
        .map_err(|e| ErrorKind::Handoff(format!("could not close write end: {}", e)))?;

    Ok(())
}

/// Opens the write end once the watchdog holds the read end, or gives up after `timeout`
async fn rendezvous(channel: &Channel, timeout: Duration) -> Result<FifoEnd<Write>, Error> {
    let deadline = Instant::now() + timeout;

    loop {
        match FifoEnd::<Write>::open_nonblocking(channel.path()) {
            Ok(writer) => return Ok(writer),
            Err(Errno::ENXIO) if Instant::now() < deadline => {
                debug!("watchdog has not opened the handoff channel yet");
                sleep(POLL_INTERVAL).await;
            }
            Err(Errno::ENXIO) => {
                warn!(?timeout, "watchdog never opened the handoff channel");
                return Err(ErrorKind::Provisioning(format!(
                    "no reader on {} after {:?}",
                    channel.path().display(),
                    timeout
                ))
                .into());
            }
            Err(Errno::EINTR) => continue,
            Err(e) => {
                return Err(ErrorKind::Handoff(format!(
                    "could not open {}: {}",
                    channel.path().display(),
                    e
                ))
                .into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read as _;

    use crate::fifo::{ChannelRole, Read};

    use super::*;

    fn handoff_channel(dir: &tempfile::TempDir) -> Channel {
        Channel::ensure(
            dir.path().join(ChannelRole::Handoff.file_name()),
            ChannelRole::Handoff,
        )
    }

    #[test]
    fn test_wire_format() {
        let message = encode([Pid::from_raw(1234), Pid::from_raw(5678)]);

        assert_eq!(message.len(), 8);
        assert_eq!(&message[..4], &1234_i32.to_ne_bytes());
        assert_eq!(&message[4..], &5678_i32.to_ne_bytes());
        assert_eq!(decode(&message), [Pid::from_raw(1234), Pid::from_raw(5678)]);
    }

    #[tokio::test]
    async fn test_deliver_then_retire() {
        let dir = tempfile::tempdir().expect("tempdir");
        let channel = handoff_channel(&dir);

        // stands in for the watchdog, which holds its read end open before the write happens
        let mut watchdog = FifoEnd::<Read>::open_nonblocking(channel.path()).expect("read end");

        let pids = [Pid::from_raw(301), Pid::from_raw(302)];
        deliver(&channel, pids, Duration::from_secs(5))
            .await
            .expect("delivered");

        let mut received = Vec::new();
        watchdog.read_to_end(&mut received).expect("read");
        assert_eq!(received.len(), MESSAGE_LEN);

        let mut message = [0u8; MESSAGE_LEN];
        message.copy_from_slice(&received);
        assert_eq!(decode(&message), pids);

        assert!(!channel.path().exists());
        assert_eq!(
            FifoEnd::<Read>::open_nonblocking(channel.path()).expect_err("retired"),
            Errno::ENOENT
        );
    }

    #[tokio::test]
    async fn test_rendezvous_times_out() {
        let dir = tempfile::tempdir().expect("tempdir");
        let channel = handoff_channel(&dir);

        let err = deliver(
            &channel,
            [Pid::from_raw(1), Pid::from_raw(2)],
            Duration::from_millis(60),
        )
        .await
        .expect_err("nobody is reading");

        assert!(matches!(err.kind(), ErrorKind::Provisioning(_)));
        assert!(!channel.path().exists(), "retired even on failure");
    }

    #[tokio::test]
    async fn test_unprovisioned_channel() {
        let dir = tempfile::tempdir().expect("tempdir");
        let channel = Channel::ensure(
            dir.path().join("missing").join("master_watchdog"),
            ChannelRole::Handoff,
        );

        let err = deliver(
            &channel,
            [Pid::from_raw(1), Pid::from_raw(2)],
            Duration::from_millis(60),
        )
        .await
        .expect_err("no channel");
        assert!(matches!(err.kind(), ErrorKind::Handoff(_)));
    }
}
