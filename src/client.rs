//! The wait client.
//!
//! Spawned once per device watch, typically as a supervised service's
//! process: it connects to the monitor, waits for the device to become
//! available, signals readiness on the fd it was given, then blocks until
//! the device disappears and exits so the supervisor can react.

use std::io::{Read, Write};
use std::os::fd::{AsFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::time::Duration;

use nix::fcntl::{FcntlArg, fcntl};
use thiserror::Error;

use crate::proto::{ProtoError, STATUS_ABSENT, STATUS_PRESENT, WatchKind, encode_handshake};

/// Pause between connection attempts while the monitor is not up yet.
const RETRY_DELAY: Duration = Duration::from_millis(250);

/// Filesystem tags the mount stack resolves through `/dev/disk/by-*`.
const DISK_TAGS: [&str; 5] = ["LABEL", "UUID", "PARTLABEL", "PARTUUID", "ID"];

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid device value '{0}'")]
    InvalidDescriptor(String),
    #[error("invalid file descriptor for readiness ({0})")]
    BadReadinessFd(RawFd),
    #[error(transparent)]
    Proto(#[from] ProtoError),
    #[error("connect failed: {0}")]
    Connect(#[source] std::io::Error),
    #[error("monitor closed the connection")]
    ServerClosed,
    #[error("unexpected status byte 0x{0:02x}")]
    BadStatus(u8),
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
}

/// Turn a command-line device descriptor into a protocol query.
pub fn parse_descriptor(raw: &str) -> Result<(WatchKind, String), ClientError> {
    if raw.starts_with("/dev/") {
        return Ok((WatchKind::Dev, raw.to_string()));
    }
    if raw.starts_with("/sys/") {
        return Ok((WatchKind::Sys, raw.to_string()));
    }
    for (prefix, kind) in [
        ("netif:", WatchKind::Netif),
        ("mac:", WatchKind::Mac),
        ("usb:", WatchKind::Usb),
    ] {
        if let Some(rest) = raw.strip_prefix(prefix) {
            if rest.is_empty() {
                return Err(ClientError::InvalidDescriptor(raw.to_string()));
            }
            return Ok((kind, rest.to_string()));
        }
    }
    // mount-style tags resolve through the /dev/disk symlink farm
    for tag in DISK_TAGS {
        if let Some(value) = raw.strip_prefix(tag).and_then(|r| r.strip_prefix('=')) {
            if value.is_empty() {
                return Err(ClientError::InvalidDescriptor(raw.to_string()));
            }
            let path = format!("/dev/disk/by-{}/{}", tag.to_lowercase(), value);
            return Ok((WatchKind::Dev, path));
        }
    }
    Err(ClientError::InvalidDescriptor(raw.to_string()))
}

/// Is this connect failure worth retrying? The monitor may simply not be
/// up yet (no socket, no runtime dir, nobody listening).
fn transient_connect_error(err: &std::io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::ENOENT) | Some(libc::ENOTDIR) | Some(libc::ECONNREFUSED) | Some(libc::EINTR)
    )
}

/// Connect to the monitor, retrying while it is still coming up.
pub fn connect_retry(path: &str) -> Result<UnixStream, ClientError> {
    loop {
        match UnixStream::connect(path) {
            Ok(stream) => return Ok(stream),
            Err(e) if transient_connect_error(&e) => std::thread::sleep(RETRY_DELAY),
            Err(e) => return Err(ClientError::Connect(e)),
        }
    }
}

/// Run the watch: handshake, wait for presence, signal readiness, then
/// wait for the device to vanish.
pub fn run(descriptor: &str, ready_fd: RawFd) -> Result<(), ClientError> {
    if ready_fd < 0 {
        return Err(ClientError::BadReadinessFd(ready_fd));
    }
    if fcntl(ready_fd, FcntlArg::F_GETFD).is_err() {
        return Err(ClientError::BadReadinessFd(ready_fd));
    }
    // SAFETY: validated above; the readiness fd is ours to write and close.
    let ready = unsafe { OwnedFd::from_raw_fd(ready_fd) };

    let (kind, query) = parse_descriptor(descriptor)?;
    let mut stream = connect_retry(crate::paths::SOCKET_PATH)?;
    tracing::debug!("connected, watching {kind} '{query}'");

    stream.write_all(&encode_handshake(kind, &query)?)?;
    wait(&mut stream, Some(ready))
}

/// Read status bytes until the device has come and gone.
fn wait(stream: &mut UnixStream, mut ready: Option<OwnedFd>) -> Result<(), ClientError> {
    let mut byte = [0u8; 1];
    loop {
        match stream.read(&mut byte) {
            Ok(0) => return Err(ClientError::ServerClosed),
            Ok(_) => match byte[0] {
                STATUS_PRESENT => {
                    if let Some(fd) = ready.take() {
                        tracing::debug!("device present, signalling readiness");
                        nix::unistd::write(fd.as_fd(), b"READY=1\n")
                            .map_err(|e| ClientError::Io(e.into()))?;
                        // drop closes the readiness fd
                    }
                }
                STATUS_ABSENT => {
                    if ready.is_none() {
                        // it was there and is gone; our exit is the signal
                        tracing::debug!("device disappeared, exiting");
                        return Ok(());
                    }
                }
                other => return Err(ClientError::BadStatus(other)),
            },
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
}
