//! The daemon: control socket setup, signal plumbing and the poll loop.
//!
//! Everything runs on one thread around a single `poll(2)` call. The fd
//! set is rebuilt each iteration from the signal pipe, the listener, the
//! kernel monitors, the supervisor connection and the live subscribers;
//! dead entries are compacted at the end of every pass.

use std::io::Read;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::{UnixListener, UnixStream};

use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use nix::sys::socket::{self, AddressFamily, Backlog, SockFlag, SockType, UnixAddr, sockopt};
use nix::sys::stat::{Mode, umask};
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::low_level::pipe;
use thiserror::Error;

use crate::config::Config;
use crate::monitor::{Bridge, Monitor};
use crate::paths;
use crate::source::{Source, SourceError, StreamId};
use crate::sup::SupError;

/// Subscriber traffic is single status bytes; size both directions down.
const SOCKET_BUF: usize = 2048;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("control socket setup failed: {0}")]
    Listener(#[source] std::io::Error),
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    Sup(#[from] SupError),
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
}

/// Run the daemon. Never returns on success until a shutdown signal
/// arrives. `ready_fd`, when given, receives `READY=1\n` as soon as the
/// control socket is listening and the initial state is flushed.
pub fn run(ready_fd: Option<RawFd>) -> Result<(), ServerError> {
    // nothing this process creates may be group or world accessible
    umask(Mode::from_bits_truncate(0o077));

    let config = Config::from_env();

    // self-pipe: the handler writes one byte per signal, the loop reads
    let (sig_read, sig_write) = UnixStream::pair()?;
    sig_read.set_nonblocking(true)?;
    sig_write.set_nonblocking(true)?;
    pipe::register(SIGTERM, sig_write.try_clone()?)?;
    pipe::register(SIGINT, sig_write)?;

    let listener = bind_control_socket(paths::SOCKET_PATH)?;

    let mut source = Source::new(config.dummy)?;

    let mut monitor = Monitor::new(Bridge::open(&config)?);

    // the snapshot must be in the table before anyone can subscribe, and
    // the reconciliations it generates must leave the write buffer
    for ev in source.snapshot()? {
        monitor.handle_event(&ev)?;
    }
    monitor.pump_supervisor()?;

    if let Some(fd) = ready_fd {
        signal_readiness(fd)?;
    }

    tracing::info!("entering main loop");
    event_loop(&mut monitor, &sig_read, &listener, &mut source)
}

fn bind_control_socket(path: &str) -> Result<UnixListener, ServerError> {
    let listener_err = |e: Errno| ServerError::Listener(e.into());

    let sock = socket::socket(
        AddressFamily::Unix,
        SockType::Stream,
        SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
        None,
    )
    .map_err(listener_err)?;
    if let Err(e) = socket::setsockopt(&sock, sockopt::RcvBuf, &SOCKET_BUF) {
        tracing::warn!("setsockopt SO_RCVBUF failed: {e}");
    }
    if let Err(e) = socket::setsockopt(&sock, sockopt::SndBuf, &SOCKET_BUF) {
        tracing::warn!("setsockopt SO_SNDBUF failed: {e}");
    }

    let addr = UnixAddr::new(path).map_err(listener_err)?;
    // a stale socket from a previous run would make bind fail
    let _ = std::fs::remove_file(path);
    socket::bind(sock.as_raw_fd(), &addr).map_err(listener_err)?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))
        .map_err(ServerError::Listener)?;
    socket::listen(&sock, Backlog::MAXCONN).map_err(listener_err)?;

    tracing::info!("listening on {path}");
    Ok(UnixListener::from(sock))
}

fn signal_readiness(fd: RawFd) -> Result<(), ServerError> {
    // SAFETY: the fd number was passed on the command line for exactly
    // this purpose; ownership transfers here and the drop closes it.
    let owned = unsafe { OwnedFd::from_raw_fd(fd) };
    nix::unistd::write(&owned, b"READY=1\n").map_err(|e| ServerError::Io(e.into()))?;
    Ok(())
}

fn event_loop(
    monitor: &mut Monitor,
    sig: &UnixStream,
    listener: &UnixListener,
    source: &mut Source,
) -> Result<(), ServerError> {
    loop {
        let src_fds = source.fds();
        let sup_fd = monitor.supervisor_fd();
        let sub_fds = monitor.subscriber_fds();

        let mut pfds = Vec::with_capacity(5 + sub_fds.len());
        pfds.push(PollFd::new(sig.as_fd(), PollFlags::POLLIN));
        pfds.push(PollFd::new(listener.as_fd(), PollFlags::POLLIN));
        if let Some((plain, tagged)) = src_fds {
            // SAFETY: the monitor sockets live in `source` for the whole
            // iteration; the borrow does not outlast them.
            pfds.push(PollFd::new(
                unsafe { BorrowedFd::borrow_raw(plain) },
                PollFlags::POLLIN,
            ));
            // SAFETY: as above.
            pfds.push(PollFd::new(
                unsafe { BorrowedFd::borrow_raw(tagged) },
                PollFlags::POLLIN,
            ));
        }
        // SAFETY: the supervisor connection lives in `monitor`.
        pfds.push(PollFd::new(
            unsafe { BorrowedFd::borrow_raw(sup_fd) },
            PollFlags::POLLIN,
        ));
        let subs_base = pfds.len();
        for fd in &sub_fds {
            // SAFETY: subscriber sockets are only reaped at compaction,
            // after this iteration's dispatch.
            pfds.push(PollFd::new(
                unsafe { BorrowedFd::borrow_raw(*fd) },
                PollFlags::POLLIN | PollFlags::POLLHUP,
            ));
        }

        match poll(&mut pfds, PollTimeout::NONE) {
            Ok(_) => {}
            Err(Errno::EINTR) => {
                monitor.compact_subscribers();
                continue;
            }
            Err(e) => return Err(ServerError::Io(e.into())),
        }
        let revents: Vec<PollFlags> = pfds
            .iter()
            .map(|pfd| pfd.revents().unwrap_or_else(PollFlags::empty))
            .collect();
        drop(pfds);

        // a shutdown request wins over any pending work
        if revents[0].intersects(PollFlags::POLLIN) {
            let mut buf = [0u8; 16];
            match (&*sig).read(&mut buf) {
                Ok(_) => {
                    tracing::info!("shutdown signal received");
                    return Ok(());
                }
                Err(e) => tracing::warn!("signal pipe read failed: {e}"),
            }
        }

        if revents[1].intersects(PollFlags::POLLIN) {
            accept_loop(monitor, listener);
        }

        if src_fds.is_some() {
            if revents[2].intersects(PollFlags::POLLIN)
                && let Some(ev) = source.recv(StreamId::Plain)
            {
                monitor.handle_event(&ev)?;
            }
            if revents[3].intersects(PollFlags::POLLIN)
                && let Some(ev) = source.recv(StreamId::Tagged)
            {
                monitor.handle_event(&ev)?;
            }
        }

        // dispatch whether or not the fd was readable, so requests queued
        // this iteration leave the write buffer
        monitor.pump_supervisor()?;

        for (i, fd) in sub_fds.iter().enumerate() {
            let re = revents[subs_base + i];
            if re.intersects(PollFlags::POLLHUP) {
                monitor.hangup_subscriber(*fd);
            } else if re.intersects(PollFlags::POLLIN) {
                monitor.pump_subscriber(*fd);
            }
        }

        monitor.compact_subscribers();
    }
}

fn accept_loop(monitor: &mut Monitor, listener: &UnixListener) {
    loop {
        match listener.accept() {
            Ok((stream, _)) => {
                if let Err(e) = monitor.accept_subscriber(stream) {
                    tracing::warn!("could not set up subscriber: {e}");
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                tracing::warn!("accept failed: {e}");
                break;
            }
        }
    }
}
