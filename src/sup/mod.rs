//! Supervisor bridge: an asynchronous client of the service manager.
//!
//! The connection is persistent and nonblocking. Requests are queued into
//! a write buffer together with a caller-supplied completion context;
//! because the manager answers strictly in order, contexts are matched to
//! replies FIFO and no request ids exist on the wire. `dispatch` drains
//! the write buffer and decodes whatever has arrived, never blocking.
//!
//! Any I/O failure on this connection is fatal to the daemon: the bridge
//! is the one collaborator the monitor cannot degrade without.

mod codec;

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;

use nix::fcntl::{FcntlArg, fcntl};
use thiserror::Error;

pub use codec::{
    CodecError, DepType, Reply, Request, ServiceHandle, ServiceState, decode_reply,
    decode_request, encode_reply,
};

#[derive(Debug, Error)]
pub enum SupError {
    #[error("supervisor i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("supervisor closed the control connection")]
    Disconnected,
    #[error("reply received with no request outstanding")]
    UnexpectedReply,
    #[error("reply does not match the outstanding request")]
    ReplyMismatch,
    #[error("anchor service '{0}' could not be loaded")]
    AnchorUnavailable(String),
    #[error("fd {0} from the environment is not an open file descriptor")]
    BadFd(RawFd),
}

/// A completion delivered by `dispatch`.
#[derive(Debug)]
pub enum SupEvent<C> {
    /// The oldest outstanding request finished; `C` is the context it was
    /// queued with.
    Reply(C, Reply),
    /// A service changed state.
    ServiceEvent(ServiceHandle, ServiceState),
}

/// The persistent manager connection, generic over the completion
/// context attached to each request.
pub struct SupConn<C> {
    stream: UnixStream,
    wbuf: Vec<u8>,
    wpos: usize,
    rbuf: Vec<u8>,
    pending: VecDeque<C>,
}

impl<C> SupConn<C> {
    pub fn open(path: &str) -> Result<Self, SupError> {
        let stream = UnixStream::connect(path)?;
        Self::from_stream(stream)
    }

    /// Adopt a connection handed down through the environment.
    pub fn from_env_fd(fd: RawFd) -> Result<Self, SupError> {
        if fd < 0 {
            return Err(SupError::BadFd(fd));
        }
        if fcntl(fd, FcntlArg::F_GETFD).is_err() {
            return Err(SupError::BadFd(fd));
        }
        // SAFETY: checked open above; the environment contract hands this
        // process exclusive ownership of the descriptor.
        let owned = unsafe { OwnedFd::from_raw_fd(fd) };
        Self::from_stream(UnixStream::from(owned))
    }

    pub fn from_stream(stream: UnixStream) -> Result<Self, SupError> {
        stream.set_nonblocking(true)?;
        Ok(Self {
            stream,
            wbuf: Vec::new(),
            wpos: 0,
            rbuf: Vec::new(),
            pending: VecDeque::new(),
        })
    }

    pub fn as_fd(&self) -> BorrowedFd<'_> {
        self.stream.as_fd()
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    /// Queue a request with its completion context and push bytes out if
    /// the socket will take them.
    pub fn send(&mut self, request: &Request, ctx: C) -> Result<(), SupError> {
        request.encode(&mut self.wbuf);
        self.pending.push_back(ctx);
        self.flush()
    }

    /// Bytes still waiting to leave the write buffer.
    pub fn write_pending(&self) -> bool {
        self.wpos < self.wbuf.len()
    }

    /// Requests whose replies have not arrived yet.
    pub fn inflight(&self) -> usize {
        self.pending.len()
    }

    fn flush(&mut self) -> Result<(), SupError> {
        while self.wpos < self.wbuf.len() {
            match self.stream.write(&self.wbuf[self.wpos..]) {
                Ok(0) => return Err(SupError::Disconnected),
                Ok(n) => self.wpos += n,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        if self.wpos == self.wbuf.len() {
            self.wbuf.clear();
            self.wpos = 0;
        }
        Ok(())
    }

    /// Drive outstanding I/O: flush queued requests, read whatever the
    /// manager has sent, and decode it into completions. Never blocks.
    pub fn dispatch(&mut self) -> Result<Vec<SupEvent<C>>, SupError> {
        self.flush()?;
        let mut buf = [0u8; 4096];
        loop {
            match self.stream.read(&mut buf) {
                Ok(0) => return Err(SupError::Disconnected),
                Ok(n) => self.rbuf.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        let mut events = Vec::new();
        let mut consumed = 0;
        while let Some((reply, used)) = decode_reply(&self.rbuf[consumed..])? {
            consumed += used;
            match reply {
                Reply::ServiceEvent(handle, state) => {
                    events.push(SupEvent::ServiceEvent(handle, state));
                }
                other => {
                    let ctx = self.pending.pop_front().ok_or(SupError::UnexpectedReply)?;
                    events.push(SupEvent::Reply(ctx, other));
                }
            }
        }
        self.rbuf.drain(..consumed);
        Ok(events)
    }

    /// Load a service and wait for its handle. Only used during startup,
    /// before any other request is in flight.
    pub fn load_blocking(
        &mut self,
        name: &str,
        reload: bool,
    ) -> Result<(ServiceHandle, ServiceState), SupError> {
        debug_assert!(self.pending.is_empty() && !self.write_pending());
        self.stream.set_nonblocking(false)?;
        let mut wire = Vec::new();
        Request::Load {
            name: name.to_string(),
            reload,
        }
        .encode(&mut wire);
        self.stream.write_all(&wire)?;
        let result = self.read_load_reply(name);
        self.stream.set_nonblocking(true)?;
        result
    }

    fn read_load_reply(&mut self, name: &str) -> Result<(ServiceHandle, ServiceState), SupError> {
        let mut buf = [0u8; 4096];
        loop {
            while let Some((reply, used)) = decode_reply(&self.rbuf)? {
                self.rbuf.drain(..used);
                match reply {
                    Reply::Handle(handle, state) => return Ok((handle, state)),
                    Reply::NotFound => {
                        return Err(SupError::AnchorUnavailable(name.to_string()));
                    }
                    // Nothing is started on our behalf yet; drop strays.
                    Reply::ServiceEvent(..) => continue,
                    Reply::Ack => return Err(SupError::UnexpectedReply),
                }
            }
            match self.stream.read(&mut buf) {
                Ok(0) => return Err(SupError::Disconnected),
                Ok(n) => self.rbuf.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }
}
