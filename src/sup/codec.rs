//! Framed codec for the service-manager control connection.
//!
//! Both directions carry frames of `opcode (1) | payload length (2, LE) |
//! payload`. Requests receive exactly one reply each, in order; the
//! manager may interleave unsolicited service-state event frames at any
//! point. Handles are 32-bit tokens minted by the manager and valid until
//! explicitly closed.

use thiserror::Error;

// Requests.
pub const OP_LOAD: u8 = 0x01;
pub const OP_ADD_DEP: u8 = 0x02;
pub const OP_RM_DEP: u8 = 0x03;
pub const OP_WAKE: u8 = 0x04;
pub const OP_CLOSE: u8 = 0x05;

// Replies.
pub const RP_ACK: u8 = 0x10;
pub const RP_NOT_FOUND: u8 = 0x11;
pub const RP_HANDLE: u8 = 0x12;

// Unsolicited.
pub const RP_SERVICE_EVENT: u8 = 0x20;

/// Opaque reference to a loaded service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServiceHandle(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Stopped,
    Starting,
    Started,
    Stopping,
}

impl ServiceState {
    pub fn from_wire(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(ServiceState::Stopped),
            1 => Some(ServiceState::Starting),
            2 => Some(ServiceState::Started),
            3 => Some(ServiceState::Stopping),
            _ => None,
        }
    }

    pub fn to_wire(self) -> u8 {
        match self {
            ServiceState::Stopped => 0,
            ServiceState::Starting => 1,
            ServiceState::Started => 2,
            ServiceState::Stopping => 3,
        }
    }
}

/// Dependency flavor carried on the wire. The monitor only ever creates
/// `waits-for` edges, which neither fail nor stop the dependent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepType {
    WaitsFor,
}

impl DepType {
    pub fn to_wire(self) -> u8 {
        match self {
            DepType::WaitsFor => 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Load {
        name: String,
        reload: bool,
    },
    AddDep {
        from: ServiceHandle,
        to: ServiceHandle,
        dep: DepType,
        enable: bool,
    },
    RmDep {
        from: ServiceHandle,
        to: ServiceHandle,
        dep: DepType,
    },
    Wake(ServiceHandle),
    Close(ServiceHandle),
}

impl Request {
    pub fn encode(&self, out: &mut Vec<u8>) {
        match self {
            Request::Load { name, reload } => {
                let len = 1 + name.len();
                frame_header(out, OP_LOAD, len);
                out.push(u8::from(*reload));
                out.extend_from_slice(name.as_bytes());
            }
            Request::AddDep {
                from,
                to,
                dep,
                enable,
            } => {
                frame_header(out, OP_ADD_DEP, 10);
                out.extend_from_slice(&from.0.to_le_bytes());
                out.extend_from_slice(&to.0.to_le_bytes());
                out.push(dep.to_wire());
                out.push(u8::from(*enable));
            }
            Request::RmDep { from, to, dep } => {
                frame_header(out, OP_RM_DEP, 9);
                out.extend_from_slice(&from.0.to_le_bytes());
                out.extend_from_slice(&to.0.to_le_bytes());
                out.push(dep.to_wire());
            }
            Request::Wake(handle) => {
                frame_header(out, OP_WAKE, 4);
                out.extend_from_slice(&handle.0.to_le_bytes());
            }
            Request::Close(handle) => {
                frame_header(out, OP_CLOSE, 4);
                out.extend_from_slice(&handle.0.to_le_bytes());
            }
        }
    }
}

fn frame_header(out: &mut Vec<u8>, op: u8, len: usize) {
    debug_assert!(len <= usize::from(u16::MAX));
    out.push(op);
    out.extend_from_slice(&(len as u16).to_le_bytes());
}

/// A frame received from the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    /// Request completed.
    Ack,
    /// `Load` target does not exist; not an error.
    NotFound,
    /// `Load` completed with a handle and the service's current state.
    Handle(ServiceHandle, ServiceState),
    /// Unsolicited: a service changed state.
    ServiceEvent(ServiceHandle, ServiceState),
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("unknown reply opcode 0x{0:02x}")]
    UnknownOpcode(u8),
    #[error("reply payload malformed for opcode 0x{op:02x} (len {len})")]
    BadPayload { op: u8, len: usize },
}

/// Decode one reply frame from the front of `buf`. Returns the frame and
/// the number of bytes consumed, or `None` when the frame is incomplete.
pub fn decode_reply(buf: &[u8]) -> Result<Option<(Reply, usize)>, CodecError> {
    if buf.len() < 3 {
        return Ok(None);
    }
    let op = buf[0];
    let len = usize::from(u16::from_le_bytes([buf[1], buf[2]]));
    if buf.len() < 3 + len {
        return Ok(None);
    }
    let payload = &buf[3..3 + len];
    let reply = match op {
        RP_ACK => expect_empty(op, payload, Reply::Ack)?,
        RP_NOT_FOUND => expect_empty(op, payload, Reply::NotFound)?,
        RP_HANDLE => {
            let (handle, state) = handle_state(op, payload)?;
            Reply::Handle(handle, state)
        }
        RP_SERVICE_EVENT => {
            let (handle, state) = handle_state(op, payload)?;
            Reply::ServiceEvent(handle, state)
        }
        other => return Err(CodecError::UnknownOpcode(other)),
    };
    Ok(Some((reply, 3 + len)))
}

fn expect_empty(op: u8, payload: &[u8], reply: Reply) -> Result<Reply, CodecError> {
    if payload.is_empty() {
        Ok(reply)
    } else {
        Err(CodecError::BadPayload {
            op,
            len: payload.len(),
        })
    }
}

fn handle_state(op: u8, payload: &[u8]) -> Result<(ServiceHandle, ServiceState), CodecError> {
    if payload.len() != 5 {
        return Err(CodecError::BadPayload {
            op,
            len: payload.len(),
        });
    }
    let handle = ServiceHandle(u32::from_le_bytes([
        payload[0], payload[1], payload[2], payload[3],
    ]));
    let state = ServiceState::from_wire(payload[4]).ok_or(CodecError::BadPayload {
        op,
        len: payload.len(),
    })?;
    Ok((handle, state))
}

/// Encode a reply frame; the daemon itself never sends these, but test
/// doubles standing in for the manager do.
pub fn encode_reply(reply: Reply, out: &mut Vec<u8>) {
    match reply {
        Reply::Ack => frame_header(out, RP_ACK, 0),
        Reply::NotFound => frame_header(out, RP_NOT_FOUND, 0),
        Reply::Handle(handle, state) => {
            frame_header(out, RP_HANDLE, 5);
            out.extend_from_slice(&handle.0.to_le_bytes());
            out.push(state.to_wire());
        }
        Reply::ServiceEvent(handle, state) => {
            frame_header(out, RP_SERVICE_EVENT, 5);
            out.extend_from_slice(&handle.0.to_le_bytes());
            out.push(state.to_wire());
        }
    }
}

/// Decode one request frame; used by test doubles.
pub fn decode_request(buf: &[u8]) -> Result<Option<(Request, usize)>, CodecError> {
    if buf.len() < 3 {
        return Ok(None);
    }
    let op = buf[0];
    let len = usize::from(u16::from_le_bytes([buf[1], buf[2]]));
    if buf.len() < 3 + len {
        return Ok(None);
    }
    let payload = &buf[3..3 + len];
    let bad = || CodecError::BadPayload {
        op,
        len: payload.len(),
    };
    let request = match op {
        OP_LOAD => {
            if payload.is_empty() {
                return Err(bad());
            }
            let name = String::from_utf8(payload[1..].to_vec()).map_err(|_| bad())?;
            Request::Load {
                name,
                reload: payload[0] != 0,
            }
        }
        OP_ADD_DEP => {
            if payload.len() != 10 {
                return Err(bad());
            }
            Request::AddDep {
                from: handle_at(payload, 0),
                to: handle_at(payload, 4),
                dep: DepType::WaitsFor,
                enable: payload[9] != 0,
            }
        }
        OP_RM_DEP => {
            if payload.len() != 9 {
                return Err(bad());
            }
            Request::RmDep {
                from: handle_at(payload, 0),
                to: handle_at(payload, 4),
                dep: DepType::WaitsFor,
            }
        }
        OP_WAKE => {
            if payload.len() != 4 {
                return Err(bad());
            }
            Request::Wake(handle_at(payload, 0))
        }
        OP_CLOSE => {
            if payload.len() != 4 {
                return Err(bad());
            }
            Request::Close(handle_at(payload, 0))
        }
        other => return Err(CodecError::UnknownOpcode(other)),
    };
    Ok(Some((request, 3 + len)))
}

fn handle_at(payload: &[u8], at: usize) -> ServiceHandle {
    ServiceHandle(u32::from_le_bytes([
        payload[at],
        payload[at + 1],
        payload[at + 2],
        payload[at + 3],
    ]))
}
