//! Subscriber wire protocol.
//!
//! A subscriber opens a stream connection and sends one handshake: a magic
//! byte (0xDD), a six byte NUL-padded kind string, a zero separator byte,
//! a 16-bit little-endian payload length and the payload itself (no NUL
//! terminator). Once the handshake completes the server answers with
//! single status bytes: 0x01 for present, 0x00 for absent. The first byte
//! reflects current knowledge; later bytes are sent on transitions only.
//! Any deviation from the framing terminates the session.

use thiserror::Error;

pub const MAGIC: u8 = 0xDD;
pub const HEADER_LEN: usize = 8;
pub const KIND_LEN: usize = 6;

pub const STATUS_ABSENT: u8 = 0x00;
pub const STATUS_PRESENT: u8 = 0x01;

/// What a subscriber is watching for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WatchKind {
    /// A device node path under `/dev`.
    Dev,
    /// A kernel syspath.
    Sys,
    /// A network interface name.
    Netif,
    /// A network interface hardware address.
    Mac,
    /// A `vendor:product` USB identifier.
    Usb,
}

impl WatchKind {
    pub fn as_str(self) -> &'static str {
        match self {
            WatchKind::Dev => "dev",
            WatchKind::Sys => "sys",
            WatchKind::Netif => "netif",
            WatchKind::Mac => "mac",
            WatchKind::Usb => "usb",
        }
    }

    /// Parse the NUL-padded kind field; bytes past the first NUL are
    /// ignored, as with any C string.
    fn from_wire(field: &[u8]) -> Option<Self> {
        let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
        match &field[..end] {
            b"dev" => Some(WatchKind::Dev),
            b"sys" => Some(WatchKind::Sys),
            b"netif" => Some(WatchKind::Netif),
            b"mac" => Some(WatchKind::Mac),
            b"usb" => Some(WatchKind::Usb),
            _ => None,
        }
    }
}

impl std::fmt::Display for WatchKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A completed handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Watch {
    pub kind: WatchKind,
    pub query: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtoError {
    #[error("bad magic byte 0x{0:02x}")]
    BadMagic(u8),
    #[error("nonzero separator byte 0x{0:02x}")]
    BadSeparator(u8),
    #[error("unknown watch kind")]
    UnknownKind,
    #[error("zero-length query")]
    ZeroLength,
    #[error("query exceeds protocol limit ({0} bytes)")]
    QueryTooLong(usize),
    #[error("query is not valid UTF-8")]
    InvalidQuery,
    #[error("data received past end of handshake")]
    TrailingData,
}

/// Encode a complete handshake for the client side.
pub fn encode_handshake(kind: WatchKind, query: &str) -> Result<Vec<u8>, ProtoError> {
    if query.is_empty() {
        return Err(ProtoError::ZeroLength);
    }
    let len = u16::try_from(query.len()).map_err(|_| ProtoError::QueryTooLong(query.len()))?;
    let mut out = Vec::with_capacity(HEADER_LEN + 2 + query.len());
    out.push(MAGIC);
    let mut field = [0u8; KIND_LEN];
    let name = kind.as_str().as_bytes();
    field[..name.len()].copy_from_slice(name);
    out.extend_from_slice(&field);
    out.push(0);
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(query.as_bytes());
    Ok(out)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Header,
    Length,
    Payload,
    Done,
}

/// Incremental parser for the subscriber handshake.
///
/// The wire format does not require atomic framing, so the server
/// accumulates partial reads until each stage is satisfied.
#[derive(Debug)]
pub struct Handshake {
    stage: Stage,
    header: [u8; HEADER_LEN],
    filled: usize,
    len_buf: [u8; 2],
    len_filled: usize,
    kind: Option<WatchKind>,
    want: usize,
    payload: Vec<u8>,
}

impl Default for Handshake {
    fn default() -> Self {
        Self::new()
    }
}

impl Handshake {
    pub fn new() -> Self {
        Self {
            stage: Stage::Header,
            header: [0; HEADER_LEN],
            filled: 0,
            len_buf: [0; 2],
            len_filled: 0,
            kind: None,
            want: 0,
            payload: Vec::new(),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.stage == Stage::Done
    }

    /// Feed received bytes into the state machine. Returns the completed
    /// watch once the full handshake has arrived. Bytes past the end of
    /// the handshake are a protocol error.
    pub fn advance(&mut self, mut buf: &[u8]) -> Result<Option<Watch>, ProtoError> {
        while !buf.is_empty() {
            match self.stage {
                Stage::Header => {
                    let take = buf.len().min(HEADER_LEN - self.filled);
                    self.header[self.filled..self.filled + take].copy_from_slice(&buf[..take]);
                    self.filled += take;
                    buf = &buf[take..];
                    if self.filled < HEADER_LEN {
                        continue;
                    }
                    if self.header[0] != MAGIC {
                        return Err(ProtoError::BadMagic(self.header[0]));
                    }
                    let sep = self.header[HEADER_LEN - 1];
                    if sep != 0 {
                        return Err(ProtoError::BadSeparator(sep));
                    }
                    self.kind = Some(
                        WatchKind::from_wire(&self.header[1..1 + KIND_LEN])
                            .ok_or(ProtoError::UnknownKind)?,
                    );
                    self.stage = Stage::Length;
                }
                Stage::Length => {
                    let take = buf.len().min(2 - self.len_filled);
                    self.len_buf[self.len_filled..self.len_filled + take]
                        .copy_from_slice(&buf[..take]);
                    self.len_filled += take;
                    buf = &buf[take..];
                    if self.len_filled < 2 {
                        continue;
                    }
                    let len = u16::from_le_bytes(self.len_buf);
                    if len == 0 {
                        return Err(ProtoError::ZeroLength);
                    }
                    self.want = usize::from(len);
                    self.payload = Vec::with_capacity(self.want);
                    self.stage = Stage::Payload;
                }
                Stage::Payload => {
                    let take = buf.len().min(self.want - self.payload.len());
                    self.payload.extend_from_slice(&buf[..take]);
                    buf = &buf[take..];
                    if self.payload.len() < self.want {
                        continue;
                    }
                    self.stage = Stage::Done;
                    if !buf.is_empty() {
                        return Err(ProtoError::TrailingData);
                    }
                    return Ok(Some(self.finish()?));
                }
                Stage::Done => return Err(ProtoError::TrailingData),
            }
        }
        Ok(None)
    }

    fn finish(&mut self) -> Result<Watch, ProtoError> {
        let query = String::from_utf8(std::mem::take(&mut self.payload))
            .map_err(|_| ProtoError::InvalidQuery)?;
        Ok(Watch {
            // kind was validated when the header completed
            kind: self.kind.expect("handshake header complete"),
            query,
        })
    }
}
