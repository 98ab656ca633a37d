//! One subscriber session.
//!
//! A session owns its accepted socket; dropping the record closes the
//! fd, so every exit path releases the connection. The server never
//! closes a well-formed session on its own: `dead` is only set by peer
//! hangup, protocol violations, or write failures.

use std::io::{Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;

use crate::proto::{Handshake, Watch};

pub struct Subscriber {
    stream: UnixStream,
    handshake: Handshake,
    watch: Option<Watch>,
    last_sent: Option<u8>,
    dead: bool,
}

/// What a round of reads produced.
pub(crate) enum Pump {
    /// Waiting for more handshake bytes.
    Pending,
    /// Handshake just completed; the initial status byte is owed.
    Established,
    /// Session is over; reap at compaction.
    Dead,
}

impl Subscriber {
    pub fn new(stream: UnixStream) -> Self {
        Self {
            stream,
            handshake: Handshake::new(),
            watch: None,
            last_sent: None,
            dead: false,
        }
    }

    pub fn fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    pub fn watch(&self) -> Option<&Watch> {
        self.watch.as_ref()
    }

    pub fn is_dead(&self) -> bool {
        self.dead
    }

    pub fn mark_dead(&mut self) {
        self.dead = true;
    }

    /// Drive the handshake with whatever bytes have arrived.
    pub(crate) fn pump(&mut self) -> Pump {
        if self.dead {
            return Pump::Dead;
        }
        let mut buf = [0u8; 256];
        loop {
            match self.stream.read(&mut buf) {
                Ok(0) => {
                    self.dead = true;
                    return Pump::Dead;
                }
                Ok(n) => {
                    if self.watch.is_some() {
                        // nothing further is ever expected from the peer
                        tracing::warn!("junk received from subscriber fd {}", self.fd());
                        self.dead = true;
                        return Pump::Dead;
                    }
                    match self.handshake.advance(&buf[..n]) {
                        Ok(Some(watch)) => {
                            self.watch = Some(watch);
                            return Pump::Established;
                        }
                        Ok(None) => continue,
                        Err(err) => {
                            tracing::warn!("invalid handshake from fd {}: {err}", self.fd());
                            self.dead = true;
                            return Pump::Dead;
                        }
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Pump::Pending,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::warn!("read failed for subscriber fd {}: {e}", self.fd());
                    self.dead = true;
                    return Pump::Dead;
                }
            }
        }
    }

    /// Write a status byte, suppressing repeats of the current state so a
    /// subscriber sees exactly one byte per observable transition.
    pub(crate) fn send(&mut self, status: u8) {
        if self.dead || self.last_sent == Some(status) {
            return;
        }
        match self.stream.write(&[status]) {
            Ok(1) => self.last_sent = Some(status),
            Ok(_) | Err(_) => {
                tracing::warn!("write failed for subscriber fd {}", self.fd());
                self.dead = true;
            }
        }
    }
}
