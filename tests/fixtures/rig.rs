//! In-process monitor harness.

use std::io::{Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;

use devmon::monitor::{Bridge, Monitor};
use devmon::proto::{WatchKind, encode_handshake};
use devmon::source::DeviceEvent;

use super::fake_sup::FakeSupervisor;

pub struct Rig {
    pub monitor: Monitor,
    pub fake: FakeSupervisor,
}

impl Rig {
    pub fn new() -> Self {
        let (ours, theirs) = UnixStream::pair().unwrap();
        let mut fake = FakeSupervisor::new(theirs);
        fake.pre_answer_anchor();
        let bridge = Bridge::from_stream(ours, "system").unwrap();
        Rig {
            monitor: Monitor::new(bridge),
            fake,
        }
    }

    pub fn apply(&mut self, ev: &DeviceEvent) {
        self.monitor.handle_event(ev).unwrap();
    }

    /// Alternate the two sides until neither has anything left to do.
    pub fn settle(&mut self) {
        let mut quiet = 0;
        for _ in 0..64 {
            let handled = self.fake.pump();
            self.monitor.pump_supervisor().unwrap();
            if handled == 0 {
                quiet += 1;
                if quiet >= 2 {
                    return;
                }
            } else {
                quiet = 0;
            }
        }
        panic!("monitor and fake supervisor never settled");
    }

    /// Connect a subscriber and complete its handshake.
    pub fn subscribe(&mut self, kind: WatchKind, query: &str) -> TestSubscriber {
        let (mut client, server) = UnixStream::pair().unwrap();
        let fd = server.as_raw_fd();
        self.monitor.accept_subscriber(server).unwrap();
        client
            .write_all(&encode_handshake(kind, query).unwrap())
            .unwrap();
        self.monitor.pump_subscriber(fd);
        client.set_nonblocking(true).unwrap();
        TestSubscriber { stream: client, fd }
    }

    /// Connect and send raw bytes instead of a well-formed handshake.
    pub fn subscribe_raw(&mut self, bytes: &[u8]) -> UnixStream {
        let (mut client, server) = UnixStream::pair().unwrap();
        let fd = server.as_raw_fd();
        self.monitor.accept_subscriber(server).unwrap();
        client.write_all(bytes).unwrap();
        self.monitor.pump_subscriber(fd);
        client.set_nonblocking(true).unwrap();
        client
    }
}

pub struct TestSubscriber {
    stream: UnixStream,
    pub fd: RawFd,
}

impl TestSubscriber {
    /// Everything the server has sent since the last call.
    pub fn drain(&mut self) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = [0u8; 64];
        loop {
            match self.stream.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => out.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => panic!("subscriber read: {e}"),
            }
        }
        out
    }

    #[track_caller]
    pub fn expect(&mut self, expected: &[u8]) {
        assert_eq!(self.drain(), expected);
    }

    pub fn send(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).unwrap();
    }
}
