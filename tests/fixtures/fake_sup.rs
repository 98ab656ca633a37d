//! A scripted service manager on the far end of a socketpair.
//!
//! Speaks the bridge codec, answers FIFO, and records everything it is
//! asked so tests can assert on the resulting dependency graph.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::io::{Read, Write};
use std::os::unix::net::UnixStream;

use devmon::sup::{
    Reply, Request, ServiceHandle, ServiceState, decode_request, encode_reply,
};

pub const ANCHOR_HANDLE: ServiceHandle = ServiceHandle(1);

pub struct FakeSupervisor {
    stream: UnixStream,
    rbuf: Vec<u8>,
    next_handle: u32,
    /// Replies already written for requests not yet read back.
    pre_answered: usize,
    /// Every request seen, in order.
    pub log: Vec<Request>,
    /// Live handle to service name.
    pub loaded: HashMap<u32, String>,
    /// Services that reply "not found" on load.
    pub missing: HashSet<String>,
    /// Services already started when loaded (no wake expected).
    pub started: HashSet<String>,
    /// Current dependency edges, by service name.
    pub edges: BTreeSet<(String, String)>,
    /// Emit a start event after each wake; on by default.
    pub start_on_wake: bool,
    /// Service names woken, in order.
    pub woken: Vec<String>,
}

impl FakeSupervisor {
    pub fn new(stream: UnixStream) -> Self {
        stream.set_nonblocking(true).unwrap();
        Self {
            stream,
            rbuf: Vec::new(),
            next_handle: ANCHOR_HANDLE.0 + 1,
            pre_answered: 0,
            log: Vec::new(),
            loaded: HashMap::new(),
            missing: HashSet::new(),
            started: HashSet::new(),
            edges: BTreeSet::new(),
            start_on_wake: true,
            woken: Vec::new(),
        }
    }

    /// The bridge loads its anchor synchronously before anything else
    /// runs; put the reply on the wire ahead of time.
    pub fn pre_answer_anchor(&mut self) {
        self.write_reply(Reply::Handle(ANCHOR_HANDLE, ServiceState::Started));
        self.pre_answered += 1;
    }

    /// Read and answer everything currently on the wire; returns how many
    /// requests were handled.
    pub fn pump(&mut self) -> usize {
        let mut buf = [0u8; 4096];
        loop {
            match self.stream.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => self.rbuf.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => panic!("fake supervisor read: {e}"),
            }
        }
        let mut handled = 0;
        while let Some((request, used)) = decode_request(&self.rbuf).unwrap() {
            self.rbuf.drain(..used);
            self.handle(request);
            handled += 1;
        }
        handled
    }

    fn handle(&mut self, request: Request) {
        self.log.push(request.clone());
        if self.pre_answered > 0 {
            self.pre_answered -= 1;
            if let Request::Load { name, .. } = &request {
                self.loaded.insert(ANCHOR_HANDLE.0, name.clone());
            }
            return;
        }
        match request {
            Request::Load { name, .. } => {
                if self.missing.contains(&name) {
                    self.write_reply(Reply::NotFound);
                    return;
                }
                let handle = ServiceHandle(self.next_handle);
                self.next_handle += 1;
                let state = if self.started.contains(&name) {
                    ServiceState::Started
                } else {
                    ServiceState::Stopped
                };
                self.loaded.insert(handle.0, name);
                self.write_reply(Reply::Handle(handle, state));
            }
            Request::AddDep { from, to, .. } => {
                let edge = (self.name_of(from), self.name_of(to));
                self.edges.insert(edge);
                self.write_reply(Reply::Ack);
            }
            Request::RmDep { from, to, .. } => {
                let edge = (self.name_of(from), self.name_of(to));
                self.edges.remove(&edge);
                self.write_reply(Reply::Ack);
            }
            Request::Wake(handle) => {
                self.woken.push(self.name_of(handle));
                self.write_reply(Reply::Ack);
                if self.start_on_wake {
                    self.write_reply(Reply::ServiceEvent(handle, ServiceState::Started));
                }
            }
            Request::Close(handle) => {
                self.loaded.remove(&handle.0);
                self.write_reply(Reply::Ack);
            }
        }
    }

    fn name_of(&self, handle: ServiceHandle) -> String {
        self.loaded
            .get(&handle.0)
            .cloned()
            .unwrap_or_else(|| format!("<handle {}>", handle.0))
    }

    fn write_reply(&mut self, reply: Reply) {
        let mut out = Vec::new();
        encode_reply(reply, &mut out);
        self.stream.write_all(&out).unwrap();
    }

    pub fn has_edge(&self, from: &str, to: &str) -> bool {
        self.edges.contains(&(from.to_string(), to.to_string()))
    }
}
