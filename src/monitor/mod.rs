//! The monitor core.
//!
//! One `Monitor` value owns the device table, the live subscriber
//! sessions and the supervisor bridge; the event loop feeds it kernel
//! observations, subscriber reads and supervisor completions. All state
//! lives here so nothing is global and nothing is shared across threads.

mod reconcile;
mod subscriber;

use std::collections::HashMap;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;

use crate::config::Config;
use crate::device::{DeviceTable, IdentityDrop, Observed, node_matches, parse_service_list};
use crate::proto::{STATUS_ABSENT, STATUS_PRESENT, Watch, WatchKind};
use crate::source::{Action, DeviceEvent};
use crate::sup::{ServiceHandle, SupConn, SupError};

pub(crate) use reconcile::OpCtx;
pub use subscriber::Subscriber;
use subscriber::Pump;

/// The supervisor side of the monitor: the persistent connection, the
/// anchor every device pseudo-service hangs off, and the services whose
/// start we are waiting on (handle to owning device key).
pub struct Bridge {
    pub(crate) conn: SupConn<OpCtx>,
    pub(crate) anchor: ServiceHandle,
    pub(crate) start_waits: HashMap<ServiceHandle, String>,
}

impl Bridge {
    /// Connect per the environment: an inherited control fd when the init
    /// handed one down, the system socket otherwise. Pins the anchor
    /// service handle for the life of the process.
    pub fn open(config: &Config) -> Result<Self, SupError> {
        let conn = match config.supervisor_fd {
            Some(fd) => SupConn::from_env_fd(fd)?,
            None => SupConn::open(crate::paths::SUPERVISOR_SOCKET)?,
        };
        Self::with_conn(conn, &config.anchor_service)
    }

    /// Bridge over an already-connected stream.
    pub fn from_stream(stream: UnixStream, anchor_service: &str) -> Result<Self, SupError> {
        Self::with_conn(SupConn::from_stream(stream)?, anchor_service)
    }

    fn with_conn(mut conn: SupConn<OpCtx>, anchor_service: &str) -> Result<Self, SupError> {
        tracing::info!("locate anchor service '{anchor_service}'");
        let (anchor, _) = conn.load_blocking(anchor_service, false)?;
        Ok(Self {
            conn,
            anchor,
            start_waits: HashMap::new(),
        })
    }
}

pub struct Monitor {
    table: DeviceTable,
    subscribers: Vec<Subscriber>,
    bridge: Bridge,
}

impl Monitor {
    pub fn new(bridge: Bridge) -> Self {
        Self {
            table: DeviceTable::new(),
            subscribers: Vec::new(),
            bridge,
        }
    }

    pub fn table(&self) -> &DeviceTable {
        &self.table
    }

    pub fn supervisor_fd(&self) -> RawFd {
        self.bridge.conn.as_raw_fd()
    }

    /// Feed one kernel observation through the table and on to the
    /// supervisor integration. Supervisor failures here are fatal.
    pub fn handle_event(&mut self, ev: &DeviceEvent) -> Result<(), SupError> {
        let observed = match ev.action {
            Action::Add => self.table.observe_add(ev),
            Action::Change => self.table.observe_change(ev),
            Action::Remove => self.table.observe_remove(ev),
        };
        let Observed::Touched { key, dropped } = observed else {
            return Ok(());
        };

        let dev = self.table.get_mut(&key).expect("touched entries exist");
        if ev.tagged {
            dev.has_tag = true;
        }
        let has_tag = dev.has_tag;
        let removed = dev.removed;

        for drop in &dropped {
            publish_drop(&self.table, &mut self.subscribers, drop, &key);
        }

        if !has_tag {
            // no supervision involvement: presence is published directly
            publish_presence(&self.table, &mut self.subscribers, &key, !removed);
            return Ok(());
        }

        let desired = if removed {
            Default::default()
        } else {
            parse_service_list(ev.waits_for.as_deref().unwrap_or(""))
        };
        let dev = self.table.get_mut(&key).expect("touched entries exist");
        dev.next_deps = desired;
        dev.pending = true;
        if !dev.processing {
            self.start_reconciliation(&key)?;
        }
        Ok(())
    }

    // ---- subscriber sessions -------------------------------------------

    pub fn accept_subscriber(&mut self, stream: UnixStream) -> std::io::Result<()> {
        stream.set_nonblocking(true)?;
        tracing::debug!("accepted subscriber fd {}", stream.as_raw_fd());
        self.subscribers.push(Subscriber::new(stream));
        Ok(())
    }

    pub fn subscriber_fds(&self) -> Vec<RawFd> {
        self.subscribers.iter().map(Subscriber::fd).collect()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// The peer hung up; the record is reaped at compaction.
    pub fn hangup_subscriber(&mut self, fd: RawFd) {
        if let Some(sub) = self.subscribers.iter_mut().find(|s| s.fd() == fd) {
            tracing::debug!("subscriber fd {fd} hung up");
            sub.mark_dead();
        }
    }

    /// Drive reads on one subscriber; on handshake completion, answer
    /// with the current presence of the queried device.
    pub fn pump_subscriber(&mut self, fd: RawFd) {
        let Some(sub) = self.subscribers.iter_mut().find(|s| s.fd() == fd) else {
            return;
        };
        match sub.pump() {
            Pump::Pending | Pump::Dead => {}
            Pump::Established => {
                let watch = sub.watch().cloned().expect("established watch");
                let status = initial_status(&self.table, &watch);
                tracing::info!(
                    "send status {status} for {} '{}' to fd {fd}",
                    watch.kind,
                    watch.query
                );
                // borrow of `sub` ended above; look it up again to write
                if let Some(sub) = self.subscribers.iter_mut().find(|s| s.fd() == fd) {
                    sub.send(status);
                }
            }
        }
    }

    /// Reap dead sessions; called at the end of each poll iteration.
    pub fn compact_subscribers(&mut self) {
        self.subscribers.retain(|sub| !sub.is_dead());
    }
}

/// First byte for a fresh subscriber: present only if the device is known,
/// not removed, and not mid-reconciliation (a device being reconciled is
/// announced once its dependencies are in place).
fn initial_status(table: &DeviceTable, watch: &Watch) -> u8 {
    match table.resolve(watch.kind, &watch.query) {
        Some(key) => match table.get(&key) {
            Some(dev) if !dev.removed && !dev.processing => STATUS_PRESENT,
            _ => STATUS_ABSENT,
        },
        None => STATUS_ABSENT,
    }
}

/// Fan a device's presence out to every matching subscriber.
pub(crate) fn publish_presence(
    table: &DeviceTable,
    subs: &mut [Subscriber],
    key: &str,
    present: bool,
) {
    let Some(dev) = table.get(key) else {
        return;
    };
    let status = if present {
        STATUS_PRESENT
    } else {
        STATUS_ABSENT
    };
    tracing::info!("ready {status} for '{key}'");
    if dev.is_usb() {
        // USB aggregates are only addressable by their vendor:product id
        fan_out(table, subs, WatchKind::Usb, key, status, key);
        return;
    }
    fan_out(table, subs, WatchKind::Sys, &dev.syspath, status, key);
    if dev.is_net() {
        if !dev.name.is_empty() {
            fan_out(table, subs, WatchKind::Netif, &dev.name, status, key);
        }
        if !dev.mac.is_empty() {
            fan_out(table, subs, WatchKind::Mac, &dev.mac, status, key);
        }
    } else if !dev.name.is_empty() {
        fan_out(table, subs, WatchKind::Dev, &dev.name, status, key);
    }
}

/// Announce a renamed identity as absent.
pub(crate) fn publish_drop(
    table: &DeviceTable,
    subs: &mut [Subscriber],
    dropped: &IdentityDrop,
    key: &str,
) {
    match dropped {
        IdentityDrop::Node(node) => fan_out(table, subs, WatchKind::Dev, node, STATUS_ABSENT, key),
        IdentityDrop::Ifname(name) => {
            fan_out(table, subs, WatchKind::Netif, name, STATUS_ABSENT, key)
        }
        IdentityDrop::Mac(mac) => fan_out(table, subs, WatchKind::Mac, mac, STATUS_ABSENT, key),
    }
}

fn fan_out(
    table: &DeviceTable,
    subs: &mut [Subscriber],
    kind: WatchKind,
    value: &str,
    status: u8,
    key: &str,
) {
    if status == STATUS_ABSENT {
        // a late absence must not clobber an identity that has already
        // moved on to another device
        let owner = match kind {
            WatchKind::Dev => table.node_owner(value),
            WatchKind::Netif => table.ifname_owner(value),
            WatchKind::Mac => table.mac_owner(value),
            WatchKind::Sys | WatchKind::Usb => None,
        };
        if owner.is_some_and(|owner| owner != key) {
            return;
        }
    }
    for sub in subs.iter_mut() {
        let hit = match sub.watch() {
            Some(watch) if watch.kind == kind => match kind {
                WatchKind::Dev => node_matches(&watch.query, value),
                _ => watch.query == value,
            },
            _ => false,
        };
        if hit {
            sub.send(status);
        }
    }
}
