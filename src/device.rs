//! Canonical device table and lookup indices.
//!
//! The table owns every `Device`; the four secondary indices (device
//! node, interface name, hardware address, USB device number) store the
//! owning key, never a reference into the map. USB devices aggregate
//! under a synthetic `vendor:product` key and stay live until every
//! kernel device number sharing that identity has been removed.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fs;

use crate::source::DeviceEvent;
use crate::sup::ServiceHandle;

pub type DevNum = libc::dev_t;

/// One entry in the canonical table.
#[derive(Debug)]
pub struct Device {
    /// Table key: kernel syspath, or `vendor:product` for USB.
    pub syspath: String,
    pub subsystem: String,
    /// Device node path, or interface name for net; may be empty. Kept
    /// across removal so the final absence can still be fanned out.
    pub name: String,
    /// Hardware address for net; empty otherwise.
    pub mac: String,
    /// Kernel device numbers aliasing to this USB identity.
    pub usb_ids: HashSet<DevNum>,
    /// The device carried the supervision tag at some point; sticky.
    pub has_tag: bool,
    /// Services currently registered as `waits-for` dependencies.
    pub current_deps: BTreeSet<String>,
    /// Services the in-flight reconciliation is applying.
    pub pending_deps: BTreeSet<String>,
    /// Services queued while a reconciliation is in progress.
    pub next_deps: BTreeSet<String>,
    /// Latest external observation is removal.
    pub removed: bool,
    /// A reconciliation is in flight.
    pub processing: bool,
    /// The in-flight reconciliation is a removal.
    pub removal_in_flight: bool,
    /// A new reconciliation is queued behind the in-flight one.
    pub pending: bool,
    /// Handle to `device@<syspath>`, owned for one reconciliation.
    pub device_handle: Option<ServiceHandle>,
    /// Outstanding per-service chains in the current reconciliation.
    pub pending_ops: usize,
}

impl Device {
    fn new(syspath: String, subsystem: String) -> Self {
        Self {
            syspath,
            subsystem,
            name: String::new(),
            mac: String::new(),
            usb_ids: HashSet::new(),
            has_tag: false,
            current_deps: BTreeSet::new(),
            pending_deps: BTreeSet::new(),
            next_deps: BTreeSet::new(),
            removed: false,
            processing: false,
            removal_in_flight: false,
            pending: false,
            device_handle: None,
            pending_ops: 0,
        }
    }

    pub fn is_net(&self) -> bool {
        self.subsystem == "net"
    }

    pub fn is_usb(&self) -> bool {
        self.subsystem == "usb"
    }
}

/// An identity a device no longer answers to; subscribers watching it
/// must be told it is gone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentityDrop {
    Node(String),
    Ifname(String),
    Mac(String),
}

/// Outcome of feeding one kernel observation into the table.
#[derive(Debug, PartialEq, Eq)]
pub enum Observed {
    /// The device under `key` changed state.
    Touched {
        key: String,
        dropped: Vec<IdentityDrop>,
    },
    /// The observation carried no state change (unidentifiable USB
    /// device, unknown removal, or a USB aggregate with members left).
    Ignored,
}

#[derive(Debug, Default)]
pub struct DeviceTable {
    devices: HashMap<String, Device>,
    by_node: HashMap<String, String>,
    by_ifname: HashMap<String, String>,
    by_mac: HashMap<String, String>,
    by_usb: HashMap<DevNum, String>,
}

impl DeviceTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&Device> {
        self.devices.get(key)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut Device> {
        self.devices.get_mut(key)
    }

    /// Current owner of a device-node index entry, if any.
    pub fn node_owner(&self, node: &str) -> Option<&str> {
        self.by_node.get(node).map(String::as_str)
    }

    pub fn ifname_owner(&self, ifname: &str) -> Option<&str> {
        self.by_ifname.get(ifname).map(String::as_str)
    }

    pub fn mac_owner(&self, mac: &str) -> Option<&str> {
        self.by_mac.get(mac).map(String::as_str)
    }

    /// Create-or-update from an `add` observation.
    pub fn observe_add(&mut self, ev: &DeviceEvent) -> Observed {
        let Some(key) = table_key(ev) else {
            return Observed::Ignored;
        };
        if ev.subsystem == "usb" && ev.devnum.is_none() {
            // No device number means nothing to aggregate on.
            return Observed::Ignored;
        }

        let live = self.devices.get(&key).is_some_and(|dev| !dev.removed);
        if live {
            return self.update_live(&key, ev);
        }

        let Self {
            devices,
            by_node,
            by_ifname,
            by_mac,
            by_usb,
        } = self;
        let dev = devices
            .entry(key.clone())
            .or_insert_with(|| Device::new(key.clone(), ev.subsystem.clone()));
        dev.removed = false;
        if dev.is_usb() {
            let devnum = ev.devnum.expect("checked above");
            dev.usb_ids.insert(devnum);
            by_usb.insert(devnum, key.clone());
            tracing::info!("add usb '{key}'");
        } else if dev.is_net() {
            dev.name = ev.sysname.clone();
            dev.mac = ev.mac.clone().unwrap_or_default();
            if !dev.name.is_empty() {
                by_ifname.insert(dev.name.clone(), key.clone());
            }
            if !dev.mac.is_empty() {
                by_mac.insert(dev.mac.clone(), key.clone());
            }
            tracing::info!("add netif '{}' ('{}')", dev.name, dev.mac);
        } else {
            dev.name = ev.devnode.clone().unwrap_or_default();
            if !dev.name.is_empty() {
                by_node.insert(dev.name.clone(), key.clone());
            }
            tracing::info!("add {} '{}'", dev.subsystem, dev.name);
        }
        Observed::Touched {
            key,
            dropped: Vec::new(),
        }
    }

    /// A `change` observation is an `add` that may rename identities; the
    /// renamed ones are reported so their absence can be announced.
    pub fn observe_change(&mut self, ev: &DeviceEvent) -> Observed {
        self.observe_add(ev)
    }

    fn update_live(&mut self, key: &str, ev: &DeviceEvent) -> Observed {
        let mut dropped = Vec::new();
        if ev.subsystem == "usb" {
            let devnum = ev.devnum.expect("usb update requires devnum");
            let dev = self.devices.get_mut(key).expect("live entry");
            dev.usb_ids.insert(devnum);
            self.by_usb.insert(devnum, key.to_string());
        } else if self.devices.get(key).expect("live entry").is_net() {
            if let Some(drop) = self.set_ifname(key, &ev.sysname) {
                dropped.push(drop);
            }
            let new_mac = ev.mac.clone().unwrap_or_default();
            if let Some(drop) = self.set_mac(key, &new_mac) {
                dropped.push(drop);
            }
            self.devices.get_mut(key).expect("live entry").removed = false;
        } else {
            let new_node = ev.devnode.clone().unwrap_or_default();
            if let Some(drop) = self.set_node(key, &new_node) {
                dropped.push(drop);
            }
            self.devices.get_mut(key).expect("live entry").removed = false;
        }
        Observed::Touched {
            key: key.to_string(),
            dropped,
        }
    }

    fn set_node(&mut self, key: &str, new: &str) -> Option<IdentityDrop> {
        let Self {
            devices, by_node, ..
        } = self;
        let dev = devices.get_mut(key).expect("live entry");
        if dev.name == new {
            return None;
        }
        tracing::info!("device change '{}' -> '{new}'", dev.name);
        let mut dropped = None;
        if !dev.name.is_empty() {
            by_node.remove(&dev.name);
            dropped = Some(IdentityDrop::Node(std::mem::take(&mut dev.name)));
        }
        dev.name = new.to_string();
        if !new.is_empty() {
            by_node.insert(new.to_string(), key.to_string());
        }
        dropped
    }

    fn set_ifname(&mut self, key: &str, new: &str) -> Option<IdentityDrop> {
        let Self {
            devices, by_ifname, ..
        } = self;
        let dev = devices.get_mut(key).expect("live entry");
        if dev.name == new {
            return None;
        }
        tracing::info!("ifname change '{}' -> '{new}'", dev.name);
        let mut dropped = None;
        if !dev.name.is_empty() {
            by_ifname.remove(&dev.name);
            dropped = Some(IdentityDrop::Ifname(std::mem::take(&mut dev.name)));
        }
        dev.name = new.to_string();
        if !new.is_empty() {
            by_ifname.insert(new.to_string(), key.to_string());
        }
        dropped
    }

    fn set_mac(&mut self, key: &str, new: &str) -> Option<IdentityDrop> {
        let Self {
            devices, by_mac, ..
        } = self;
        let dev = devices.get_mut(key).expect("live entry");
        if dev.mac == new {
            return None;
        }
        tracing::info!("mac change '{}' -> '{new}'", dev.mac);
        let mut dropped = None;
        if !dev.mac.is_empty() {
            by_mac.remove(&dev.mac);
            dropped = Some(IdentityDrop::Mac(std::mem::take(&mut dev.mac)));
        }
        dev.mac = new.to_string();
        if !new.is_empty() {
            by_mac.insert(new.to_string(), key.to_string());
        }
        dropped
    }

    /// Apply a `remove` observation. USB removals only take effect once
    /// the last aliased device number is gone; index entries are dropped
    /// here, while `name`/`mac` stay behind for the final fan-out.
    pub fn observe_remove(&mut self, ev: &DeviceEvent) -> Observed {
        if ev.subsystem == "usb" {
            let Some(devnum) = ev.devnum else {
                return Observed::Ignored;
            };
            let Some(key) = self.by_usb.remove(&devnum) else {
                return Observed::Ignored;
            };
            let dev = self.devices.get_mut(&key).expect("indexed entry");
            dev.usb_ids.remove(&devnum);
            if !dev.usb_ids.is_empty() {
                return Observed::Ignored;
            }
            dev.removed = true;
            tracing::info!("drop usb '{key}'");
            return Observed::Touched {
                key,
                dropped: Vec::new(),
            };
        }

        let key = ev.syspath.clone();
        let Self {
            devices,
            by_node,
            by_ifname,
            by_mac,
            ..
        } = self;
        let Some(dev) = devices.get_mut(&key) else {
            return Observed::Ignored;
        };
        if dev.removed {
            return Observed::Ignored;
        }
        dev.removed = true;
        if dev.is_net() {
            tracing::info!("drop netif '{}' (mac: '{}')", dev.name, dev.mac);
            if !dev.name.is_empty() {
                by_ifname.remove(&dev.name);
            }
            if !dev.mac.is_empty() {
                by_mac.remove(&dev.mac);
            }
        } else {
            tracing::info!("drop {} '{}'", dev.subsystem, dev.name);
            if !dev.name.is_empty() {
                by_node.remove(&dev.name);
            }
        }
        Observed::Touched {
            key,
            dropped: Vec::new(),
        }
    }

    /// Answer a subscriber query with the owning table key, if any.
    pub fn resolve(&self, kind: crate::proto::WatchKind, query: &str) -> Option<String> {
        use crate::proto::WatchKind;
        match kind {
            WatchKind::Dev => self.resolve_node(query),
            WatchKind::Sys | WatchKind::Usb => {
                self.devices.contains_key(query).then(|| query.to_string())
            }
            WatchKind::Netif => self.by_ifname.get(query).cloned(),
            WatchKind::Mac => self.by_mac.get(query).cloned(),
        }
    }

    fn resolve_node(&self, query: &str) -> Option<String> {
        if let Some(key) = self.by_node.get(query) {
            return Some(key.clone());
        }
        let resolved = resolve_symlink(query)?;
        self.by_node.get(&resolved).cloned()
    }
}

/// Derive the table key for an observation; USB devices without a full
/// `vendor:product` identity are not tracked at all.
fn table_key(ev: &DeviceEvent) -> Option<String> {
    if ev.subsystem == "usb" {
        ev.usb_id.clone()
    } else {
        Some(ev.syspath.clone())
    }
}

/// Resolve `path` when it is a symlink on disk. Resolution failures mean
/// "not present"; out-of-memory from the resolver is unrecoverable.
fn resolve_symlink(path: &str) -> Option<String> {
    let meta = fs::symlink_metadata(path).ok()?;
    if !meta.file_type().is_symlink() {
        return None;
    }
    match fs::canonicalize(path) {
        Ok(resolved) => Some(resolved.to_string_lossy().into_owned()),
        Err(e) => {
            if e.raw_os_error() == Some(libc::ENOMEM) {
                std::process::abort();
            }
            None
        }
    }
}

/// Does a `dev` subscriber query match this device node, either exactly
/// or through a symlink on disk?
pub fn node_matches(query: &str, node: &str) -> bool {
    if query == node {
        return true;
    }
    resolve_symlink(query).as_deref() == Some(node)
}

/// Parse the space-separated service list carried in the device property.
pub fn parse_service_list(raw: &str) -> BTreeSet<String> {
    raw.split_whitespace().map(str::to_string).collect()
}
