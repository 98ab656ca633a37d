//! Kernel device event source.
//!
//! Two udev monitors feed the daemon: one matched on the subsystems that
//! are always watched, and one matched on the supervision tags. The tag
//! filter cannot express "but not those subsystems", so the tagged stream
//! skips them at receive time; a single device therefore never fires two
//! events. The initial enumeration is delivered as `add` events before
//! the event loop starts.
//!
//! In environments without a kernel source (containers), the source runs
//! in dummy mode: no fds, no events, a permanently empty presence view.

use std::os::fd::{AsRawFd, RawFd};

use thiserror::Error;

use crate::device::DevNum;

/// Subsystems watched whether or not the device is tagged.
pub const WATCHED_SUBSYSTEMS: [&str; 4] = ["block", "net", "tty", "usb"];

/// Tags admitted onto the tagged stream. Rules written for either init
/// system reach us, so filters match both.
pub const STREAM_TAGS: [&str; 2] = ["dinit", "systemd"];

/// The one tag that actually opts a device into the supervision
/// integration; a device carrying only the foreign tag is watched but
/// never reconciled.
pub const SUPERVISION_TAG: &str = "dinit";

/// Device property naming the services that wait for the device.
pub const WAITS_FOR_PROPERTY: &str = "DINIT_WAITS_FOR";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("udev monitor setup failed: {0}")]
    Setup(#[source] std::io::Error),
    #[error("udev enumeration failed: {0}")]
    Enumerate(#[source] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Add,
    Change,
    Remove,
}

/// One kernel observation, reduced to the fields the monitor consumes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceEvent {
    pub action: Action,
    pub syspath: String,
    pub subsystem: String,
    pub sysname: String,
    pub devnode: Option<String>,
    /// Hardware address, net devices only.
    pub mac: Option<String>,
    /// Kernel device number, USB devices only.
    pub devnum: Option<DevNum>,
    /// `vendor:product`, USB devices carrying both id attributes.
    pub usb_id: Option<String>,
    /// Device carries the supervision tag.
    pub tagged: bool,
    pub waits_for: Option<String>,
}

/// Which of the two monitor streams an fd belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamId {
    /// Unconditionally watched subsystems.
    Plain,
    /// Tagged devices outside those subsystems.
    Tagged,
}

pub enum Source {
    Udev(Box<UdevSource>),
    Dummy,
}

impl Source {
    pub fn new(dummy: bool) -> Result<Self, SourceError> {
        if dummy {
            tracing::info!("no kernel source, serving an empty presence view");
            return Ok(Source::Dummy);
        }
        Ok(Source::Udev(Box::new(UdevSource::new()?)))
    }

    /// The initial enumeration, as `add` events.
    pub fn snapshot(&mut self) -> Result<Vec<DeviceEvent>, SourceError> {
        match self {
            Source::Udev(udev) => udev.snapshot(),
            Source::Dummy => Ok(Vec::new()),
        }
    }

    /// Monitor fds to multiplex, `(plain, tagged)`.
    pub fn fds(&self) -> Option<(RawFd, RawFd)> {
        match self {
            Source::Udev(udev) => Some((udev.plain.as_raw_fd(), udev.tagged.as_raw_fd())),
            Source::Dummy => None,
        }
    }

    /// Receive one event from the given stream, if one is pending and
    /// survives filtering.
    pub fn recv(&mut self, id: StreamId) -> Option<DeviceEvent> {
        match self {
            Source::Udev(udev) => udev.recv(id),
            Source::Dummy => None,
        }
    }
}

pub struct UdevSource {
    plain: udev::MonitorSocket,
    tagged: udev::MonitorSocket,
}

impl UdevSource {
    fn new() -> Result<Self, SourceError> {
        let mut plain = udev::MonitorBuilder::new().map_err(SourceError::Setup)?;
        for subsystem in WATCHED_SUBSYSTEMS {
            plain = plain
                .match_subsystem(subsystem)
                .map_err(SourceError::Setup)?;
        }
        let plain = plain.listen().map_err(SourceError::Setup)?;

        let mut tagged = udev::MonitorBuilder::new().map_err(SourceError::Setup)?;
        for tag in STREAM_TAGS {
            tagged = tagged.match_tag(tag).map_err(SourceError::Setup)?;
        }
        let tagged = tagged.listen().map_err(SourceError::Setup)?;

        Ok(Self { plain, tagged })
    }

    fn snapshot(&mut self) -> Result<Vec<DeviceEvent>, SourceError> {
        let mut events = Vec::new();

        let mut by_subsystem = udev::Enumerator::new().map_err(SourceError::Enumerate)?;
        for subsystem in WATCHED_SUBSYSTEMS {
            by_subsystem
                .match_subsystem(subsystem)
                .map_err(SourceError::Enumerate)?;
        }
        for device in by_subsystem
            .scan_devices()
            .map_err(SourceError::Enumerate)?
        {
            events.extend(convert(Action::Add, &device));
        }

        let mut by_tag = udev::Enumerator::new().map_err(SourceError::Enumerate)?;
        for tag in STREAM_TAGS {
            by_tag.match_tag(tag).map_err(SourceError::Enumerate)?;
        }
        for subsystem in WATCHED_SUBSYSTEMS {
            by_tag
                .nomatch_subsystem(subsystem)
                .map_err(SourceError::Enumerate)?;
        }
        for device in by_tag.scan_devices().map_err(SourceError::Enumerate)? {
            events.extend(convert(Action::Add, &device));
        }

        Ok(events)
    }

    fn recv(&mut self, id: StreamId) -> Option<DeviceEvent> {
        let socket = match id {
            StreamId::Plain => &mut self.plain,
            StreamId::Tagged => &mut self.tagged,
        };
        let event = socket.iter().next()?;
        let device = event.device();
        if id == StreamId::Tagged {
            // Devices in the watched subsystems arrive on the other
            // monitor already; do not report them twice.
            let subsystem = device.subsystem()?.to_string_lossy().into_owned();
            if WATCHED_SUBSYSTEMS.contains(&subsystem.as_str()) {
                return None;
            }
        }
        let action = match event.event_type() {
            udev::EventType::Add => Action::Add,
            udev::EventType::Change => Action::Change,
            udev::EventType::Remove => Action::Remove,
            // bind/unbind carry no availability information
            _ => return None,
        };
        convert(action, &device)
    }
}

fn convert(action: Action, device: &udev::Device) -> Option<DeviceEvent> {
    let syspath = device.syspath().to_string_lossy().into_owned();
    let Some(subsystem) = device.subsystem() else {
        tracing::warn!("device without subsystem at '{syspath}'");
        return None;
    };
    let subsystem = subsystem.to_string_lossy().into_owned();
    let sysname = device.sysname().to_string_lossy().into_owned();
    let devnode = device
        .devnode()
        .map(|path| path.to_string_lossy().into_owned());

    let mac = if subsystem == "net" {
        device
            .attribute_value("address")
            .map(|value| value.to_string_lossy().into_owned())
    } else {
        None
    };

    let (devnum, usb_id) = if subsystem == "usb" {
        let vendor = device.attribute_value("idVendor");
        let product = device.attribute_value("idProduct");
        let usb_id = vendor.zip(product).map(|(vendor, product)| {
            format!("{}:{}", vendor.to_string_lossy(), product.to_string_lossy())
        });
        (device.devnum(), usb_id)
    } else {
        (None, None)
    };

    // the foreign tag only admits a device onto the tagged stream; it
    // does not enroll it in the dependency integration
    let tagged = device_has_tag(device, SUPERVISION_TAG);
    let waits_for = device
        .property_value(WAITS_FOR_PROPERTY)
        .map(|value| value.to_string_lossy().into_owned());

    Some(DeviceEvent {
        action,
        syspath,
        subsystem,
        sysname,
        devnode,
        mac,
        devnum,
        usb_id,
        tagged,
        waits_for,
    })
}

/// Tags surface as the colon-delimited `TAGS` property (and, on newer
/// kernels, `CURRENT_TAGS` for tags still attached).
fn device_has_tag(device: &udev::Device, tag: &str) -> bool {
    ["TAGS", "CURRENT_TAGS"].iter().any(|prop| {
        device
            .property_value(prop)
            .map(|list| tag_list_contains(&list.to_string_lossy(), tag))
            .unwrap_or(false)
    })
}

fn tag_list_contains(list: &str, tag: &str) -> bool {
    list.split(':').any(|entry| entry == tag)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_lists_are_colon_delimited() {
        assert!(tag_list_contains(":systemd:dinit:", "dinit"));
        assert!(tag_list_contains(":dinit:", "dinit"));
        assert!(!tag_list_contains(":systemd:", "dinit"));
        assert!(!tag_list_contains("", "dinit"));
        // no substring matches
        assert!(!tag_list_contains(":dinit-extra:", "dinit"));
    }

    #[test]
    fn dummy_source_is_inert() {
        let mut source = Source::new(true).unwrap();
        assert!(source.fds().is_none());
        assert!(source.snapshot().unwrap().is_empty());
        assert!(source.recv(StreamId::Plain).is_none());
        assert!(source.recv(StreamId::Tagged).is_none());
    }
}
