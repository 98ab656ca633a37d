//! Synthetic kernel observations.

use devmon::device::DevNum;
use devmon::source::{Action, DeviceEvent};

pub fn tty(action: Action, syspath: &str, node: &str) -> DeviceEvent {
    DeviceEvent {
        action,
        syspath: syspath.to_string(),
        subsystem: "tty".to_string(),
        sysname: syspath.rsplit('/').next().unwrap().to_string(),
        devnode: Some(node.to_string()),
        mac: None,
        devnum: None,
        usb_id: None,
        tagged: false,
        waits_for: None,
    }
}

pub fn block(action: Action, syspath: &str, node: &str) -> DeviceEvent {
    DeviceEvent {
        subsystem: "block".to_string(),
        ..tty(action, syspath, node)
    }
}

pub fn net(action: Action, syspath: &str, ifname: &str, mac: &str) -> DeviceEvent {
    DeviceEvent {
        action,
        syspath: syspath.to_string(),
        subsystem: "net".to_string(),
        sysname: ifname.to_string(),
        devnode: None,
        mac: Some(mac.to_string()),
        devnum: None,
        usb_id: None,
        tagged: false,
        waits_for: None,
    }
}

pub fn usb(action: Action, syspath: &str, usb_id: &str, devnum: DevNum) -> DeviceEvent {
    DeviceEvent {
        action,
        syspath: syspath.to_string(),
        subsystem: "usb".to_string(),
        sysname: syspath.rsplit('/').next().unwrap().to_string(),
        devnode: None,
        mac: None,
        devnum: Some(devnum),
        usb_id: Some(usb_id.to_string()),
        tagged: false,
        waits_for: None,
    }
}

pub fn tagged(mut ev: DeviceEvent, waits_for: &str) -> DeviceEvent {
    ev.tagged = true;
    ev.waits_for = Some(waits_for.to_string());
    ev
}
