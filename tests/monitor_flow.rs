//! Presence flow: hotplug, symlinks, USB aggregation, protocol abuse.

mod fixtures;

use devmon::proto::WatchKind;
use devmon::source::Action;
use std::io::Read;

use fixtures::events;
use fixtures::rig::Rig;

const TTY_SYS: &str = "/sys/class/tty/ttyUSB0";
const TTY_NODE: &str = "/dev/ttyUSB0";

#[test]
fn hotplug_tty_announces_presence() {
    let mut rig = Rig::new();
    let mut sub = rig.subscribe(WatchKind::Dev, TTY_NODE);
    sub.expect(&[0]);

    rig.apply(&events::tty(Action::Add, TTY_SYS, TTY_NODE));
    sub.expect(&[1]);

    rig.apply(&events::tty(Action::Remove, TTY_SYS, TTY_NODE));
    sub.expect(&[0]);
}

#[test]
fn late_subscriber_sees_current_state() {
    let mut rig = Rig::new();
    rig.apply(&events::tty(Action::Add, TTY_SYS, TTY_NODE));
    let mut sub = rig.subscribe(WatchKind::Dev, TTY_NODE);
    sub.expect(&[1]);
}

#[test]
fn unmatched_query_stays_silent() {
    let mut rig = Rig::new();
    let mut sub = rig.subscribe(WatchKind::Netif, "wlan0");
    sub.expect(&[0]);

    // unrelated traffic must not reach this subscriber
    rig.apply(&events::tty(Action::Add, TTY_SYS, TTY_NODE));
    sub.expect(&[]);

    rig.apply(&events::net(
        Action::Add,
        "/sys/class/net/wlan0",
        "wlan0",
        "aa:bb:cc:dd:ee:ff",
    ));
    sub.expect(&[1]);
}

#[test]
fn flapping_device_alternates_without_duplicates() {
    let mut rig = Rig::new();
    let mut sub = rig.subscribe(WatchKind::Dev, TTY_NODE);
    sub.expect(&[0]);

    rig.apply(&events::tty(Action::Add, TTY_SYS, TTY_NODE));
    rig.apply(&events::tty(Action::Remove, TTY_SYS, TTY_NODE));
    rig.apply(&events::tty(Action::Add, TTY_SYS, TTY_NODE));
    sub.expect(&[1, 0, 1]);
}

#[test]
fn symlink_queries_follow_to_the_node() {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().canonicalize().unwrap();
    let node = base.join("sda1");
    std::fs::write(&node, b"").unwrap();
    let link = base.join("by-label-root");
    std::os::unix::fs::symlink(&node, &link).unwrap();
    let node = node.to_str().unwrap();
    let link = link.to_str().unwrap();

    let mut rig = Rig::new();
    rig.apply(&events::block(Action::Add, "/sys/block/sda/sda1", node));

    let mut by_link = rig.subscribe(WatchKind::Dev, link);
    let mut by_node = rig.subscribe(WatchKind::Dev, node);
    by_link.expect(&[1]);
    by_node.expect(&[1]);

    // both views transition together
    rig.apply(&events::block(Action::Remove, "/sys/block/sda/sda1", node));
    by_link.expect(&[0]);
    by_node.expect(&[0]);
}

#[test]
fn usb_identity_outlives_individual_devices() {
    let mut rig = Rig::new();
    rig.apply(&events::usb(
        Action::Add,
        "/sys/bus/usb/devices/1-1",
        "046d:c52b",
        0xbd01,
    ));
    rig.apply(&events::usb(
        Action::Add,
        "/sys/bus/usb/devices/2-3",
        "046d:c52b",
        0xbd02,
    ));

    let mut sub = rig.subscribe(WatchKind::Usb, "046d:c52b");
    sub.expect(&[1]);

    // one of the two aliases going away changes nothing
    rig.apply(&events::usb(
        Action::Remove,
        "/sys/bus/usb/devices/1-1",
        "046d:c52b",
        0xbd01,
    ));
    sub.expect(&[]);

    rig.apply(&events::usb(
        Action::Remove,
        "/sys/bus/usb/devices/2-3",
        "046d:c52b",
        0xbd02,
    ));
    sub.expect(&[0]);
}

#[test]
fn node_rename_reads_as_disappearance() {
    let mut rig = Rig::new();
    rig.apply(&events::tty(Action::Add, TTY_SYS, TTY_NODE));
    let mut sub = rig.subscribe(WatchKind::Dev, TTY_NODE);
    sub.expect(&[1]);

    rig.apply(&events::tty(Action::Change, TTY_SYS, "/dev/ttyUSB1"));
    sub.expect(&[0]);

    let mut renamed = rig.subscribe(WatchKind::Dev, "/dev/ttyUSB1");
    renamed.expect(&[1]);
}

#[test]
fn net_device_answers_to_all_identities() {
    let mut rig = Rig::new();
    rig.apply(&events::net(
        Action::Add,
        "/sys/class/net/eth0",
        "eth0",
        "aa:bb:cc:dd:ee:ff",
    ));

    let mut by_ifname = rig.subscribe(WatchKind::Netif, "eth0");
    let mut by_mac = rig.subscribe(WatchKind::Mac, "aa:bb:cc:dd:ee:ff");
    let mut by_sys = rig.subscribe(WatchKind::Sys, "/sys/class/net/eth0");
    by_ifname.expect(&[1]);
    by_mac.expect(&[1]);
    by_sys.expect(&[1]);

    rig.apply(&events::net(
        Action::Remove,
        "/sys/class/net/eth0",
        "eth0",
        "aa:bb:cc:dd:ee:ff",
    ));
    by_ifname.expect(&[0]);
    by_mac.expect(&[0]);
    by_sys.expect(&[0]);
}

#[test]
fn malformed_handshake_is_rejected() {
    let mut rig = Rig::new();
    let mut wire = vec![0xEEu8, b'd', b'e', b'v', 0, 0, 0, 0, 4, 0];
    wire.extend_from_slice(b"/dev/null");
    let mut peer = rig.subscribe_raw(&wire);

    rig.monitor.compact_subscribers();
    assert_eq!(rig.monitor.subscriber_count(), 0);

    // the server closed its end; the peer reads EOF
    let mut buf = [0u8; 4];
    peer.set_nonblocking(false).unwrap();
    assert_eq!(peer.read(&mut buf).unwrap(), 0);
}

#[test]
fn junk_after_handshake_is_rejected() {
    let mut rig = Rig::new();
    rig.apply(&events::tty(Action::Add, TTY_SYS, TTY_NODE));
    let mut sub = rig.subscribe(WatchKind::Dev, TTY_NODE);
    sub.expect(&[1]);
    assert_eq!(rig.monitor.subscriber_count(), 1);

    sub.send(b"extra");
    rig.monitor.pump_subscriber(sub.fd);
    rig.monitor.compact_subscribers();
    assert_eq!(rig.monitor.subscriber_count(), 0);
}
