//! Dependency reconciliation against a scripted service manager.

mod fixtures;

use std::collections::BTreeSet;

use devmon::proto::WatchKind;
use devmon::source::Action;
use devmon::sup::Request;

use fixtures::events::{tagged, tty};
use fixtures::fake_sup::ANCHOR_HANDLE;
use fixtures::rig::Rig;

const SYS: &str = "/sys/class/tty/ttyUSB0";
const NODE: &str = "/dev/ttyUSB0";
const DEVSVC: &str = "device@/sys/class/tty/ttyUSB0";

fn deps(rig: &Rig) -> BTreeSet<String> {
    rig.monitor
        .table()
        .get(SYS)
        .expect("device exists")
        .current_deps
        .clone()
}

fn set(names: &[&str]) -> BTreeSet<String> {
    names.iter().map(|s| s.to_string()).collect()
}

#[test]
fn tagged_device_waits_for_its_services() {
    let mut rig = Rig::new();
    let mut sub = rig.subscribe(WatchKind::Dev, NODE);
    sub.expect(&[0]);

    rig.apply(&tagged(tty(Action::Add, SYS, NODE), "foo bar"));

    // presence is withheld while the reconciliation is in flight, for
    // existing subscribers and new ones alike
    sub.expect(&[]);
    let mut mid = rig.subscribe(WatchKind::Dev, NODE);
    mid.expect(&[0]);

    rig.settle();
    sub.expect(&[1]);
    mid.expect(&[1]);

    assert!(rig.fake.has_edge("system", DEVSVC));
    assert!(rig.fake.has_edge(DEVSVC, "foo"));
    assert!(rig.fake.has_edge(DEVSVC, "bar"));
    assert_eq!(deps(&rig), set(&["foo", "bar"]));
    assert_eq!(rig.fake.woken, vec!["bar", "foo"]);
}

#[test]
fn coalesced_reconciliation_applies_latest_state() {
    let mut rig = Rig::new();
    let mut sub = rig.subscribe(WatchKind::Dev, NODE);
    sub.expect(&[0]);

    rig.apply(&tagged(tty(Action::Add, SYS, NODE), "a b"));
    // the desired set changes before the first reconciliation has made
    // any progress; only the latest state may win
    rig.apply(&tagged(tty(Action::Change, SYS, NODE), "b c"));
    rig.settle();

    assert_eq!(deps(&rig), set(&["b", "c"]));
    assert!(!rig.fake.has_edge(DEVSVC, "a"));
    assert!(rig.fake.has_edge(DEVSVC, "b"));
    assert!(rig.fake.has_edge(DEVSVC, "c"));

    // exactly one presence byte for the whole dance
    sub.expect(&[1]);
}

#[test]
fn removal_unwinds_the_dependency_graph() {
    let mut rig = Rig::new();
    rig.apply(&tagged(tty(Action::Add, SYS, NODE), "a b"));
    rig.settle();
    let mut sub = rig.subscribe(WatchKind::Dev, NODE);
    sub.expect(&[1]);

    rig.apply(&tty(Action::Remove, SYS, NODE));
    rig.settle();

    sub.expect(&[0]);
    assert_eq!(deps(&rig), set(&[]));
    assert!(!rig.fake.has_edge("system", DEVSVC));
    assert!(!rig.fake.has_edge(DEVSVC, "a"));
    assert!(!rig.fake.has_edge(DEVSVC, "b"));
}

#[test]
fn missing_service_is_skipped_not_fatal() {
    let mut rig = Rig::new();
    rig.fake.missing.insert("ghost".to_string());

    rig.apply(&tagged(tty(Action::Add, SYS, NODE), "ghost real"));
    rig.settle();

    assert!(rig.fake.has_edge(DEVSVC, "real"));
    assert!(!rig.fake.has_edge(DEVSVC, "ghost"));
    // the observed set is remembered even where an edge could not be made
    assert_eq!(deps(&rig), set(&["ghost", "real"]));
}

#[test]
fn started_service_is_not_woken() {
    let mut rig = Rig::new();
    rig.fake.started.insert("dbus".to_string());

    rig.apply(&tagged(tty(Action::Add, SYS, NODE), "dbus"));
    rig.settle();

    assert!(rig.fake.has_edge(DEVSVC, "dbus"));
    assert!(rig.fake.woken.is_empty());
}

#[test]
fn anchor_handle_is_never_released() {
    let mut rig = Rig::new();
    rig.apply(&tagged(tty(Action::Add, SYS, NODE), "x"));
    rig.settle();
    rig.apply(&tty(Action::Remove, SYS, NODE));
    rig.settle();

    assert!(
        !rig.fake
            .log
            .iter()
            .any(|r| matches!(r, Request::Close(h) if *h == ANCHOR_HANDLE))
    );
    assert!(rig.fake.loaded.contains_key(&ANCHOR_HANDLE.0));
}

#[test]
fn untagged_devices_never_touch_the_supervisor() {
    let mut rig = Rig::new();
    rig.apply(&tty(Action::Add, SYS, NODE));
    rig.apply(&tty(Action::Remove, SYS, NODE));
    rig.settle();

    // only the anchor load ever hit the wire
    assert_eq!(rig.fake.log.len(), 1);
    assert!(matches!(rig.fake.log[0], Request::Load { .. }));
}

#[test]
fn reobserved_identical_state_still_settles() {
    let mut rig = Rig::new();
    rig.apply(&tagged(tty(Action::Add, SYS, NODE), "a"));
    rig.settle();
    let before = rig.fake.edges.clone();

    // a change event carrying the same set reconciles to the same graph
    rig.apply(&tagged(tty(Action::Change, SYS, NODE), "a"));
    rig.settle();

    assert_eq!(rig.fake.edges, before);
    assert_eq!(deps(&rig), set(&["a"]));
}
