#![forbid(unsafe_code)]

use archivist_core::{BuildRecord, WatchAction, WatchEvent};
use archivist_store::Mirror;
use chrono::{TimeZone, Utc};

fn build(ns: &str, name: &str, day: u32) -> BuildRecord {
    BuildRecord {
        namespace: ns.to_string(),
        name: name.to_string(),
        started: Some(Utc.with_ymd_and_hms(2017, 5, day, 0, 0, 0).unwrap()),
    }
}

fn apply(m: &Mirror<BuildRecord>, ev: WatchEvent<BuildRecord>) {
    match ev.action {
        WatchAction::Added | WatchAction::Modified => m.upsert(ev.object).unwrap(),
        WatchAction::Deleted => {
            m.remove_object(&ev.object).unwrap();
        }
    }
}

#[test]
fn replay_basic_sequence() {
    let m = Mirror::new("builds", BuildRecord::key, BuildRecord::namespace);

    let events = vec![
        WatchEvent::added(build("ns", "a", 1)),
        // duplicate add just replaces
        WatchEvent::added(build("ns", "a", 1)),
        WatchEvent::added(build("other", "b", 2)),
        // update a
        WatchEvent::modified(build("ns", "a", 3)),
        // delete b
        WatchEvent::deleted(build("other", "b", 2)),
    ];

    for ev in events[..2].iter().cloned() {
        apply(&m, ev);
    }
    assert_eq!(m.len().unwrap(), 1);
    assert_eq!(m.list_by_namespace("ns").unwrap()[0].name, "a");

    for ev in events[2..].iter().cloned() {
        apply(&m, ev);
    }
    assert_eq!(m.len().unwrap(), 1);
    let a = m.get("ns/a").unwrap().expect("a present");
    assert_eq!(a.started, Some(Utc.with_ymd_and_hms(2017, 5, 3, 0, 0, 0).unwrap()));
    assert!(m.list_by_namespace("other").unwrap().is_empty());
    assert_eq!(m.epoch(), 5);
}
