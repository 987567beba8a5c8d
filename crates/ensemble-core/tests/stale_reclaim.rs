//! Crash recovery: markers left by dead agents are quarantined, live ones
//! are never touched.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod common;

use ensemble_core::{
    events::EventType,
    lock::{Acquisition, Holder, LockKind},
    Error,
};

#[test]
fn dead_holder_past_threshold_is_quarantined_and_replaced() {
    let (_dir, ws) = common::workspace();
    let crashed = Holder::new("agent-a").with_pid(common::dead_pid());
    common::plant_marker(&ws, "src/x.py", &crashed, 200);

    let locks = ws.locks();
    let b = Holder::new("agent-b");
    let grant = locks
        .acquire("src/x.py", &b, None, LockKind::Exclusive)
        .expect("reclaim");

    assert_eq!(grant.record.agent_id, "agent-b");
    assert_eq!(grant.quarantined.len(), 1);
    let quarantined = common::files_matching(&ws.state_dir().join("locks"), "x.py.lock.stale.");
    assert_eq!(quarantined.len(), 1, "{quarantined:?}");

    let events = locks.recent_events(20).expect("events");
    assert!(events
        .iter()
        .any(|e| e.event == EventType::StaleLockQuarantined));
    assert_eq!(
        locks.holder_of("src/x.py").expect("holder").map(|h| h.record.agent_id),
        Some("agent-b".to_string())
    );
}

#[test]
fn live_holder_is_never_reclaimed_however_old() {
    let (_dir, ws) = common::workspace();
    let alive = Holder::new("agent-a");
    common::plant_marker(&ws, "src/x.py", &alive, 10_000);

    let locks = ws.locks();
    assert!(matches!(
        locks.acquire("src/x.py", &Holder::new("agent-b"), None, LockKind::Exclusive),
        Err(Error::LockHeld { .. })
    ));
    assert!(common::files_matching(&ws.state_dir().join("locks"), ".stale.").is_empty());
}

#[test]
fn young_marker_of_dead_holder_waits_for_threshold() {
    let (_dir, ws) = common::workspace();
    let crashed = Holder::new("agent-a").with_pid(common::dead_pid());
    common::plant_marker(&ws, "src/y.py", &crashed, 5);

    match ws
        .locks()
        .try_acquire("src/y.py", &Holder::new("agent-b"), None, LockKind::Exclusive)
        .expect("try")
    {
        Acquisition::Held(info) => assert!(!info.stale),
        Acquisition::Acquired(grant) => panic!("reclaimed too early: {grant:?}"),
    }
}

#[test]
fn cleanup_counts_stale_markers_once() {
    let (_dir, ws) = common::workspace();
    let crashed = Holder::new("agent-a").with_pid(common::dead_pid());
    common::plant_marker(&ws, "a.txt", &crashed, 500);
    common::plant_marker(&ws, "dir/b.txt", &crashed, 500);
    common::plant_marker(&ws, "c.txt", &Holder::new("agent-live"), 500);

    let locks = ws.locks();
    let first = locks.cleanup_expired().expect("cleanup");
    assert_eq!(first.quarantined.len(), 2);
    let second = locks.cleanup_expired().expect("cleanup again");
    assert!(second.quarantined.is_empty());
    assert_eq!(locks.list().expect("list").len(), 1);
}
