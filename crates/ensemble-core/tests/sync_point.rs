//! Sync points report the same conflicts every time and clean up only once.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod common;

use ensemble_core::{
    lock::{Holder, LockKind},
    partition::Conflict,
};

#[test]
fn repeated_sync_is_idempotent() {
    let (_dir, ws) = common::workspace();
    let crashed = Holder::new("agent-z").with_pid(common::dead_pid());
    common::plant_marker(&ws, "tmp/old.txt", &crashed, 900);

    let partitions = ws.partitions();
    partitions
        .declare("agent-a", "TASK-20260101-001", &["src".to_string()])
        .expect("declare a");
    partitions
        .declare("agent-b", "TASK-20260101-002", &["src/api".to_string()])
        .expect("declare b");
    ws.locks()
        .acquire("src/api/routes.rs", &Holder::new("agent-c"), None, LockKind::Exclusive)
        .expect("lock");

    let sync = ws.sync_point();
    let first = sync.run().expect("first sync");
    assert_eq!(first.cleaned_locks, 1);
    assert!(first.findings_path.exists());
    assert_eq!(first.conflicts.len(), 3, "{:#?}", first.conflicts);
    assert!(first
        .conflicts
        .iter()
        .any(|c| matches!(c, Conflict::PartitionNested { inner_agent, .. } if inner_agent == "agent-b")));

    let second = sync.run().expect("second sync");
    assert_eq!(second.cleaned_locks, 0);
    assert_eq!(second.conflicts, first.conflicts);
}
