//! Task board flows across the lock manager, partitions and registry.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod common;

use ensemble_core::{
    events::EventType,
    lock::Holder,
    partition::Conflict,
    task::TaskState,
    Error,
};

fn paths(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| (*s).to_string()).collect()
}

#[test]
fn close_without_passing_verification_keeps_task_active() {
    let (_dir, ws) = common::workspace();
    let board = ws.tasks();
    let agent = Holder::new("agent-a");

    let task = board.create("Refactor parser", &paths(&["src/parser"])).expect("create");
    assert_eq!(task.state, TaskState::Inbox);
    board.start(&task.id, &agent, &[], true).expect("start");

    match board.close(&task.id, "agent-a") {
        Err(Error::VerificationRequired { status, .. }) => assert_eq!(status, "absent"),
        other => panic!("expected VerificationRequired, got {other:?}"),
    }
    board
        .record_verification(&task.id, false, "3 tests failing", "ci")
        .expect("verify");
    match board.close(&task.id, "agent-a") {
        Err(Error::VerificationRequired { status, .. }) => assert_eq!(status, "failed"),
        other => panic!("expected VerificationRequired, got {other:?}"),
    }
    assert_eq!(board.get(&task.id).expect("get").state, TaskState::Active);

    board
        .record_verification(&task.id, true, "all green", "ci")
        .expect("verify");
    let closed = board.close(&task.id, "agent-a").expect("close");
    assert_eq!(closed.state, TaskState::Completed);
    assert!(closed.owner.is_none());
    assert!(ws.findings_path().exists());
}

#[test]
fn start_locks_partitions_and_halt_releases_them() {
    let (_dir, ws) = common::workspace();
    let board = ws.tasks();
    let agent = Holder::new("agent-a");

    let task = board.create("Docs pass", &paths(&["docs", "./docs/"])).expect("create");
    assert_eq!(task.partitions, paths(&["docs"]));

    let activation = board.start(&task.id, &agent, &[], true).expect("start");
    assert_eq!(activation.locked, paths(&["docs"]));
    assert_eq!(activation.task.owner.as_deref(), Some("agent-a"));
    assert_eq!(ws.locks().list().expect("list").len(), 1);
    assert!(ws.partitions().load().expect("load").agents.contains_key("agent-a"));

    let halted = board
        .halt(&task.id, "agent-a", "waiting on review", Some("design approved"))
        .expect("halt");
    assert_eq!(halted.state, TaskState::Halted);
    assert!(halted.locks.is_empty());
    assert!(ws.locks().list().expect("list").is_empty());
    assert!(ws.partitions().load().expect("load").agents.is_empty());

    let resumed = board.resume(&task.id, &agent, false).expect("resume");
    assert_eq!(resumed.task.state, TaskState::Active);
    assert!(resumed.task.halt.is_none());
    assert!(resumed.locked.is_empty());
}

#[test]
fn invalid_transitions_are_rejected() {
    let (_dir, ws) = common::workspace();
    let board = ws.tasks();
    let agent = Holder::new("agent-a");
    let task = board.create("Spike", &[]).expect("create");

    assert!(matches!(
        board.halt(&task.id, "agent-a", "why", None),
        Err(Error::InvalidTransition { .. })
    ));
    assert!(matches!(
        board.resume(&task.id, &agent, false),
        Err(Error::InvalidTransition { .. })
    ));
    board.start(&task.id, &agent, &[], false).expect("start");
    assert!(matches!(
        board.start(&task.id, &agent, &[], false),
        Err(Error::InvalidTransition { .. })
    ));

    let dumped = board.dump(&task.id, "agent-a", "superseded").expect("dump");
    assert_eq!(dumped.state, TaskState::Dumped);
    assert!(matches!(
        board.reopen(&task.id, &agent, "try again", false),
        Err(Error::InvalidTransition { .. })
    ));
    assert!(matches!(
        board.get("TASK-19990101-001"),
        Err(Error::NotFound { .. })
    ));
}

#[test]
fn reopen_clears_verification_and_counts() {
    let (_dir, ws) = common::workspace();
    let board = ws.tasks();
    let agent = Holder::new("agent-a");
    let task = board.create("Fix flaky test", &[]).expect("create");

    board.start(&task.id, &agent, &[], false).expect("start");
    board.record_verification(&task.id, true, "ok", "ci").expect("verify");
    board.close(&task.id, "agent-a").expect("close");

    let reopened = board
        .reopen(&task.id, &agent, "regressed on main", false)
        .expect("reopen");
    assert_eq!(reopened.task.state, TaskState::Active);
    assert_eq!(reopened.task.reopen_count, 1);
    assert!(reopened.task.verification.is_none());
    assert!(matches!(
        board.close(&task.id, "agent-a"),
        Err(Error::VerificationRequired { .. })
    ));

    let history: Vec<(TaskState, TaskState)> = reopened
        .task
        .history
        .iter()
        .map(|t| (t.from, t.to))
        .collect();
    assert_eq!(
        history,
        vec![
            (TaskState::Inbox, TaskState::Active),
            (TaskState::Active, TaskState::Completed),
            (TaskState::Completed, TaskState::Active),
        ]
    );
    let transitions = ws
        .events()
        .read_entries()
        .expect("events")
        .into_iter()
        .filter(|e| e.event == EventType::TaskTransition)
        .count();
    assert_eq!(transitions, 3);
}

#[test]
fn overlapping_partitions_are_reported_not_blocked() {
    let (_dir, ws) = common::workspace();
    let board = ws.tasks();

    let outer = board.create("API rewrite", &paths(&["src"])).expect("create");
    let inner = board.create("Routes", &paths(&["src/api"])).expect("create");
    assert_ne!(outer.id, inner.id);

    board
        .start(&outer.id, &Holder::new("agent-a"), &[], false)
        .expect("start outer");
    let activation = board
        .start(&inner.id, &Holder::new("agent-b"), &[], true)
        .expect("start inner");

    assert_eq!(activation.task.state, TaskState::Active);
    assert!(matches!(
        activation.partition_conflicts.as_slice(),
        [Conflict::PartitionNested { outer_agent, .. }] if outer_agent == "agent-a"
    ));

    let listed = board.list(Some(TaskState::Active)).expect("list");
    assert_eq!(listed.len(), 2);
    assert!(board.list(Some(TaskState::Inbox)).expect("list").is_empty());
}
