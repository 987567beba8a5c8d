//! Many agents racing for one resource: at most one holds it at any moment.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod common;

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use ensemble_core::{
    lock::{Acquisition, Holder, LockKind, Released},
    Error,
};

#[test]
fn concurrent_agents_never_share_an_exclusive_lock() {
    let (_dir, ws) = common::workspace();
    let inside = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let locks = ws.locks();
            let inside = Arc::clone(&inside);
            let peak = Arc::clone(&peak);
            thread::spawn(move || {
                let me = Holder::new(format!("agent-{i}"));
                for _ in 0..400 {
                    match locks
                        .try_acquire("src/shared.rs", &me, None, LockKind::Exclusive)
                        .expect("try_acquire")
                    {
                        Acquisition::Acquired(_) => {
                            let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                            peak.fetch_max(now, Ordering::SeqCst);
                            thread::sleep(Duration::from_millis(2));
                            inside.fetch_sub(1, Ordering::SeqCst);
                            assert_eq!(
                                locks.release("src/shared.rs", &me).expect("release"),
                                Released::Released
                            );
                            return true;
                        }
                        Acquisition::Held(_) => thread::sleep(Duration::from_millis(1)),
                    }
                }
                false
            })
        })
        .collect();

    let winners = handles
        .into_iter()
        .map(|h| h.join().expect("thread"))
        .filter(|won| *won)
        .count();

    assert_eq!(peak.load(Ordering::SeqCst), 1, "two holders overlapped");
    assert_eq!(winners, 8, "every agent eventually got its turn");
    assert!(ws.locks().list().expect("list").is_empty());
}

#[test]
fn blocking_acquire_times_out_with_holder_details() {
    let (_dir, ws) = common::workspace();
    let locks = ws.locks();
    let a = Holder::new("agent-a");
    let b = Holder::new("agent-b");

    locks
        .acquire("src/x.py", &a, None, LockKind::Exclusive)
        .expect("first acquire");

    match locks.acquire("src/x.py", &b, None, LockKind::Exclusive) {
        Err(Error::LockHeld {
            resource, agent_id, ..
        }) => {
            assert_eq!(resource, "src/x.py");
            assert_eq!(agent_id, "agent-a");
        }
        other => panic!("expected LockHeld, got {other:?}"),
    }

    assert!(matches!(
        locks.release("src/x.py", &b),
        Err(Error::NotLockHolder { .. })
    ));
    assert_eq!(locks.release("src/x.py", &a).expect("release"), Released::Released);
    assert_eq!(locks.release("src/x.py", &a).expect("second release"), Released::NotHeld);
}

#[test]
fn reviews_share_but_exclude_writers() {
    let (_dir, ws) = common::workspace();
    let locks = ws.locks();
    let a = Holder::new("agent-a");
    let b = Holder::new("agent-b");
    let c = Holder::new("agent-c");

    for reviewer in [&a, &b] {
        assert!(matches!(
            locks
                .try_acquire("docs/design.md", reviewer, None, LockKind::Review)
                .expect("review"),
            Acquisition::Acquired(_)
        ));
    }
    assert!(matches!(
        locks
            .try_acquire("docs/design.md", &c, None, LockKind::Exclusive)
            .expect("writer"),
        Acquisition::Held(_)
    ));
    assert_eq!(locks.list().expect("list").len(), 2);

    assert_eq!(locks.release_all("agent-a").expect("release_all"), 1);
    assert_eq!(locks.release_all("agent-b").expect("release_all"), 1);
    assert!(matches!(
        locks
            .try_acquire("docs/design.md", &c, None, LockKind::Exclusive)
            .expect("writer"),
        Acquisition::Acquired(_)
    ));
}
