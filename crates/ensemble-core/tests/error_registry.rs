//! Registry deduplication and the derived findings summary.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod common;

use std::fs;

use ensemble_core::registry::{ErrorCategory, ErrorReport, ErrorStatus, SearchFilter};

#[test]
fn same_failure_on_different_lines_is_one_record() {
    let (_dir, ws) = common::workspace();
    let registry = ws.registry();

    let first = registry
        .register(
            ErrorReport::new(
                ErrorCategory::Type,
                "./src/App.ts",
                "TypeError: Cannot read property 'name' of undefined at line 10",
            )
            .with_line(10)
            .with_task("TASK-20260101-001"),
        )
        .expect("register");
    assert!(!first.duplicate);

    let second = registry
        .register(
            ErrorReport::new(
                ErrorCategory::Runtime,
                "src/app.ts",
                "TypeError: Cannot read property 'title' of undefined at line 55",
            )
            .with_line(55)
            .with_task("TASK-20260101-002"),
        )
        .expect("register again");
    assert!(second.duplicate);
    assert_eq!(second.record.id, first.record.id);
    assert_eq!(second.record.occurrences, 2);
    assert_eq!(second.record.related_tasks.len(), 2);
    assert_eq!(registry.list().expect("list").len(), 1);
}

#[test]
fn resolve_moves_error_between_summary_sections() {
    let (_dir, ws) = common::workspace();
    let registry = ws.registry();

    let open = registry
        .register(ErrorReport::new(ErrorCategory::Import, "src/lib.rs", "unresolved import `foo`"))
        .expect("register");
    registry
        .register(ErrorReport::new(ErrorCategory::Build, "build.rs", "linker failed"))
        .expect("register");

    let resolved = registry
        .resolve(&open.record.id, "added the dependency", "agent-a")
        .expect("resolve");
    assert_eq!(resolved.status, ErrorStatus::Resolved);

    let still_open = registry
        .search(&SearchFilter {
            status: Some(ErrorStatus::Open),
            ..SearchFilter::default()
        })
        .expect("search");
    assert_eq!(still_open.len(), 1);
    assert_eq!(still_open[0].file, "build.rs");

    let path = registry.regenerate_summary().expect("summary");
    let summary = fs::read_to_string(path).expect("read findings");
    let open_at = summary.find("## Open Errors").expect("open section");
    let resolved_at = summary.find("## Resolved Errors").expect("resolved section");
    let resolved_id = summary.find(&open.record.id).expect("resolved id listed");
    assert!(resolved_id > resolved_at && resolved_at > open_at);
}
