//! Markdown findings summary derived from the registry.

use std::{collections::BTreeMap, fmt::Write as _};

use chrono::{DateTime, SecondsFormat, Utc};
use itertools::Itertools;

use super::{ErrorRecord, ErrorStatus};

/// Everything from this line on is hand-written and survives regeneration.
pub const MANUAL_MARKER: &str = "<!-- MANUAL NOTES - DO NOT DELETE THIS MARKER -->";

/// Entries shown per section.
const SECTION_LIMIT: usize = 10;
const MESSAGE_PREVIEW: usize = 100;

/// The manual section of an existing findings file, marker included.
#[must_use]
pub fn manual_section(existing: &str) -> Option<&str> {
    existing.find(MANUAL_MARKER).map(|at| &existing[at..])
}

fn fresh_manual_section() -> String {
    format!(
        "{MANUAL_MARKER}\n\n## Manual Notes\n\n\
         > Content below the marker is kept when this file is regenerated.\n\
         > Record reproduction commands, links and extra context here.\n"
    )
}

fn preview(message: &str) -> String {
    let mut chars = message.chars();
    let head: String = chars.by_ref().take(MESSAGE_PREVIEW).collect();
    if chars.next().is_some() {
        format!("{head}...")
    } else {
        head
    }
}

fn location(record: &ErrorRecord) -> String {
    record
        .line
        .map_or_else(|| format!("`{}`", record.file), |line| format!("`{}` (line {line})", record.file))
}

/// Render `findings.md`.
#[must_use]
pub fn render(errors: &[ErrorRecord], now: DateTime<Utc>, manual: Option<&str>) -> String {
    let open: Vec<&ErrorRecord> = errors
        .iter()
        .filter(|e| e.status == ErrorStatus::Open)
        .sorted_by(|a, b| b.last_seen.cmp(&a.last_seen).then_with(|| a.id.cmp(&b.id)))
        .collect();
    let resolved: Vec<&ErrorRecord> = errors
        .iter()
        .filter(|e| e.status == ErrorStatus::Resolved)
        .sorted_by(|a, b| b.resolved_at.cmp(&a.resolved_at).then_with(|| a.id.cmp(&b.id)))
        .collect();

    let mut out = String::new();
    let _ = writeln!(out, "# Findings\n");
    let _ = writeln!(
        out,
        "> **Last Updated**: {}",
        now.to_rfc3339_opts(SecondsFormat::Secs, true)
    );
    let _ = writeln!(
        out,
        "> **Total Errors**: {} (Open: {}, Resolved: {})\n",
        errors.len(),
        open.len(),
        resolved.len()
    );

    out.push_str("---\n\n## Open Errors\n\n");
    if open.is_empty() {
        out.push_str("_(No open errors)_\n\n");
    }
    for e in open.iter().take(SECTION_LIMIT) {
        let _ = writeln!(out, "### {} - {}", e.id, e.category);
        let _ = writeln!(out, "- **File**: {}", location(e));
        let _ = writeln!(out, "- **Occurrences**: {}", e.occurrences);
        let _ = writeln!(
            out,
            "- **First Seen**: {}",
            e.first_seen.to_rfc3339_opts(SecondsFormat::Secs, true)
        );
        if !e.related_tasks.is_empty() {
            let _ = writeln!(out, "- **Tasks**: {}", e.related_tasks.join(", "));
        }
        let _ = writeln!(out, "- **Message**: {}\n", preview(&e.message));
    }
    if open.len() > SECTION_LIMIT {
        let _ = writeln!(out, "_... and {} more_\n", open.len() - SECTION_LIMIT);
    }

    out.push_str("---\n\n## Resolved Errors\n\n");
    if resolved.is_empty() {
        out.push_str("_(No resolved errors yet)_\n\n");
    }
    for e in resolved.iter().take(SECTION_LIMIT) {
        let _ = writeln!(out, "### {} - {} [RESOLVED]", e.id, e.category);
        let _ = writeln!(out, "- **File**: {}", location(e));
        let _ = writeln!(
            out,
            "- **Resolution**: {}",
            e.resolution.as_deref().unwrap_or("N/A")
        );
        let _ = writeln!(
            out,
            "- **Resolved By**: @{}\n",
            e.resolved_by.as_deref().unwrap_or("unknown")
        );
    }
    if resolved.len() > SECTION_LIMIT {
        let _ = writeln!(out, "_... and {} more_\n", resolved.len() - SECTION_LIMIT);
    }

    out.push_str("---\n\n## Hotspots by File\n\n");
    out.push_str("| File | Open | Resolved | Total |\n|------|------|----------|-------|\n");
    let mut by_file: BTreeMap<&str, (usize, usize)> = BTreeMap::new();
    for e in errors {
        let counts = by_file.entry(e.file.as_str()).or_default();
        match e.status {
            ErrorStatus::Open => counts.0 += 1,
            ErrorStatus::Resolved => counts.1 += 1,
        }
    }
    for (file, (open_count, resolved_count)) in by_file
        .into_iter()
        .sorted_by(|a, b| (b.1 .0 + b.1 .1).cmp(&(a.1 .0 + a.1 .1)).then_with(|| a.0.cmp(b.0)))
        .take(SECTION_LIMIT)
    {
        let _ = writeln!(
            out,
            "| `{file}` | {open_count} | {resolved_count} | {} |",
            open_count + resolved_count
        );
    }
    out.push_str("\n---\n\n");

    match manual {
        Some(section) => out.push_str(section),
        None => out.push_str(&fresh_manual_section()),
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ErrorCategory;

    fn record(id: &str, file: &str, status: ErrorStatus) -> ErrorRecord {
        let now = Utc::now();
        ErrorRecord {
            id: id.into(),
            category: ErrorCategory::Runtime,
            file: file.into(),
            line: Some(3),
            message: "x".repeat(150),
            signature: id.into(),
            status,
            first_seen: now,
            last_seen: now,
            occurrences: 2,
            related_tasks: vec!["TASK-20260101-001".into()],
            registered_by: "agent-a".into(),
            resolution: (status == ErrorStatus::Resolved).then(|| "pinned the version".into()),
            resolved_at: (status == ErrorStatus::Resolved).then_some(now),
            resolved_by: (status == ErrorStatus::Resolved).then(|| "agent-b".into()),
        }
    }

    #[test]
    fn sections_and_hotspots_are_rendered() {
        let errors = vec![
            record("ERR-20260101-001", "src/a.py", ErrorStatus::Open),
            record("ERR-20260101-002", "src/a.py", ErrorStatus::Resolved),
            record("ERR-20260101-003", "src/b.py", ErrorStatus::Open),
        ];
        let text = render(&errors, Utc::now(), None);

        assert!(text.contains("**Total Errors**: 3 (Open: 2, Resolved: 1)"));
        assert!(text.contains("### ERR-20260101-001 - RUNTIME"));
        assert!(text.contains("### ERR-20260101-002 - RUNTIME [RESOLVED]"));
        assert!(text.contains("- **Resolution**: pinned the version"));
        assert!(text.contains("| `src/a.py` | 1 | 1 | 2 |"));
        assert!(text.contains(&format!("{}...", "x".repeat(100))));
        assert!(text.contains(MANUAL_MARKER));

        let a = text.find("| `src/a.py`").unwrap_or(usize::MAX);
        let b = text.find("| `src/b.py`").unwrap_or(0);
        assert!(a < b, "hotspots are ordered by total");
    }

    #[test]
    fn manual_section_is_carried_verbatim() {
        let previous = format!("# old\nstale\n{MANUAL_MARKER}\n\nmy notes\n  keep `this`\n");
        let manual = manual_section(&previous);
        assert_eq!(manual, Some(&previous[previous.find(MANUAL_MARKER).unwrap_or(0)..]));

        let text = render(&[], Utc::now(), manual);
        assert!(text.ends_with(&format!("{MANUAL_MARKER}\n\nmy notes\n  keep `this`\n")));
        assert!(!text.contains("stale"));
        assert!(text.contains("_(No open errors)_"));
    }

    #[test]
    fn missing_marker_means_no_manual_section() {
        assert!(manual_section("# Findings\nnothing here\n").is_none());
    }
}
