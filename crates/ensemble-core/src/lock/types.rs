//! Lock records, holders and the staleness policy.

use std::{collections::BTreeMap, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

use super::marker::STALE_INFIX;
use crate::{host, host::Liveness, Error, Result};

/// Names that cannot be locked (case-insensitive).
const RESERVED_KEYWORDS: &[&str] = &["null", "none", "undefined", "true", "false"];

#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum LockKind {
    /// Sole ownership of the resource.
    #[default]
    Exclusive,
    /// Shared read-for-review claim; excludes exclusive holders only.
    Review,
}

impl LockKind {
    #[must_use]
    pub const fn is_exclusive(self) -> bool {
        matches!(self, Self::Exclusive)
    }
}

/// Identity of whoever takes a lock.
///
/// Ownership checks compare `agent_id` and `hostname`. The pid only feeds the
/// liveness test, since one agent may act through several short-lived
/// processes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Holder {
    pub agent_id: String,
    pub pid: u32,
    pub hostname: String,
}

impl Holder {
    /// Holder for the current process on this host.
    #[must_use]
    pub fn new(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            pid: std::process::id(),
            hostname: host::local_hostname().to_string(),
        }
    }

    #[must_use]
    pub const fn with_pid(mut self, pid: u32) -> Self {
        self.pid = pid;
        self
    }

    #[must_use]
    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = hostname.into();
        self
    }
}

/// A claim on a resource, as stored in marker files and the lock table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub resource: String,
    pub holder_pid: u32,
    pub hostname: String,
    pub agent_id: String,
    pub acquired_at_utc: DateTime<Utc>,
    pub ttl_seconds: u64,
    #[serde(default)]
    pub kind: LockKind,
}

impl LockRecord {
    #[must_use]
    pub fn new(resource: impl Into<String>, holder: &Holder, ttl: Duration, kind: LockKind) -> Self {
        Self {
            resource: resource.into(),
            holder_pid: holder.pid,
            hostname: holder.hostname.clone(),
            agent_id: holder.agent_id.clone(),
            acquired_at_utc: Utc::now(),
            ttl_seconds: ttl.as_secs(),
            kind,
        }
    }

    /// Whole seconds since acquisition, clamped at zero for clock skew.
    #[must_use]
    pub fn age_secs(&self, now: DateTime<Utc>) -> i64 {
        (now - self.acquired_at_utc).num_seconds().max(0)
    }

    #[must_use]
    pub fn is_held_by(&self, holder: &Holder) -> bool {
        self.agent_id == holder.agent_id && self.hostname == holder.hostname
    }

    #[must_use]
    pub fn holder(&self) -> Holder {
        Holder {
            agent_id: self.agent_id.clone(),
            pid: self.holder_pid,
            hostname: self.hostname.clone(),
        }
    }

    #[must_use]
    pub fn liveness(&self) -> Liveness {
        Liveness::of(&self.hostname, self.holder_pid)
    }
}

/// A record together with how it looked when assessed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HolderInfo {
    #[serde(flatten)]
    pub record: LockRecord,
    pub age_secs: i64,
    pub liveness: Liveness,
    pub stale: bool,
}

impl HolderInfo {
    /// Contention error naming this holder.
    #[must_use]
    pub fn held_error(&self) -> Error {
        Error::LockHeld {
            resource: self.record.resource.clone(),
            agent_id: self.record.agent_id.clone(),
            pid: self.record.holder_pid,
            hostname: self.record.hostname.clone(),
            age_secs: self.age_secs,
            liveness: self.liveness.to_string(),
        }
    }
}

/// Two-tier staleness test.
///
/// A record is stale when its age exceeds the limit and its holder cannot be
/// shown to be alive. The limit is the configured threshold, shortened to the
/// record's own TTL when that is smaller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StalenessPolicy {
    pub threshold: Duration,
    /// Treat a dead same-host holder as stale regardless of age. Only used for
    /// short internal critical sections.
    pub reclaim_dead_immediately: bool,
}

impl StalenessPolicy {
    #[must_use]
    pub const fn new(threshold: Duration) -> Self {
        Self {
            threshold,
            reclaim_dead_immediately: false,
        }
    }

    #[must_use]
    pub const fn for_guards(threshold: Duration) -> Self {
        Self {
            threshold,
            reclaim_dead_immediately: true,
        }
    }

    fn limit_secs(&self, record: &LockRecord) -> u64 {
        let threshold = self.threshold.as_secs();
        if record.ttl_seconds == 0 {
            threshold
        } else {
            threshold.min(record.ttl_seconds)
        }
    }

    #[must_use]
    pub fn assess(&self, record: &LockRecord, now: DateTime<Utc>) -> HolderInfo {
        let age_secs = record.age_secs(now);
        let liveness = record.liveness();
        let too_old = u64::try_from(age_secs).map_or(false, |age| age > self.limit_secs(record));
        let stale = match liveness {
            Liveness::Alive => false,
            Liveness::Dead => too_old || self.reclaim_dead_immediately,
            Liveness::Unverifiable => too_old,
        };
        HolderInfo {
            record: record.clone(),
            age_secs,
            liveness,
            stale,
        }
    }

    #[must_use]
    pub fn is_stale(&self, record: &LockRecord, now: DateTime<Utc>) -> bool {
        self.assess(record, now).stale
    }
}

/// Result of a single acquisition attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Acquisition {
    /// The lock was created, or renewed by its current holder.
    Acquired(LockGrant),
    /// Someone else holds a live claim.
    Held(HolderInfo),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockGrant {
    pub record: LockRecord,
    /// The caller already held the lock and its timestamp was refreshed.
    pub renewed: bool,
    /// Markers moved aside to make room for this grant.
    pub quarantined: Vec<String>,
}

/// Outcome of `release`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Released {
    Released,
    NotHeld,
}

/// The lock table document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockTable {
    pub locks: BTreeMap<String, LockRecord>,
    pub reviews: BTreeMap<String, Vec<LockRecord>>,
    pub last_cleanup: Option<DateTime<Utc>>,
}

impl LockTable {
    /// All records, exclusive first, ordered by resource.
    pub fn records(&self) -> impl Iterator<Item = &LockRecord> {
        self.locks
            .values()
            .chain(self.reviews.values().flatten())
    }

    pub(crate) fn insert(&mut self, record: LockRecord) {
        if record.kind.is_exclusive() {
            self.locks.insert(record.resource.clone(), record);
        } else {
            let entry = self.reviews.entry(record.resource.clone()).or_default();
            entry.retain(|existing| existing.agent_id != record.agent_id);
            entry.push(record);
        }
    }

    /// Drop the entry matching `record`'s resource, kind and agent.
    pub(crate) fn remove(&mut self, record: &LockRecord) {
        if record.kind.is_exclusive() {
            self.locks.remove(&record.resource);
        } else if let Some(entry) = self.reviews.get_mut(&record.resource) {
            entry.retain(|existing| existing.agent_id != record.agent_id);
            if entry.is_empty() {
                self.reviews.remove(&record.resource);
            }
        }
    }
}

/// Validate and canonicalize a resource key.
///
/// Keys are relative, `/`-separated and free of `.`/`..` segments so that they
/// map onto marker paths inside the lock directory.
pub fn normalize_resource(resource: &str) -> Result<String> {
    let invalid = |reason: &str| Error::InvalidResource {
        resource: resource.to_string(),
        reason: reason.to_string(),
    };

    let trimmed = resource.trim();
    if trimmed.is_empty() {
        return Err(invalid("resource name cannot be empty or whitespace-only"));
    }

    let unified = trimmed.replace('\\', "/");
    if unified.starts_with('/') || has_drive_prefix(&unified) {
        return Err(invalid("resource must be relative to the workspace root"));
    }

    let segments: Vec<&str> = unified
        .split('/')
        .filter(|segment| !segment.is_empty() && *segment != ".")
        .collect();

    if segments.is_empty() {
        return Err(invalid("resource name cannot be empty"));
    }
    if segments.iter().any(|segment| *segment == "..") {
        return Err(invalid("'..' segments are not allowed"));
    }
    if segments.first().is_some_and(|first| first.starts_with('_')) {
        return Err(invalid("names starting with '_' are reserved for internal state"));
    }
    if segments.iter().any(|segment| {
        segment.ends_with(".lock") || segment.contains(".lock.") || segment.ends_with(".guard")
    }) {
        return Err(invalid("'.lock' and '.guard' suffixes are reserved for marker files"));
    }
    if segments.iter().any(|segment| segment.contains(STALE_INFIX)) {
        return Err(invalid("'.stale.' is reserved for quarantined markers"));
    }

    let normalized = segments.join("/");
    let lower = normalized.to_lowercase();
    if RESERVED_KEYWORDS.iter().any(|&keyword| keyword == lower) {
        return Err(invalid("reserved keyword"));
    }
    if !normalized.chars().any(char::is_alphanumeric) {
        return Err(invalid("must contain at least one alphanumeric character"));
    }

    Ok(normalized)
}

/// `C:` or `C:/...`
fn has_drive_prefix(path: &str) -> bool {
    let bytes = path.as_bytes();
    matches!(
        (bytes.first(), bytes.get(1), bytes.get(2)),
        (Some(letter), Some(b':'), None | Some(b'/')) if letter.is_ascii_alphabetic()
    )
}

#[cfg(test)]
mod tests {
    use chrono::Duration as ChronoDuration;

    use super::*;

    fn record_aged(secs: i64, hostname: &str, pid: u32, ttl: u64) -> LockRecord {
        LockRecord {
            resource: "src/x.py".into(),
            holder_pid: pid,
            hostname: hostname.into(),
            agent_id: "agent-a".into(),
            acquired_at_utc: Utc::now() - ChronoDuration::seconds(secs),
            ttl_seconds: ttl,
            kind: LockKind::Exclusive,
        }
    }

    #[test]
    fn normalizes_separators_and_dot_segments() -> Result<()> {
        assert_eq!(normalize_resource("./src\\x.py")?, "src/x.py");
        assert_eq!(normalize_resource("src//a/./b")?, "src/a/b");
        assert_eq!(normalize_resource("db:migrations")?, "db:migrations");
        Ok(())
    }

    #[test]
    fn rejects_unsafe_or_reserved_names() {
        let rejected = [
            "", "   ", "/etc/passwd", "C:\\x", "../x", "a/../b", "null", ":::", "_locks.json",
            "x.lock", "x.lock.stale.1", "y.guard", "data.stale.1700000000", "a.stale.b/c",
        ];
        for bad in rejected {
            assert!(normalize_resource(bad).is_err(), "expected rejection of {bad:?}");
        }
    }

    #[test]
    fn foreign_host_is_stale_only_after_threshold() {
        let policy = StalenessPolicy::new(Duration::from_secs(120));
        let young = record_aged(10, "elsewhere.invalid", 1, 300);
        let old = record_aged(500, "elsewhere.invalid", 1, 300);
        assert!(!policy.is_stale(&young, Utc::now()));
        let info = policy.assess(&old, Utc::now());
        assert!(info.stale);
        assert_eq!(info.liveness, Liveness::Unverifiable);
    }

    #[test]
    fn short_ttl_shortens_the_limit() {
        let policy = StalenessPolicy::new(Duration::from_secs(120));
        let record = record_aged(45, "elsewhere.invalid", 1, 30);
        assert!(policy.is_stale(&record, Utc::now()));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn live_local_holder_is_never_stale() {
        let policy = StalenessPolicy::new(Duration::from_secs(1));
        let record = record_aged(10_000, host::local_hostname(), std::process::id(), 1);
        let info = policy.assess(&record, Utc::now());
        assert_eq!(info.liveness, Liveness::Alive);
        assert!(!info.stale);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn dead_local_holder_waits_for_age_unless_guard() -> std::io::Result<()> {
        let mut child = std::process::Command::new("true").spawn()?;
        let pid = child.id();
        child.wait()?;

        let record = record_aged(5, host::local_hostname(), pid, 300);
        assert!(!StalenessPolicy::new(Duration::from_secs(120)).is_stale(&record, Utc::now()));
        assert!(StalenessPolicy::for_guards(Duration::from_secs(120)).is_stale(&record, Utc::now()));
        Ok(())
    }

    #[test]
    fn future_timestamps_clamp_to_zero_age() {
        let mut record = record_aged(0, "elsewhere.invalid", 1, 300);
        record.acquired_at_utc = Utc::now() + ChronoDuration::seconds(600);
        assert_eq!(record.age_secs(Utc::now()), 0);
    }

    #[test]
    fn table_keeps_one_review_per_agent() {
        let holder = Holder::new("agent-a");
        let mut table = LockTable::default();
        let review = LockRecord::new("docs/a.md", &holder, Duration::from_secs(60), LockKind::Review);
        table.insert(review.clone());
        table.insert(review.clone());
        assert_eq!(table.reviews.get("docs/a.md").map(Vec::len), Some(1));
        table.remove(&review);
        assert!(table.reviews.is_empty());
    }

    #[test]
    fn kind_parses_case_insensitively() {
        assert_eq!("Review".parse::<LockKind>().ok(), Some(LockKind::Review));
        assert_eq!(LockKind::Exclusive.to_string(), "exclusive");
    }
}
