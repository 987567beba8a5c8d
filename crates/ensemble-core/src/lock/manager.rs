//! Named advisory locks over marker files, mirrored into the lock table.

use std::{
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use walkdir::WalkDir;

use super::{
    marker::{is_marker_name, quarantine_epoch, Marker, MarkerContent, REVIEW_INFIX},
    retry::Backoff,
    types::{
        normalize_resource, Acquisition, Holder, HolderInfo, LockGrant, LockKind, LockRecord,
        LockTable, Released, StalenessPolicy,
    },
};
use crate::{
    config::LockConfig,
    events::{EventLog, EventType, LogEntry},
    host::Liveness,
    store::StateStore,
    Error, Result,
};

/// Directory holding markers, relative to the state directory.
pub const LOCKS_DIR: &str = "locks";
/// Lock table document.
pub const LOCK_TABLE: &str = "locks/_locks.json";
/// Lock event log, relative to the state directory.
pub const LOCK_EVENTS: &str = "locks/_lock_events.log";

/// What `cleanup_expired` did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupReport {
    /// Resources whose stale marker was moved aside.
    pub quarantined: Vec<String>,
    /// Table entries dropped because their marker was gone or replaced.
    pub orphans_dropped: usize,
    /// Live markers missing from the table and added back.
    pub adopted: usize,
    /// Quarantine files removed after the retention window.
    pub purged: usize,
}

impl CleanupReport {
    /// Locks cleaned out of the live set.
    #[must_use]
    pub fn cleaned(&self) -> usize {
        self.quarantined.len() + self.orphans_dropped
    }
}

/// State of one marker as seen by a caller that wants it.
enum Claim {
    /// Absent, or just quarantined.
    Vacant,
    Ours(LockRecord),
    Held(HolderInfo),
}

#[derive(Debug, Clone)]
pub struct LockManager {
    store: StateStore,
    locks_dir: PathBuf,
    config: LockConfig,
    policy: StalenessPolicy,
    backoff: Backoff,
    events: EventLog,
}

impl LockManager {
    /// `events` is the lock event log; guard and table corruption events go
    /// to the store's own log.
    #[must_use]
    pub fn new(store: StateStore, config: LockConfig, events: EventLog) -> Self {
        let locks_dir = store.path_of(LOCKS_DIR);
        Self {
            store,
            locks_dir,
            policy: StalenessPolicy::new(config.stale_threshold()),
            backoff: Backoff::from_config(&config),
            config,
            events,
        }
    }

    #[must_use]
    pub fn locks_dir(&self) -> &Path {
        &self.locks_dir
    }

    #[must_use]
    pub const fn policy(&self) -> &StalenessPolicy {
        &self.policy
    }

    #[must_use]
    pub fn is_stale(&self, record: &LockRecord) -> bool {
        self.policy.is_stale(record, Utc::now())
    }

    /// Acquire, retrying with backoff until the configured timeout.
    ///
    /// # Errors
    ///
    /// `LockHeld` naming the holder when the timeout elapses.
    pub fn acquire(
        &self,
        resource: &str,
        holder: &Holder,
        ttl: Option<Duration>,
        kind: LockKind,
    ) -> Result<LockGrant> {
        let started = Instant::now();
        let mut attempt = 0_u32;
        loop {
            match self.try_acquire(resource, holder, ttl, kind)? {
                Acquisition::Acquired(grant) => return Ok(grant),
                Acquisition::Held(info) => {
                    if !self.backoff.wait(started, attempt) {
                        self.events.record(
                            EventType::LockConflict,
                            json!({
                                "resource": info.record.resource,
                                "requested_by": holder,
                                "kind": kind,
                                "held_by": info.record.agent_id,
                                "holder_pid": info.record.holder_pid,
                                "holder_host": info.record.hostname,
                                "age_secs": info.age_secs,
                                "liveness": info.liveness,
                            }),
                        );
                        return Err(info.held_error());
                    }
                    tracing::debug!(
                        resource,
                        attempt,
                        holder = %info.record.agent_id,
                        "lock busy, backing off"
                    );
                    attempt = attempt.saturating_add(1);
                }
            }
        }
    }

    /// One acquisition attempt.
    ///
    /// Stale markers in the way are quarantined. A caller that already holds
    /// the lock gets it renewed.
    pub fn try_acquire(
        &self,
        resource: &str,
        holder: &Holder,
        ttl: Option<Duration>,
        kind: LockKind,
    ) -> Result<Acquisition> {
        let resource = normalize_resource(resource)?;
        let ttl = self.resolve_ttl(ttl)?;

        self.with_table(|table| {
            let mut quarantined = Vec::new();
            let outcome = match kind {
                LockKind::Exclusive => {
                    self.claim_exclusive(&resource, holder, ttl, table, &mut quarantined)?
                }
                LockKind::Review => {
                    self.claim_review(&resource, holder, ttl, table, &mut quarantined)?
                }
            };

            Ok(match outcome {
                Ok((record, renewed)) => {
                    table.insert(record.clone());
                    tracing::info!(
                        resource = %record.resource,
                        agent = %record.agent_id,
                        kind = %record.kind,
                        renewed,
                        "lock acquired"
                    );
                    self.events.record(
                        EventType::LockAcquired,
                        json!({
                            "resource": record.resource,
                            "agent_id": record.agent_id,
                            "pid": record.holder_pid,
                            "hostname": record.hostname,
                            "kind": record.kind,
                            "ttl_seconds": record.ttl_seconds,
                            "renewed": renewed,
                        }),
                    );
                    Acquisition::Acquired(LockGrant {
                        record,
                        renewed,
                        quarantined,
                    })
                }
                Err(info) => Acquisition::Held(info),
            })
        })
    }

    fn claim_exclusive(
        &self,
        resource: &str,
        holder: &Holder,
        ttl: Duration,
        table: &mut LockTable,
        quarantined: &mut Vec<String>,
    ) -> Result<std::result::Result<(LockRecord, bool), HolderInfo>> {
        for marker in self.review_markers(resource)? {
            match self.inspect(&marker, resource, Some(holder), table, quarantined)? {
                Claim::Held(info) => return Ok(Err(info)),
                Claim::Ours(review) => {
                    marker.remove()?;
                    table.remove(&review);
                    tracing::debug!(resource, "review lock upgraded to exclusive");
                }
                Claim::Vacant => {}
            }
        }

        let marker = self.exclusive_marker(resource);
        loop {
            let record = LockRecord::new(resource, holder, ttl, LockKind::Exclusive);
            if marker.create(&record)? {
                return Ok(Ok((record, false)));
            }
            match self.inspect(&marker, resource, Some(holder), table, quarantined)? {
                Claim::Vacant => {}
                Claim::Ours(_) => {
                    marker.overwrite(&record)?;
                    return Ok(Ok((record, true)));
                }
                Claim::Held(info) => return Ok(Err(info)),
            }
        }
    }

    fn claim_review(
        &self,
        resource: &str,
        holder: &Holder,
        ttl: Duration,
        table: &mut LockTable,
        quarantined: &mut Vec<String>,
    ) -> Result<std::result::Result<(LockRecord, bool), HolderInfo>> {
        let exclusive = self.exclusive_marker(resource);
        match self.inspect(&exclusive, resource, Some(holder), table, quarantined)? {
            Claim::Vacant => {}
            // An exclusive lock already covers review.
            Claim::Ours(_) => {
                let renewed = LockRecord::new(resource, holder, ttl, LockKind::Exclusive);
                exclusive.overwrite(&renewed)?;
                return Ok(Ok((renewed, true)));
            }
            Claim::Held(info) => return Ok(Err(info)),
        }

        let marker = self.review_marker(resource, &holder.agent_id);
        loop {
            let record = LockRecord::new(resource, holder, ttl, LockKind::Review);
            if marker.create(&record)? {
                return Ok(Ok((record, false)));
            }
            match self.inspect(&marker, resource, Some(holder), table, quarantined)? {
                Claim::Vacant => {}
                Claim::Ours(_) => {
                    marker.overwrite(&record)?;
                    return Ok(Ok((record, true)));
                }
                Claim::Held(info) => return Ok(Err(info)),
            }
        }
    }

    /// Read a marker and quarantine it if stale.
    fn inspect(
        &self,
        marker: &Marker,
        resource: &str,
        holder: Option<&Holder>,
        table: &mut LockTable,
        quarantined: &mut Vec<String>,
    ) -> Result<Claim> {
        let now = Utc::now();
        match marker.read()? {
            None => Ok(Claim::Vacant),
            Some(MarkerContent::Record(existing)) => {
                if holder.is_some_and(|h| existing.is_held_by(h)) {
                    return Ok(Claim::Ours(existing));
                }
                let info = self.policy.assess(&existing, now);
                if !info.stale {
                    return Ok(Claim::Held(info));
                }
                if self.quarantine(marker, Some(&info), now)?.is_some() {
                    table.remove(&existing);
                    quarantined.push(existing.resource);
                }
                Ok(Claim::Vacant)
            }
            Some(MarkerContent::Unreadable { modified }) => {
                let info = unreadable_holder(resource, modified, now);
                if !self.unreadable_expired(&info) {
                    return Ok(Claim::Held(info));
                }
                if self.quarantine(marker, None, now)?.is_some() {
                    quarantined.push(resource.to_string());
                }
                Ok(Claim::Vacant)
            }
        }
    }

    fn unreadable_expired(&self, info: &HolderInfo) -> bool {
        u64::try_from(info.age_secs).is_ok_and(|age| age > self.policy.threshold.as_secs())
    }

    fn quarantine(
        &self,
        marker: &Marker,
        stale: Option<&HolderInfo>,
        now: DateTime<Utc>,
    ) -> Result<Option<PathBuf>> {
        let Some(moved) = marker.quarantine(stale.map(|info| &info.record), now)? else {
            return Ok(None);
        };
        tracing::info!(
            marker = %marker.path().display(),
            quarantined_to = %moved.display(),
            "stale lock quarantined"
        );
        self.events.record(
            EventType::StaleLockQuarantined,
            json!({
                "marker": marker.path().display().to_string(),
                "quarantined_to": moved.display().to_string(),
                "holder": stale.map(|info| &info.record),
                "age_secs": stale.map(|info| info.age_secs),
                "liveness": stale.map(|info| info.liveness),
            }),
        );
        Ok(Some(moved))
    }

    /// Release the caller's lock on `resource`.
    ///
    /// Releasing something nobody holds is a no-op.
    ///
    /// # Errors
    ///
    /// `NotLockHolder` when someone else holds it.
    pub fn release(&self, resource: &str, holder: &Holder) -> Result<Released> {
        let resource = normalize_resource(resource)?;
        self.with_table(|table| {
            let mut blocker = None;
            for marker in [
                self.exclusive_marker(&resource),
                self.review_marker(&resource, &holder.agent_id),
            ] {
                match marker.read()? {
                    Some(MarkerContent::Record(record)) if record.is_held_by(holder) => {
                        marker.remove()?;
                        table.remove(&record);
                        tracing::info!(resource = %resource, agent = %holder.agent_id, "lock released");
                        self.events.record(
                            EventType::LockReleased,
                            json!({
                                "resource": resource,
                                "agent_id": record.agent_id,
                                "kind": record.kind,
                                "held_secs": record.age_secs(Utc::now()),
                            }),
                        );
                        return Ok(Released::Released);
                    }
                    Some(MarkerContent::Record(record)) => {
                        blocker.get_or_insert(record);
                    }
                    Some(MarkerContent::Unreadable { .. }) | None => {}
                }
            }

            let leftovers: Vec<LockRecord> = table
                .records()
                .filter(|r| r.resource == resource && r.is_held_by(holder))
                .cloned()
                .collect();
            for record in &leftovers {
                table.remove(record);
            }

            match blocker {
                Some(record) => Err(Error::NotLockHolder {
                    resource,
                    holder: record.agent_id,
                    holder_host: record.hostname,
                    caller: holder.agent_id.clone(),
                    caller_host: holder.hostname.clone(),
                }),
                None => Ok(Released::NotHeld),
            }
        })
    }

    /// Release every lock recorded for `agent_id`. Returns how many markers
    /// were removed.
    pub fn release_all(&self, agent_id: &str) -> Result<usize> {
        self.with_table(|table| {
            let mine: Vec<LockRecord> = table
                .records()
                .filter(|record| record.agent_id == agent_id)
                .cloned()
                .collect();

            let mut released = 0;
            for record in mine {
                let marker = self.marker_for(&record);
                if let Some(MarkerContent::Record(current)) = marker.read()? {
                    if current.agent_id == record.agent_id && current.hostname == record.hostname {
                        marker.remove()?;
                        released += 1;
                        self.events.record(
                            EventType::LockReleased,
                            json!({
                                "resource": current.resource,
                                "agent_id": current.agent_id,
                                "kind": current.kind,
                                "bulk": true,
                            }),
                        );
                    }
                }
                table.remove(&record);
            }

            if released > 0 {
                tracing::info!(agent = agent_id, released, "released all locks");
            }
            Ok(released)
        })
    }

    /// Every live lock with its age and liveness, ordered by resource.
    pub fn list(&self) -> Result<Vec<HolderInfo>> {
        let now = Utc::now();
        let mut infos: Vec<HolderInfo> = self
            .live_markers()
            .into_iter()
            .filter_map(|marker| match marker.read() {
                Ok(Some(MarkerContent::Record(record))) => Some(self.policy.assess(&record, now)),
                Ok(_) => None,
                Err(e) => {
                    tracing::warn!(marker = %marker.path().display(), error = %e, "skipping unreadable marker");
                    None
                }
            })
            .collect();
        infos.sort_by(|a, b| {
            (&a.record.resource, a.record.kind.as_ref(), &a.record.agent_id).cmp(&(
                &b.record.resource,
                b.record.kind.as_ref(),
                &b.record.agent_id,
            ))
        });
        Ok(infos)
    }

    /// Current exclusive holder of `resource`, if any.
    pub fn holder_of(&self, resource: &str) -> Result<Option<HolderInfo>> {
        let resource = normalize_resource(resource)?;
        Ok(match self.exclusive_marker(&resource).read()? {
            Some(MarkerContent::Record(record)) => Some(self.policy.assess(&record, Utc::now())),
            Some(MarkerContent::Unreadable { .. }) | None => None,
        })
    }

    /// Quarantine stale markers, reconcile the table with the markers and
    /// purge quarantine files past the retention window.
    ///
    /// Live markers are never removed.
    pub fn cleanup_expired(&self) -> Result<CleanupReport> {
        self.with_table(|table| {
            let mut report = CleanupReport::default();
            let now = Utc::now();

            for marker in self.live_markers() {
                match marker.read()? {
                    Some(MarkerContent::Record(record)) => {
                        let info = self.policy.assess(&record, now);
                        if info.stale {
                            if self.quarantine(&marker, Some(&info), now)?.is_some() {
                                table.remove(&record);
                                report.quarantined.push(record.resource);
                            }
                        } else if !table.records().any(|known| *known == record) {
                            table.insert(record);
                            report.adopted += 1;
                        }
                    }
                    Some(MarkerContent::Unreadable { modified }) => {
                        let resource = self.resource_of(marker.path());
                        let info = unreadable_holder(&resource, modified, now);
                        if self.unreadable_expired(&info)
                            && self.quarantine(&marker, None, now)?.is_some()
                        {
                            report.quarantined.push(resource);
                        }
                    }
                    None => {}
                }
            }

            let orphans: Vec<LockRecord> = table
                .records()
                .filter(|record| {
                    !matches!(
                        self.marker_for(record).read(),
                        Ok(Some(MarkerContent::Record(ref current))) if current == *record
                    )
                })
                .cloned()
                .collect();
            for orphan in &orphans {
                table.remove(orphan);
            }
            report.orphans_dropped = orphans.len();

            report.purged = self.purge_quarantined(now)?;
            table.last_cleanup = Some(now);

            tracing::info!(
                quarantined = report.quarantined.len(),
                orphans = report.orphans_dropped,
                adopted = report.adopted,
                purged = report.purged,
                "lock cleanup finished"
            );
            Ok(report)
        })
    }

    fn purge_quarantined(&self, now: DateTime<Utc>) -> Result<usize> {
        let Some(retention) = self.config.retention() else {
            return Ok(0);
        };
        let retention = i64::try_from(retention.as_secs()).unwrap_or(i64::MAX);
        let cutoff = now.timestamp().saturating_sub(retention);
        let mut purged = 0;

        for entry in WalkDir::new(&self.locks_dir)
            .into_iter()
            .filter_map(std::result::Result::ok)
            .filter(|entry| entry.file_type().is_file())
        {
            let Some(quarantined_at) = quarantine_epoch(&entry.file_name().to_string_lossy())
            else {
                continue;
            };
            if quarantined_at >= cutoff {
                continue;
            }

            match fs::remove_file(entry.path()) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => {
                    return Err(Error::io(
                        format!("failed to purge {}", entry.path().display()),
                        e,
                    ))
                }
            }
            purged += 1;
            self.events.record(
                EventType::StaleLockPurged,
                json!({
                    "file": entry.path().display().to_string(),
                    "quarantined_at": quarantined_at,
                }),
            );
        }
        Ok(purged)
    }

    /// Most recent lock events, oldest first.
    pub fn recent_events(&self, limit: usize) -> Result<Vec<LogEntry>> {
        let mut entries = self.events.read_entries()?;
        let skip = entries.len().saturating_sub(limit);
        Ok(entries.split_off(skip))
    }

    fn resolve_ttl(&self, ttl: Option<Duration>) -> Result<Duration> {
        match ttl {
            Some(ttl) if ttl.as_secs() == 0 => Err(Error::InvalidInput(
                "lock ttl must be at least one second".to_string(),
            )),
            Some(ttl) => Ok(ttl),
            None => Ok(Duration::from_secs(self.config.default_ttl_secs)),
        }
    }

    /// Run `f` on the lock table under its guard, saving it if changed.
    ///
    /// The table is written even when `f` fails, since markers may already
    /// have been moved.
    fn with_table<R>(&self, f: impl FnOnce(&mut LockTable) -> Result<R>) -> Result<R> {
        let guard = self.store.guard(LOCK_TABLE)?;
        let mut table: LockTable = self.store.read(LOCK_TABLE)?;
        let before = table.clone();
        let outcome = f(&mut table);
        if table != before {
            self.store.write(LOCK_TABLE, &table)?;
        }
        guard.release()?;
        outcome
    }

    fn exclusive_marker(&self, resource: &str) -> Marker {
        Marker::new(self.locks_dir.join(format!("{resource}.lock")))
    }

    fn review_marker(&self, resource: &str, agent_id: &str) -> Marker {
        Marker::new(
            self.locks_dir
                .join(format!("{resource}{REVIEW_INFIX}{}", agent_slug(agent_id))),
        )
    }

    fn marker_for(&self, record: &LockRecord) -> Marker {
        match record.kind {
            LockKind::Exclusive => self.exclusive_marker(&record.resource),
            LockKind::Review => self.review_marker(&record.resource, &record.agent_id),
        }
    }

    fn review_markers(&self, resource: &str) -> Result<Vec<Marker>> {
        let exclusive = self.exclusive_marker(resource);
        let (Some(dir), Some(base)) = (
            exclusive.path().parent(),
            exclusive.path().file_name().map(|n| n.to_string_lossy()),
        ) else {
            return Ok(Vec::new());
        };
        let prefix = format!("{}{REVIEW_INFIX}", base.trim_end_matches(".lock"));

        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::io(format!("failed to list {}", dir.display()), e)),
        };
        let mut markers: Vec<Marker> = entries
            .filter_map(std::result::Result::ok)
            .filter(|entry| {
                let name = entry.file_name().to_string_lossy().into_owned();
                name.starts_with(&prefix) && is_marker_name(&name)
            })
            .map(|entry| Marker::new(entry.path()))
            .collect();
        markers.sort_by(|a, b| a.path().cmp(b.path()));
        Ok(markers)
    }

    fn live_markers(&self) -> Vec<Marker> {
        let mut markers: Vec<Marker> = WalkDir::new(&self.locks_dir)
            .into_iter()
            .filter_map(std::result::Result::ok)
            .filter(|entry| entry.file_type().is_file())
            .filter(|entry| is_marker_name(&entry.file_name().to_string_lossy()))
            .map(|entry| Marker::new(entry.into_path()))
            .collect();
        markers.sort_by(|a, b| a.path().cmp(b.path()));
        markers
    }

    /// Resource key a marker path stands for.
    fn resource_of(&self, path: &Path) -> String {
        let relative = path
            .strip_prefix(&self.locks_dir)
            .unwrap_or(path)
            .to_string_lossy()
            .replace('\\', "/");
        match relative.split_once(REVIEW_INFIX) {
            Some((resource, _)) => resource.to_string(),
            None => relative.trim_end_matches(".lock").to_string(),
        }
    }
}

/// Stand-in holder for a marker whose contents cannot be parsed.
fn unreadable_holder(resource: &str, modified: DateTime<Utc>, now: DateTime<Utc>) -> HolderInfo {
    HolderInfo {
        record: LockRecord {
            resource: resource.to_string(),
            holder_pid: 0,
            hostname: "unknown".to_string(),
            agent_id: "unknown".to_string(),
            acquired_at_utc: modified,
            ttl_seconds: 0,
            kind: LockKind::Exclusive,
        },
        age_secs: (now - modified).num_seconds().max(0),
        liveness: Liveness::Unverifiable,
        stale: false,
    }
}

/// File-name-safe form of an agent id.
///
/// Bytes outside `[A-Za-z0-9_-]` are percent-encoded, so distinct ids never
/// share a review marker.
fn agent_slug(agent_id: &str) -> String {
    agent_id.bytes().fold(String::with_capacity(agent_id.len()), |mut slug, byte| {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
            slug.push(char::from(byte));
        } else {
            slug.push_str(&format!("%{byte:02X}"));
        }
        slug
    })
}
