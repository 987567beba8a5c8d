//! Short-lived guards serializing read-modify-write cycles on documents.

use std::{path::PathBuf, time::Instant};

use chrono::Utc;
use serde_json::json;

use super::{
    marker::{Marker, MarkerContent},
    retry::Backoff,
    types::{Holder, LockKind, LockRecord, StalenessPolicy},
};
use crate::{
    events::{EventLog, EventType},
    Error, Result,
};

/// Agent id recorded in guard markers.
const GUARD_AGENT: &str = "ensemble-guard";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuardOptions {
    pub policy: StalenessPolicy,
    pub backoff: Backoff,
}

/// Exclusive guard on one document, released on drop.
#[derive(Debug)]
pub struct Guard {
    marker: Marker,
    record: LockRecord,
    active: bool,
}

impl Guard {
    /// Take the guard at `path`, reclaiming it from a dead or expired owner.
    pub fn acquire(path: impl Into<PathBuf>, options: &GuardOptions, events: &EventLog) -> Result<Self> {
        let marker = Marker::new(path);
        let name = marker
            .path()
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let holder = Holder::new(GUARD_AGENT);
        let started = Instant::now();
        let mut attempt = 0_u32;

        loop {
            let record = LockRecord::new(
                name.clone(),
                &holder,
                options.policy.threshold,
                LockKind::Exclusive,
            );
            if marker.create(&record)? {
                return Ok(Self {
                    marker,
                    record,
                    active: true,
                });
            }

            let now = Utc::now();
            let blocker = match marker.read()? {
                None => continue,
                Some(MarkerContent::Record(existing)) => {
                    let info = options.policy.assess(&existing, now);
                    if info.stale {
                        if let Some(moved) = marker.quarantine(Some(&existing), now)? {
                            tracing::info!(guard = %marker.path().display(), "reclaimed stale guard");
                            events.record(
                                EventType::StaleLockQuarantined,
                                json!({
                                    "marker": marker.path().display().to_string(),
                                    "quarantined_to": moved.display().to_string(),
                                    "holder": existing,
                                    "age_secs": info.age_secs,
                                    "liveness": info.liveness,
                                }),
                            );
                        }
                        continue;
                    }
                    Some(info)
                }
                Some(MarkerContent::Unreadable { modified }) => {
                    let age = (now - modified).num_seconds();
                    let limit = i64::try_from(options.policy.threshold.as_secs()).unwrap_or(i64::MAX);
                    if age > limit {
                        marker.quarantine(None, now)?;
                        continue;
                    }
                    None
                }
            };

            if !options.backoff.wait(started, attempt) {
                return Err(blocker.map_or_else(
                    || Error::LockHeld {
                        resource: name.clone(),
                        agent_id: "unknown".to_string(),
                        pid: 0,
                        hostname: "unknown".to_string(),
                        age_secs: 0,
                        liveness: "unverifiable".to_string(),
                    },
                    |info| info.held_error(),
                ));
            }
            attempt = attempt.saturating_add(1);
        }
    }

    /// Release explicitly, surfacing I/O failures that drop would swallow.
    pub fn release(mut self) -> Result<()> {
        self.active = false;
        self.remove_if_ours()
    }

    fn remove_if_ours(&self) -> Result<()> {
        match self.marker.read()? {
            Some(MarkerContent::Record(current)) if current == self.record => {
                self.marker.remove().map(|_| ())
            }
            _ => {
                tracing::warn!(
                    guard = %self.marker.path().display(),
                    "guard was reclaimed by another process before release"
                );
                Ok(())
            }
        }
    }
}

impl Drop for Guard {
    fn drop(&mut self) {
        if self.active {
            if let Err(e) = self.remove_if_ours() {
                tracing::warn!(guard = %self.marker.path().display(), error = %e, "failed to release guard");
            }
        }
    }
}
