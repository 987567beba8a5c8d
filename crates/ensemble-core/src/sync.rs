//! Sync point: clean expired locks, then report partition conflicts.

use std::path::PathBuf;

use itertools::Itertools;
use serde::Serialize;
use serde_json::json;

use crate::{
    events::{EventLog, EventType},
    lock::{CleanupReport, HolderInfo, LockManager},
    partition::{contains, Conflict, PartitionTable, Partitions},
    registry::ErrorRegistry,
    Result,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub cleaned_locks: usize,
    pub cleanup: CleanupReport,
    pub conflicts: Vec<Conflict>,
    pub findings_path: PathBuf,
}

/// Conflicts between declared partitions and live exclusive locks.
///
/// Sorted and deduplicated, so equal inputs give equal output.
#[must_use]
pub fn detect_conflicts(partitions: &PartitionTable, locks: &[HolderInfo]) -> Vec<Conflict> {
    let claims: Vec<(&str, &str)> = partitions
        .agents
        .iter()
        .flat_map(|(agent, entry)| {
            entry
                .prefixes
                .iter()
                .map(move |prefix| (agent.as_str(), prefix.as_str()))
        })
        .collect();

    let between_agents = claims
        .iter()
        .tuple_combinations()
        .filter(|((agent_a, _), (agent_b, _))| agent_a != agent_b)
        .filter_map(|((agent_a, a), (agent_b, b))| Conflict::between(agent_a, a, agent_b, b));

    let locks_inside = locks
        .iter()
        .filter(|info| info.record.kind.is_exclusive())
        .flat_map(|info| {
            claims
                .iter()
                .filter(move |(owner, prefix)| {
                    *owner != info.record.agent_id && contains(prefix, &info.record.resource)
                })
                .map(move |(owner, prefix)| Conflict::LockInPartition {
                    holder: info.record.agent_id.clone(),
                    resource: info.record.resource.clone(),
                    owner: (*owner).to_string(),
                    prefix: (*prefix).to_string(),
                })
        });

    let mut conflicts: Vec<Conflict> = between_agents.chain(locks_inside).collect();
    conflicts.sort();
    conflicts.dedup();
    conflicts
}

#[derive(Debug, Clone)]
pub struct SyncPoint {
    locks: LockManager,
    partitions: Partitions,
    registry: ErrorRegistry,
    events: EventLog,
}

impl SyncPoint {
    #[must_use]
    pub const fn new(
        locks: LockManager,
        partitions: Partitions,
        registry: ErrorRegistry,
        events: EventLog,
    ) -> Self {
        Self {
            locks,
            partitions,
            registry,
            events,
        }
    }

    /// Reconcile once. Conflicts are reported, not resolved.
    pub fn run(&self) -> Result<SyncReport> {
        let cleanup = self.locks.cleanup_expired()?;
        let partitions = self.partitions.load()?;
        let live = self.locks.list()?;
        let conflicts = detect_conflicts(&partitions, &live);
        let findings_path = self.registry.regenerate_summary()?;

        let report = SyncReport {
            cleaned_locks: cleanup.cleaned(),
            cleanup,
            conflicts,
            findings_path,
        };

        if report.conflicts.is_empty() {
            tracing::info!(cleaned = report.cleaned_locks, "sync point clean");
        } else {
            tracing::warn!(
                cleaned = report.cleaned_locks,
                conflicts = report.conflicts.len(),
                "sync point found conflicts"
            );
        }
        self.events.record(
            EventType::SyncPoint,
            json!({
                "cleaned_locks": report.cleaned_locks,
                "purged": report.cleanup.purged,
                "agents": partitions.agents.len(),
                "locks": live.len(),
                "conflicts": report.conflicts,
            }),
        );
        Ok(report)
    }
}
