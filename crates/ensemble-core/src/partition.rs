//! Per-agent path partitions and the conflicts between them.
//!
//! Partitions are advisory: overlap and nesting are reported, never
//! prevented.

use std::{collections::BTreeMap, fmt};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::IntoStaticStr;

use crate::{lock::normalize_resource, store::StateStore, Result};

/// Partition table document.
pub const PARTITIONS: &str = "partitions.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionEntry {
    pub task_id: String,
    pub prefixes: Vec<String>,
    pub declared_at: DateTime<Utc>,
}

/// Active partitions keyed by agent id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PartitionTable {
    pub agents: BTreeMap<String, PartitionEntry>,
}

/// A reported coordination conflict.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, IntoStaticStr,
)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum Conflict {
    /// Two agents declared the same prefix.
    PartitionOverlap {
        agent_a: String,
        agent_b: String,
        prefix: String,
    },
    /// One agent's prefix lies strictly inside another's.
    PartitionNested {
        outer_agent: String,
        outer: String,
        inner_agent: String,
        inner: String,
    },
    /// An exclusive lock held by one agent inside another agent's partition.
    LockInPartition {
        holder: String,
        resource: String,
        owner: String,
        prefix: String,
    },
}

impl Conflict {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        self.into()
    }

    /// Overlap or nesting between two (agent, prefix) claims, if any.
    #[must_use]
    pub fn between(agent_a: &str, a: &str, agent_b: &str, b: &str) -> Option<Self> {
        if a == b {
            Some(Self::PartitionOverlap {
                agent_a: agent_a.to_string(),
                agent_b: agent_b.to_string(),
                prefix: a.to_string(),
            })
        } else if contains(a, b) {
            Some(Self::PartitionNested {
                outer_agent: agent_a.to_string(),
                outer: a.to_string(),
                inner_agent: agent_b.to_string(),
                inner: b.to_string(),
            })
        } else if contains(b, a) {
            Some(Self::PartitionNested {
                outer_agent: agent_b.to_string(),
                outer: b.to_string(),
                inner_agent: agent_a.to_string(),
                inner: a.to_string(),
            })
        } else {
            None
        }
    }
}

impl fmt::Display for Conflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PartitionOverlap {
                agent_a,
                agent_b,
                prefix,
            } => write!(f, "{}: {agent_a} and {agent_b} both claim '{prefix}'", self.kind()),
            Self::PartitionNested {
                outer_agent,
                outer,
                inner_agent,
                inner,
            } => write!(
                f,
                "{}: '{inner}' ({inner_agent}) lies inside '{outer}' ({outer_agent})",
                self.kind()
            ),
            Self::LockInPartition {
                holder,
                resource,
                owner,
                prefix,
            } => write!(
                f,
                "{}: {holder} locks '{resource}' inside '{prefix}' owned by {owner}",
                self.kind()
            ),
        }
    }
}

/// Whether `path` is `prefix` or lies below it, compared by segment.
#[must_use]
pub fn contains(prefix: &str, path: &str) -> bool {
    path == prefix
        || path
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('/'))
}

/// Handle on the partition table.
#[derive(Debug, Clone)]
pub struct Partitions {
    store: StateStore,
}

impl Partitions {
    #[must_use]
    pub const fn new(store: StateStore) -> Self {
        Self { store }
    }

    pub fn load(&self) -> Result<PartitionTable> {
        self.store.read(PARTITIONS)
    }

    /// Record `agent`'s prefixes for `task_id`, replacing any earlier entry.
    pub fn declare(&self, agent: &str, task_id: &str, prefixes: &[String]) -> Result<PartitionEntry> {
        let prefixes = normalize_prefixes(prefixes)?;
        self.store.update(PARTITIONS, |table: &mut PartitionTable| {
            let entry = PartitionEntry {
                task_id: task_id.to_string(),
                prefixes,
                declared_at: Utc::now(),
            };
            table.agents.insert(agent.to_string(), entry.clone());
            tracing::debug!(agent, task = task_id, "partition declared");
            Ok(entry)
        })
    }

    /// Drop `agent`'s entry. With `task_id`, only if it belongs to that task.
    pub fn clear(&self, agent: &str, task_id: Option<&str>) -> Result<Option<PartitionEntry>> {
        self.store.update(PARTITIONS, |table: &mut PartitionTable| {
            let owned = table
                .agents
                .get(agent)
                .is_some_and(|entry| task_id.map_or(true, |id| entry.task_id == id));
            Ok(if owned { table.agents.remove(agent) } else { None })
        })
    }

    /// Other agents' partitions that contain, or lie inside, `paths`.
    pub fn check_targets(&self, agent: &str, paths: &[String]) -> Result<Vec<Conflict>> {
        let normalized = normalize_prefixes(paths)?;
        let targets = normalized.as_slice();
        let table = self.load()?;
        let mut conflicts: Vec<Conflict> = table
            .agents
            .iter()
            .filter(|(other, _)| other.as_str() != agent)
            .flat_map(|(other, entry)| {
                entry.prefixes.iter().flat_map(move |prefix| {
                    targets
                        .iter()
                        .filter_map(move |target| Conflict::between(agent, target, other, prefix))
                })
            })
            .collect();
        conflicts.sort();
        conflicts.dedup();
        Ok(conflicts)
    }
}

/// Normalize, sort and deduplicate prefixes.
pub fn normalize_prefixes(prefixes: &[String]) -> Result<Vec<String>> {
    let mut normalized = prefixes
        .iter()
        .map(|p| normalize_resource(p))
        .collect::<Result<Vec<_>>>()?;
    normalized.sort();
    normalized.dedup();
    Ok(normalized)
}
