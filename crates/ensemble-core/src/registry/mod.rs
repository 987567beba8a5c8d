//! Error registry: deduplicates failures by normalized signature.
//!
//! The registry document (`errors/_registry.json`) is the source of truth.
//! Every record is mirrored to `errors/<id>.json` under the same guard, so the
//! two never disagree on status. `findings.md` is derived from the registry.

mod signature;
mod summary;

use std::{
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use strum::{AsRefStr, Display, EnumIter, EnumString};

pub use signature::{hash_signature, SignaturePolicy, V1Policy};
pub use summary::{manual_section, render as render_summary, MANUAL_MARKER};

use crate::{
    events::{EventLog, EventType},
    ids,
    store::{atomic_write, StateStore},
    Error, Result,
};

/// Directory of per-error documents.
pub const ERRORS_DIR: &str = "errors";
/// Registry document.
pub const REGISTRY: &str = "errors/_registry.json";

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
    EnumIter,
)]
#[serde(rename_all = "UPPERCASE")]
#[strum(serialize_all = "UPPERCASE", ascii_case_insensitive)]
pub enum ErrorCategory {
    Syntax,
    Import,
    Runtime,
    Type,
    Logic,
    Config,
    Build,
    Test,
    Other,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "UPPERCASE")]
#[strum(serialize_all = "UPPERCASE", ascii_case_insensitive)]
pub enum ErrorStatus {
    Open,
    Resolved,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub id: String,
    #[serde(rename = "type")]
    pub category: ErrorCategory,
    pub file: String,
    pub line: Option<u32>,
    pub message: String,
    pub signature: String,
    pub status: ErrorStatus,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub occurrences: u64,
    #[serde(default)]
    pub related_tasks: Vec<String>,
    #[serde(default)]
    pub registered_by: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_by: Option<String>,
}

impl ErrorRecord {
    fn add_task(&mut self, task: &str) {
        if !self.related_tasks.iter().any(|t| t == task) {
            self.related_tasks.push(task.to_string());
        }
    }

    /// Fold a record with the same signature into this one.
    fn absorb(&mut self, other: Self) {
        self.occurrences = self.occurrences.saturating_add(other.occurrences);
        self.first_seen = self.first_seen.min(other.first_seen);
        self.last_seen = self.last_seen.max(other.last_seen);
        for task in &other.related_tasks {
            self.add_task(task);
        }
        if other.status == ErrorStatus::Open {
            self.status = ErrorStatus::Open;
        }
    }
}

/// The registry document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryDoc {
    pub errors: Vec<ErrorRecord>,
    pub last_updated: Option<DateTime<Utc>>,
    /// Version of the policy the signatures were computed with.
    pub sig_version: u32,
}

/// A failure as reported by an agent or tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorReport {
    pub category: ErrorCategory,
    pub file: String,
    pub line: Option<u32>,
    pub message: String,
    pub task_id: Option<String>,
    pub agent: String,
}

impl ErrorReport {
    #[must_use]
    pub fn new(category: ErrorCategory, file: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            category,
            file: file.into(),
            line: None,
            message: message.into(),
            task_id: None,
            agent: "cli".to_string(),
        }
    }

    #[must_use]
    pub const fn with_line(mut self, line: u32) -> Self {
        self.line = Some(line);
        self
    }

    #[must_use]
    pub fn with_task(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    #[must_use]
    pub fn with_agent(mut self, agent: impl Into<String>) -> Self {
        self.agent = agent.into();
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Registration {
    pub record: ErrorRecord,
    /// An existing record with the same signature absorbed this report.
    pub duplicate: bool,
}

/// Search filters; `None` matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchFilter {
    /// Substring of the recorded file.
    pub file: Option<String>,
    pub category: Option<ErrorCategory>,
    pub status: Option<ErrorStatus>,
    pub task_id: Option<String>,
}

impl SearchFilter {
    fn matches(&self, record: &ErrorRecord) -> bool {
        self.file.as_ref().map_or(true, |f| record.file.contains(f.as_str()))
            && self.category.map_or(true, |c| record.category == c)
            && self.status.map_or(true, |s| record.status == s)
            && self
                .task_id
                .as_ref()
                .map_or(true, |t| record.related_tasks.contains(t))
    }
}

fn error_doc(id: &str) -> String {
    format!("{ERRORS_DIR}/{id}.json")
}

#[derive(Debug, Clone)]
pub struct ErrorRegistry {
    store: StateStore,
    events: EventLog,
    policy: Arc<dyn SignaturePolicy>,
    findings: PathBuf,
}

impl ErrorRegistry {
    #[must_use]
    pub fn new(store: StateStore, events: EventLog, findings: impl Into<PathBuf>) -> Self {
        Self {
            store,
            events,
            policy: Arc::new(V1Policy),
            findings: findings.into(),
        }
    }

    /// Replace the signature policy. Stored records are re-signed on the next
    /// mutation if the version differs.
    #[must_use]
    pub fn with_policy(mut self, policy: Arc<dyn SignaturePolicy>) -> Self {
        self.policy = policy;
        self
    }

    #[must_use]
    pub fn findings_path(&self) -> &Path {
        &self.findings
    }

    #[must_use]
    pub fn signature(&self, location: &str, message: &str) -> String {
        self.policy.signature(location, message)
    }

    /// Record a failure, merging it into an existing record when the
    /// signatures match.
    pub fn register(&self, report: ErrorReport) -> Result<Registration> {
        if report.message.trim().is_empty() {
            return Err(Error::InvalidInput("error message cannot be empty".into()));
        }

        let registration = self.store.update(REGISTRY, |doc: &mut RegistryDoc| {
            let now = Utc::now();
            self.migrate_if_needed(doc)?;
            let signature = self.policy.signature(&report.file, &report.message);
            doc.last_updated = Some(now);

            if let Some(existing) = doc.errors.iter_mut().find(|e| e.signature == signature) {
                existing.occurrences = existing.occurrences.saturating_add(1);
                existing.last_seen = now;
                if let Some(task) = &report.task_id {
                    existing.add_task(task);
                }
                let record = existing.clone();
                self.store.write(&error_doc(&record.id), &record)?;
                return Ok(Registration {
                    record,
                    duplicate: true,
                });
            }

            let record = ErrorRecord {
                id: ids::next_id("ERR", now, doc.errors.iter().map(|e| e.id.as_str())),
                category: report.category,
                file: report.file.clone(),
                line: report.line,
                message: report.message.clone(),
                signature,
                status: ErrorStatus::Open,
                first_seen: now,
                last_seen: now,
                occurrences: 1,
                related_tasks: report.task_id.iter().cloned().collect(),
                registered_by: report.agent.clone(),
                resolution: None,
                resolved_at: None,
                resolved_by: None,
            };
            doc.errors.push(record.clone());
            self.store.write(&error_doc(&record.id), &record)?;
            Ok(Registration {
                record,
                duplicate: false,
            })
        })?;

        let record = &registration.record;
        tracing::info!(
            id = %record.id,
            duplicate = registration.duplicate,
            occurrences = record.occurrences,
            "error registered"
        );
        self.events.record(
            EventType::ErrorRegistered,
            json!({
                "id": record.id,
                "type": record.category,
                "file": record.file,
                "signature": record.signature,
                "duplicate": registration.duplicate,
                "occurrences": record.occurrences,
                "agent": report.agent,
            }),
        );
        Ok(registration)
    }

    /// Mark an error resolved in the registry and its own document.
    pub fn resolve(&self, id: &str, resolution: &str, agent: &str) -> Result<ErrorRecord> {
        if resolution.trim().is_empty() {
            return Err(Error::InvalidInput("resolution note cannot be empty".into()));
        }

        let record = self.store.update(REGISTRY, |doc: &mut RegistryDoc| {
            self.migrate_if_needed(doc)?;
            let now = Utc::now();
            let record = doc
                .errors
                .iter_mut()
                .find(|e| e.id == id)
                .ok_or_else(|| Error::not_found("error", id))?;
            record.status = ErrorStatus::Resolved;
            record.resolution = Some(resolution.to_string());
            record.resolved_at = Some(now);
            record.resolved_by = Some(agent.to_string());
            let record = record.clone();
            doc.last_updated = Some(now);
            self.store.write(&error_doc(&record.id), &record)?;
            Ok(record)
        })?;

        tracing::info!(id = %record.id, agent, "error resolved");
        self.events.record(
            EventType::ErrorResolved,
            json!({ "id": record.id, "agent": agent, "resolution": resolution }),
        );
        Ok(record)
    }

    /// Matching records, most recently seen first.
    pub fn search(&self, filter: &SearchFilter) -> Result<Vec<ErrorRecord>> {
        let doc: RegistryDoc = self.store.read(REGISTRY)?;
        let mut found: Vec<ErrorRecord> = doc
            .errors
            .into_iter()
            .filter(|record| filter.matches(record))
            .collect();
        found.sort_by(|a, b| b.last_seen.cmp(&a.last_seen).then_with(|| a.id.cmp(&b.id)));
        Ok(found)
    }

    pub fn list(&self) -> Result<Vec<ErrorRecord>> {
        Ok(self.store.read::<RegistryDoc>(REGISTRY)?.errors)
    }

    pub fn get(&self, id: &str) -> Result<ErrorRecord> {
        self.list()?
            .into_iter()
            .find(|e| e.id == id)
            .ok_or_else(|| Error::not_found("error", id))
    }

    /// Re-sign every record under the current policy and merge collisions.
    /// Returns how many records were merged away.
    pub fn rebuild_signatures(&self) -> Result<usize> {
        self.store
            .update(REGISTRY, |doc: &mut RegistryDoc| self.resign(doc))
    }

    fn migrate_if_needed(&self, doc: &mut RegistryDoc) -> Result<()> {
        if doc.sig_version == self.policy.version() {
            return Ok(());
        }
        if doc.errors.is_empty() {
            doc.sig_version = self.policy.version();
            return Ok(());
        }
        self.resign(doc).map(|_| ())
    }

    fn resign(&self, doc: &mut RegistryDoc) -> Result<usize> {
        let from = doc.sig_version;
        let mut records = std::mem::take(&mut doc.errors);
        records.sort_by(|a, b| a.id.cmp(&b.id));

        let mut kept: Vec<ErrorRecord> = Vec::with_capacity(records.len());
        let mut merged_away = Vec::new();
        for mut record in records {
            record.signature = self.policy.signature(&record.file, &record.message);
            match kept.iter_mut().find(|k| k.signature == record.signature) {
                Some(survivor) => {
                    merged_away.push(record.id.clone());
                    survivor.absorb(record);
                }
                None => kept.push(record),
            }
        }

        for record in &kept {
            self.store.write(&error_doc(&record.id), record)?;
        }
        for id in &merged_away {
            self.store.remove(&error_doc(id))?;
        }

        doc.errors = kept;
        doc.sig_version = self.policy.version();
        doc.last_updated = Some(Utc::now());

        tracing::info!(from, to = doc.sig_version, merged = merged_away.len(), "signatures rebuilt");
        self.events.record(
            EventType::SignaturesRebuilt,
            json!({
                "from_version": from,
                "to_version": doc.sig_version,
                "records": doc.errors.len(),
                "merged": merged_away,
            }),
        );
        Ok(merged_away.len())
    }

    /// Rewrite `findings.md`, keeping its manual section.
    pub fn regenerate_summary(&self) -> Result<PathBuf> {
        let errors = self.list()?;
        let previous = match fs::read_to_string(&self.findings) {
            Ok(text) => Some(text),
            Err(e) if e.kind() == ErrorKind::NotFound => None,
            Err(e) => {
                return Err(Error::io(
                    format!("failed to read {}", self.findings.display()),
                    e,
                ))
            }
        };
        let manual = previous.as_deref().and_then(manual_section);
        let text = render_summary(&errors, Utc::now(), manual);
        atomic_write(&self.findings, text.as_bytes())?;
        tracing::debug!(path = %self.findings.display(), errors = errors.len(), "findings regenerated");
        Ok(self.findings.clone())
    }
}
