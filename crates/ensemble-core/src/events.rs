//! Append-only JSONL event log.
//!
//! One JSON object per line, tagged with a schema version, UTC epoch and
//! ISO-8601 timestamps, hostname, pid, event name and a details object.
//! Paths inside details are home-masked before they are written. Files rotate
//! at a size limit, keeping a fixed number of generations.

use std::{
    fs::{self, File, OpenOptions},
    io::{BufRead, BufReader, Write},
    path::{Path, PathBuf},
};

use chrono::{SecondsFormat, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::{AsRefStr, Display};

use crate::{config::EventLogConfig, host, Error, Result};

/// Schema version stamped on every line.
pub const LOG_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, AsRefStr)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    LockAcquired,
    LockReleased,
    LockConflict,
    StaleLockQuarantined,
    StaleLockPurged,
    StateCorrupted,
    StateRestoredFromBackup,
    StateReset,
    ErrorRegistered,
    ErrorResolved,
    SignaturesRebuilt,
    SyncPoint,
    TaskTransition,
}

/// A single line of the event log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogEntry {
    pub log_v: u32,
    pub event: EventType,
    pub timestamp_utc: f64,
    pub timestamp_utc_iso: String,
    pub hostname: String,
    pub pid: u32,
    pub details: Value,
}

impl LogEntry {
    fn now(event: EventType, details: Value) -> Self {
        let now = Utc::now();
        #[allow(clippy::cast_precision_loss)]
        let epoch = now.timestamp_micros() as f64 / 1_000_000.0;
        Self {
            log_v: LOG_SCHEMA_VERSION,
            event,
            timestamp_utc: epoch,
            timestamp_utc_iso: now.to_rfc3339_opts(SecondsFormat::Millis, true),
            hostname: host::local_hostname().to_string(),
            pid: std::process::id(),
            details,
        }
    }
}

/// Handle on one JSONL log file.
#[derive(Debug, Clone)]
pub struct EventLog {
    path: PathBuf,
    config: EventLogConfig,
    home: Option<String>,
}

impl EventLog {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, config: EventLogConfig) -> Self {
        Self {
            path: path.into(),
            config,
            home: host::home_dir(),
        }
    }

    /// Override the directory masked as `~`.
    #[must_use]
    pub fn with_home(mut self, home: Option<String>) -> Self {
        self.home = home;
        self
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append an event, rotating first if the file is over its size limit.
    ///
    /// Concurrent appenders serialize on an advisory lock held on a sidecar
    /// file, which is never renamed by rotation.
    pub fn append(&self, event: EventType, details: Value) -> Result<()> {
        let details = mask_home(details, self.home.as_deref());
        let entry = LogEntry::now(event, details);
        let mut line = serde_json::to_string(&entry)
            .map_err(|e| Error::serialization("failed to encode log entry", e))?;
        line.push('\n');

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                Error::io(format!("failed to create log directory {}", parent.display()), e)
            })?;
        }

        let guard = self.open_guard()?;
        guard
            .lock_exclusive()
            .map_err(|e| Error::io(format!("failed to lock {}", self.path.display()), e))?;

        let outcome = self.rotate_if_needed().and_then(|()| self.write_line(&line));
        let _ = guard.unlock();
        outcome?;

        tracing::debug!(event = %event, log = %self.path.display(), "event recorded");
        Ok(())
    }

    /// Append, downgrading failure to a warning.
    ///
    /// Used where the event is audit trail for an operation that already
    /// succeeded.
    pub fn record(&self, event: EventType, details: Value) {
        if let Err(e) = self.append(event, details) {
            tracing::warn!(event = %event, error = %e, "failed to write event log");
        }
    }

    /// Read every parsable entry of the live file, oldest first.
    ///
    /// Lines that fail to parse are skipped.
    pub fn read_entries(&self) -> Result<Vec<LogEntry>> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(Error::io(
                    format!("failed to open {}", self.path.display()),
                    e,
                ))
            }
        };

        Ok(BufReader::new(file)
            .lines()
            .map_while(std::result::Result::ok)
            .filter_map(|line| serde_json::from_str(&line).ok())
            .collect())
    }

    fn open_guard(&self) -> Result<File> {
        let guard_path = sidecar(&self.path, "guard");
        OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&guard_path)
            .map_err(|e| Error::io(format!("failed to open {}", guard_path.display()), e))
    }

    fn write_line(&self, line: &str) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| Error::io(format!("failed to open {}", self.path.display()), e))?;
        file.write_all(line.as_bytes())
            .map_err(|e| Error::io(format!("failed to append to {}", self.path.display()), e))
    }

    fn rotate_if_needed(&self) -> Result<()> {
        let size = match fs::metadata(&self.path) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => {
                return Err(Error::io(
                    format!("failed to stat {}", self.path.display()),
                    e,
                ))
            }
        };
        if size < self.config.max_bytes {
            return Ok(());
        }

        let keep = self.config.keep;
        let oldest = sidecar(&self.path, &keep.to_string());
        if oldest.exists() {
            fs::remove_file(&oldest)
                .map_err(|e| Error::io(format!("failed to drop {}", oldest.display()), e))?;
        }
        for generation in (1..keep).rev() {
            let from = sidecar(&self.path, &generation.to_string());
            if from.exists() {
                let to = sidecar(&self.path, &(generation + 1).to_string());
                fs::rename(&from, &to)
                    .map_err(|e| Error::io(format!("failed to rotate {}", from.display()), e))?;
            }
        }
        let first = sidecar(&self.path, "1");
        fs::rename(&self.path, &first)
            .map_err(|e| Error::io(format!("failed to rotate {}", self.path.display()), e))?;
        tracing::debug!(log = %self.path.display(), size, "event log rotated");
        Ok(())
    }
}

/// `<path>.<suffix>`
fn sidecar(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}

/// Replace the home directory prefix with `~` in every string of `value`.
pub fn mask_home(value: Value, home: Option<&str>) -> Value {
    let Some(home) = home.filter(|h| !h.is_empty() && *h != "/") else {
        return value;
    };
    match value {
        Value::String(s) => Value::String(s.replace(home, "~")),
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|item| mask_home(item, Some(home)))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k, mask_home(v, Some(home))))
                .collect(),
        ),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tempfile::TempDir;

    use super::*;

    fn log_in(dir: &TempDir, config: EventLogConfig) -> EventLog {
        EventLog::new(dir.path().join("events.log"), config)
            .with_home(Some("/home/alice".to_string()))
    }

    #[test]
    fn appended_lines_carry_envelope_fields() -> Result<()> {
        let dir = TempDir::new().map_err(|e| Error::io("tempdir", e))?;
        let log = log_in(&dir, EventLogConfig::default());

        log.append(EventType::LockAcquired, json!({"resource": "src/x.py"}))?;
        log.append(EventType::LockReleased, json!({"resource": "src/x.py"}))?;

        let entries = log.read_entries()?;
        assert_eq!(entries.len(), 2);
        let first = &entries[0];
        assert_eq!(first.log_v, LOG_SCHEMA_VERSION);
        assert_eq!(first.event, EventType::LockAcquired);
        assert_eq!(first.pid, std::process::id());
        assert_eq!(first.hostname, host::local_hostname());
        assert!(first.timestamp_utc > 0.0);
        assert!(first.timestamp_utc_iso.ends_with('Z'));
        Ok(())
    }

    #[test]
    fn event_names_are_screaming_snake_case() -> Result<()> {
        let dir = TempDir::new().map_err(|e| Error::io("tempdir", e))?;
        let log = log_in(&dir, EventLogConfig::default());
        log.append(EventType::StaleLockQuarantined, json!({}))?;

        let raw = fs::read_to_string(log.path()).map_err(|e| Error::io("read", e))?;
        assert!(raw.contains("\"event\":\"STALE_LOCK_QUARANTINED\""));
        assert_eq!(EventType::StaleLockQuarantined.to_string(), "STALE_LOCK_QUARANTINED");
        Ok(())
    }

    #[test]
    fn home_paths_are_masked() {
        let masked = mask_home(
            json!({
                "marker": "/home/alice/project/.ensemble/locks/a.lock",
                "nested": ["/home/alice/x", 3],
                "other": "/srv/data"
            }),
            Some("/home/alice"),
        );
        assert_eq!(masked["marker"], "~/project/.ensemble/locks/a.lock");
        assert_eq!(masked["nested"][0], "~/x");
        assert_eq!(masked["nested"][1], 3);
        assert_eq!(masked["other"], "/srv/data");
    }

    #[test]
    fn root_home_is_not_masked() {
        let value = json!({"path": "/etc/hosts"});
        assert_eq!(mask_home(value.clone(), Some("/")), value);
    }

    #[test]
    fn rotation_keeps_bounded_generations() -> Result<()> {
        let dir = TempDir::new().map_err(|e| Error::io("tempdir", e))?;
        let log = log_in(
            &dir,
            EventLogConfig {
                max_bytes: 64,
                keep: 2,
            },
        );

        for i in 0..10 {
            log.append(EventType::SyncPoint, json!({ "round": i }))?;
        }

        assert!(log.path().exists());
        assert!(sidecar(log.path(), "1").exists());
        assert!(sidecar(log.path(), "2").exists());
        assert!(!sidecar(log.path(), "3").exists());

        let live = log.read_entries()?;
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].details["round"], 9);
        Ok(())
    }

    #[test]
    fn missing_log_reads_as_empty() -> Result<()> {
        let dir = TempDir::new().map_err(|e| Error::io("tempdir", e))?;
        let log = log_in(&dir, EventLogConfig::default());
        assert!(log.read_entries()?.is_empty());
        Ok(())
    }
}
