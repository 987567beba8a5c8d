//! Marker files: the create-if-absent primitive every lock is built on.

use std::{
    fs::{self, OpenOptions},
    io::{ErrorKind, Write},
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};

use super::types::LockRecord;
use crate::{store::atomic_write, Error, Result};

/// Infix marking a quarantined marker: `<marker>.stale.<epoch>`.
pub const STALE_INFIX: &str = ".stale.";
/// Infix of a review marker: `<resource>.lock.review.<agent>`.
pub(crate) const REVIEW_INFIX: &str = ".lock.review.";

/// What a marker file turned out to contain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum MarkerContent {
    Record(LockRecord),
    /// Empty or garbled, e.g. the writer died between create and write.
    Unreadable { modified: DateTime<Utc> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Marker {
    path: PathBuf,
}

impl Marker {
    pub(crate) fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    /// Atomically create the marker and fill in the holder metadata.
    ///
    /// Returns `false` when the marker already exists.
    pub(crate) fn create(&self, record: &LockRecord) -> Result<bool> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                Error::io(format!("failed to create lock directory {}", parent.display()), e)
            })?;
        }

        let mut file = match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)
        {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => return Ok(false),
            Err(e) => {
                return Err(Error::io(
                    format!("failed to create marker {}", self.path.display()),
                    e,
                ))
            }
        };

        let written = serde_json::to_vec_pretty(record)
            .map_err(|e| Error::serialization("failed to encode lock record", e))
            .and_then(|bytes| {
                file.write_all(&bytes)
                    .and_then(|()| file.sync_all())
                    .map_err(|e| {
                        Error::io(format!("failed to write marker {}", self.path.display()), e)
                    })
            });

        if let Err(e) = written {
            let _ = fs::remove_file(&self.path);
            return Err(e);
        }
        Ok(true)
    }

    /// Read the marker; `None` when it does not exist.
    pub(crate) fn read(&self) -> Result<Option<MarkerContent>> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(Error::io(
                    format!("failed to read marker {}", self.path.display()),
                    e,
                ))
            }
        };

        if let Ok(record) = serde_json::from_slice::<LockRecord>(&bytes) {
            return Ok(Some(MarkerContent::Record(record)));
        }

        match fs::metadata(&self.path).and_then(|meta| meta.modified()) {
            Ok(modified) => Ok(Some(MarkerContent::Unreadable {
                modified: modified.into(),
            })),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::io(
                format!("failed to stat marker {}", self.path.display()),
                e,
            )),
        }
    }

    /// Replace the metadata of a marker the caller already holds.
    pub(crate) fn overwrite(&self, record: &LockRecord) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(record)
            .map_err(|e| Error::serialization("failed to encode lock record", e))?;
        atomic_write(&self.path, &bytes)
    }

    /// Remove the marker. Returns `false` if it was already gone.
    pub(crate) fn remove(&self) -> Result<bool> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(Error::io(
                format!("failed to remove marker {}", self.path.display()),
                e,
            )),
        }
    }

    /// Move the marker aside to `<marker>.stale.<epoch>`.
    ///
    /// `expected` is the record that was judged stale. If the file moved aside
    /// turns out to hold a different record, a competitor replaced the marker
    /// in between; it is linked back into place and `None` is returned. `None`
    /// is also returned when the marker had already vanished.
    pub(crate) fn quarantine(
        &self,
        expected: Option<&LockRecord>,
        now: DateTime<Utc>,
    ) -> Result<Option<PathBuf>> {
        let target = self.quarantine_path(now);
        match fs::rename(&self.path, &target) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(Error::io(
                    format!("failed to quarantine {}", self.path.display()),
                    e,
                ))
            }
        }

        let Some(expected) = expected else {
            return Ok(Some(target));
        };

        let moved = fs::read(&target)
            .ok()
            .and_then(|bytes| serde_json::from_slice::<LockRecord>(&bytes).ok());
        if moved.as_ref() == Some(expected) {
            return Ok(Some(target));
        }

        match fs::hard_link(&target, &self.path) {
            Ok(()) => {
                let _ = fs::remove_file(&target);
            }
            Err(e) => {
                tracing::warn!(
                    marker = %self.path.display(),
                    quarantined = %target.display(),
                    error = %e,
                    "marker changed during quarantine and could not be restored"
                );
            }
        }
        Ok(None)
    }

    fn quarantine_path(&self, now: DateTime<Utc>) -> PathBuf {
        let base = format!("{}{STALE_INFIX}{}", self.path.display(), now.timestamp());
        let first = PathBuf::from(&base);
        if !first.exists() {
            return first;
        }
        (1..)
            .map(|n| PathBuf::from(format!("{base}.{n}")))
            .find(|candidate| !candidate.exists())
            .unwrap_or(first)
    }
}

/// Whether `file_name` is a live marker: `<name>.lock` or
/// `<name>.lock.review.<agent>`.
///
/// Agent parts never contain `.`, so quarantined review markers do not match.
pub(crate) fn is_marker_name(file_name: &str) -> bool {
    match file_name.split_once(REVIEW_INFIX) {
        Some((resource, agent)) => !resource.is_empty() && !agent.is_empty() && !agent.contains('.'),
        None => file_name.len() > ".lock".len() && file_name.ends_with(".lock"),
    }
}

/// Epoch of a quarantine file `<marker>.stale.<epoch>[.<n>]`.
///
/// `None` for every other name, live markers included.
pub(crate) fn quarantine_epoch(file_name: &str) -> Option<i64> {
    let (marker, suffix) = file_name.rsplit_once(STALE_INFIX)?;
    if !is_marker_name(marker) {
        return None;
    }
    let (epoch, collision) = match suffix.split_once('.') {
        Some((epoch, n)) => (epoch, Some(n)),
        None => (suffix, None),
    };
    let digits = |part: &str| !part.is_empty() && part.bytes().all(|b| b.is_ascii_digit());
    if !digits(epoch) || !collision.map_or(true, digits) {
        return None;
    }
    epoch.parse().ok()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tempfile::TempDir;

    use super::*;
    use crate::lock::types::{Holder, LockKind};

    fn record(agent: &str) -> LockRecord {
        LockRecord::new(
            "src/x.py",
            &Holder::new(agent),
            Duration::from_secs(300),
            LockKind::Exclusive,
        )
    }

    #[test]
    fn create_is_exclusive() -> Result<()> {
        let dir = TempDir::new().map_err(|e| Error::io("tempdir", e))?;
        let marker = Marker::new(dir.path().join("src/x.py.lock"));

        assert!(marker.create(&record("a"))?);
        assert!(!marker.create(&record("b"))?);

        match marker.read()? {
            Some(MarkerContent::Record(found)) => assert_eq!(found.agent_id, "a"),
            other => panic!("unexpected marker content: {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn garbled_marker_reads_as_unreadable() -> Result<()> {
        let dir = TempDir::new().map_err(|e| Error::io("tempdir", e))?;
        let path = dir.path().join("x.lock");
        fs::write(&path, b"{\"resource\":").map_err(|e| Error::io("write", e))?;

        let content = Marker::new(&path).read()?;
        assert!(matches!(content, Some(MarkerContent::Unreadable { .. })));
        Ok(())
    }

    #[test]
    fn quarantine_renames_instead_of_deleting() -> Result<()> {
        let dir = TempDir::new().map_err(|e| Error::io("tempdir", e))?;
        let marker = Marker::new(dir.path().join("x.lock"));
        let original = record("a");
        marker.create(&original)?;

        let now = Utc::now();
        let moved = marker.quarantine(Some(&original), now)?;
        let moved = moved.ok_or_else(|| Error::InvalidInput("not quarantined".into()))?;

        assert!(!marker.path().exists());
        assert!(moved.exists());
        let name = moved
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();
        assert_eq!(name, format!("x.lock.stale.{}", now.timestamp()));
        assert_eq!(quarantine_epoch(&name), Some(now.timestamp()));
        Ok(())
    }

    #[test]
    fn quarantine_restores_a_replaced_marker() -> Result<()> {
        let dir = TempDir::new().map_err(|e| Error::io("tempdir", e))?;
        let marker = Marker::new(dir.path().join("x.lock"));
        let judged_stale = record("a");
        let fresh = record("b");
        marker.create(&fresh)?;

        let moved = marker.quarantine(Some(&judged_stale), Utc::now())?;
        assert!(moved.is_none());
        match marker.read()? {
            Some(MarkerContent::Record(found)) => assert_eq!(found, fresh),
            other => panic!("fresh marker lost: {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn repeated_quarantine_in_one_second_does_not_overwrite() -> Result<()> {
        let dir = TempDir::new().map_err(|e| Error::io("tempdir", e))?;
        let marker = Marker::new(dir.path().join("x.lock"));
        let now = Utc::now();

        marker.create(&record("a"))?;
        let first = marker.quarantine(None, now)?;
        marker.create(&record("b"))?;
        let second = marker.quarantine(None, now)?;

        assert!(first.is_some());
        assert!(second.is_some());
        assert_ne!(first, second);
        Ok(())
    }

    #[test]
    fn vanished_marker_is_not_an_error() -> Result<()> {
        let dir = TempDir::new().map_err(|e| Error::io("tempdir", e))?;
        let marker = Marker::new(dir.path().join("gone.lock"));
        assert!(marker.read()?.is_none());
        assert!(marker.quarantine(None, Utc::now())?.is_none());
        assert!(!marker.remove()?);
        Ok(())
    }

    #[test]
    fn epoch_parsing_ignores_collision_suffix() {
        assert_eq!(quarantine_epoch("a.lock.stale.1700000000.2"), Some(1_700_000_000));
        assert_eq!(
            quarantine_epoch("a.lock.review.agent-b.stale.1700000000"),
            Some(1_700_000_000)
        );
        assert_eq!(quarantine_epoch("a.lock.stale.soon"), None);
        assert_eq!(quarantine_epoch("a.lock.stale.1700000000.x"), None);
    }

    #[test]
    fn stale_looking_marker_names_are_not_quarantine_files() {
        for live in ["data.stale.1700000000.lock", "data.stale.lock", "a.lock.review.b"] {
            assert!(is_marker_name(live), "{live} should be a live marker");
            assert_eq!(quarantine_epoch(live), None, "{live} is not quarantined");
        }
        assert_eq!(quarantine_epoch("data.stale.1700000000"), None);
        assert!(!is_marker_name("a.lock.stale.1700000000"));
        assert!(!is_marker_name("a.lock.review.b.stale.1700000000"));
        assert!(!is_marker_name(".lock"));
        assert_eq!(quarantine_epoch("a.lock"), None);
    }
}
