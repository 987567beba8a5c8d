//! Atomic JSON state store.
//!
//! Documents are written to a temp file in the target directory, synced, and
//! renamed over the target, so readers only ever see a complete old or new
//! version. The previous valid version is kept as `<name>.bak` and used to
//! recover when the primary fails to parse.

use std::{
    fs,
    io::{ErrorKind, Write},
    path::{Path, PathBuf},
};

use serde::{de::DeserializeOwned, Serialize};
use serde_json::json;

use crate::{
    events::{EventLog, EventType},
    lock::{Guard, GuardOptions},
    Error, Result,
};

/// Write `data` to `path` through a synced temp file and a rename.
pub(crate) fn atomic_write(path: &Path, data: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)
        .map_err(|e| Error::io(format!("failed to create directory {}", dir.display()), e))?;

    let mut temp = tempfile::Builder::new()
        .prefix(".ensemble-")
        .suffix(".tmp")
        .tempfile_in(dir)
        .map_err(|e| Error::io(format!("failed to create temp file in {}", dir.display()), e))?;
    temp.write_all(data)
        .and_then(|()| temp.flush())
        .and_then(|()| temp.as_file().sync_all())
        .map_err(|e| Error::io(format!("failed to write temp file for {}", path.display()), e))?;
    temp.persist(path)
        .map_err(|e| Error::io(format!("failed to persist {}", path.display()), e.error))?;
    Ok(())
}

fn backup_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".bak");
    PathBuf::from(name)
}

/// Handle on the documents below one state directory.
#[derive(Debug, Clone)]
pub struct StateStore {
    root: PathBuf,
    events: EventLog,
    guard: GuardOptions,
}

impl StateStore {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>, events: EventLog, guard: GuardOptions) -> Self {
        Self {
            root: root.into(),
            events,
            guard,
        }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// On-disk path of a document; names are relative, `/`-separated.
    #[must_use]
    pub fn path_of(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    #[must_use]
    pub fn exists(&self, name: &str) -> bool {
        self.path_of(name).is_file()
    }

    /// Read a document, falling back to its backup and then to the default.
    ///
    /// A missing document is the default document, not an error. Only I/O
    /// failures other than absence are returned.
    pub fn read<T>(&self, name: &str) -> Result<T>
    where
        T: DeserializeOwned + Default,
    {
        let path = self.path_of(name);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(T::default()),
            Err(e) => return Err(Error::io(format!("failed to read {}", path.display()), e)),
        };

        match serde_json::from_slice(&bytes) {
            Ok(doc) => Ok(doc),
            Err(parse_error) => Ok(self.recover(name, &path, &parse_error.to_string())),
        }
    }

    fn recover<T>(&self, name: &str, path: &Path, parse_error: &str) -> T
    where
        T: DeserializeOwned + Default,
    {
        tracing::warn!(document = name, error = parse_error, "state document is corrupted");
        self.events.record(
            EventType::StateCorrupted,
            json!({ "document": name, "path": path.display().to_string(), "error": parse_error }),
        );

        let bak = backup_path(path);
        let restored = fs::read(&bak).ok().and_then(|bytes| {
            serde_json::from_slice::<T>(&bytes)
                .ok()
                .map(|doc| (doc, bytes))
        });

        if let Some((doc, bytes)) = restored {
            if let Err(e) = atomic_write(path, &bytes) {
                tracing::warn!(document = name, error = %e, "failed to restore backup as primary");
            }
            tracing::warn!(document = name, "state document restored from backup");
            self.events.record(
                EventType::StateRestoredFromBackup,
                json!({ "document": name, "backup": bak.display().to_string() }),
            );
            return doc;
        }

        tracing::error!(document = name, "state document and backup unreadable; resetting");
        self.events.record(
            EventType::StateReset,
            json!({ "document": name, "path": path.display().to_string() }),
        );
        T::default()
    }

    /// Atomically replace a document, keeping the previous valid version as
    /// `.bak`.
    pub fn write<T>(&self, name: &str, document: &T) -> Result<()>
    where
        T: Serialize,
    {
        let path = self.path_of(name);
        let mut bytes = serde_json::to_vec_pretty(document)
            .map_err(|e| Error::serialization(format!("failed to encode {name}"), e))?;
        bytes.push(b'\n');

        if let Ok(current) = fs::read(&path) {
            if serde_json::from_slice::<serde_json::Value>(&current).is_ok() {
                atomic_write(&backup_path(&path), &current)?;
            }
        }

        atomic_write(&path, &bytes)
    }

    /// Delete a document and its backup. Returns `false` if it did not exist.
    pub fn remove(&self, name: &str) -> Result<bool> {
        let path = self.path_of(name);
        let _ = fs::remove_file(backup_path(&path));
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(Error::io(format!("failed to remove {}", path.display()), e)),
        }
    }

    /// Take the read-modify-write guard for a document.
    pub fn guard(&self, name: &str) -> Result<Guard> {
        let mut guard_path = self.path_of(name).into_os_string();
        guard_path.push(".guard");
        Guard::acquire(PathBuf::from(guard_path), &self.guard, &self.events)
    }

    /// Read-modify-write under the document guard.
    ///
    /// The document is written only when `f` succeeds.
    pub fn update<T, R, F>(&self, name: &str, f: F) -> Result<R>
    where
        T: Serialize + DeserializeOwned + Default,
        F: FnOnce(&mut T) -> Result<R>,
    {
        let guard = self.guard(name)?;
        let mut document: T = self.read(name)?;
        let outcome = f(&mut document)?;
        self.write(name, &document)?;
        guard.release()?;
        Ok(outcome)
    }

    /// Names (without `.json`) of the documents directly inside `dir`.
    pub fn list(&self, dir: &str) -> Result<Vec<String>> {
        let path = self.path_of(dir);
        let entries = match fs::read_dir(&path) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::io(format!("failed to list {}", path.display()), e)),
        };

        let mut names: Vec<String> = entries
            .filter_map(std::result::Result::ok)
            .filter_map(|entry| {
                entry
                    .file_name()
                    .to_str()
                    .and_then(|name| name.strip_suffix(".json"))
                    .filter(|stem| !stem.starts_with('_') && !stem.starts_with('.'))
                    .map(String::from)
            })
            .collect();
        names.sort();
        Ok(names)
    }
}
