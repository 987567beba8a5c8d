//! Per-command handle on a workspace's state directory.

use std::{
    fs,
    path::{Path, PathBuf},
};

use crate::{
    config::EnsembleConfig,
    events::EventLog,
    lock::{Backoff, GuardOptions, LockManager, StalenessPolicy, LOCKS_DIR, LOCK_EVENTS},
    partition::Partitions,
    registry::{ErrorRegistry, ERRORS_DIR},
    store::StateStore,
    sync::SyncPoint,
    task::{TaskBoard, TASKS_DIR},
    Error, Result,
};

/// Derived error summary, relative to the state directory.
pub const FINDINGS: &str = "findings.md";
/// State store corruption and recovery events.
pub const STORAGE_EVENTS: &str = "_storage_events.log";
/// Registry, sync and task events.
pub const COORDINATION_EVENTS: &str = "_events.log";

/// Resolved paths and configuration for one workspace.
///
/// Components are built on demand from the handle; nothing is cached between
/// commands.
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
    state_dir: PathBuf,
    config: EnsembleConfig,
}

impl Workspace {
    /// Validate `config` and create the state directory layout below `root`.
    ///
    /// # Errors
    ///
    /// `WorkspaceUnavailable` if the directories cannot be created or written.
    pub fn open(root: impl Into<PathBuf>, config: EnsembleConfig) -> Result<Self> {
        config.validate()?;
        let root = root.into();
        let state_dir = root.join(&config.state_dir);

        for dir in [
            state_dir.clone(),
            state_dir.join(LOCKS_DIR),
            state_dir.join(ERRORS_DIR),
            state_dir.join(TASKS_DIR),
        ] {
            fs::create_dir_all(&dir).map_err(|source| Error::WorkspaceUnavailable {
                path: dir.clone(),
                source,
            })?;
        }
        tempfile::NamedTempFile::new_in(&state_dir).map_err(|source| Error::WorkspaceUnavailable {
            path: state_dir.clone(),
            source,
        })?;

        tracing::debug!(state_dir = %state_dir.display(), "workspace opened");
        Ok(Self {
            root,
            state_dir,
            config,
        })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    #[must_use]
    pub const fn config(&self) -> &EnsembleConfig {
        &self.config
    }

    #[must_use]
    pub fn findings_path(&self) -> PathBuf {
        self.state_dir.join(FINDINGS)
    }

    fn event_log(&self, name: &str) -> EventLog {
        EventLog::new(self.state_dir.join(name), self.config.events.clone())
    }

    #[must_use]
    pub fn storage_events(&self) -> EventLog {
        self.event_log(STORAGE_EVENTS)
    }

    #[must_use]
    pub fn lock_events(&self) -> EventLog {
        self.event_log(LOCK_EVENTS)
    }

    #[must_use]
    pub fn events(&self) -> EventLog {
        self.event_log(COORDINATION_EVENTS)
    }

    #[must_use]
    pub fn store(&self) -> StateStore {
        let locks = &self.config.locks;
        let guard = GuardOptions {
            policy: StalenessPolicy::for_guards(locks.stale_threshold()),
            backoff: Backoff::from_config(locks),
        };
        StateStore::new(&self.state_dir, self.storage_events(), guard)
    }

    #[must_use]
    pub fn locks(&self) -> LockManager {
        LockManager::new(self.store(), self.config.locks.clone(), self.lock_events())
    }

    #[must_use]
    pub fn registry(&self) -> ErrorRegistry {
        ErrorRegistry::new(self.store(), self.events(), self.findings_path())
    }

    #[must_use]
    pub fn partitions(&self) -> Partitions {
        Partitions::new(self.store())
    }

    #[must_use]
    pub fn sync_point(&self) -> SyncPoint {
        SyncPoint::new(self.locks(), self.partitions(), self.registry(), self.events())
    }

    #[must_use]
    pub fn tasks(&self) -> TaskBoard {
        TaskBoard::new(
            self.store(),
            self.locks(),
            self.partitions(),
            self.registry(),
            self.events(),
        )
    }
}
