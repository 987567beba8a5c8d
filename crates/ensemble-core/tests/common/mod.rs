//! Shared fixtures for ensemble-core integration tests.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::{fs, path::Path, time::Duration};

use chrono::{Duration as ChronoDuration, Utc};
use ensemble_core::{
    lock::{Holder, LockKind, LockRecord},
    EnsembleConfig, Workspace,
};
use tempfile::TempDir;

/// Config with short waits so contention tests finish quickly.
pub fn fast_config() -> EnsembleConfig {
    let mut config = EnsembleConfig::default();
    config.locks = config.locks.with_acquire_timeout_ms(300);
    config.locks.base_delay_ms = 5;
    config.locks.max_delay_ms = 20;
    config
}

pub fn workspace() -> (TempDir, Workspace) {
    let dir = TempDir::new().expect("tempdir");
    let ws = Workspace::open(dir.path(), fast_config()).expect("open workspace");
    (dir, ws)
}

/// Pid of a process that has already exited.
pub fn dead_pid() -> u32 {
    let mut child = std::process::Command::new("true")
        .spawn()
        .expect("spawn true");
    let pid = child.id();
    child.wait().expect("reap true");
    pid
}

/// Write an exclusive marker for `resource` as if `holder` took it
/// `age_secs` ago.
pub fn plant_marker(ws: &Workspace, resource: &str, holder: &Holder, age_secs: i64) -> LockRecord {
    let mut record = LockRecord::new(resource, holder, Duration::from_secs(300), LockKind::Exclusive);
    record.acquired_at_utc = Utc::now() - ChronoDuration::seconds(age_secs);
    let path = ws.state_dir().join("locks").join(format!("{resource}.lock"));
    fs::create_dir_all(path.parent().expect("marker parent")).expect("marker dir");
    fs::write(&path, serde_json::to_vec(&record).expect("encode")).expect("write marker");
    record
}

pub fn files_matching(dir: &Path, needle: &str) -> Vec<String> {
    walkdir::WalkDir::new(dir)
        .into_iter()
        .filter_map(std::result::Result::ok)
        .map(|entry| entry.path().to_string_lossy().into_owned())
        .filter(|path| path.contains(needle))
        .collect()
}
