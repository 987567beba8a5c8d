//! Configuration type definitions and built-in defaults.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default name of the per-workspace state directory.
pub const DEFAULT_STATE_DIR: &str = ".ensemble";

/// Root configuration structure
///
/// Loaded from defaults → global → project → env vars → CLI flags
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EnsembleConfig {
    /// State directory, relative to the workspace root.
    pub state_dir: String,
    /// Verbose tracing toggle (`ENSEMBLE_DEBUG`).
    pub debug: bool,
    pub locks: LockConfig,
    pub events: EventLogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LockConfig {
    /// Age after which a lock whose holder cannot be proven alive is stale.
    pub stale_threshold_secs: u64,
    /// How long quarantined markers are kept before hygiene removes them.
    /// Zero keeps them forever.
    pub stale_retention_days: u64,
    /// Upper bound on how long `acquire` keeps retrying.
    pub acquire_timeout_ms: u64,
    /// TTL recorded on locks when the caller does not pass one.
    pub default_ttl_secs: u64,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EventLogConfig {
    /// Size at which a log file is rotated.
    pub max_bytes: u64,
    /// Number of rotated generations kept.
    pub keep: usize,
}

impl Default for EnsembleConfig {
    fn default() -> Self {
        Self {
            state_dir: DEFAULT_STATE_DIR.to_string(),
            debug: false,
            locks: LockConfig::default(),
            events: EventLogConfig::default(),
        }
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            stale_threshold_secs: 120,
            stale_retention_days: 7,
            acquire_timeout_ms: 5_000,
            default_ttl_secs: 1_800,
            base_delay_ms: 10,
            max_delay_ms: 500,
        }
    }
}

impl Default for EventLogConfig {
    fn default() -> Self {
        Self {
            max_bytes: 5 * 1024 * 1024,
            keep: 3,
        }
    }
}

impl LockConfig {
    #[must_use]
    pub const fn stale_threshold(&self) -> Duration {
        Duration::from_secs(self.stale_threshold_secs)
    }

    /// Quarantine retention window, or `None` when purging is disabled.
    #[must_use]
    pub const fn retention(&self) -> Option<Duration> {
        match self.stale_retention_days {
            0 => None,
            days => Some(Duration::from_secs(days.saturating_mul(24 * 60 * 60))),
        }
    }

    #[must_use]
    pub const fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    /// Builder-style override of the stale threshold.
    #[must_use]
    pub const fn with_stale_threshold_secs(mut self, secs: u64) -> Self {
        self.stale_threshold_secs = secs;
        self
    }

    /// Builder-style override of the acquire timeout.
    #[must_use]
    pub const fn with_acquire_timeout_ms(mut self, ms: u64) -> Self {
        self.acquire_timeout_ms = ms;
        self
    }
}

/// Partial configuration as it appears in a TOML file.
///
/// Absent keys leave the lower layer untouched.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    pub state_dir: Option<String>,
    pub debug: Option<bool>,
    #[serde(default)]
    pub locks: LockConfigFile,
    #[serde(default)]
    pub events: EventLogConfigFile,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct LockConfigFile {
    pub stale_threshold_secs: Option<u64>,
    pub stale_retention_days: Option<u64>,
    pub acquire_timeout_ms: Option<u64>,
    pub default_ttl_secs: Option<u64>,
    pub base_delay_ms: Option<u64>,
    pub max_delay_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct EventLogConfigFile {
    pub max_bytes: Option<u64>,
    pub keep: Option<usize>,
}

impl EnsembleConfig {
    /// Merge a file layer into this config (file values take precedence).
    pub fn merge(self, other: ConfigFile) -> Self {
        Self {
            state_dir: other.state_dir.unwrap_or(self.state_dir),
            debug: other.debug.unwrap_or(self.debug),
            locks: LockConfig {
                stale_threshold_secs: other
                    .locks
                    .stale_threshold_secs
                    .unwrap_or(self.locks.stale_threshold_secs),
                stale_retention_days: other
                    .locks
                    .stale_retention_days
                    .unwrap_or(self.locks.stale_retention_days),
                acquire_timeout_ms: other
                    .locks
                    .acquire_timeout_ms
                    .unwrap_or(self.locks.acquire_timeout_ms),
                default_ttl_secs: other
                    .locks
                    .default_ttl_secs
                    .unwrap_or(self.locks.default_ttl_secs),
                base_delay_ms: other.locks.base_delay_ms.unwrap_or(self.locks.base_delay_ms),
                max_delay_ms: other.locks.max_delay_ms.unwrap_or(self.locks.max_delay_ms),
            },
            events: EventLogConfig {
                max_bytes: other.events.max_bytes.unwrap_or(self.events.max_bytes),
                keep: other.events.keep.unwrap_or(self.events.keep),
            },
        }
    }
}
