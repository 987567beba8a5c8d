//! Local host identity and process liveness.

use std::{path::Path, sync::OnceLock};

use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display};

/// Name used when the OS refuses to report a hostname.
const UNKNOWN_HOST: &str = "unknown-host";

/// Hostname of this machine, resolved once per process.
pub fn local_hostname() -> &'static str {
    static HOSTNAME: OnceLock<String> = OnceLock::new();
    HOSTNAME.get_or_init(|| {
        hostname::get()
            .ok()
            .and_then(|name| name.into_string().ok())
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| UNKNOWN_HOST.to_string())
    })
}

/// Home directory of the current user, used to mask paths in event logs.
pub fn home_dir() -> Option<String> {
    directories::BaseDirs::new().and_then(|dirs| dirs.home_dir().to_str().map(String::from))
}

/// Result of asking whether a lock holder is still running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, AsRefStr)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Liveness {
    /// Same host, process exists.
    Alive,
    /// Same host, process does not exist.
    Dead,
    /// Different host, or this platform cannot inspect processes. Only the
    /// age heuristic applies.
    Unverifiable,
}

impl Liveness {
    /// Assess a holder recorded as `(hostname, pid)` from this machine.
    pub fn of(hostname: &str, pid: u32) -> Self {
        if hostname != local_hostname() {
            return Self::Unverifiable;
        }
        process_liveness(pid)
    }

    #[must_use]
    pub const fn is_alive(self) -> bool {
        matches!(self, Self::Alive)
    }
}

/// Check a pid on this machine through procfs.
fn process_liveness(pid: u32) -> Liveness {
    if pid == 0 {
        return Liveness::Dead;
    }
    let proc_root = Path::new("/proc");
    if !proc_root.join("self").exists() {
        return Liveness::Unverifiable;
    }
    if proc_root.join(pid.to_string()).exists() {
        Liveness::Alive
    } else {
        Liveness::Dead
    }
}
