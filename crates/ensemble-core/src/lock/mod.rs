//! Crash-tolerant advisory locks.
//!
//! A lock is a marker file created with `O_EXCL` below `<state>/locks/`,
//! mirroring the resource path. The marker holds the holder's agent id, pid,
//! hostname, acquisition time and TTL.
//!
//! # Guarantees
//!
//! - **Exclusivity**: at most one exclusive marker per resource, and never an
//!   exclusive marker next to review markers
//! - **No false reclamation**: a holder whose pid is alive on this host is
//!   never treated as stale
//! - **Quarantine, not deletion**: stale markers are renamed to
//!   `<marker>.stale.<epoch>` and logged
//! - **Bounded waiting**: `acquire` backs off exponentially up to a timeout
//!
//! # Example
//!
//! ```no_run
//! use ensemble_core::{lock::{Holder, LockKind}, EnsembleConfig, Workspace};
//!
//! let workspace = Workspace::open(".", EnsembleConfig::default())?;
//! let locks = workspace.locks();
//! let me = Holder::new("agent-a");
//!
//! let grant = locks.acquire("src/x.py", &me, None, LockKind::Exclusive)?;
//! println!("locked {}", grant.record.resource);
//! locks.release("src/x.py", &me)?;
//! # Ok::<(), ensemble_core::Error>(())
//! ```

mod guard;
mod manager;
mod marker;
mod retry;
pub mod types;

pub use guard::{Guard, GuardOptions};
pub use manager::{CleanupReport, LockManager, LOCKS_DIR, LOCK_EVENTS, LOCK_TABLE};
pub use marker::STALE_INFIX;
pub use retry::Backoff;
pub use types::{
    normalize_resource, Acquisition, Holder, HolderInfo, LockGrant, LockKind, LockRecord,
    LockTable, Released, StalenessPolicy,
};
