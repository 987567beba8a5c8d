//! Configuration loading and management
//!
//! # Hierarchy
//!
//! Configuration is loaded in this order (later overrides earlier):
//! 1. Built-in defaults
//! 2. Global config: `~/.config/ensemble/config.toml`
//! 3. Project config: `<root>/.ensemble/config.toml`
//! 4. Environment variables: `ENSEMBLE_*`
//! 5. CLI flags (applied by the binary)
//!
//! # Example Config
//!
//! ```toml
//! debug = false
//!
//! [locks]
//! stale_threshold_secs = 120
//! stale_retention_days = 7
//! acquire_timeout_ms = 5000
//!
//! [events]
//! max_bytes = 5242880
//! keep = 3
//! ```

mod load;
mod types;
mod validate;

pub use load::{global_config_path, load_config, load_toml_file, project_config_path};
pub use types::{
    ConfigFile, EnsembleConfig, EventLogConfig, EventLogConfigFile, LockConfig, LockConfigFile,
    DEFAULT_STATE_DIR,
};
