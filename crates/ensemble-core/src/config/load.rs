//! Configuration loading from files and environment
//!
//! This module handles loading configuration from:
//! 1. Built-in defaults
//! 2. Global config: ~/.config/ensemble/config.toml
//! 3. Project config: <root>/.ensemble/config.toml
//! 4. Environment variables: ENSEMBLE_*
//!
//! All operations return new instances rather than mutating in place.

use std::path::{Path, PathBuf};

use super::types::{ConfigFile, EnsembleConfig, DEFAULT_STATE_DIR};
use crate::{Error, Result};

/// Load configuration from all sources with hierarchy
///
/// # Errors
///
/// Returns error if:
/// - A config file is malformed TOML
/// - An `ENSEMBLE_*` variable cannot be parsed
/// - Config values fail validation
pub fn load_config(root: &Path) -> Result<EnsembleConfig> {
    let config = EnsembleConfig::default();

    let config = match global_config_path() {
        Some(global_path) if global_path.exists() => config.merge(load_toml_file(&global_path)?),
        _ => config,
    };

    let project_path = project_config_path(root);
    let config = if project_path.exists() {
        config.merge(load_toml_file(&project_path)?)
    } else {
        config
    };

    let config = config.apply_env_vars()?;
    config.validate()?;
    Ok(config)
}

/// Get path to global config file
pub fn global_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "ensemble")
        .map(|proj_dirs| proj_dirs.config_dir().join("config.toml"))
}

/// Get path to project config file for a workspace root.
///
/// The project file always lives in the default state directory so that it
/// can itself relocate `state_dir`.
pub fn project_config_path(root: &Path) -> PathBuf {
    root.join(DEFAULT_STATE_DIR).join("config.toml")
}

/// Load a TOML file into a partial config layer
///
/// # Errors
///
/// Returns error if the path is a directory, cannot be read, or is not valid TOML.
pub fn load_toml_file(path: &Path) -> Result<ConfigFile> {
    if path.is_dir() {
        return Err(Error::InvalidConfig(format!(
            "config path is a directory, not a file: {}",
            path.display()
        )));
    }

    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::io(format!("failed to read config file {}", path.display()), e))?;

    toml::from_str(&content).map_err(|e| {
        Error::InvalidConfig(format!(
            "failed to parse config file {}: {e}",
            path.display()
        ))
    })
}

impl EnsembleConfig {
    /// Apply `ENSEMBLE_*` environment variable overrides
    ///
    /// # Errors
    ///
    /// Returns error if a variable is set to an unparsable value
    pub fn apply_env_vars(self) -> Result<Self> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary variable source.
    ///
    /// # Errors
    ///
    /// Returns error if a variable is set to an unparsable value
    pub fn apply_env_from<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("ENSEMBLE_STALE_THRESHOLD") {
            self.locks.stale_threshold_secs = parse_env("ENSEMBLE_STALE_THRESHOLD", &value)?;
        }

        if let Some(value) = lookup("ENSEMBLE_STALE_CLEANUP_DAYS") {
            self.locks.stale_retention_days = parse_env("ENSEMBLE_STALE_CLEANUP_DAYS", &value)?;
        }

        if let Some(value) = lookup("ENSEMBLE_ACQUIRE_TIMEOUT_MS") {
            self.locks.acquire_timeout_ms = parse_env("ENSEMBLE_ACQUIRE_TIMEOUT_MS", &value)?;
        }

        if let Some(value) = lookup("ENSEMBLE_LOCK_TTL") {
            self.locks.default_ttl_secs = parse_env("ENSEMBLE_LOCK_TTL", &value)?;
        }

        if let Some(value) = lookup("ENSEMBLE_STATE_DIR") {
            if value.trim().is_empty() {
                return Err(Error::InvalidConfig(
                    "ENSEMBLE_STATE_DIR cannot be empty - unset the variable or provide a directory"
                        .to_string(),
                ));
            }
            self.state_dir = value;
        }

        if let Some(value) = lookup("ENSEMBLE_DEBUG") {
            self.debug = parse_flag(&value);
        }

        Ok(self)
    }
}

fn parse_env(key: &str, value: &str) -> Result<u64> {
    value
        .trim()
        .parse()
        .map_err(|e| Error::InvalidConfig(format!("invalid {key} value '{value}': {e}")))
}

/// Truthy values accepted for boolean toggles.
fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use serial_test::serial;

    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn env_overrides_thresholds() -> Result<()> {
        let env = vars(&[
            ("ENSEMBLE_STALE_THRESHOLD", "45"),
            ("ENSEMBLE_STALE_CLEANUP_DAYS", "2"),
            ("ENSEMBLE_DEBUG", "1"),
        ]);
        let config = EnsembleConfig::default().apply_env_from(|k| env.get(k).cloned())?;
        assert_eq!(config.locks.stale_threshold_secs, 45);
        assert_eq!(config.locks.stale_retention_days, 2);
        assert!(config.debug);
        Ok(())
    }

    #[test]
    fn unparsable_env_value_is_rejected() {
        let env = vars(&[("ENSEMBLE_STALE_THRESHOLD", "two minutes")]);
        let result = EnsembleConfig::default().apply_env_from(|k| env.get(k).cloned());
        assert!(matches!(result, Err(Error::InvalidConfig(msg)) if msg.contains("ENSEMBLE_STALE_THRESHOLD")));
    }

    #[test]
    fn debug_flag_accepts_common_spellings() {
        assert!(parse_flag("TRUE"));
        assert!(parse_flag(" on "));
        assert!(!parse_flag("0"));
        assert!(!parse_flag(""));
    }

    #[test]
    fn malformed_toml_returns_config_error() -> Result<()> {
        let temp_dir = tempfile::tempdir().map_err(|e| Error::io("tempdir", e))?;
        let path = temp_dir.path().join("config.toml");
        std::fs::write(&path, "debug = \n [[[").map_err(|e| Error::io("write", e))?;

        let result = load_toml_file(&path);
        assert!(matches!(result, Err(Error::InvalidConfig(msg)) if msg.contains("parse")));
        Ok(())
    }

    #[test]
    fn unknown_keys_are_rejected() -> Result<()> {
        let temp_dir = tempfile::tempdir().map_err(|e| Error::io("tempdir", e))?;
        let path = temp_dir.path().join("config.toml");
        std::fs::write(&path, "[locks]\nstale_treshold_secs = 5\n")
            .map_err(|e| Error::io("write", e))?;

        assert!(load_toml_file(&path).is_err());
        Ok(())
    }

    #[test]
    #[serial]
    fn project_file_and_env_layer_in_order() -> Result<()> {
        let temp_dir = tempfile::tempdir().map_err(|e| Error::io("tempdir", e))?;
        let project = project_config_path(temp_dir.path());
        if let Some(parent) = project.parent() {
            std::fs::create_dir_all(parent).map_err(|e| Error::io("mkdir", e))?;
        }
        std::fs::write(
            &project,
            "[locks]\nstale_threshold_secs = 60\nacquire_timeout_ms = 250\n",
        )
        .map_err(|e| Error::io("write", e))?;

        std::env::set_var("ENSEMBLE_STALE_THRESHOLD", "90");
        let loaded = load_config(temp_dir.path());
        std::env::remove_var("ENSEMBLE_STALE_THRESHOLD");

        let config = loaded?;
        assert_eq!(config.locks.stale_threshold_secs, 90);
        assert_eq!(config.locks.acquire_timeout_ms, 250);
        Ok(())
    }
}
