//! Configuration validation

use std::path::Path;

use super::types::EnsembleConfig;
use crate::{Error, Result};

const MAX_ACQUIRE_TIMEOUT_MS: u64 = 10 * 60 * 1_000;

impl EnsembleConfig {
    /// Validate configuration values
    ///
    /// # Errors
    ///
    /// Returns error if any values are out of range or invalid
    pub fn validate(&self) -> Result<()> {
        if self.state_dir.trim().is_empty() {
            return Err(Error::InvalidConfig(
                "state_dir cannot be empty".to_string(),
            ));
        }

        if Path::new(&self.state_dir).is_absolute() {
            return Err(Error::InvalidConfig(format!(
                "state_dir must be relative to the workspace root, got '{}'",
                self.state_dir
            )));
        }

        if self.locks.stale_threshold_secs == 0 {
            return Err(Error::InvalidConfig(
                "stale_threshold_secs must be at least 1".to_string(),
            ));
        }

        if self.locks.default_ttl_secs == 0 {
            return Err(Error::InvalidConfig(
                "default_ttl_secs must be at least 1".to_string(),
            ));
        }

        if self.locks.acquire_timeout_ms > MAX_ACQUIRE_TIMEOUT_MS {
            return Err(Error::InvalidConfig(format!(
                "acquire_timeout_ms must be at most {MAX_ACQUIRE_TIMEOUT_MS}"
            )));
        }

        if self.locks.base_delay_ms == 0 || self.locks.max_delay_ms < self.locks.base_delay_ms {
            return Err(Error::InvalidConfig(
                "backoff requires 0 < base_delay_ms <= max_delay_ms".to_string(),
            ));
        }

        if self.events.keep == 0 || self.events.max_bytes == 0 {
            return Err(Error::InvalidConfig(
                "event log rotation needs max_bytes > 0 and keep >= 1".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(EnsembleConfig::default().validate().is_ok());
    }

    #[test]
    fn zero_threshold_is_rejected() {
        let mut config = EnsembleConfig::default();
        config.locks.stale_threshold_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn absolute_state_dir_is_rejected() {
        let config = EnsembleConfig {
            state_dir: "/var/lib/ensemble".to_string(),
            ..EnsembleConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn inverted_backoff_is_rejected() {
        let mut config = EnsembleConfig::default();
        config.locks.max_delay_ms = 1;
        config.locks.base_delay_ms = 50;
        assert!(config.validate().is_err());
    }
}
