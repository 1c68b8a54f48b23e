//! Configuration types for the buffer cache
//!
//! A single process-wide [`CacheConfig`] drives the cache runtime: the
//! shared memory budget, the janitor schedule and a few tuning knobs.
//! Every field has a default, so a partial TOML file is enough.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Process-wide cache configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Shared budget across all clients; 0 = derived from available memory
    pub max_cache_size_bytes: u64,
    /// Unreferenced clean buffers older than this are swept
    pub max_age_seconds: u64,
    /// Janitor period; 0 disables the background janitor
    pub sweep_interval_seconds: u64,
    /// Dirty share of the ceiling that triggers background write-back
    pub writeback_threshold_percent: u8,
    /// Floor for every client's ceiling, in buffers
    pub min_buffers_per_client: usize,
    /// Hard cap on allocator bytes in use; 0 = unlimited
    pub allocator_limit_bytes: u64,
    /// Requests gathered into one outgoing write batch
    pub write_batch_size: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_cache_size_bytes: 0,
            max_age_seconds: 60,
            sweep_interval_seconds: 10,
            writeback_threshold_percent: 75,
            min_buffers_per_client: 16,
            allocator_limit_bytes: 0,
            write_batch_size: 16,
        }
    }
}

impl CacheConfig {
    /// Parse a configuration from TOML text
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)
            .map_err(|e| Error::configuration(format!("invalid cache config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::configuration(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&text)
    }

    /// Reject values the runtime cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.writeback_threshold_percent == 0 || self.writeback_threshold_percent > 100 {
            return Err(Error::configuration(format!(
                "writeback_threshold_percent must be in 1..=100, got {}",
                self.writeback_threshold_percent
            )));
        }
        if self.min_buffers_per_client == 0 {
            return Err(Error::configuration(
                "min_buffers_per_client must be at least 1",
            ));
        }
        if self.write_batch_size == 0 {
            return Err(Error::configuration("write_batch_size must be at least 1"));
        }
        if self.allocator_limit_bytes != 0
            && self.max_cache_size_bytes != 0
            && self.allocator_limit_bytes < self.max_cache_size_bytes
        {
            return Err(Error::configuration(format!(
                "allocator_limit_bytes ({}) is below max_cache_size_bytes ({})",
                self.allocator_limit_bytes, self.max_cache_size_bytes
            )));
        }
        Ok(())
    }

    /// Age threshold for the periodic sweep
    #[must_use]
    pub const fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_seconds)
    }

    /// Janitor period, if the janitor is enabled
    #[must_use]
    pub const fn sweep_interval(&self) -> Option<Duration> {
        if self.sweep_interval_seconds == 0 {
            None
        } else {
            Some(Duration::from_secs(self.sweep_interval_seconds))
        }
    }

    /// Allocator hard cap, if any
    #[must_use]
    pub const fn allocator_limit(&self) -> Option<u64> {
        if self.allocator_limit_bytes == 0 {
            None
        } else {
            Some(self.allocator_limit_bytes)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = CacheConfig::default();
        config.validate().unwrap();
        assert_eq!(config.max_age(), Duration::from_secs(60));
        assert_eq!(config.sweep_interval(), Some(Duration::from_secs(10)));
        assert_eq!(config.allocator_limit(), None);
    }

    #[test]
    fn test_partial_toml() {
        let config = CacheConfig::from_toml_str(
            r#"
            max_cache_size_bytes = 1048576
            sweep_interval_seconds = 0
            "#,
        )
        .unwrap();
        assert_eq!(config.max_cache_size_bytes, 1_048_576);
        assert_eq!(config.sweep_interval(), None);
        assert_eq!(config.min_buffers_per_client, 16);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = CacheConfig::from_toml_str("writeback_threshold_percent = 0").unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));

        let err = CacheConfig::from_toml_str("min_buffers_per_client = 0").unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));

        let err = CacheConfig::from_toml_str(
            "max_cache_size_bytes = 4096\nallocator_limit_bytes = 1024",
        )
        .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));

        assert!(CacheConfig::from_toml_str("max_age_seconds = \"soon\"").is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "max_age_seconds = 5\nwrite_batch_size = 4").unwrap();

        let config = CacheConfig::load(file.path()).unwrap();
        assert_eq!(config.max_age(), Duration::from_secs(5));
        assert_eq!(config.write_batch_size, 4);

        assert!(CacheConfig::load("/nonexistent/blockcache.toml").is_err());
    }
}
