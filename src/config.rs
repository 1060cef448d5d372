//! # Engine Configuration
//!
//! Serde-backed configuration with layered loading: an optional TOML file
//! under a `RELAY__`-prefixed environment override (double underscore
//! separating nesting levels, e.g. `RELAY__REDELIVERY__MAX_REDELIVERIES=5`).
//! Defaults come from [`crate::constants::defaults`].

use crate::constants::defaults;
use crate::error::{RelayError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Concurrent step executions permitted by the task executor.
    pub max_concurrent_tasks: usize,
    /// Buffered capacity of the lifecycle event channel.
    pub event_channel_capacity: usize,
    /// Per-exchange deadline; a watcher sets the cancellation flag when it
    /// elapses. `None` disables the watcher.
    pub exchange_timeout_ms: Option<u64>,
    pub redelivery: RedeliveryConfig,
    pub multicast: MulticastConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: defaults::MAX_CONCURRENT_TASKS,
            event_channel_capacity: defaults::EVENT_CHANNEL_CAPACITY,
            exchange_timeout_ms: None,
            redelivery: RedeliveryConfig::default(),
            multicast: MulticastConfig::default(),
        }
    }
}

/// Serializable mirror of [`RedeliveryPolicy`](crate::recovery::RedeliveryPolicy);
/// the exclusion predicate is code, not configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedeliveryConfig {
    pub max_redeliveries: u32,
    pub initial_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub max_delay_ms: u64,
}

impl Default for RedeliveryConfig {
    fn default() -> Self {
        Self {
            max_redeliveries: defaults::MAX_REDELIVERIES,
            initial_delay_ms: defaults::INITIAL_DELAY_MS,
            backoff_multiplier: defaults::BACKOFF_MULTIPLIER,
            max_delay_ms: defaults::MAX_DELAY_MS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MulticastConfig {
    /// Submit branches concurrently instead of one at a time.
    pub parallel: bool,
    /// Merge branch results in declared order.
    pub ordered: bool,
    /// Stop scheduling not-yet-started branches after the first failure.
    pub stop_on_failure: bool,
}

impl Default for MulticastConfig {
    fn default() -> Self {
        Self {
            parallel: false,
            ordered: true,
            stop_on_failure: true,
        }
    }
}

impl EngineConfig {
    /// Load from `relay.toml` in the working directory (if present) with
    /// `RELAY__` environment overrides on top.
    pub fn load() -> Result<Self> {
        Self::build(config::File::with_name("relay").required(false))
    }

    /// Load from an explicit file with environment overrides on top.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        Self::build(config::File::from(path))
    }

    fn build(file: config::File<config::FileSourceFile, config::FileFormat>) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(file)
            .add_source(
                config::Environment::with_prefix("RELAY")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()
            .map_err(|e| RelayError::Configuration(e.to_string()))?;
        settings
            .try_deserialize()
            .map_err(|e| RelayError::Configuration(e.to_string()))
    }

    /// Validate cross-field invariants not expressible in the type system.
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_tasks == 0 {
            return Err(RelayError::Configuration(
                "max_concurrent_tasks must be at least 1".to_string(),
            ));
        }
        if self.redelivery.backoff_multiplier < 1.0 {
            return Err(RelayError::Configuration(format!(
                "backoff_multiplier must be >= 1.0, got {}",
                self.redelivery.backoff_multiplier
            )));
        }
        if self.redelivery.max_delay_ms < self.redelivery.initial_delay_ms {
            return Err(RelayError::Configuration(
                "max_delay_ms must not be below initial_delay_ms".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.redelivery.max_redeliveries, 3);
        assert_eq!(config.redelivery.backoff_multiplier, 2.0);
        assert!(!config.multicast.parallel);
        assert!(config.multicast.ordered);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = EngineConfig::default();
        config.redelivery.backoff_multiplier = 0.5;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.max_concurrent_tasks = 0;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.redelivery.initial_delay_ms = 10_000;
        config.redelivery.max_delay_ms = 1_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_toml_file() {
        use std::io::Write;

        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .unwrap();
        writeln!(
            file,
            "max_concurrent_tasks = 4\n\n[redelivery]\nmax_redeliveries = 7\ninitial_delay_ms = 50\n\n[multicast]\nparallel = true"
        )
        .unwrap();

        let config = EngineConfig::load_from_file(file.path()).unwrap();
        assert_eq!(config.max_concurrent_tasks, 4);
        assert_eq!(config.redelivery.max_redeliveries, 7);
        assert_eq!(config.redelivery.initial_delay_ms, 50);
        // unset fields keep defaults
        assert_eq!(config.redelivery.max_delay_ms, 60_000);
        assert!(config.multicast.parallel);
    }

    #[test]
    fn test_config_serde_round_trip() {
        let config = EngineConfig::default();
        let encoded = serde_json::to_string(&config).unwrap();
        let decoded: EngineConfig = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, config);
    }
}
