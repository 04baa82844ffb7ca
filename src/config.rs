//! Configuration management for Slidegate.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Result, SlidegateError};
use crate::ratelimit::GateConfig;
use crate::store::{BucketStore, CounterStore, MemoryStore};

/// Prefix for environment variable overrides, e.g. `SLIDEGATE_GATE__QUOTA=20`.
pub const ENV_PREFIX: &str = "SLIDEGATE";

/// Main configuration for a Slidegate deployment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SlidegateConfig {
    /// Admission settings
    #[serde(default)]
    pub gate: GateConfig,

    /// Counter store settings
    #[serde(default)]
    pub store: StoreConfig,

    /// Logging settings
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Which counter store implementation to use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Exact instants in memory
    #[default]
    Memory,
    /// One-second buckets
    Bucket,
}

/// Counter store configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Store implementation
    #[serde(default)]
    pub backend: StoreBackend,

    /// How long admissions are kept, in seconds
    ///
    /// Defaults to twice the gate interval.
    #[serde(default)]
    pub retention_secs: Option<u64>,
}

impl StoreConfig {
    /// Retention to use for a gate with the given interval.
    pub fn retention(&self, gate: &GateConfig) -> Duration {
        let secs = self
            .retention_secs
            .unwrap_or_else(|| gate.interval_secs.saturating_mul(2));
        Duration::from_secs(secs)
    }

    /// Build the configured store.
    pub fn build(&self, gate: &GateConfig) -> Arc<dyn CounterStore> {
        let retention = self.retention(gate);
        match self.backend {
            StoreBackend::Memory => Arc::new(MemoryStore::with_retention(retention)),
            StoreBackend::Bucket => Arc::new(BucketStore::with_retention(retention)),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl SlidegateConfig {
    /// Load configuration from a file path.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: SlidegateConfig = serde_yaml::from_str(yaml)
            .map_err(|e| SlidegateError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from an optional YAML file, overridden by
    /// `SLIDEGATE_`-prefixed environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            if !path.exists() {
                return Err(SlidegateError::Config(format!(
                    "config file not found: {}",
                    path.display()
                )));
            }
            info!(path = %path.display(), "Loading configuration");
            builder = builder
                .add_source(::config::File::from(path).format(::config::FileFormat::Yaml));
        }

        let config: SlidegateConfig = builder
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|settings| settings.try_deserialize())
            .map_err(|e| SlidegateError::Config(format!("Failed to load config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Check the configuration for values the gate cannot run with.
    pub fn validate(&self) -> Result<()> {
        self.gate.validate()?;
        if let Some(retention) = self.store.retention_secs {
            if retention < self.gate.interval_secs {
                return Err(SlidegateError::Config(format!(
                    "store retention ({}s) is shorter than the gate interval ({}s)",
                    retention, self.gate.interval_secs
                )));
            }
        }
        Ok(())
    }
}
