//! Centralized configuration for the path cache.
//!
//! Constants are grouped in namespace structs; the two runtime-tunable
//! structs (`RegistryConfig`, `HandlerConfig`) are serde-friendly so they can
//! be embedded in an application's own config file.

use crate::error::{CacheError, Result};
use crate::storage;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Background sweep timing.
pub struct SweepConfig;

impl SweepConfig {
    pub const INTERVAL: Duration = Duration::from_secs(1);
}

/// Durable storage layout.
pub struct StorageConfig;

impl StorageConfig {
    /// Extension of every durable record file.
    pub const RECORD_EXTENSION: &'static str = "dat";
    /// Suffix of in-flight atomic writes. Never matches `RECORD_EXTENSION`.
    pub const TEMP_SUFFIX: &'static str = "tmp";
}

/// Defaults applied to handlers built from a partial config.
pub struct HandlerDefaults;

impl HandlerDefaults {
    pub const TTL_SECS: u64 = 300;
}

/// Registry-wide settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RegistryConfig {
    /// Period between two eviction sweeps.
    pub sweep_interval: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            sweep_interval: SweepConfig::INTERVAL,
        }
    }
}

/// Settings for one type handler.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct HandlerConfig {
    /// Root directory of this record type's files.
    pub base_dir: PathBuf,
    /// Idle time after which a resident record is saved and evicted.
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
}

fn default_ttl_secs() -> u64 {
    HandlerDefaults::TTL_SECS
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("data"),
            ttl_secs: HandlerDefaults::TTL_SECS,
        }
    }
}

impl HandlerConfig {
    pub fn new(base_dir: impl Into<PathBuf>, ttl_secs: u64) -> Self {
        Self {
            base_dir: base_dir.into(),
            ttl_secs,
        }
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    /// Load a handler config from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let map = storage::read_map(path)?.ok_or_else(|| CacheError::Config {
            message: format!("Handler config {} not found", path.display()),
        })?;
        serde_json::from_value(serde_json::Value::Object(map)).map_err(|e| CacheError::Config {
            message: format!("Invalid handler config {}: {}", path.display(), e),
        })
    }
}
