//! Configuration types for runsync
//!
//! Every section carries serde defaults so that a partial file (or none at
//! all, with environment overrides) deserializes. The only required value is
//! `run_store.metadata_pattern`; [`Config::validate`] enforces it.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;

/// Root configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub run_store: RunStoreConfig,
    pub index: IndexConfig,
    pub pipeline: PipelineConfig,
    pub importer: ImporterConfig,
    pub admin: AdminConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Check the values no default can supply
    pub fn validate(&self) -> Result<()> {
        match self.run_store.metadata_pattern.as_deref() {
            None => {
                return Err(Error::configuration(
                    "run_store.metadata_pattern is required",
                ));
            }
            Some(p) if p.trim().is_empty() => {
                return Err(Error::configuration(
                    "run_store.metadata_pattern must not be empty",
                ));
            }
            Some(_) => {}
        }
        if self.pipeline.max_concurrent_imports == 0 {
            return Err(Error::configuration(
                "pipeline.max_concurrent_imports must be at least 1",
            ));
        }
        Ok(())
    }
}

/// Run store location and classification
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RunStoreConfig {
    /// Root directory of the store
    pub root: PathBuf,
    /// Regular expression with a required `runId` named capture
    pub metadata_pattern: Option<String>,
    /// Memoize one full listing for the process lifetime
    pub cache_all: bool,
    /// When set, files are copied here before import
    pub scratch_dir: Option<PathBuf>,
}

impl Default for RunStoreConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/var/lib/runsync/runs"),
            metadata_pattern: None,
            cache_all: false,
            scratch_dir: None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    /// redb database file
    pub path: PathBuf,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/var/lib/runsync/index.redb"),
        }
    }
}

/// Change aggregation settings
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Directory holding the journal and the lease file
    pub state_dir: PathBuf,
    /// Debounce window for change batches
    pub threshold_seconds: u64,
    /// Lifetime of run cache entries
    pub cache_ttl_hours: u64,
    pub max_concurrent_imports: usize,
    /// Enqueue a full scan when the daemon starts
    pub full_scan_on_start: bool,
    /// Housekeeping full scan period (0 disables)
    pub full_scan_interval_hours: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from("/var/lib/runsync/pipeline"),
            threshold_seconds: 30,
            cache_ttl_hours: 48,
            max_concurrent_imports: 16,
            full_scan_on_start: false,
            full_scan_interval_hours: 24,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ImporterConfig {
    /// File extensions (without the dot) treated as importable data
    pub data_extensions: Vec<String>,
}

impl Default for ImporterConfig {
    fn default() -> Self {
        Self {
            data_extensions: vec!["csv".to_string()],
        }
    }
}

/// Admin HTTP surface
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AdminConfig {
    pub listen: SocketAddr,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from((Ipv4Addr::LOCALHOST, 9310)),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by `RUST_LOG`
    pub level: String,
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.pipeline.threshold_seconds, 30);
        assert_eq!(config.pipeline.cache_ttl_hours, 48);
        assert_eq!(config.admin.listen.port(), 9310);
        assert_eq!(config.importer.data_extensions, vec!["csv"]);
    }

    #[test]
    fn test_missing_pattern_is_configuration_error() {
        let err = Config::default().validate().unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: Config = serde_json::from_str(
            r#"{"run_store": {"metadata_pattern": "^(?<runId>.*)/params.json$"}, "pipeline": {"threshold_seconds": 5}}"#,
        )
        .unwrap();
        config.validate().unwrap();
        assert_eq!(config.pipeline.threshold_seconds, 5);
        assert_eq!(config.pipeline.cache_ttl_hours, 48);
        assert!(!config.run_store.cache_all);
    }
}
