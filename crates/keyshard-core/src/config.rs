use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{KeyshardError, KeyshardResult};
use crate::types::ShardConfig;

const SECS_PER_DAY: u64 = 24 * 3600;

/// Top-level configuration (loaded from keyshard.toml)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyshardConfig {
    pub transport: TransportConfig,
    pub distribution: DistributionConfig,
    pub backup: BackupDefaults,
    /// Log level (default: info)
    pub log_level: String,
    /// Log format: "json" or "text"
    pub log_format: String,
}

impl Default for KeyshardConfig {
    fn default() -> Self {
        Self {
            transport: TransportConfig::default(),
            distribution: DistributionConfig::default(),
            backup: BackupDefaults::default(),
            log_level: "info".into(),
            log_format: "text".into(),
        }
    }
}

impl KeyshardConfig {
    /// Load from a TOML file; a missing file yields the defaults.
    pub fn load(path: &Path) -> KeyshardResult<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
            .map_err(|e| KeyshardError::Config(format!("{}: {e}", path.display())))
    }

    pub fn from_toml(content: &str) -> KeyshardResult<Self> {
        toml::from_str(content).map_err(|e| KeyshardError::Config(e.to_string()))
    }
}

/// Transport endpoints and I/O ceilings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Endpoints every shard and manifest is published to
    pub relays: Vec<String>,
    /// Root directory for the directory-backed transport
    pub data_dir: PathBuf,
    /// Ceiling for a single publish call (default: 180)
    pub publish_timeout_secs: u64,
    /// Ceiling for a single fetch call (default: 180)
    pub fetch_timeout_secs: u64,
}

impl TransportConfig {
    pub fn publish_timeout(&self) -> Duration {
        Duration::from_secs(self.publish_timeout_secs)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            relays: vec!["relay-a".into(), "relay-b".into()],
            data_dir: PathBuf::from("~/.local/share/keyshard/relays"),
            publish_timeout_secs: 180,
            fetch_timeout_secs: 180,
        }
    }
}

/// Publication spacing and the deferred queue
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DistributionConfig {
    /// Gap growth per shard, in days (default: 1)
    pub offset_increment_days: u64,
    /// Largest offset published immediately; anything later is deferred (default: 30)
    pub max_publish_offset_days: u64,
    /// JSON file holding deferred shards
    pub deferred_queue: PathBuf,
}

impl DistributionConfig {
    pub fn offset_increment_secs(&self) -> u64 {
        self.offset_increment_days.saturating_mul(SECS_PER_DAY)
    }

    pub fn max_publish_offset_secs(&self) -> u64 {
        self.max_publish_offset_days.saturating_mul(SECS_PER_DAY)
    }
}

impl Default for DistributionConfig {
    fn default() -> Self {
        Self {
            offset_increment_days: 1,
            max_publish_offset_days: 30,
            deferred_queue: PathBuf::from("~/.local/share/keyshard/deferred.json"),
        }
    }
}

/// Quorum used when the caller does not specify one
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupDefaults {
    pub threshold: u8,
    pub total_shards: u8,
}

impl BackupDefaults {
    pub fn shard_config(&self) -> KeyshardResult<ShardConfig> {
        ShardConfig::new(self.threshold, self.total_shards)
    }
}

impl Default for BackupDefaults {
    fn default() -> Self {
        Self {
            threshold: 2,
            total_shards: 3,
        }
    }
}

/// Expand a leading `~/` against `$HOME`.
pub fn expand_tilde(path: &Path) -> PathBuf {
    if let Some(s) = path.to_str() {
        if let Some(rest) = s.strip_prefix("~/") {
            let home = std::env::var("HOME")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("/tmp"));
            return home.join(rest);
        }
    }
    path.to_path_buf()
}
