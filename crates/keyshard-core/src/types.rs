use serde::{Deserialize, Serialize};

use crate::error::{KeyshardError, KeyshardResult};

/// Smallest allowed reconstruction threshold.
pub const MIN_THRESHOLD: u8 = 2;
/// Largest allowed reconstruction threshold.
pub const MAX_THRESHOLD: u8 = 5;
/// Smallest allowed number of shards.
pub const MIN_SHARDS: u8 = 3;
/// Largest allowed number of shards.
pub const MAX_SHARDS: u8 = 10;

/// Current `BackupMetadata` format version.
pub const METADATA_VERSION: u32 = 1;

/// Quorum parameters for one backup session.
///
/// Only constructible through [`ShardConfig::new`], so a value in hand is
/// always valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ShardConfig {
    threshold: u8,
    total_shards: u8,
}

impl ShardConfig {
    /// Validate and build a config: `2 ≤ threshold ≤ 5`, `3 ≤ total ≤ 10`,
    /// `threshold ≤ total`.
    pub fn new(threshold: u8, total_shards: u8) -> KeyshardResult<Self> {
        if !(MIN_SHARDS..=MAX_SHARDS).contains(&total_shards) {
            return Err(KeyshardError::InvalidShardCount { total_shards });
        }
        if !(MIN_THRESHOLD..=MAX_THRESHOLD).contains(&threshold) || threshold > total_shards {
            return Err(KeyshardError::InvalidThreshold {
                threshold,
                total_shards,
            });
        }
        Ok(Self {
            threshold,
            total_shards,
        })
    }

    pub fn threshold(&self) -> u8 {
        self.threshold
    }

    pub fn total_shards(&self) -> u8 {
        self.total_shards
    }
}

impl<'de> Deserialize<'de> for ShardConfig {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Raw {
            threshold: u8,
            total_shards: u8,
        }

        let raw = Raw::deserialize(deserializer)?;
        ShardConfig::new(raw.threshold, raw.total_shards).map_err(serde::de::Error::custom)
    }
}

/// A shard after passphrase encryption: the only shard form that may be
/// persisted or transmitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedShard {
    /// 1-based shard index (the Shamir x-coordinate)
    pub index: u8,
    /// base64(`salt ‖ iv ‖ ciphertext ‖ tag`)
    pub encrypted_data: String,
    pub total_shards: u8,
    pub threshold: u8,
}

impl EncryptedShard {
    /// Serialize to the JSON payload carried by the transport.
    pub fn to_json(&self) -> KeyshardResult<String> {
        serde_json::to_string(self)
            .map_err(|e| KeyshardError::InvalidPayload(format!("encoding shard: {e}")))
    }

    pub fn from_json(data: &str) -> KeyshardResult<Self> {
        serde_json::from_str(data)
            .map_err(|e| KeyshardError::InvalidPayload(format!("decoding shard: {e}")))
    }
}

/// A party chosen to hold one shard.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Trustee {
    /// Hex-encoded 32-byte public key
    pub pubkey: String,
}

impl Trustee {
    pub fn new(pubkey: impl Into<String>) -> Self {
        Self {
            pubkey: pubkey.into(),
        }
    }
}

/// Record of one shard successfully handed to the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishedShard {
    /// Run that produced the shard
    #[serde(default)]
    pub backup_id: String,
    pub event_id: String,
    pub recipient_pubkey: String,
    pub relays: Vec<String>,
    pub shard_index: u8,
    /// Unix seconds
    pub published_at: u64,
    /// Public half of the one-time identity that signed the message
    pub disposable_key: String,
}

/// Trustee ↔ shard assignment as recorded in the manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrusteeEntry {
    pub pubkey: String,
    pub shard_index: u8,
}

/// Where a shard message lives on the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShardEvent {
    pub event_id: String,
    pub recipient_pubkey: String,
    pub relays: Vec<String>,
    pub shard_index: u8,
    pub published_at: u64,
}

impl From<&PublishedShard> for ShardEvent {
    fn from(p: &PublishedShard) -> Self {
        Self {
            event_id: p.event_id.clone(),
            recipient_pubkey: p.recipient_pubkey.clone(),
            relays: p.relays.clone(),
            shard_index: p.shard_index,
            published_at: p.published_at,
        }
    }
}

/// A shard that was deferred and has not been published yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingShard {
    /// Run that produced the shard; ties the entry to its deferred-queue record
    #[serde(default)]
    pub backup_id: String,
    pub recipient_pubkey: String,
    pub shard_index: u8,
    /// Unix seconds at which the shard is scheduled to appear
    pub publish_at: u64,
}

/// The owner-only manifest: which shard went to which trustee via which message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupMetadata {
    pub version: u32,
    pub created_at: u64,
    pub threshold: u8,
    pub total_shards: u8,
    pub trustees: Vec<TrusteeEntry>,
    pub shard_events: Vec<ShardEvent>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pending_shards: Vec<PendingShard>,
}

impl BackupMetadata {
    /// At least `threshold` shards are recorded as published.
    pub fn is_valid(&self) -> bool {
        self.threshold > 0 && usize::from(self.threshold) <= self.shard_events.len()
    }

    /// Every shard of the backup has been published.
    pub fn is_finalized(&self) -> bool {
        self.shard_events.len() == usize::from(self.total_shards)
    }

    pub fn to_json(&self) -> KeyshardResult<String> {
        serde_json::to_string(self)
            .map_err(|e| KeyshardError::MetadataBuildFailed(format!("serializing metadata: {e}")))
    }

    pub fn from_json(data: &str) -> KeyshardResult<Self> {
        serde_json::from_str(data)
            .map_err(|e| KeyshardError::MetadataFetchFailed(format!("parsing metadata: {e}")))
    }
}

/// Result of probing one shard's message on its recorded relays.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShardHealth {
    pub shard_index: u8,
    pub healthy: bool,
    /// Relays from which the message could be fetched
    pub relays: Vec<String>,
}

/// Coarse orchestrator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackupStatus {
    #[default]
    Idle,
    CreatingShards,
    Publishing,
    Complete,
    Error,
}

/// Progress snapshot exposed to the UI layer.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupProgress {
    pub status: BackupStatus,
    pub current_step: u32,
    pub total_steps: u32,
    pub message: String,
    /// Machine-readable error code when `status == Error`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
