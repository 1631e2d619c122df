use thiserror::Error;

pub type KeyshardResult<T> = Result<T, KeyshardError>;

/// Every failure keyshard can surface.
///
/// Each variant maps to a stable machine-readable code via [`KeyshardError::code`];
/// the `Display` text is the human-readable message.
#[derive(Debug, Error)]
pub enum KeyshardError {
    // ── configuration ────────────────────────────────────────────────────────
    #[error("invalid threshold {threshold} for {total_shards} shards (must be 2..=5 and not exceed the shard count)")]
    InvalidThreshold { threshold: u8, total_shards: u8 },

    #[error("invalid shard count {total_shards} (must be 3..=10)")]
    InvalidShardCount { total_shards: u8 },

    #[error("expected {expected} trustees, got {actual}")]
    TrusteeMismatch { expected: usize, actual: usize },

    #[error("trustee {0} appears more than once")]
    DuplicateTrustee(String),

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("passphrase too weak: {}", join_rules(.0))]
    WeakPassphrase(Vec<String>),

    #[error("config error: {0}")]
    Config(String),

    // ── cryptographic ────────────────────────────────────────────────────────
    #[error("key derivation failed: {0}")]
    KeyDerivationFailed(String),

    #[error("encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("decryption failed: wrong passphrase or key, or corrupted data")]
    DecryptionFailed,

    // ── secret sharing ───────────────────────────────────────────────────────
    #[error("secret split failed: {0}")]
    SplitFailed(String),

    #[error("secret join failed: {0}")]
    JoinFailed(String),

    #[error("need {} more shard(s) to recover (have {provided}, need {required})", missing(.required, .provided))]
    InsufficientShards { required: usize, provided: usize },

    #[error("shards disagree: {0}")]
    InconsistentShards(String),

    #[error("invalid shard payload: {0}")]
    InvalidPayload(String),

    // ── distribution (scoped to one shard) ───────────────────────────────────
    #[error("shard {shard_index}: disposable identity generation failed: {reason}")]
    IdentityGenerationFailed { shard_index: u8, reason: String },

    #[error("shard {shard_index}: encryption to trustee failed: {reason}")]
    ShardEncryptionFailed { shard_index: u8, reason: String },

    #[error("shard {shard_index}: signing failed: {reason}")]
    SigningFailed { shard_index: u8, reason: String },

    #[error("shard {shard_index}: publish failed: {reason}")]
    PublishFailed { shard_index: u8, reason: String },

    #[error("publish timed out after {timeout_secs}s{}", shard_suffix(.shard_index))]
    PublishTimeout {
        shard_index: Option<u8>,
        timeout_secs: u64,
    },

    #[error("shard {shard_index}: could not store in deferred queue: {reason}")]
    DeferFailed { shard_index: u8, reason: String },

    // ── metadata ─────────────────────────────────────────────────────────────
    #[error("metadata build failed: {0}")]
    MetadataBuildFailed(String),

    #[error("metadata publish failed: {0}")]
    MetadataPublishFailed(String),

    #[error("metadata fetch failed: {0}")]
    MetadataFetchFailed(String),

    #[error("fetch timed out after {timeout_secs}s")]
    FetchTimeout { timeout_secs: u64 },

    // ── session ──────────────────────────────────────────────────────────────
    #[error("a backup is already in progress")]
    BackupInProgress,

    #[error("backup cancelled")]
    Cancelled,

    // ── plumbing ─────────────────────────────────────────────────────────────
    #[error("transport error: {0}")]
    Transport(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

fn join_rules(rules: &[String]) -> String {
    rules.join("; ")
}

fn missing(required: &usize, provided: &usize) -> usize {
    required.saturating_sub(*provided)
}

fn shard_suffix(shard_index: &Option<u8>) -> String {
    shard_index
        .map(|i| format!(" (shard {i})"))
        .unwrap_or_default()
}

impl KeyshardError {
    /// Stable machine-readable code, for UI layers to map to guidance.
    pub fn code(&self) -> &'static str {
        match self {
            KeyshardError::InvalidThreshold { .. } => "INVALID_THRESHOLD",
            KeyshardError::InvalidShardCount { .. } => "INVALID_SHARD_COUNT",
            KeyshardError::TrusteeMismatch { .. } => "TRUSTEE_MISMATCH",
            KeyshardError::DuplicateTrustee(_) => "DUPLICATE_TRUSTEE",
            KeyshardError::InvalidKey(_) => "INVALID_KEY",
            KeyshardError::WeakPassphrase(_) => "WEAK_PASSPHRASE",
            KeyshardError::Config(_) => "CONFIG",
            KeyshardError::KeyDerivationFailed(_) => "KEY_DERIVATION_FAILED",
            KeyshardError::EncryptionFailed(_) => "ENCRYPTION_FAILED",
            KeyshardError::DecryptionFailed => "DECRYPTION_FAILED",
            KeyshardError::SplitFailed(_) => "SPLIT_FAILED",
            KeyshardError::JoinFailed(_) => "JOIN_FAILED",
            KeyshardError::InsufficientShards { .. } => "INSUFFICIENT_SHARDS",
            KeyshardError::InconsistentShards(_) => "INCONSISTENT_SHARDS",
            KeyshardError::InvalidPayload(_) => "INVALID_PAYLOAD",
            KeyshardError::IdentityGenerationFailed { .. } => "IDENTITY_GENERATION_FAILED",
            KeyshardError::ShardEncryptionFailed { .. } => "SHARD_ENCRYPTION_FAILED",
            KeyshardError::SigningFailed { .. } => "SIGNING_FAILED",
            KeyshardError::PublishFailed { .. } => "PUBLISH_FAILED",
            KeyshardError::PublishTimeout { .. } => "PUBLISH_TIMEOUT",
            KeyshardError::DeferFailed { .. } => "DEFER_FAILED",
            KeyshardError::MetadataBuildFailed(_) => "METADATA_BUILD_FAILED",
            KeyshardError::MetadataPublishFailed(_) => "METADATA_PUBLISH_FAILED",
            KeyshardError::MetadataFetchFailed(_) => "METADATA_FETCH_FAILED",
            KeyshardError::FetchTimeout { .. } => "FETCH_TIMEOUT",
            KeyshardError::BackupInProgress => "BACKUP_IN_PROGRESS",
            KeyshardError::Cancelled => "CANCELLED",
            KeyshardError::Transport(_) => "TRANSPORT",
            KeyshardError::Io(_) => "IO",
            KeyshardError::Other(_) => "OTHER",
        }
    }

    /// The shard a distribution failure is scoped to, if any.
    pub fn shard_index(&self) -> Option<u8> {
        match self {
            KeyshardError::IdentityGenerationFailed { shard_index, .. }
            | KeyshardError::ShardEncryptionFailed { shard_index, .. }
            | KeyshardError::SigningFailed { shard_index, .. }
            | KeyshardError::PublishFailed { shard_index, .. }
            | KeyshardError::DeferFailed { shard_index, .. } => Some(*shard_index),
            KeyshardError::PublishTimeout { shard_index, .. } => *shard_index,
            _ => None,
        }
    }

    /// Configuration errors are raised before any cryptographic work happens.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            KeyshardError::InvalidThreshold { .. }
                | KeyshardError::InvalidShardCount { .. }
                | KeyshardError::TrusteeMismatch { .. }
                | KeyshardError::DuplicateTrustee(_)
                | KeyshardError::InvalidKey(_)
                | KeyshardError::WeakPassphrase(_)
                | KeyshardError::Config(_)
        )
    }
}
