//! keyshard-core: types, configuration and errors shared by every keyshard crate
//!
//! The wire shapes defined here (`EncryptedShard`, `BackupMetadata`) are the
//! only payloads keyshard dictates; everything else rides inside the
//! transport's own message envelope.

pub mod config;
pub mod error;
pub mod types;

pub use error::{KeyshardError, KeyshardResult};
pub use types::{
    BackupMetadata, BackupProgress, BackupStatus, EncryptedShard, PendingShard, PublishedShard,
    ShardConfig, ShardEvent, ShardHealth, Trustee, TrusteeEntry,
};
