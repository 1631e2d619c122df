//! keyshard-backup: splitting a secret across trustees and getting it back
//!
//! Backup: validate → split → seal each shard under the passphrase →
//! distribute each shard to its trustee through a fresh disposable identity
//! (or defer it) → publish a self-encrypted manifest.
//!
//! Recovery: fetch the manifest → collect shards from trustees → open
//! `threshold` of them → join.

pub mod deferred;
pub mod distribution;
pub mod metadata;
pub mod orchestrator;
pub mod recovery;

pub use deferred::{DeferredQueue, DeferredShard, JsonDeferredQueue, MemoryDeferredQueue};
pub use distribution::{offset_for, DistributionOutcome, DistributionSettings, Distributor};
pub use metadata::MetadataService;
pub use orchestrator::{BackupAbort, BackupOrchestrator, BackupOutcome, BackupRequest};
pub use recovery::{collect_shards, open_shard_message, recover_secret};
