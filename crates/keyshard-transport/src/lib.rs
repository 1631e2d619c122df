//! keyshard-transport: how shard and manifest messages reach relays
//!
//! Relays are opaque string endpoints. Every message is a [`SignedMessage`]
//! whose id commits to its content and whose signature commits to the id;
//! relays store messages by id and answer queries by id or by author + tag.
//!
//! Implementations:
//!   - [`MemoryTransport`]: in-process relays with fault injection
//!   - [`DirTransport`]: one JSON file per relay under a root directory

pub mod dir;
pub mod memory;
pub mod message;

use anyhow::Result;
use async_trait::async_trait;

pub use dir::DirTransport;
pub use memory::MemoryTransport;
pub use message::{
    metadata_tag, recipient_tag, SignedMessage, METADATA_KIND, METADATA_TAG, SHARD_KIND,
};

/// Outcome of a publish that reached at least one relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishReceipt {
    pub id: String,
    /// Relays that stored the message
    pub accepted: Vec<String>,
    /// Relays that refused or were unreachable, with the reason
    pub rejected: Vec<(String, String)>,
}

/// The pub/sub collaborator.
///
/// Each relay may fail independently. `publish` succeeds when at least one
/// relay accepts; the fetch calls return whatever the reachable relays hold
/// (deduplicated by id) and fail only when no relay answered.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn publish(&self, message: &SignedMessage, relays: &[String]) -> Result<PublishReceipt>;

    async fn fetch_by_ids(&self, ids: &[String], relays: &[String]) -> Result<Vec<SignedMessage>>;

    async fn fetch_by_author_and_tag(
        &self,
        author: &str,
        tag_key: &str,
        tag_value: &str,
        relays: &[String],
    ) -> Result<Vec<SignedMessage>>;
}

/// Merge per-relay results, keeping the first copy of each id.
pub(crate) fn merge_unique(
    acc: &mut Vec<SignedMessage>,
    found: impl IntoIterator<Item = SignedMessage>,
) {
    for msg in found {
        if !acc.iter().any(|m| m.id == msg.id) {
            acc.push(msg);
        }
    }
}

/// Current unix time in seconds.
pub fn now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
