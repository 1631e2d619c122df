//! Backup manifest: built once per backup, encrypted to the owner's own key,
//! signed, and published under the `["d", "keyshard-backup-metadata"]` tag.
//!
//! A newer manifest supersedes an older one by `createdAt`; the transport
//! never sees the trustee ↔ shard mapping in the clear.

use keyshard_core::config::KeyshardConfig;
use keyshard_core::types::METADATA_VERSION;
use keyshard_core::{
    BackupMetadata, KeyshardError, KeyshardResult, PublishedShard, ShardConfig, ShardEvent,
    ShardHealth, TrusteeEntry,
};
use keyshard_crypto::{decrypt_from, encrypt_to, Keypair};
use keyshard_transport::{metadata_tag, SignedMessage, Transport, METADATA_KIND, METADATA_TAG};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::deferred::DeferredShard;

fn sorted_entries(published: &[PublishedShard]) -> (Vec<TrusteeEntry>, Vec<ShardEvent>) {
    let mut shards: Vec<&PublishedShard> = published.iter().collect();
    shards.sort_by_key(|p| p.shard_index);
    let trustees = shards
        .iter()
        .map(|p| TrusteeEntry {
            pubkey: p.recipient_pubkey.clone(),
            shard_index: p.shard_index,
        })
        .collect();
    let events = shards.iter().map(|p| ShardEvent::from(*p)).collect();
    (trustees, events)
}

fn check_published(published: &[PublishedShard], threshold: u8) -> KeyshardResult<()> {
    if threshold == 0 {
        return Err(KeyshardError::MetadataBuildFailed(
            "threshold must be positive".into(),
        ));
    }
    if published.is_empty() {
        return Err(KeyshardError::MetadataBuildFailed(
            "no published shards".into(),
        ));
    }
    if usize::from(threshold) > published.len() {
        return Err(KeyshardError::MetadataBuildFailed(format!(
            "threshold {threshold} exceeds {} published shard(s)",
            published.len()
        )));
    }
    let mut indices: Vec<u8> = published.iter().map(|p| p.shard_index).collect();
    indices.sort_unstable();
    if indices.windows(2).any(|w| w[0] == w[1]) {
        return Err(KeyshardError::MetadataBuildFailed(
            "duplicate shard index".into(),
        ));
    }
    Ok(())
}

/// Build a manifest covering exactly the published shards.
///
/// `totalShards` is the number of published shards.
pub fn build(published: &[PublishedShard], threshold: u8) -> KeyshardResult<BackupMetadata> {
    check_published(published, threshold)?;
    let (trustees, shard_events) = sorted_entries(published);
    let total_shards = u8::try_from(published.len())
        .map_err(|_| KeyshardError::MetadataBuildFailed("too many shards".into()))?;
    Ok(BackupMetadata {
        version: METADATA_VERSION,
        created_at: keyshard_transport::now(),
        threshold,
        total_shards,
        trustees,
        shard_events,
        pending_shards: Vec::new(),
    })
}

/// Build a manifest for a run where some shards were deferred.
///
/// `totalShards` comes from `config`; deferred shards are listed as pending
/// and their trustees are included in the trustee list.
pub fn build_with_pending(
    published: &[PublishedShard],
    deferred: &[DeferredShard],
    config: &ShardConfig,
) -> KeyshardResult<BackupMetadata> {
    check_published(published, config.threshold())?;
    if published.len() + deferred.len() > usize::from(config.total_shards()) {
        return Err(KeyshardError::MetadataBuildFailed(format!(
            "{} published + {} deferred exceeds {} shards",
            published.len(),
            deferred.len(),
            config.total_shards()
        )));
    }

    let (mut trustees, shard_events) = sorted_entries(published);
    let mut pending_shards: Vec<_> = deferred.iter().map(DeferredShard::pending).collect();
    pending_shards.sort_by_key(|p| p.shard_index);
    trustees.extend(pending_shards.iter().map(|p| TrusteeEntry {
        pubkey: p.recipient_pubkey.clone(),
        shard_index: p.shard_index,
    }));
    trustees.sort_by_key(|t| t.shard_index);

    Ok(BackupMetadata {
        version: METADATA_VERSION,
        created_at: keyshard_transport::now(),
        threshold: config.threshold(),
        total_shards: config.total_shards(),
        trustees,
        shard_events,
        pending_shards,
    })
}

/// Fold newly published (previously pending) shards into a manifest.
///
/// A shard is matched to a pending entry of `previous` by run, index and
/// trustee; anything else is ignored. The result is stamped strictly later
/// than `previous`.
pub fn supersede(previous: &BackupMetadata, newly_published: &[PublishedShard]) -> BackupMetadata {
    let mut next = previous.clone();
    for shard in newly_published {
        let Some(pos) = next.pending_shards.iter().position(|p| {
            p.backup_id == shard.backup_id
                && p.shard_index == shard.shard_index
                && p.recipient_pubkey == shard.recipient_pubkey
        }) else {
            debug!(
                shard_index = shard.shard_index,
                "published shard is not pending in this manifest"
            );
            continue;
        };
        next.pending_shards.remove(pos);
        next.shard_events.push(ShardEvent::from(shard));
    }
    next.shard_events.sort_by_key(|e| e.shard_index);
    next.created_at = keyshard_transport::now().max(previous.created_at.saturating_add(1));
    next
}

/// Publishes, fetches and health-checks manifests over a [`Transport`].
pub struct MetadataService {
    transport: Arc<dyn Transport>,
    relays: Vec<String>,
    publish_timeout: Duration,
    fetch_timeout: Duration,
}

impl MetadataService {
    pub fn new(
        transport: Arc<dyn Transport>,
        relays: Vec<String>,
        publish_timeout: Duration,
        fetch_timeout: Duration,
    ) -> Self {
        Self {
            transport,
            relays,
            publish_timeout,
            fetch_timeout,
        }
    }

    pub fn from_config(transport: Arc<dyn Transport>, config: &KeyshardConfig) -> Self {
        Self::new(
            transport,
            config.transport.relays.clone(),
            config.transport.publish_timeout(),
            config.transport.fetch_timeout(),
        )
    }

    /// Self-encrypt, sign and publish; returns the manifest message id.
    pub async fn publish(&self, metadata: &BackupMetadata, owner: &Keypair) -> KeyshardResult<String> {
        let json = metadata
            .to_json()
            .map_err(|e| KeyshardError::MetadataPublishFailed(e.to_string()))?;
        let content = encrypt_to(owner, &owner.public(), json.as_bytes())
            .map_err(|e| KeyshardError::MetadataPublishFailed(format!("encrypting manifest: {e}")))?;
        let message = SignedMessage::sign(
            owner,
            METADATA_KIND,
            metadata.created_at,
            vec![metadata_tag()],
            content,
        )
        .map_err(|e| KeyshardError::MetadataPublishFailed(format!("signing manifest: {e}")))?;

        let publish = self.transport.publish(&message, &self.relays);
        let receipt = match tokio::time::timeout(self.publish_timeout, publish).await {
            Err(_) => {
                return Err(KeyshardError::PublishTimeout {
                    shard_index: None,
                    timeout_secs: self.publish_timeout.as_secs(),
                })
            }
            Ok(Err(e)) => return Err(KeyshardError::MetadataPublishFailed(format!("{e:#}"))),
            Ok(Ok(receipt)) => receipt,
        };

        info!(
            event_id = %receipt.id,
            shards = metadata.shard_events.len(),
            pending = metadata.pending_shards.len(),
            "manifest published"
        );
        Ok(receipt.id)
    }

    /// Stamp `metadata` strictly after the owner's newest manifest, then publish.
    ///
    /// Keeps [`fetch`](Self::fetch) ordering strict when two manifests land
    /// in the same second.
    pub async fn publish_superseding(
        &self,
        metadata: &mut BackupMetadata,
        owner: &Keypair,
    ) -> KeyshardResult<String> {
        match self.fetch(owner).await {
            Ok(Some(latest)) if latest.created_at >= metadata.created_at => {
                debug!(
                    latest = latest.created_at,
                    "restamping manifest after current one"
                );
                metadata.created_at = latest.created_at.saturating_add(1);
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "could not read current manifest before publishing"),
        }
        self.publish(metadata, owner).await
    }

    /// The owner's most recent manifest, or `None` if there is none.
    pub async fn fetch(&self, owner: &Keypair) -> KeyshardResult<Option<BackupMetadata>> {
        let owner_pub = owner.public();
        let author = owner_pub.to_hex();

        let query = self
            .transport
            .fetch_by_author_and_tag(&author, "d", METADATA_TAG, &self.relays);
        let messages = match tokio::time::timeout(self.fetch_timeout, query).await {
            Err(_) => {
                return Err(KeyshardError::FetchTimeout {
                    timeout_secs: self.fetch_timeout.as_secs(),
                })
            }
            Ok(Err(e)) => return Err(KeyshardError::MetadataFetchFailed(format!("{e:#}"))),
            Ok(Ok(messages)) => messages,
        };

        let latest = messages
            .into_iter()
            .filter(|m| m.kind == METADATA_KIND && m.pubkey == author)
            .filter(|m| match m.verify() {
                Ok(()) => true,
                Err(e) => {
                    warn!(event_id = %m.id, "dropping manifest with bad signature: {e}");
                    false
                }
            })
            .max_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));

        let Some(message) = latest else {
            debug!("no manifest found");
            return Ok(None);
        };

        let plaintext = decrypt_from(owner, &owner_pub, &message.content)
            .map_err(|e| KeyshardError::MetadataFetchFailed(format!("decrypting manifest: {e}")))?;
        let json = std::str::from_utf8(&plaintext)
            .map_err(|e| KeyshardError::MetadataFetchFailed(format!("manifest is not UTF-8: {e}")))?;
        BackupMetadata::from_json(json).map(Some)
    }

    /// Check every recorded shard message on each of its relays.
    ///
    /// Read-only; a relay that errors or times out is simply left out of
    /// that shard's `relays`.
    pub async fn check_health(&self, metadata: &BackupMetadata) -> Vec<ShardHealth> {
        let mut report = Vec::with_capacity(metadata.shard_events.len());
        for event in &metadata.shard_events {
            let mut reachable = Vec::new();
            for relay in &event.relays {
                let ids = [event.event_id.clone()];
                let relays = [relay.clone()];
                let lookup = self.transport.fetch_by_ids(&ids, &relays);
                match tokio::time::timeout(self.fetch_timeout, lookup).await {
                    Ok(Ok(found))
                        if found
                            .iter()
                            .any(|m| m.id == event.event_id && m.verify().is_ok()) =>
                    {
                        reachable.push(relay.clone())
                    }
                    Ok(Ok(_)) => {
                        debug!(shard_index = event.shard_index, relay = %relay, "shard missing")
                    }
                    Ok(Err(e)) => {
                        debug!(shard_index = event.shard_index, relay = %relay, "relay check failed: {e:#}")
                    }
                    Err(_) => {
                        debug!(shard_index = event.shard_index, relay = %relay, "relay check timed out")
                    }
                }
            }
            report.push(ShardHealth {
                shard_index: event.shard_index,
                healthy: !reachable.is_empty(),
                relays: reachable,
            });
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keyshard_core::EncryptedShard;
    use keyshard_transport::MemoryTransport;

    fn published(index: u8, at: u64) -> PublishedShard {
        PublishedShard {
            backup_id: "run-1".into(),
            event_id: format!("{index:064x}"),
            recipient_pubkey: format!("{:064x}", u32::from(index) + 100),
            relays: vec!["relay-a".into()],
            shard_index: index,
            published_at: at,
            disposable_key: format!("{:064x}", u32::from(index) + 200),
        }
    }

    fn deferred(index: u8) -> DeferredShard {
        DeferredShard {
            backup_id: "run-1".into(),
            encrypted_shard: EncryptedShard {
                index,
                encrypted_data: String::new(),
                total_shards: 5,
                threshold: 2,
            },
            recipient_pubkey: format!("{:064x}", u32::from(index) + 100),
            relays: vec!["relay-a".into()],
            stored_at: 0,
            publish_at: 99,
        }
    }

    fn service(transport: Arc<MemoryTransport>) -> MetadataService {
        MetadataService::new(
            transport,
            vec!["relay-a".into(), "relay-b".into()],
            Duration::from_secs(5),
            Duration::from_secs(5),
        )
    }

    #[test]
    fn test_build_sorts_and_counts() {
        let meta = build(&[published(3, 30), published(1, 10), published(2, 20)], 2).unwrap();
        assert_eq!(meta.version, 1);
        assert_eq!(meta.total_shards, 3);
        let order: Vec<u8> = meta.shard_events.iter().map(|e| e.shard_index).collect();
        assert_eq!(order, vec![1, 2, 3]);
        assert_eq!(meta.trustees[0].shard_index, 1);
        assert!(meta.is_valid());
        assert!(meta.is_finalized());
        assert!(meta.pending_shards.is_empty());
    }

    #[test]
    fn test_build_rejects_bad_input() {
        assert!(matches!(build(&[], 2), Err(KeyshardError::MetadataBuildFailed(_))));
        assert!(build(&[published(1, 0)], 0).is_err());
        assert!(build(&[published(1, 0)], 2).is_err());
        assert!(build(&[published(1, 0), published(1, 0)], 2).is_err());
    }

    #[test]
    fn test_build_with_pending() {
        let config = ShardConfig::new(2, 5).unwrap();
        let meta = build_with_pending(
            &[published(1, 0), published(2, 0), published(3, 0)],
            &[deferred(5), deferred(4)],
            &config,
        )
        .unwrap();
        assert_eq!(meta.total_shards, 5);
        assert_eq!(meta.trustees.len(), 5);
        assert_eq!(meta.pending_shards[0].shard_index, 4);
        assert!(meta.is_valid());
        assert!(!meta.is_finalized());

        assert!(build_with_pending(&[published(1, 0)], &[], &config).is_err());
    }

    #[test]
    fn test_supersede_moves_pending_to_events() {
        let config = ShardConfig::new(2, 5).unwrap();
        let previous = build_with_pending(
            &[published(1, 0), published(2, 0), published(3, 0)],
            &[deferred(4), deferred(5)],
            &config,
        )
        .unwrap();

        let next = supersede(&previous, &[published(4, 50), published(9, 50)]);
        assert_eq!(next.shard_events.len(), 4);
        assert_eq!(next.pending_shards.len(), 1);
        assert_eq!(next.pending_shards[0].shard_index, 5);
        assert!(next.created_at > previous.created_at);
    }

    #[test]
    fn test_supersede_ignores_other_runs() {
        let config = ShardConfig::new(2, 5).unwrap();
        let previous = build_with_pending(
            &[published(1, 0), published(2, 0), published(3, 0)],
            &[deferred(4), deferred(5)],
            &config,
        )
        .unwrap();

        // Same trustee and index, different backup.
        let mut foreign = published(4, 50);
        foreign.backup_id = "run-0".into();
        let next = supersede(&previous, &[foreign]);
        assert_eq!(next.shard_events.len(), 3);
        assert_eq!(next.pending_shards.len(), 2);
    }

    #[tokio::test]
    async fn test_publish_then_fetch() {
        let transport = Arc::new(MemoryTransport::new());
        let svc = service(transport.clone());
        let owner = Keypair::try_generate().unwrap();

        assert!(svc.fetch(&owner).await.unwrap().is_none());

        let meta = build(&[published(1, 0), published(2, 0), published(3, 0)], 2).unwrap();
        let id = svc.publish(&meta, &owner).await.unwrap();

        let stored = transport.messages("relay-a");
        assert_eq!(stored[0].id, id);
        assert!(!stored[0].content.contains("recipientPubkey"));

        assert_eq!(svc.fetch(&owner).await.unwrap(), Some(meta));
    }

    #[tokio::test]
    async fn test_fetch_picks_newest() {
        let transport = Arc::new(MemoryTransport::new());
        let svc = service(transport);
        let owner = Keypair::try_generate().unwrap();

        let mut old = build(&[published(1, 0), published(2, 0), published(3, 0)], 2).unwrap();
        old.created_at = 1_000;
        let mut new = build(&[published(1, 0), published(2, 0), published(3, 0)], 3).unwrap();
        new.created_at = 2_000;
        svc.publish(&new, &owner).await.unwrap();
        svc.publish(&old, &owner).await.unwrap();

        let fetched = svc.fetch(&owner).await.unwrap().unwrap();
        assert_eq!(fetched.created_at, 2_000);
        assert_eq!(fetched.threshold, 3);
    }

    #[tokio::test]
    async fn test_publish_superseding_breaks_same_second_tie() {
        for _ in 0..10 {
            let transport = Arc::new(MemoryTransport::new());
            let svc = service(transport);
            let owner = Keypair::try_generate().unwrap();

            let mut first = build(&[published(1, 0), published(2, 0), published(3, 0)], 2).unwrap();
            first.created_at = 5_000;
            svc.publish_superseding(&mut first, &owner).await.unwrap();
            assert_eq!(first.created_at, 5_000);

            let mut second = build(&[published(1, 0), published(2, 0), published(3, 0)], 3).unwrap();
            second.created_at = 5_000;
            svc.publish_superseding(&mut second, &owner).await.unwrap();
            assert_eq!(second.created_at, 5_001);

            assert_eq!(svc.fetch(&owner).await.unwrap(), Some(second));
        }
    }

    #[tokio::test]
    async fn test_fetch_ignores_other_authors() {
        let transport = Arc::new(MemoryTransport::new());
        let svc = service(transport);
        let owner = Keypair::try_generate().unwrap();
        let other = Keypair::try_generate().unwrap();

        let meta = build(&[published(1, 0), published(2, 0), published(3, 0)], 2).unwrap();
        svc.publish(&meta, &other).await.unwrap();
        assert!(svc.fetch(&owner).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_publish_failure() {
        let transport = Arc::new(MemoryTransport::new());
        transport.reject_kind(METADATA_KIND);
        let svc = service(transport);
        let owner = Keypair::try_generate().unwrap();
        let meta = build(&[published(1, 0), published(2, 0), published(3, 0)], 2).unwrap();

        assert!(matches!(
            svc.publish(&meta, &owner).await,
            Err(KeyshardError::MetadataPublishFailed(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_timeout() {
        let transport = Arc::new(MemoryTransport::new());
        transport.set_fetch_delay(Duration::from_secs(60));
        let svc = service(transport);
        let owner = Keypair::try_generate().unwrap();

        assert!(matches!(
            svc.fetch(&owner).await,
            Err(KeyshardError::FetchTimeout { timeout_secs: 5 })
        ));
    }
}
