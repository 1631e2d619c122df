//! Shard distribution: one message per trustee, each from a fresh identity.
//!
//! Shards are scheduled on a staggered timeline so that their timestamps do
//! not cluster: the gap before the shard at position `i` is
//! `i × offset_increment`, giving offsets `0, 1, 3, 6, 10, …` increments.
//! A shard whose offset exceeds `max_publish_offset` is not published now;
//! it goes to the [`DeferredQueue`] and is published by
//! [`Distributor::drain_deferred`] once it falls inside the window.
//!
//! Per-shard lifecycle, tracked by [`ShardJob`]:
//! ```text
//! Pending → Encrypted → Published ─┐
//!                     └→ Deferred ─┴→ Done
//! ```

use keyshard_core::config::KeyshardConfig;
use keyshard_core::{EncryptedShard, KeyshardError, KeyshardResult, PublishedShard, Trustee};
use keyshard_crypto::{encrypt_to, DisposableIdentity, PublicKey};
use keyshard_transport::{recipient_tag, SignedMessage, Transport, SHARD_KIND};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::deferred::{DeferredQueue, DeferredShard};

/// Scheduling offset, in seconds, of the shard at 0-based `position`.
pub fn offset_for(position: usize, increment_secs: u64) -> u64 {
    let position = position as u64;
    increment_secs.saturating_mul(position.saturating_mul(position.saturating_add(1)) / 2)
}

/// Distribution knobs, usually taken from [`KeyshardConfig`].
#[derive(Debug, Clone)]
pub struct DistributionSettings {
    pub relays: Vec<String>,
    pub offset_increment_secs: u64,
    pub max_publish_offset_secs: u64,
    pub publish_timeout: Duration,
}

impl DistributionSettings {
    pub fn from_config(config: &KeyshardConfig) -> Self {
        Self {
            relays: config.transport.relays.clone(),
            offset_increment_secs: config.distribution.offset_increment_secs(),
            max_publish_offset_secs: config.distribution.max_publish_offset_secs(),
            publish_timeout: config.transport.publish_timeout(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardState {
    Pending,
    Encrypted,
    Published,
    Deferred,
    Done,
}

/// Bookkeeping for one shard moving through distribution.
#[derive(Debug)]
pub struct ShardJob {
    pub shard_index: u8,
    pub publish_at: u64,
    state: ShardState,
}

impl ShardJob {
    fn new(shard_index: u8, publish_at: u64) -> Self {
        Self {
            shard_index,
            publish_at,
            state: ShardState::Pending,
        }
    }

    pub fn state(&self) -> ShardState {
        self.state
    }

    fn advance(&mut self, next: ShardState) {
        debug!(shard_index = self.shard_index, from = ?self.state, to = ?next, "shard transition");
        self.state = next;
    }
}

/// Identity and clock shared by every shard of one backup run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistributionRun {
    /// Random per-run tag carried by queued, pending and published shards
    pub backup_id: String,
    pub started_at: u64,
}

impl DistributionRun {
    /// A run with a fresh random id.
    pub fn new(started_at: u64) -> Self {
        Self {
            backup_id: hex::encode(rand::random::<[u8; 16]>()),
            started_at,
        }
    }
}

/// What happened to one shard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DistributionOutcome {
    Published(PublishedShard),
    Deferred(DeferredShard),
}

/// Result of a drain over the deferred queue.
#[derive(Debug, Default)]
pub struct DrainReport {
    /// Shards published by this drain
    pub published: Vec<PublishedShard>,
    /// Set when a shard went out but its queue entry could not be removed.
    /// The drain stops there; the entry would be published again next time.
    pub queue_error: Option<KeyshardError>,
}

impl DrainReport {
    pub fn into_result(self) -> KeyshardResult<Vec<PublishedShard>> {
        match self.queue_error {
            Some(e) => Err(e),
            None => Ok(self.published),
        }
    }
}

pub struct Distributor {
    transport: Arc<dyn Transport>,
    queue: Arc<dyn DeferredQueue>,
    settings: DistributionSettings,
}

impl Distributor {
    pub fn new(
        transport: Arc<dyn Transport>,
        queue: Arc<dyn DeferredQueue>,
        settings: DistributionSettings,
    ) -> Self {
        Self {
            transport,
            queue,
            settings,
        }
    }

    pub fn settings(&self) -> &DistributionSettings {
        &self.settings
    }

    /// Whether the shard at `position` goes out during the run itself.
    pub fn publishes_immediately(&self, position: usize) -> bool {
        offset_for(position, self.settings.offset_increment_secs)
            <= self.settings.max_publish_offset_secs
    }

    /// Publish or defer the shard at `position` in `run`.
    pub async fn distribute_one(
        &self,
        shard: &EncryptedShard,
        trustee: &Trustee,
        position: usize,
        run: &DistributionRun,
    ) -> KeyshardResult<DistributionOutcome> {
        let offset = offset_for(position, self.settings.offset_increment_secs);
        let publish_at = run.started_at.saturating_add(offset);
        let mut job = ShardJob::new(shard.index, publish_at);

        if offset > self.settings.max_publish_offset_secs {
            let deferred = DeferredShard {
                backup_id: run.backup_id.clone(),
                encrypted_shard: shard.clone(),
                recipient_pubkey: trustee.pubkey.clone(),
                relays: self.settings.relays.clone(),
                stored_at: run.started_at,
                publish_at,
            };
            self.queue
                .push(deferred.clone())
                .map_err(|e| KeyshardError::DeferFailed {
                    shard_index: shard.index,
                    reason: format!("{e:#}"),
                })?;
            job.advance(ShardState::Deferred);
            info!(
                shard_index = shard.index,
                publish_at, "shard deferred beyond publish window"
            );
            job.advance(ShardState::Done);
            return Ok(DistributionOutcome::Deferred(deferred));
        }

        let published = self
            .publish_shard(
                &mut job,
                &run.backup_id,
                shard,
                &trustee.pubkey,
                &self.settings.relays,
            )
            .await?;
        job.advance(ShardState::Done);
        Ok(DistributionOutcome::Published(published))
    }

    async fn publish_shard(
        &self,
        job: &mut ShardJob,
        backup_id: &str,
        shard: &EncryptedShard,
        recipient: &str,
        relays: &[String],
    ) -> KeyshardResult<PublishedShard> {
        let shard_index = shard.index;
        let encryption_failed = |reason: String| KeyshardError::ShardEncryptionFailed {
            shard_index,
            reason,
        };

        let recipient_key =
            PublicKey::from_hex(recipient).map_err(|e| encryption_failed(e.to_string()))?;
        let identity =
            DisposableIdentity::generate().map_err(|e| KeyshardError::IdentityGenerationFailed {
                shard_index,
                reason: e.to_string(),
            })?;

        let payload = shard.to_json().map_err(|e| encryption_failed(e.to_string()))?;
        let content = encrypt_to(identity.keypair(), &recipient_key, payload.as_bytes())
            .map_err(|e| encryption_failed(e.to_string()))?;
        job.advance(ShardState::Encrypted);

        let message = SignedMessage::sign(
            identity.keypair(),
            SHARD_KIND,
            job.publish_at,
            vec![recipient_tag(recipient)],
            content,
        )
        .map_err(|e| KeyshardError::SigningFailed {
            shard_index,
            reason: e.to_string(),
        })?;

        let timeout = self.settings.publish_timeout;
        let publish = self.transport.publish(&message, relays);
        let receipt = match tokio::time::timeout(timeout, publish).await {
            Err(_) => {
                return Err(KeyshardError::PublishTimeout {
                    shard_index: Some(shard_index),
                    timeout_secs: timeout.as_secs(),
                })
            }
            Ok(Err(e)) => {
                return Err(KeyshardError::PublishFailed {
                    shard_index,
                    reason: format!("{e:#}"),
                })
            }
            Ok(Ok(receipt)) => receipt,
        };
        job.advance(ShardState::Published);

        for (relay, reason) in &receipt.rejected {
            warn!(shard_index, relay = %relay, %reason, "relay refused shard");
        }
        info!(
            shard_index,
            event_id = %receipt.id,
            relays = receipt.accepted.len(),
            "shard published"
        );

        Ok(PublishedShard {
            backup_id: backup_id.to_string(),
            event_id: receipt.id,
            recipient_pubkey: recipient.to_string(),
            relays: receipt.accepted,
            shard_index,
            published_at: job.publish_at,
            disposable_key: identity.public().to_hex(),
        })
    }

    /// Publish every queued shard, from any run, whose `publish_at` is
    /// within `max_publish_offset` of `now`.
    ///
    /// Entries that are not yet due, or whose publish fails, stay queued.
    pub async fn drain_deferred(&self, now: u64) -> KeyshardResult<DrainReport> {
        self.drain_where(now, |_| true).await
    }

    /// [`drain_deferred`](Self::drain_deferred) restricted to one run.
    pub async fn drain_backup(&self, backup_id: &str, now: u64) -> KeyshardResult<DrainReport> {
        self.drain_where(now, |entry| entry.backup_id == backup_id)
            .await
    }

    async fn drain_where<F>(&self, now: u64, wanted: F) -> KeyshardResult<DrainReport>
    where
        F: Fn(&DeferredShard) -> bool,
    {
        let entries = self
            .queue
            .list()
            .map_err(|e| KeyshardError::Other(e.context("reading deferred queue")))?;

        let mut report = DrainReport::default();
        for entry in entries.into_iter().filter(|e| wanted(e)) {
            let shard_index = entry.shard_index();
            if entry.publish_at.saturating_sub(now) > self.settings.max_publish_offset_secs {
                debug!(shard_index, publish_at = entry.publish_at, "deferred shard not yet due");
                continue;
            }

            let mut job = ShardJob::new(shard_index, entry.publish_at);
            let shard = match self
                .publish_shard(
                    &mut job,
                    &entry.backup_id,
                    &entry.encrypted_shard,
                    &entry.recipient_pubkey,
                    &entry.relays,
                )
                .await
            {
                Ok(shard) => shard,
                Err(e) => {
                    warn!(shard_index, error = %e, "deferred shard publish failed, keeping it queued");
                    continue;
                }
            };

            let removed = self.queue.remove(&entry);
            job.advance(ShardState::Done);
            let event_id = shard.event_id.clone();
            report.published.push(shard);
            if let Err(e) = removed {
                warn!(shard_index, event_id = %event_id, "published shard still queued: {e:#}");
                report.queue_error = Some(KeyshardError::DeferFailed {
                    shard_index,
                    reason: format!("published as {event_id} but still queued: {e:#}"),
                });
                break;
            }
        }
        Ok(report)
    }
}
