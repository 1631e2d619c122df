//! Backup orchestration: one session at a time, strictly sequential.
//!
//! Steps reported on the progress channel:
//! `1 (split) + n (seal each shard) + n (distribute each shard) + 1 (manifest)`.
//!
//! A failure after some shards went out returns a [`BackupAbort`] listing
//! exactly those shards, so the caller can inform trustees or finish with
//! [`BackupOrchestrator::resume_metadata`] instead of splitting again.

use keyshard_core::config::KeyshardConfig;
use keyshard_core::{
    BackupMetadata, BackupProgress, BackupStatus, EncryptedShard, KeyshardError, KeyshardResult,
    PublishedShard, ShardConfig, Trustee,
};
use keyshard_crypto::{
    seal_shard, split_with, validate_strength, KdfParams, Keypair, PublicKey, Secret,
};
use keyshard_transport::Transport;
use secrecy::{ExposeSecret, SecretString};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::deferred::{DeferredQueue, DeferredShard};
use crate::distribution::{
    DistributionOutcome, DistributionRun, DistributionSettings, Distributor, DrainReport,
};
use crate::metadata::{self, MetadataService};

/// Everything a backup needs. Consumed by [`BackupOrchestrator::create_backup`].
pub struct BackupRequest {
    pub secret: Secret,
    pub passphrase: SecretString,
    pub config: ShardConfig,
    /// One per shard; trustee `i` receives shard `i + 1`
    pub trustees: Vec<Trustee>,
    /// Signs and can later read the manifest
    pub owner: Keypair,
    pub cancel: CancellationToken,
}

impl BackupRequest {
    pub fn new(
        secret: Secret,
        passphrase: SecretString,
        config: ShardConfig,
        trustees: Vec<Trustee>,
        owner: Keypair,
    ) -> Self {
        Self {
            secret,
            passphrase,
            config,
            trustees,
            owner,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

#[derive(Debug)]
pub struct BackupOutcome {
    /// Tags this run's deferred entries and pending manifest entries
    pub backup_id: String,
    pub metadata: BackupMetadata,
    pub manifest_id: String,
    pub published: Vec<PublishedShard>,
    pub deferred: Vec<DeferredShard>,
}

/// A failed backup, with whatever already left the machine.
#[derive(Debug, thiserror::Error)]
#[error("backup aborted: {cause}")]
pub struct BackupAbort {
    #[source]
    pub cause: KeyshardError,
    pub published: Vec<PublishedShard>,
    pub deferred: Vec<DeferredShard>,
}

impl BackupAbort {
    pub fn code(&self) -> &'static str {
        self.cause.code()
    }

    /// Whether anything reached a relay or the deferred queue.
    pub fn is_partial(&self) -> bool {
        !self.published.is_empty() || !self.deferred.is_empty()
    }
}

impl From<KeyshardError> for BackupAbort {
    fn from(cause: KeyshardError) -> Self {
        Self {
            cause,
            published: Vec::new(),
            deferred: Vec::new(),
        }
    }
}

struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Per-run bookkeeping: step counter and what has gone out so far.
struct Session<'a> {
    progress: &'a watch::Sender<BackupProgress>,
    step: u32,
    total_steps: u32,
    published: Vec<PublishedShard>,
    deferred: Vec<DeferredShard>,
}

impl Session<'_> {
    fn advance(&mut self, status: BackupStatus, message: String) {
        self.step += 1;
        self.progress.send_replace(BackupProgress {
            status,
            current_step: self.step,
            total_steps: self.total_steps,
            message,
            error: None,
        });
    }

    fn abort(&mut self, cause: KeyshardError) -> BackupAbort {
        warn!(
            code = cause.code(),
            published = self.published.len(),
            deferred = self.deferred.len(),
            "backup aborted: {cause}"
        );
        self.progress.send_replace(BackupProgress {
            status: BackupStatus::Error,
            current_step: self.step,
            total_steps: self.total_steps,
            message: cause.to_string(),
            error: Some(cause.code().to_string()),
        });
        BackupAbort {
            cause,
            published: std::mem::take(&mut self.published),
            deferred: std::mem::take(&mut self.deferred),
        }
    }

    fn check_cancelled(&mut self, cancel: &CancellationToken) -> Result<(), BackupAbort> {
        if cancel.is_cancelled() {
            return Err(self.abort(KeyshardError::Cancelled));
        }
        Ok(())
    }
}

pub struct BackupOrchestrator {
    distributor: Distributor,
    metadata: MetadataService,
    kdf: KdfParams,
    in_flight: AtomicBool,
    progress: watch::Sender<BackupProgress>,
}

impl BackupOrchestrator {
    pub fn new(
        transport: Arc<dyn Transport>,
        queue: Arc<dyn DeferredQueue>,
        config: &KeyshardConfig,
    ) -> Self {
        let distributor = Distributor::new(
            transport.clone(),
            queue,
            DistributionSettings::from_config(config),
        );
        let metadata = MetadataService::from_config(transport, config);
        let (progress, _) = watch::channel(BackupProgress::default());
        Self {
            distributor,
            metadata,
            kdf: KdfParams::default(),
            in_flight: AtomicBool::new(false),
            progress,
        }
    }

    /// Override the passphrase KDF work factor. Recovery must use the same value.
    pub fn with_kdf_params(mut self, kdf: KdfParams) -> Self {
        self.kdf = kdf;
        self
    }

    /// Progress of the current (or last) run.
    pub fn progress(&self) -> watch::Receiver<BackupProgress> {
        self.progress.subscribe()
    }

    pub fn metadata_service(&self) -> &MetadataService {
        &self.metadata
    }

    pub fn distributor(&self) -> &Distributor {
        &self.distributor
    }

    fn acquire(&self) -> KeyshardResult<InFlight<'_>> {
        self.in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| KeyshardError::BackupInProgress)?;
        Ok(InFlight(&self.in_flight))
    }

    fn validate(
        &self,
        config: &ShardConfig,
        trustees: &[Trustee],
        passphrase: &SecretString,
    ) -> KeyshardResult<()> {
        let expected = usize::from(config.total_shards());
        let immediate = (0..expected)
            .filter(|&position| self.distributor.publishes_immediately(position))
            .count();
        if immediate < usize::from(config.threshold()) {
            let settings = self.distributor.settings();
            return Err(KeyshardError::Config(format!(
                "only {immediate} of {expected} shards fall inside the {}s publish window \
                 (increment {}s), below threshold {}",
                settings.max_publish_offset_secs,
                settings.offset_increment_secs,
                config.threshold()
            )));
        }
        if trustees.len() != expected {
            return Err(KeyshardError::TrusteeMismatch {
                expected,
                actual: trustees.len(),
            });
        }
        let mut seen = HashSet::with_capacity(trustees.len());
        for trustee in trustees {
            let key = PublicKey::from_hex(&trustee.pubkey)?;
            if !seen.insert(key.to_bytes()) {
                return Err(KeyshardError::DuplicateTrustee(trustee.pubkey.clone()));
            }
        }
        validate_strength(passphrase.expose_secret()).into_result()
    }

    /// Run a full backup.
    pub async fn create_backup(
        &self,
        request: BackupRequest,
    ) -> Result<BackupOutcome, BackupAbort> {
        let _guard = self.acquire()?;
        let BackupRequest {
            secret,
            passphrase,
            config,
            trustees,
            owner,
            cancel,
        } = request;

        let n = u32::from(config.total_shards());
        let mut session = Session {
            progress: &self.progress,
            step: 0,
            total_steps: 1 + n + n + 1,
            published: Vec::new(),
            deferred: Vec::new(),
        };

        self.validate(&config, &trustees, &passphrase)
            .map_err(|e| session.abort(e))?;
        info!(
            threshold = config.threshold(),
            total_shards = config.total_shards(),
            "starting backup"
        );

        session.advance(BackupStatus::CreatingShards, "Splitting secret".into());
        let raw_shards = split_with(secret.as_bytes(), &config).map_err(|e| session.abort(e))?;
        drop(secret);

        let passphrase = Arc::new(passphrase);
        let mut sealed: Vec<EncryptedShard> = Vec::with_capacity(raw_shards.len());
        for raw in raw_shards {
            session.check_cancelled(&cancel)?;
            session.advance(
                BackupStatus::CreatingShards,
                format!("Encrypting shard {} of {n}", raw.index),
            );
            let passphrase = Arc::clone(&passphrase);
            let kdf = self.kdf;
            let shard =
                tokio::task::spawn_blocking(move || seal_shard(&raw, &config, &passphrase, &kdf))
                    .await
                    .map_err(|e| {
                        KeyshardError::Other(anyhow::anyhow!("shard encryption task: {e}"))
                    })
                    .and_then(|sealed| sealed)
                    .map_err(|e| session.abort(e))?;
            sealed.push(shard);
        }
        drop(passphrase);

        let run = DistributionRun::new(keyshard_transport::now());
        for (position, (shard, trustee)) in sealed.iter().zip(&trustees).enumerate() {
            session.check_cancelled(&cancel)?;
            session.advance(
                BackupStatus::Publishing,
                format!("Distributing shard {} of {n}", shard.index),
            );
            let outcome = self
                .distributor
                .distribute_one(shard, trustee, position, &run)
                .await
                .map_err(|e| session.abort(e))?;
            match outcome {
                DistributionOutcome::Published(p) => session.published.push(p),
                DistributionOutcome::Deferred(d) => session.deferred.push(d),
            }
        }

        session.check_cancelled(&cancel)?;
        session.advance(BackupStatus::Publishing, "Publishing backup manifest".into());
        let mut metadata =
            metadata::build_with_pending(&session.published, &session.deferred, &config)
                .map_err(|e| session.abort(e))?;
        let manifest_id = self
            .metadata
            .publish_superseding(&mut metadata, &owner)
            .await
            .map_err(|e| session.abort(e))?;

        self.progress.send_replace(BackupProgress {
            status: BackupStatus::Complete,
            current_step: session.total_steps,
            total_steps: session.total_steps,
            message: "Backup complete".into(),
            error: None,
        });
        info!(
            manifest_id = %manifest_id,
            published = session.published.len(),
            deferred = session.deferred.len(),
            "backup complete"
        );

        Ok(BackupOutcome {
            backup_id: run.backup_id,
            metadata,
            manifest_id,
            published: session.published,
            deferred: session.deferred,
        })
    }

    /// Build and publish the manifest for shards that already went out.
    pub async fn resume_metadata(
        &self,
        published: &[PublishedShard],
        deferred: &[DeferredShard],
        config: &ShardConfig,
        owner: &Keypair,
    ) -> KeyshardResult<(BackupMetadata, String)> {
        let _guard = self.acquire()?;
        let mut metadata = metadata::build_with_pending(published, deferred, config)?;
        let id = self.metadata.publish_superseding(&mut metadata, owner).await?;
        info!(manifest_id = %id, "manifest published on resume");
        Ok((metadata, id))
    }

    /// Publish deferred shards of every run that are now due.
    ///
    /// No manifest is updated; prefer [`finalize_deferred`](Self::finalize_deferred).
    pub async fn drain_deferred(&self, now: u64) -> KeyshardResult<DrainReport> {
        let _guard = self.acquire()?;
        self.distributor.drain_deferred(now).await
    }

    /// Publish `previous`'s due pending shards and, if any went out, a
    /// superseding manifest. Queued shards of other runs are left alone.
    pub async fn finalize_deferred(
        &self,
        owner: &Keypair,
        previous: &BackupMetadata,
    ) -> KeyshardResult<Option<(BackupMetadata, String)>> {
        self.finalize_deferred_at(owner, previous, keyshard_transport::now())
            .await
    }

    /// [`finalize_deferred`](Self::finalize_deferred) with an explicit clock.
    pub async fn finalize_deferred_at(
        &self,
        owner: &Keypair,
        previous: &BackupMetadata,
        now: u64,
    ) -> KeyshardResult<Option<(BackupMetadata, String)>> {
        let _guard = self.acquire()?;
        if previous.pending_shards.is_empty() {
            return Ok(None);
        }

        let mut backup_ids: Vec<&str> = previous
            .pending_shards
            .iter()
            .map(|p| p.backup_id.as_str())
            .collect();
        backup_ids.sort_unstable();
        backup_ids.dedup();

        let mut drained = Vec::new();
        let mut queue_error = None;
        for backup_id in backup_ids {
            let report = self.distributor.drain_backup(backup_id, now).await?;
            drained.extend(report.published);
            if report.queue_error.is_some() {
                queue_error = report.queue_error;
                break;
            }
        }

        let mut next = metadata::supersede(previous, &drained);
        if next.pending_shards.len() == previous.pending_shards.len() {
            return match queue_error {
                Some(e) => Err(e),
                None => Ok(None),
            };
        }

        let id = self.metadata.publish_superseding(&mut next, owner).await?;
        info!(
            manifest_id = %id,
            still_pending = next.pending_shards.len(),
            "superseding manifest published"
        );
        if let Some(e) = queue_error {
            return Err(e);
        }
        Ok(Some((next, id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deferred::MemoryDeferredQueue;
    use keyshard_transport::MemoryTransport;

    const PASSPHRASE: &str = "Tr0ub4dor&3xtra!";

    fn orchestrator() -> (Arc<MemoryTransport>, BackupOrchestrator) {
        let transport = Arc::new(MemoryTransport::new());
        let orch = BackupOrchestrator::new(
            transport.clone(),
            Arc::new(MemoryDeferredQueue::new()),
            &KeyshardConfig::default(),
        )
        .with_kdf_params(KdfParams { iterations: 1_000 });
        (transport, orch)
    }

    fn request(trustees: Vec<Trustee>, passphrase: &str) -> BackupRequest {
        BackupRequest::new(
            Secret::new(vec![7u8; 32]),
            SecretString::from(passphrase),
            ShardConfig::new(2, 3).unwrap(),
            trustees,
            Keypair::try_generate().unwrap(),
        )
    }

    fn trustees(n: usize) -> Vec<Trustee> {
        (0..n)
            .map(|_| Trustee::new(Keypair::try_generate().unwrap().public().to_hex()))
            .collect()
    }

    #[tokio::test]
    async fn test_trustee_count_checked_before_crypto() {
        let (transport, orch) = orchestrator();
        let abort = orch.create_backup(request(trustees(2), PASSPHRASE)).await.unwrap_err();
        assert!(matches!(
            abort.cause,
            KeyshardError::TrusteeMismatch {
                expected: 3,
                actual: 2
            }
        ));
        assert!(!abort.is_partial());
        assert_eq!(transport.publish_attempts(), 0);
        assert_eq!(orch.progress().borrow().status, BackupStatus::Error);
    }

    #[tokio::test]
    async fn test_duplicate_trustee_rejected() {
        let (_transport, orch) = orchestrator();
        let mut list = trustees(2);
        list.push(list[0].clone());
        let abort = orch.create_backup(request(list, PASSPHRASE)).await.unwrap_err();
        assert_eq!(abort.code(), "DUPLICATE_TRUSTEE");
    }

    #[tokio::test]
    async fn test_invalid_trustee_key_rejected() {
        let (_transport, orch) = orchestrator();
        let mut list = trustees(2);
        list.push(Trustee::new("zz"));
        let abort = orch.create_backup(request(list, PASSPHRASE)).await.unwrap_err();
        assert_eq!(abort.code(), "INVALID_KEY");
    }

    #[tokio::test]
    async fn test_weak_passphrase_rejected() {
        let (transport, orch) = orchestrator();
        let abort = orch.create_backup(request(trustees(3), "short")).await.unwrap_err();
        let KeyshardError::WeakPassphrase(rules) = &abort.cause else {
            panic!("expected weak passphrase, got {:?}", abort.cause);
        };
        assert!(!rules.is_empty());
        assert_eq!(transport.publish_attempts(), 0);
    }

    #[tokio::test]
    async fn test_progress_reaches_complete() {
        let (_transport, orch) = orchestrator();
        let progress = orch.progress();
        let outcome = orch.create_backup(request(trustees(3), PASSPHRASE)).await.unwrap();

        assert_eq!(outcome.published.len(), 3);
        assert!(outcome.deferred.is_empty());
        let last = progress.borrow().clone();
        assert_eq!(last.status, BackupStatus::Complete);
        assert_eq!(last.total_steps, 8);
        assert_eq!(last.current_step, 8);
    }

    #[tokio::test]
    async fn test_second_session_refused_while_running() {
        let (_transport, orch) = orchestrator();
        let _guard = orch.acquire().unwrap();
        let abort = orch.create_backup(request(trustees(3), PASSPHRASE)).await.unwrap_err();
        assert!(matches!(abort.cause, KeyshardError::BackupInProgress));
    }

    #[tokio::test]
    async fn test_guard_released_after_failure() {
        let (_transport, orch) = orchestrator();
        assert!(orch.create_backup(request(trustees(2), PASSPHRASE)).await.is_err());
        assert!(orch.create_backup(request(trustees(3), PASSPHRASE)).await.is_ok());
    }

    #[tokio::test]
    async fn test_cancel_before_start_publishes_nothing() {
        let (transport, orch) = orchestrator();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let abort = orch
            .create_backup(request(trustees(3), PASSPHRASE).with_cancellation(cancel))
            .await
            .unwrap_err();
        assert!(matches!(abort.cause, KeyshardError::Cancelled));
        assert_eq!(transport.publish_attempts(), 0);
    }

    #[tokio::test]
    async fn test_unreachable_threshold_rejected_before_crypto() {
        let transport = Arc::new(MemoryTransport::new());
        let queue = Arc::new(MemoryDeferredQueue::new());
        let mut config = KeyshardConfig::default();
        // Offsets 0, 7, 21 days fit in 30; the other seven would be deferred.
        config.distribution.offset_increment_days = 7;
        let orch = BackupOrchestrator::new(transport.clone(), queue.clone(), &config)
            .with_kdf_params(KdfParams { iterations: 1_000 });

        let mut req = request(trustees(10), PASSPHRASE);
        req.config = ShardConfig::new(5, 10).unwrap();
        let abort = orch.create_backup(req).await.unwrap_err();
        assert_eq!(abort.code(), "CONFIG");
        assert!(abort.cause.to_string().contains("only 3 of 10"));
        assert!(!abort.is_partial());
        assert_eq!(transport.publish_attempts(), 0);
        assert!(queue.is_empty().unwrap());

        // 3-of-10 fits the same window.
        let mut req = request(trustees(10), PASSPHRASE);
        req.config = ShardConfig::new(3, 10).unwrap();
        let outcome = orch.create_backup(req).await.unwrap();
        assert_eq!(outcome.published.len(), 3);
        assert_eq!(outcome.deferred.len(), 7);
    }

    #[tokio::test]
    async fn test_back_to_back_backups_newest_manifest_wins() {
        let (_transport, orch) = orchestrator();
        let owner = Keypair::try_generate().unwrap();

        let mut first = request(trustees(3), PASSPHRASE);
        first.owner = owner.clone();
        let first = orch.create_backup(first).await.unwrap();

        let mut second = request(trustees(3), PASSPHRASE);
        second.owner = owner.clone();
        second.config = ShardConfig::new(3, 3).unwrap();
        let second = orch.create_backup(second).await.unwrap();

        assert!(second.metadata.created_at > first.metadata.created_at);
        assert_ne!(first.backup_id, second.backup_id);
        let latest = orch.metadata_service().fetch(&owner).await.unwrap();
        assert_eq!(latest, Some(second.metadata));
    }
}
