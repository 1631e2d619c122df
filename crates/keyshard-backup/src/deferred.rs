//! Deferred shard queue: shards whose scheduled publication is too far out
//! are stored locally and published later by `drain_deferred`.
//!
//! Two backends implement [`DeferredQueue`]:
//!   - **JSON** ([`JsonDeferredQueue`]): write-through to a single file,
//!     replaced atomically via temp+rename on every change.
//!   - **Memory** ([`MemoryDeferredQueue`]): for tests and one-shot runs.
//!
//! Entries hold only passphrase-encrypted shards, never raw shard data.

use anyhow::{Context, Result};
use keyshard_core::{EncryptedShard, PendingShard};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// A shard waiting for its publication time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeferredShard {
    /// Run that produced the shard; only that run's manifest may record it
    #[serde(default)]
    pub backup_id: String,
    pub encrypted_shard: EncryptedShard,
    /// Hex public key of the trustee
    pub recipient_pubkey: String,
    pub relays: Vec<String>,
    /// Unix seconds when the entry was queued
    pub stored_at: u64,
    /// Unix seconds the message will be stamped with
    pub publish_at: u64,
}

impl DeferredShard {
    pub fn shard_index(&self) -> u8 {
        self.encrypted_shard.index
    }

    /// The manifest's view of this entry.
    pub fn pending(&self) -> PendingShard {
        PendingShard {
            backup_id: self.backup_id.clone(),
            recipient_pubkey: self.recipient_pubkey.clone(),
            shard_index: self.encrypted_shard.index,
            publish_at: self.publish_at,
        }
    }
}

/// Storage for deferred shards, shared between a backup run and later drains.
pub trait DeferredQueue: Send + Sync {
    /// Durably store one entry.
    fn push(&self, shard: DeferredShard) -> Result<()>;
    /// Snapshot of all entries in insertion order.
    fn list(&self) -> Result<Vec<DeferredShard>>;
    /// Remove an entry equal to `shard`; returns whether one was found.
    fn remove(&self, shard: &DeferredShard) -> Result<bool>;
    fn len(&self) -> Result<usize> {
        Ok(self.list()?.len())
    }
    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Queue persisted to a JSON file.
pub struct JsonDeferredQueue {
    path: PathBuf,
    entries: Mutex<Vec<DeferredShard>>,
}

impl JsonDeferredQueue {
    /// Load or create a queue at the given path.
    /// If the file doesn't exist, starts empty and creates it on first push.
    pub fn open(path: &Path) -> Result<Self> {
        let entries = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("reading deferred queue: {}", path.display()))?;
            serde_json::from_str(&content)
                .with_context(|| format!("parsing deferred queue: {}", path.display()))?
        } else {
            Vec::new()
        };

        Ok(Self {
            path: path.to_path_buf(),
            entries: Mutex::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, entries: &[DeferredShard]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating queue dir: {}", parent.display()))?;
        }

        let json = serde_json::to_string_pretty(entries).context("serializing deferred queue")?;

        let tmp_path = self.path.with_extension("tmp");
        std::fs::write(&tmp_path, &json)
            .with_context(|| format!("writing deferred queue temp: {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, &self.path)
            .with_context(|| format!("renaming deferred queue: {}", self.path.display()))?;
        Ok(())
    }
}

impl DeferredQueue for JsonDeferredQueue {
    fn push(&self, shard: DeferredShard) -> Result<()> {
        let mut entries = lock(&self.entries);
        entries.push(shard);
        if let Err(e) = self.persist(&entries) {
            // Keep memory and disk in agreement.
            entries.pop();
            return Err(e);
        }
        Ok(())
    }

    fn list(&self) -> Result<Vec<DeferredShard>> {
        Ok(lock(&self.entries).clone())
    }

    fn remove(&self, shard: &DeferredShard) -> Result<bool> {
        let mut entries = lock(&self.entries);
        let Some(pos) = entries.iter().position(|e| e == shard) else {
            return Ok(false);
        };
        let removed = entries.remove(pos);
        if let Err(e) = self.persist(&entries) {
            entries.insert(pos, removed);
            return Err(e);
        }
        Ok(true)
    }
}

/// Queue held in memory only.
#[derive(Default)]
pub struct MemoryDeferredQueue {
    entries: Mutex<Vec<DeferredShard>>,
}

impl MemoryDeferredQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DeferredQueue for MemoryDeferredQueue {
    fn push(&self, shard: DeferredShard) -> Result<()> {
        lock(&self.entries).push(shard);
        Ok(())
    }

    fn list(&self) -> Result<Vec<DeferredShard>> {
        Ok(lock(&self.entries).clone())
    }

    fn remove(&self, shard: &DeferredShard) -> Result<bool> {
        let mut entries = lock(&self.entries);
        match entries.iter().position(|e| e == shard) {
            Some(pos) => {
                entries.remove(pos);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(index: u8, publish_at: u64) -> DeferredShard {
        DeferredShard {
            backup_id: "run-1".into(),
            encrypted_shard: EncryptedShard {
                index,
                encrypted_data: "c2VhbGVk".into(),
                total_shards: 10,
                threshold: 3,
            },
            recipient_pubkey: format!("{index:02x}").repeat(32),
            relays: vec!["relay-a".into()],
            stored_at: 1_000,
            publish_at,
        }
    }

    #[test]
    fn test_json_queue_persists() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("state").join("deferred.json");

        let queue = JsonDeferredQueue::open(&path).unwrap();
        assert!(queue.is_empty().unwrap());
        queue.push(entry(9, 5_000)).unwrap();
        queue.push(entry(10, 6_000)).unwrap();
        assert!(path.exists());
        assert!(!path.with_extension("tmp").exists());

        let reopened = JsonDeferredQueue::open(&path).unwrap();
        let entries = reopened.list().unwrap();
        assert_eq!(entries, vec![entry(9, 5_000), entry(10, 6_000)]);
    }

    #[test]
    fn test_json_queue_remove() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("deferred.json");
        let queue = JsonDeferredQueue::open(&path).unwrap();
        queue.push(entry(9, 5_000)).unwrap();
        queue.push(entry(10, 6_000)).unwrap();

        assert!(queue.remove(&entry(9, 5_000)).unwrap());
        assert!(!queue.remove(&entry(9, 5_000)).unwrap());

        let reopened = JsonDeferredQueue::open(&path).unwrap();
        assert_eq!(reopened.len().unwrap(), 1);
        assert_eq!(reopened.list().unwrap()[0].shard_index(), 10);
    }

    #[test]
    fn test_json_queue_rejects_corrupt_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("deferred.json");
        std::fs::write(&path, "{ not a list").unwrap();
        assert!(JsonDeferredQueue::open(&path).is_err());
    }

    #[test]
    fn test_wire_format() {
        let json = serde_json::to_string(&entry(9, 5_000)).unwrap();
        assert!(json.contains("\"encryptedShard\""));
        assert!(json.contains("\"recipientPubkey\""));
        assert!(json.contains("\"publishAt\":5000"));
        assert!(json.contains("\"backupId\":\"run-1\""));

        // Entries queued before runs were tagged load with an empty id.
        let legacy = json.replace("\"backupId\":\"run-1\",", "");
        let parsed: DeferredShard = serde_json::from_str(&legacy).unwrap();
        assert!(parsed.backup_id.is_empty());
    }

    #[test]
    fn test_pending_view() {
        let pending = entry(9, 5_000).pending();
        assert_eq!(pending.shard_index, 9);
        assert_eq!(pending.publish_at, 5_000);
        assert_eq!(pending.backup_id, "run-1");
    }

    #[test]
    fn test_memory_queue() {
        let queue = MemoryDeferredQueue::new();
        queue.push(entry(4, 1)).unwrap();
        assert_eq!(queue.len().unwrap(), 1);
        assert!(queue.remove(&entry(4, 1)).unwrap());
        assert!(queue.is_empty().unwrap());
    }
}
