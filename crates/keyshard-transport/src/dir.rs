//! Directory-backed relays: `<root>/<relay>.json`, one file per relay.
//!
//! Each file is a JSON object mapping message id → message, rewritten
//! atomically (temp file, then rename) on every accepted publish. Useful
//! for air-gapped handoff: copy the directory to the trustee.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::{merge_unique, PublishReceipt, SignedMessage, Transport};

type RelayFile = BTreeMap<String, SignedMessage>;

pub struct DirTransport {
    root: PathBuf,
    /// Serializes read-modify-write of relay files within this process
    write_lock: Mutex<()>,
}

impl DirTransport {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// File backing `relay`. Names made only of `[A-Za-z0-9._-]` are used
    /// as-is; anything else is hex-encoded behind an `x-` prefix, so
    /// distinct relay URLs never share a file.
    pub fn relay_path(&self, relay: &str) -> PathBuf {
        let plain = !relay.is_empty()
            && relay != "."
            && relay != ".."
            && !relay.starts_with("x-")
            && relay
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
        let name = if plain {
            relay.to_string()
        } else {
            format!("x-{}", hex::encode(relay))
        };
        self.root.join(format!("{name}.json"))
    }

    async fn read_relay(&self, relay: &str) -> Result<RelayFile> {
        let path = self.relay_path(relay);
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => serde_json::from_str(&content)
                .with_context(|| format!("parsing relay file: {}", path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(RelayFile::new()),
            Err(e) => {
                Err(e).with_context(|| format!("reading relay file: {}", path.display()))
            }
        }
    }

    async fn write_relay(&self, relay: &str, stored: &RelayFile) -> Result<()> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("creating relay dir: {}", self.root.display()))?;

        let path = self.relay_path(relay);
        let json = serde_json::to_string_pretty(stored).context("serializing relay file")?;

        let tmp_path = path.with_extension("tmp");
        tokio::fs::write(&tmp_path, &json)
            .await
            .with_context(|| format!("writing relay temp: {}", tmp_path.display()))?;
        tokio::fs::rename(&tmp_path, &path)
            .await
            .with_context(|| format!("renaming relay file: {}", path.display()))?;
        Ok(())
    }

    async fn store(&self, relay: &str, message: &SignedMessage) -> Result<()> {
        let mut stored = self.read_relay(relay).await?;
        stored.insert(message.id.clone(), message.clone());
        self.write_relay(relay, &stored).await
    }

    async fn query<F>(&self, relays: &[String], matches: F) -> Result<Vec<SignedMessage>>
    where
        F: Fn(&SignedMessage) -> bool + Send + Sync,
    {
        if relays.is_empty() {
            bail!("no relays to query");
        }
        let mut out = Vec::new();
        let mut answered = 0usize;
        for relay in relays {
            match self.read_relay(relay).await {
                Ok(stored) => {
                    answered += 1;
                    merge_unique(&mut out, stored.into_values().filter(|m| matches(m)));
                }
                Err(e) => warn!(relay = %relay, "relay unreadable: {e:#}"),
            }
        }
        if answered == 0 {
            bail!("all {} relay(s) unreadable", relays.len());
        }
        Ok(out)
    }
}

#[async_trait]
impl Transport for DirTransport {
    async fn publish(&self, message: &SignedMessage, relays: &[String]) -> Result<PublishReceipt> {
        if relays.is_empty() {
            bail!("no relays to publish to");
        }
        if let Err(e) = message.verify() {
            bail!("message {} rejected: {e}", message.id);
        }

        let _guard = self.write_lock.lock().await;
        let mut accepted = Vec::new();
        let mut rejected = Vec::new();
        for relay in relays {
            match self.store(relay, message).await {
                Ok(()) => {
                    debug!(relay = %relay, event_id = %message.id, "stored");
                    accepted.push(relay.clone());
                }
                Err(e) => {
                    warn!(relay = %relay, event_id = %message.id, "store failed: {e:#}");
                    rejected.push((relay.clone(), format!("{e:#}")));
                }
            }
        }

        if accepted.is_empty() {
            bail!("no relay accepted message {}", message.id);
        }
        Ok(PublishReceipt {
            id: message.id.clone(),
            accepted,
            rejected,
        })
    }

    async fn fetch_by_ids(&self, ids: &[String], relays: &[String]) -> Result<Vec<SignedMessage>> {
        self.query(relays, |m| ids.contains(&m.id)).await
    }

    async fn fetch_by_author_and_tag(
        &self,
        author: &str,
        tag_key: &str,
        tag_value: &str,
        relays: &[String],
    ) -> Result<Vec<SignedMessage>> {
        self.query(relays, |m| m.pubkey == author && m.has_tag(tag_key, tag_value))
            .await
    }
}
