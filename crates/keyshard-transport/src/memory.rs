//! In-process relays with fault injection, for tests and dry runs.

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::debug;

use crate::{merge_unique, PublishReceipt, SignedMessage, Transport};

#[derive(Default)]
struct State {
    /// relay → (id → message)
    relays: HashMap<String, BTreeMap<String, SignedMessage>>,
    offline: HashSet<String>,
    rejecting: HashSet<String>,
    rejected_kinds: HashSet<u32>,
    publish_delay: Duration,
    fetch_delay: Duration,
    publish_attempts: usize,
}

/// Relays held in memory.
///
/// A relay comes into existence the first time something is published to
/// it. Offline relays refuse publishes and fail fetches; rejecting relays
/// refuse publishes but still answer fetches.
#[derive(Default)]
pub struct MemoryTransport {
    state: Mutex<State>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_offline(&self, relay: &str, offline: bool) {
        let mut state = self.lock();
        if offline {
            state.offline.insert(relay.to_string());
        } else {
            state.offline.remove(relay);
        }
    }

    pub fn set_rejecting(&self, relay: &str, rejecting: bool) {
        let mut state = self.lock();
        if rejecting {
            state.rejecting.insert(relay.to_string());
        } else {
            state.rejecting.remove(relay);
        }
    }

    /// Refuse every message of `kind` on every relay.
    pub fn reject_kind(&self, kind: u32) {
        self.lock().rejected_kinds.insert(kind);
    }

    pub fn accept_kind(&self, kind: u32) {
        self.lock().rejected_kinds.remove(&kind);
    }

    /// Delay applied before every publish.
    pub fn set_publish_delay(&self, delay: Duration) {
        self.lock().publish_delay = delay;
    }

    /// Delay applied before every fetch.
    pub fn set_fetch_delay(&self, delay: Duration) {
        self.lock().fetch_delay = delay;
    }

    /// Messages stored on one relay, ordered by id.
    pub fn messages(&self, relay: &str) -> Vec<SignedMessage> {
        self.lock()
            .relays
            .get(relay)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Every distinct message across all relays.
    pub fn all_messages(&self) -> Vec<SignedMessage> {
        let state = self.lock();
        let mut out = Vec::new();
        for stored in state.relays.values() {
            merge_unique(&mut out, stored.values().cloned());
        }
        out
    }

    /// Simulate a relay losing a message.
    pub fn drop_message(&self, relay: &str, id: &str) -> bool {
        self.lock()
            .relays
            .get_mut(relay)
            .and_then(|m| m.remove(id))
            .is_some()
    }

    /// Number of `publish` calls made, successful or not.
    pub fn publish_attempts(&self) -> usize {
        self.lock().publish_attempts
    }

    fn query(
        &self,
        relays: &[String],
        matches: impl Fn(&SignedMessage) -> bool,
    ) -> Result<Vec<SignedMessage>> {
        if relays.is_empty() {
            bail!("no relays to query");
        }
        let state = self.lock();
        let mut out = Vec::new();
        let mut answered = 0usize;
        for relay in relays {
            if state.offline.contains(relay) {
                debug!(relay = %relay, "relay offline, skipping");
                continue;
            }
            answered += 1;
            if let Some(stored) = state.relays.get(relay) {
                merge_unique(&mut out, stored.values().filter(|m| matches(*m)).cloned());
            }
        }
        if answered == 0 {
            bail!("all {} relay(s) unreachable", relays.len());
        }
        Ok(out)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn publish(&self, message: &SignedMessage, relays: &[String]) -> Result<PublishReceipt> {
        let delay = {
            let mut state = self.lock();
            state.publish_attempts += 1;
            state.publish_delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if relays.is_empty() {
            bail!("no relays to publish to");
        }
        if let Err(e) = message.verify() {
            bail!("message {} rejected: {e}", message.id);
        }

        let mut state = self.lock();
        let mut accepted = Vec::new();
        let mut rejected = Vec::new();
        for relay in relays {
            let refusal = if state.offline.contains(relay) {
                Some("offline".to_string())
            } else if state.rejecting.contains(relay) {
                Some("rejected by relay".to_string())
            } else if state.rejected_kinds.contains(&message.kind) {
                Some(format!("kind {} not accepted", message.kind))
            } else {
                None
            };

            match refusal {
                Some(reason) => {
                    debug!(relay = %relay, event_id = %message.id, %reason, "publish refused");
                    rejected.push((relay.clone(), reason));
                }
                None => {
                    state
                        .relays
                        .entry(relay.clone())
                        .or_default()
                        .insert(message.id.clone(), message.clone());
                    accepted.push(relay.clone());
                }
            }
        }

        if accepted.is_empty() {
            let reasons: Vec<String> = rejected.iter().map(|(r, why)| format!("{r}: {why}")).collect();
            bail!("no relay accepted message {}: {}", message.id, reasons.join(", "));
        }
        Ok(PublishReceipt {
            id: message.id.clone(),
            accepted,
            rejected,
        })
    }

    async fn fetch_by_ids(&self, ids: &[String], relays: &[String]) -> Result<Vec<SignedMessage>> {
        let delay = self.lock().fetch_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.query(relays, |m| ids.contains(&m.id))
    }

    async fn fetch_by_author_and_tag(
        &self,
        author: &str,
        tag_key: &str,
        tag_value: &str,
        relays: &[String],
    ) -> Result<Vec<SignedMessage>> {
        let delay = self.lock().fetch_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.query(relays, |m| m.pubkey == author && m.has_tag(tag_key, tag_value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{metadata_tag, METADATA_KIND, SHARD_KIND};
    use keyshard_crypto::Keypair;

    fn relays() -> Vec<String> {
        vec!["relay-a".into(), "relay-b".into()]
    }

    fn msg(author: &Keypair, kind: u32) -> SignedMessage {
        SignedMessage::sign(author, kind, 10, vec![metadata_tag()], "x".into()).unwrap()
    }

    #[tokio::test]
    async fn test_publish_and_fetch() {
        let transport = MemoryTransport::new();
        let author = Keypair::try_generate().unwrap();
        let m = msg(&author, SHARD_KIND);

        let receipt = transport.publish(&m, &relays()).await.unwrap();
        assert_eq!(receipt.id, m.id);
        assert_eq!(receipt.accepted, relays());

        let found = transport
            .fetch_by_ids(&[m.id.clone()], &relays())
            .await
            .unwrap();
        assert_eq!(found, vec![m]);
    }

    #[tokio::test]
    async fn test_partial_relay_failure() {
        let transport = MemoryTransport::new();
        transport.set_offline("relay-a", true);
        let author = Keypair::try_generate().unwrap();
        let m = msg(&author, SHARD_KIND);

        let receipt = transport.publish(&m, &relays()).await.unwrap();
        assert_eq!(receipt.accepted, vec!["relay-b".to_string()]);
        assert_eq!(receipt.rejected.len(), 1);

        transport.set_offline("relay-b", true);
        assert!(transport.publish(&m, &relays()).await.is_err());
        assert!(transport.fetch_by_ids(&[m.id], &relays()).await.is_err());
    }

    #[tokio::test]
    async fn test_reject_kind() {
        let transport = MemoryTransport::new();
        transport.reject_kind(METADATA_KIND);
        let author = Keypair::try_generate().unwrap();

        assert!(transport.publish(&msg(&author, METADATA_KIND), &relays()).await.is_err());
        assert!(transport.publish(&msg(&author, SHARD_KIND), &relays()).await.is_ok());
        assert_eq!(transport.publish_attempts(), 2);
    }

    #[tokio::test]
    async fn test_unsigned_message_refused() {
        let transport = MemoryTransport::new();
        let author = Keypair::try_generate().unwrap();
        let mut m = msg(&author, SHARD_KIND);
        m.content = "tampered".into();
        assert!(transport.publish(&m, &relays()).await.is_err());
        assert!(transport.all_messages().is_empty());
    }

    #[tokio::test]
    async fn test_fetch_by_author_and_tag() {
        let transport = MemoryTransport::new();
        let alice = Keypair::try_generate().unwrap();
        let bob = Keypair::try_generate().unwrap();
        transport.publish(&msg(&alice, METADATA_KIND), &relays()).await.unwrap();
        transport.publish(&msg(&bob, METADATA_KIND), &relays()).await.unwrap();

        let found = transport
            .fetch_by_author_and_tag(&alice.public().to_hex(), "d", crate::METADATA_TAG, &relays())
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].pubkey, alice.public().to_hex());
    }

    #[tokio::test]
    async fn test_drop_message() {
        let transport = MemoryTransport::new();
        let author = Keypair::try_generate().unwrap();
        let m = msg(&author, SHARD_KIND);
        transport.publish(&m, &relays()).await.unwrap();

        assert!(transport.drop_message("relay-a", &m.id));
        assert!(transport.messages("relay-a").is_empty());
        assert_eq!(transport.messages("relay-b").len(), 1);
    }
}
