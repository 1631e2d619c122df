//! Signed message envelope.
//!
//! `id` is the hex SHA-256 of the JSON array
//! `[pubkey, createdAt, kind, tags, content]`, and `sig` is the hex Ed25519
//! signature by `pubkey` over the 32 raw id bytes. Relays never see anything
//! but ciphertext in `content`.

use keyshard_core::{KeyshardError, KeyshardResult};
use keyshard_crypto::{Keypair, PublicKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Kind of a message carrying one encrypted shard to one trustee.
pub const SHARD_KIND: u32 = 21_059;

/// Kind of the owner's self-encrypted backup manifest.
pub const METADATA_KIND: u32 = 30_059;

/// Value of the `d` tag every manifest carries.
pub const METADATA_TAG: &str = "keyshard-backup-metadata";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedMessage {
    pub id: String,
    /// Hex public key of the author
    pub pubkey: String,
    /// Unix seconds
    pub created_at: u64,
    pub kind: u32,
    pub tags: Vec<Vec<String>>,
    pub content: String,
    pub sig: String,
}

fn compute_id(
    pubkey: &str,
    created_at: u64,
    kind: u32,
    tags: &[Vec<String>],
    content: &str,
) -> KeyshardResult<[u8; 32]> {
    let canonical = serde_json::to_string(&(pubkey, created_at, kind, tags, content))
        .map_err(|e| KeyshardError::InvalidPayload(format!("serializing message: {e}")))?;
    Ok(Sha256::digest(canonical.as_bytes()).into())
}

impl SignedMessage {
    /// Build and sign a message authored by `author`.
    pub fn sign(
        author: &Keypair,
        kind: u32,
        created_at: u64,
        tags: Vec<Vec<String>>,
        content: String,
    ) -> KeyshardResult<Self> {
        let pubkey = author.public().to_hex();
        let id = compute_id(&pubkey, created_at, kind, &tags, &content)?;
        let sig = author.sign(&id);
        Ok(Self {
            id: hex::encode(id),
            pubkey,
            created_at,
            kind,
            tags,
            content,
            sig: hex::encode(sig),
        })
    }

    /// Check that the id commits to the content and the signature to the id.
    pub fn verify(&self) -> KeyshardResult<()> {
        let expected = compute_id(
            &self.pubkey,
            self.created_at,
            self.kind,
            &self.tags,
            &self.content,
        )?;
        if hex::encode(expected) != self.id {
            return Err(KeyshardError::InvalidPayload(format!(
                "message {} id does not match its content",
                self.id
            )));
        }
        let sig = hex::decode(&self.sig)
            .map_err(|e| KeyshardError::InvalidKey(format!("signature is not hex: {e}")))?;
        self.author()?.verify(&expected, &sig)
    }

    pub fn author(&self) -> KeyshardResult<PublicKey> {
        PublicKey::from_hex(&self.pubkey)
    }

    /// First value of the first tag named `key`.
    pub fn tag_value(&self, key: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|t| t.first().map(String::as_str) == Some(key))
            .and_then(|t| t.get(1))
            .map(String::as_str)
    }

    pub fn has_tag(&self, key: &str, value: &str) -> bool {
        self.tags.iter().any(|t| {
            t.first().map(String::as_str) == Some(key) && t.get(1).map(String::as_str) == Some(value)
        })
    }

    pub fn to_bytes(&self) -> anyhow::Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| anyhow::anyhow!("serializing SignedMessage: {e}"))
    }

    pub fn from_bytes(data: &[u8]) -> anyhow::Result<Self> {
        serde_json::from_slice(data).map_err(|e| anyhow::anyhow!("deserializing SignedMessage: {e}"))
    }
}

/// `["p", <pubkey>]`: addresses a message to a recipient.
pub fn recipient_tag(pubkey: &str) -> Vec<String> {
    vec!["p".into(), pubkey.into()]
}

/// `["d", "keyshard-backup-metadata"]`: marks a manifest.
pub fn metadata_tag() -> Vec<String> {
    vec!["d".into(), METADATA_TAG.into()]
}
