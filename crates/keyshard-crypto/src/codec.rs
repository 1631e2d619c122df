//! Shard payload codec
//!
//! Binary layout (v1, big-endian), sealed inside the passphrase ciphertext:
//! ```text
//! [4 bytes: "KSHD"][1: version = 1][1: index][1: threshold][1: total]
//! [2 bytes: data length][N bytes: shard data]
//! ```
//!
//! The outer `EncryptedShard` repeats index/threshold/total in the clear.
//! After decryption the embedded copy must match the outer one exactly, so a
//! relabelled shard (e.g. someone edits `threshold` in the JSON) is rejected
//! instead of being interpolated.

use keyshard_core::{EncryptedShard, KeyshardError, KeyshardResult, ShardConfig};
use secrecy::SecretString;
use zeroize::Zeroizing;

use crate::passphrase::{self, KdfParams};
use crate::split::RawShard;

pub const CODEC_MAGIC: &[u8; 4] = b"KSHD";
pub const CODEC_VERSION: u8 = 1;
pub const HEADER_LEN: usize = 4 + 1 + 3 + 2;

/// Quorum fields as carried by the outer `EncryptedShard`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardHeader {
    pub index: u8,
    pub threshold: u8,
    pub total_shards: u8,
}

impl From<&EncryptedShard> for ShardHeader {
    fn from(shard: &EncryptedShard) -> Self {
        Self {
            index: shard.index,
            threshold: shard.threshold,
            total_shards: shard.total_shards,
        }
    }
}

/// Encode a raw shard and its quorum into the v1 payload.
pub fn encode(raw: &RawShard, config: &ShardConfig) -> KeyshardResult<Zeroizing<Vec<u8>>> {
    if raw.index == 0 || raw.index > config.total_shards() {
        return Err(KeyshardError::InvalidPayload(format!(
            "shard index {} outside 1..={}",
            raw.index,
            config.total_shards()
        )));
    }
    let len = u16::try_from(raw.data.len()).map_err(|_| {
        KeyshardError::InvalidPayload(format!("shard data too large: {} bytes", raw.data.len()))
    })?;

    let mut out = Zeroizing::new(Vec::with_capacity(HEADER_LEN + raw.data.len()));
    out.extend_from_slice(CODEC_MAGIC);
    out.push(CODEC_VERSION);
    out.push(raw.index);
    out.push(config.threshold());
    out.push(config.total_shards());
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(&raw.data);
    Ok(out)
}

/// Decode a v1 payload, checking it against the outer header.
pub fn decode(payload: &[u8], header: &ShardHeader) -> KeyshardResult<RawShard> {
    if payload.len() < HEADER_LEN {
        return Err(KeyshardError::InvalidPayload(format!(
            "payload too short: {} bytes",
            payload.len()
        )));
    }
    if &payload[..4] != CODEC_MAGIC {
        return Err(KeyshardError::InvalidPayload("bad magic".into()));
    }
    if payload[4] != CODEC_VERSION {
        return Err(KeyshardError::InvalidPayload(format!(
            "unsupported codec version {}",
            payload[4]
        )));
    }

    let embedded = ShardHeader {
        index: payload[5],
        threshold: payload[6],
        total_shards: payload[7],
    };
    if embedded != *header {
        return Err(KeyshardError::InconsistentShards(format!(
            "embedded header {embedded:?} does not match outer header {header:?}"
        )));
    }
    // Re-validate quorum bounds; the header may come from an old or hostile writer.
    ShardConfig::new(embedded.threshold, embedded.total_shards)?;
    if embedded.index == 0 || embedded.index > embedded.total_shards {
        return Err(KeyshardError::InvalidPayload(format!(
            "shard index {} outside 1..={}",
            embedded.index, embedded.total_shards
        )));
    }

    let len = usize::from(u16::from_be_bytes([payload[8], payload[9]]));
    let data = &payload[HEADER_LEN..];
    if data.len() != len {
        return Err(KeyshardError::InvalidPayload(format!(
            "declared {len} data bytes, found {}",
            data.len()
        )));
    }

    Ok(RawShard {
        index: embedded.index,
        data: data.to_vec(),
    })
}

/// Encode a raw shard and encrypt it under the passphrase.
pub fn seal_shard(
    raw: &RawShard,
    config: &ShardConfig,
    passphrase: &SecretString,
    params: &KdfParams,
) -> KeyshardResult<EncryptedShard> {
    let payload = encode(raw, config)?;
    let encrypted_data = passphrase::encrypt(&payload, passphrase, params)?;
    Ok(EncryptedShard {
        index: raw.index,
        encrypted_data,
        total_shards: config.total_shards(),
        threshold: config.threshold(),
    })
}

/// Decrypt an encrypted shard and decode it, rejecting header disagreement.
pub fn open_shard(
    shard: &EncryptedShard,
    passphrase: &SecretString,
    params: &KdfParams,
) -> KeyshardResult<RawShard> {
    let payload = passphrase::decrypt(&shard.encrypted_data, passphrase, params)?;
    decode(&payload, &ShardHeader::from(shard))
}
