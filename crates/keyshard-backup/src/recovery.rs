//! Recovery: trustees open their shard messages; the owner joins the shards.

use keyshard_core::{BackupMetadata, EncryptedShard, KeyshardError, KeyshardResult, ShardConfig};
use keyshard_crypto::{decrypt_from, join, open_shard, KdfParams, Keypair, Secret};
use keyshard_transport::{SignedMessage, Transport, SHARD_KIND};
use secrecy::SecretString;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Reconstruct the secret from passphrase-encrypted shards.
///
/// All shards must agree on `threshold` and `totalShards`, and at least
/// `threshold` must be supplied; both are checked before any key derivation.
/// Only the first `threshold` shards in the order given are opened.
pub fn recover_secret(
    shards: &[EncryptedShard],
    passphrase: &SecretString,
    params: &KdfParams,
) -> KeyshardResult<Secret> {
    let Some(first) = shards.first() else {
        return Err(KeyshardError::InsufficientShards {
            required: usize::from(keyshard_core::types::MIN_THRESHOLD),
            provided: 0,
        });
    };

    if let Some(odd) = shards
        .iter()
        .find(|s| s.threshold != first.threshold || s.total_shards != first.total_shards)
    {
        return Err(KeyshardError::InconsistentShards(format!(
            "shard {} is {}-of-{} but shard {} is {}-of-{}",
            first.index, first.threshold, first.total_shards, odd.index, odd.threshold, odd.total_shards
        )));
    }

    let config = ShardConfig::new(first.threshold, first.total_shards)?;
    let threshold = usize::from(config.threshold());
    if shards.len() < threshold {
        return Err(KeyshardError::InsufficientShards {
            required: threshold,
            provided: shards.len(),
        });
    }

    let raw = shards[..threshold]
        .iter()
        .map(|s| open_shard(s, passphrase, params))
        .collect::<KeyshardResult<Vec<_>>>()?;
    let secret = join(&raw, config.threshold())?;
    info!(
        threshold = config.threshold(),
        supplied = shards.len(),
        "secret recovered"
    );
    Ok(secret)
}

/// Verify and decrypt one shard message addressed to `trustee`.
pub fn open_shard_message(
    trustee: &Keypair,
    message: &SignedMessage,
) -> KeyshardResult<EncryptedShard> {
    if message.kind != SHARD_KIND {
        return Err(KeyshardError::InvalidPayload(format!(
            "message {} has kind {}, not a shard",
            message.id, message.kind
        )));
    }
    message.verify()?;

    let me = trustee.public().to_hex();
    if message.tag_value("p") != Some(me.as_str()) {
        return Err(KeyshardError::InvalidPayload(format!(
            "message {} is not addressed to this trustee",
            message.id
        )));
    }

    let sender = message.author()?;
    let plaintext = decrypt_from(trustee, &sender, &message.content)?;
    let json = std::str::from_utf8(&plaintext)
        .map_err(|e| KeyshardError::InvalidPayload(format!("shard is not UTF-8: {e}")))?;
    EncryptedShard::from_json(json)
}

/// Fetch and open every shard in `metadata` for which a trustee key is held.
///
/// Shards that cannot be fetched or opened are skipped with a warning; the
/// result is in manifest order and may be shorter than the threshold.
pub async fn collect_shards(
    transport: &dyn Transport,
    metadata: &BackupMetadata,
    trustees: &[Keypair],
    fetch_timeout: Duration,
) -> KeyshardResult<Vec<EncryptedShard>> {
    let mut collected = Vec::new();
    for event in &metadata.shard_events {
        let Some(trustee) = trustees
            .iter()
            .find(|t| t.public().to_hex() == event.recipient_pubkey)
        else {
            debug!(shard_index = event.shard_index, "no key for trustee, skipping");
            continue;
        };

        let ids = [event.event_id.clone()];
        let fetched = match tokio::time::timeout(
            fetch_timeout,
            transport.fetch_by_ids(&ids, &event.relays),
        )
        .await
        {
            Ok(Ok(found)) => found,
            Ok(Err(e)) => {
                warn!(shard_index = event.shard_index, "shard fetch failed: {e:#}");
                continue;
            }
            Err(_) => {
                warn!(shard_index = event.shard_index, "shard fetch timed out");
                continue;
            }
        };

        let Some(message) = fetched.iter().find(|m| m.id == event.event_id) else {
            warn!(shard_index = event.shard_index, event_id = %event.event_id, "shard message not found");
            continue;
        };
        match open_shard_message(trustee, message) {
            Ok(shard) if shard.index == event.shard_index => collected.push(shard),
            Ok(shard) => warn!(
                expected = event.shard_index,
                found = shard.index,
                "shard index does not match manifest"
            ),
            Err(e) => warn!(shard_index = event.shard_index, error = %e, "could not open shard"),
        }
    }
    Ok(collected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use keyshard_crypto::{encrypt_to, seal_shard, split_with};
    use keyshard_transport::recipient_tag;

    const PASSPHRASE: &str = "Tr0ub4dor&3xtra!";

    fn fast() -> KdfParams {
        KdfParams { iterations: 1_000 }
    }

    fn sealed(secret: &[u8], threshold: u8, total: u8) -> Vec<EncryptedShard> {
        let config = ShardConfig::new(threshold, total).unwrap();
        let passphrase = SecretString::from(PASSPHRASE);
        split_with(secret, &config)
            .unwrap()
            .iter()
            .map(|raw| seal_shard(raw, &config, &passphrase, &fast()).unwrap())
            .collect()
    }

    #[test]
    fn test_recover_with_any_threshold_subset() {
        let secret = [0x5Au8; 32];
        let shards = sealed(&secret, 3, 5);
        let passphrase = SecretString::from(PASSPHRASE);

        let subset = vec![shards[4].clone(), shards[0].clone(), shards[2].clone()];
        let recovered = recover_secret(&subset, &passphrase, &fast()).unwrap();
        assert_eq!(recovered.as_bytes(), &secret);
    }

    #[test]
    fn test_insufficient_before_kdf() {
        let shards = sealed(&[1u8; 16], 2, 3);
        // Wrong passphrase proves no decryption was attempted.
        let wrong = SecretString::from("wrong");
        let err = recover_secret(&shards[..1], &wrong, &fast()).unwrap_err();
        assert!(matches!(
            err,
            KeyshardError::InsufficientShards {
                required: 2,
                provided: 1
            }
        ));
        assert!(err.to_string().contains("need 1 more shard"));

        assert!(matches!(
            recover_secret(&[], &wrong, &fast()),
            Err(KeyshardError::InsufficientShards { provided: 0, .. })
        ));
    }

    #[test]
    fn test_inconsistent_shards_before_kdf() {
        let mut shards = sealed(&[1u8; 16], 2, 3);
        shards.extend(sealed(&[1u8; 16], 3, 5));
        let wrong = SecretString::from("wrong");
        assert!(matches!(
            recover_secret(&shards, &wrong, &fast()),
            Err(KeyshardError::InconsistentShards(_))
        ));
    }

    #[test]
    fn test_wrong_passphrase() {
        let shards = sealed(&[1u8; 16], 2, 3);
        let wrong = SecretString::from("Wr0ng-passphrase!");
        assert!(matches!(
            recover_secret(&shards, &wrong, &fast()),
            Err(KeyshardError::DecryptionFailed)
        ));
    }

    fn shard_message(sender: &Keypair, trustee: &Keypair, shard: &EncryptedShard) -> SignedMessage {
        let recipient = trustee.public();
        let content = encrypt_to(sender, &recipient, shard.to_json().unwrap().as_bytes()).unwrap();
        SignedMessage::sign(
            sender,
            SHARD_KIND,
            100,
            vec![recipient_tag(&recipient.to_hex())],
            content,
        )
        .unwrap()
    }

    #[test]
    fn test_open_shard_message() {
        let shard = sealed(&[3u8; 8], 2, 3).remove(1);
        let sender = Keypair::try_generate().unwrap();
        let trustee = Keypair::try_generate().unwrap();
        let message = shard_message(&sender, &trustee, &shard);

        assert_eq!(open_shard_message(&trustee, &message).unwrap(), shard);

        let stranger = Keypair::try_generate().unwrap();
        assert!(matches!(
            open_shard_message(&stranger, &message),
            Err(KeyshardError::InvalidPayload(_))
        ));

        let mut tampered = message.clone();
        tampered.created_at += 1;
        assert!(open_shard_message(&trustee, &tampered).is_err());
    }
}
