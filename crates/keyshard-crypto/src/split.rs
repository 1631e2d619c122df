//! Shamir secret sharing over GF(2^8)
//!
//! Each secret byte gets its own random polynomial of degree `threshold - 1`
//! whose constant term is the byte. Shard `i` holds the evaluations at
//! `x = i` (1-based). Field arithmetic uses the AES reduction polynomial
//! `x^8 + x^4 + x^3 + x + 1` and avoids data-dependent branches and tables.
//!
//! Shard selection in [`join`]: only the first `threshold` shards, in the
//! order the caller passes them, are interpolated. Extra shards are ignored
//! rather than cross-checked, so callers should pass every shard they have
//! and order them by preference.

use keyshard_core::types::{MAX_THRESHOLD, MIN_THRESHOLD};
use keyshard_core::{KeyshardError, KeyshardResult, ShardConfig};
use rand::RngCore;
use zeroize::{Zeroize, Zeroizing};

/// Largest secret the shard codec can carry.
pub const MAX_SECRET_LEN: usize = u16::MAX as usize;

/// Raw private key material. Zeroized on drop, never printed.
pub struct Secret {
    bytes: Vec<u8>,
}

impl Secret {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl From<Vec<u8>> for Secret {
    fn from(bytes: Vec<u8>) -> Self {
        Self::new(bytes)
    }
}

impl PartialEq for Secret {
    fn eq(&self, other: &Self) -> bool {
        self.bytes == other.bytes
    }
}

impl Eq for Secret {}

impl Drop for Secret {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Secret")
            .field("len", &self.bytes.len())
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// One Shamir share: the x-coordinate and one y value per secret byte.
#[derive(Clone)]
pub struct RawShard {
    /// 1-based x-coordinate
    pub index: u8,
    pub data: Vec<u8>,
}

impl Drop for RawShard {
    fn drop(&mut self) {
        self.data.zeroize();
    }
}

impl std::fmt::Debug for RawShard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawShard")
            .field("index", &self.index)
            .field("data", &"[REDACTED]")
            .finish()
    }
}

/// Validate `(threshold, total_shards)` and split.
///
/// Invalid combinations are rejected before any randomness is drawn.
pub fn split(secret: &[u8], threshold: u8, total_shards: u8) -> KeyshardResult<Vec<RawShard>> {
    let config = ShardConfig::new(threshold, total_shards)?;
    split_with(secret, &config)
}

/// Split `secret` into `config.total_shards()` shards, any `config.threshold()`
/// of which reconstruct it.
pub fn split_with(secret: &[u8], config: &ShardConfig) -> KeyshardResult<Vec<RawShard>> {
    if secret.is_empty() {
        return Err(KeyshardError::SplitFailed("secret is empty".into()));
    }
    if secret.len() > MAX_SECRET_LEN {
        return Err(KeyshardError::SplitFailed(format!(
            "secret is {} bytes (maximum {MAX_SECRET_LEN})",
            secret.len()
        )));
    }

    let mut shards: Vec<RawShard> = (1..=config.total_shards())
        .map(|index| RawShard {
            index,
            data: Vec::with_capacity(secret.len()),
        })
        .collect();

    let mut rng = rand::thread_rng();
    let mut coeffs = Zeroizing::new(vec![0u8; usize::from(config.threshold())]);

    for &byte in secret {
        coeffs[0] = byte;
        rng.fill_bytes(&mut coeffs[1..]);
        for shard in shards.iter_mut() {
            shard.data.push(gf256::eval(&coeffs, shard.index));
        }
    }

    tracing::debug!(
        threshold = config.threshold(),
        total_shards = config.total_shards(),
        secret_len = secret.len(),
        "secret split"
    );
    Ok(shards)
}

/// Reconstruct the secret from the first `threshold` shards in `shards`.
///
/// Fails with `InsufficientShards` before any arithmetic when fewer than
/// `threshold` shards are supplied.
pub fn join(shards: &[RawShard], threshold: u8) -> KeyshardResult<Secret> {
    if !(MIN_THRESHOLD..=MAX_THRESHOLD).contains(&threshold) {
        return Err(KeyshardError::InvalidThreshold {
            threshold,
            total_shards: u8::try_from(shards.len()).unwrap_or(u8::MAX),
        });
    }

    let required = usize::from(threshold);
    if shards.len() < required {
        return Err(KeyshardError::InsufficientShards {
            required,
            provided: shards.len(),
        });
    }

    let used = &shards[..required];
    let len = used[0].data.len();
    if len == 0 {
        return Err(KeyshardError::JoinFailed("shard data is empty".into()));
    }

    for (i, shard) in used.iter().enumerate() {
        if shard.index == 0 {
            return Err(KeyshardError::JoinFailed("shard index 0 is not valid".into()));
        }
        if shard.data.len() != len {
            return Err(KeyshardError::JoinFailed(format!(
                "shard {} has {} bytes, expected {len}",
                shard.index,
                shard.data.len()
            )));
        }
        if used[..i].iter().any(|prev| prev.index == shard.index) {
            return Err(KeyshardError::JoinFailed(format!(
                "shard index {} supplied twice",
                shard.index
            )));
        }
    }

    let xs: Vec<u8> = used.iter().map(|s| s.index).collect();
    let basis = gf256::lagrange_basis_at_zero(&xs);

    let mut secret = vec![0u8; len];
    for (shard, &weight) in used.iter().zip(basis.iter()) {
        for (out, &y) in secret.iter_mut().zip(shard.data.iter()) {
            *out ^= gf256::mul(y, weight);
        }
    }

    Ok(Secret::new(secret))
}

mod gf256 {
    /// Carry-less multiply modulo x^8 + x^4 + x^3 + x + 1.
    pub(super) fn mul(mut a: u8, mut b: u8) -> u8 {
        let mut product = 0u8;
        for _ in 0..8 {
            product ^= a & 0u8.wrapping_sub(b & 1);
            let carry = a >> 7;
            a = (a << 1) ^ (0x1b & 0u8.wrapping_sub(carry));
            b >>= 1;
        }
        product
    }

    /// Multiplicative inverse as a^254. `inv(0) == 0`.
    pub(super) fn inv(a: u8) -> u8 {
        let mut result = 1u8;
        let mut base = a;
        let mut exp = 254u8;
        while exp > 0 {
            if exp & 1 == 1 {
                result = mul(result, base);
            }
            base = mul(base, base);
            exp >>= 1;
        }
        result
    }

    /// Horner evaluation; `coeffs[0]` is the constant term.
    pub(super) fn eval(coeffs: &[u8], x: u8) -> u8 {
        coeffs.iter().rev().fold(0u8, |acc, &c| mul(acc, x) ^ c)
    }

    /// Lagrange basis polynomials evaluated at x = 0 for distinct, non-zero `xs`.
    pub(super) fn lagrange_basis_at_zero(xs: &[u8]) -> Vec<u8> {
        xs.iter()
            .enumerate()
            .map(|(i, &xi)| {
                let mut num = 1u8;
                let mut den = 1u8;
                for (j, &xj) in xs.iter().enumerate() {
                    if i != j {
                        num = mul(num, xj);
                        den = mul(den, xj ^ xi);
                    }
                }
                mul(num, inv(den))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;

    fn random_secret(len: usize) -> Vec<u8> {
        let mut bytes = vec![0u8; len];
        rand::thread_rng().fill_bytes(&mut bytes);
        bytes
    }

    /// All size-`k` index subsets of `0..n`.
    fn combinations(n: usize, k: usize) -> Vec<Vec<usize>> {
        fn go(start: usize, n: usize, k: usize, cur: &mut Vec<usize>, out: &mut Vec<Vec<usize>>) {
            if cur.len() == k {
                out.push(cur.clone());
                return;
            }
            for i in start..n {
                cur.push(i);
                go(i + 1, n, k, cur, out);
                cur.pop();
            }
        }
        let mut out = Vec::new();
        go(0, n, k, &mut Vec::new(), &mut out);
        out
    }

    #[test]
    fn test_gf256_field_laws() {
        assert_eq!(gf256::mul(0x57, 0x83), 0xc1, "FIPS-197 §4.2 example");
        assert_eq!(gf256::mul(0x57, 0x13), 0xfe, "FIPS-197 §4.2.1 example");
        for a in 1..=255u8 {
            assert_eq!(gf256::mul(a, gf256::inv(a)), 1, "inverse of {a:#04x}");
            assert_eq!(gf256::mul(a, 1), a);
            assert_eq!(gf256::mul(a, 0), 0);
        }
    }

    #[test]
    fn test_split_shapes() {
        let secret = random_secret(32);
        let shards = split(&secret, 3, 5).unwrap();

        assert_eq!(shards.len(), 5);
        for (i, shard) in shards.iter().enumerate() {
            assert_eq!(usize::from(shard.index), i + 1);
            assert_eq!(shard.data.len(), 32);
        }
    }

    #[test]
    fn test_every_threshold_subset_reconstructs() {
        for (t, n) in [(2u8, 3u8), (3, 5), (5, 10)] {
            let secret = random_secret(32);
            let shards = split(&secret, t, n).unwrap();

            for subset in combinations(usize::from(n), usize::from(t)) {
                let picked: Vec<RawShard> = subset.iter().map(|&i| shards[i].clone()).collect();
                let recovered = join(&picked, t).unwrap();
                assert_eq!(recovered.as_bytes(), secret.as_slice(), "subset {subset:?}");
            }
        }
    }

    #[test]
    fn test_config_rejected_before_split() {
        let secret = random_secret(16);
        assert!(matches!(split(&secret, 1, 3), Err(KeyshardError::InvalidThreshold { .. })));
        assert!(matches!(split(&secret, 4, 3), Err(KeyshardError::InvalidThreshold { .. })));
        assert!(matches!(split(&secret, 2, 2), Err(KeyshardError::InvalidShardCount { .. })));
        assert!(matches!(split(&secret, 2, 11), Err(KeyshardError::InvalidShardCount { .. })));
        assert!(split(&secret, 2, 3).is_ok());
        assert!(split(&secret, 5, 10).is_ok());
    }

    #[test]
    fn test_empty_secret_rejected() {
        assert!(matches!(split(&[], 2, 3), Err(KeyshardError::SplitFailed(_))));
    }

    #[test]
    fn test_join_insufficient_shards() {
        let secret = random_secret(32);
        let shards = split(&secret, 2, 3).unwrap();

        let result = join(&shards[..1], 2);
        assert!(matches!(
            result,
            Err(KeyshardError::InsufficientShards {
                required: 2,
                provided: 1
            })
        ));
    }

    #[test]
    fn test_join_uses_first_threshold_in_caller_order() {
        let secret = random_secret(32);
        let shards = split(&secret, 2, 4).unwrap();

        // A corrupted trailing shard is never read.
        let mut garbage = shards[3].clone();
        garbage.data = vec![0xAA; 5];
        let picked = vec![shards[2].clone(), shards[0].clone(), garbage];
        assert_eq!(join(&picked, 2).unwrap().as_bytes(), secret.as_slice());

        // A corrupted leading shard is read, and poisons the result.
        let mut tampered = shards[0].clone();
        tampered.data[0] ^= 0x01;
        let picked = vec![tampered, shards[1].clone(), shards[2].clone()];
        assert_ne!(join(&picked, 2).unwrap().as_bytes(), secret.as_slice());
    }

    #[test]
    fn test_join_rejects_duplicates_and_bad_shapes() {
        let secret = random_secret(8);
        let shards = split(&secret, 2, 3).unwrap();

        let dup = vec![shards[0].clone(), shards[0].clone()];
        assert!(matches!(join(&dup, 2), Err(KeyshardError::JoinFailed(_))));

        let mut short = shards[1].clone();
        short.data.truncate(4);
        let mismatched = vec![shards[0].clone(), short];
        assert!(matches!(join(&mismatched, 2), Err(KeyshardError::JoinFailed(_))));

        let mut zero = shards[1].clone();
        zero.index = 0;
        assert!(matches!(
            join(&[shards[0].clone(), zero], 2),
            Err(KeyshardError::JoinFailed(_))
        ));

        assert!(matches!(
            join(&shards, 1),
            Err(KeyshardError::InvalidThreshold { .. })
        ));
    }

    #[test]
    fn test_below_threshold_shard_values_are_uniform() {
        // With t = 3, a single shard byte is a uniformly random field element
        // regardless of the secret byte.
        let mut seen = HashSet::new();
        for _ in 0..512 {
            let shards = split(&[0x42], 3, 5).unwrap();
            seen.insert(shards[0].data[0]);
        }
        // ~221 distinct values expected for 512 uniform draws.
        assert!(seen.len() > 180, "only {} distinct values", seen.len());
    }

    #[test]
    fn test_below_threshold_interpolation_is_unrelated() {
        let secret = random_secret(32);
        for _ in 0..50 {
            let shards = split(&secret, 3, 5).unwrap();
            // Pretend t-1 shards suffice: the result is noise, not the secret.
            let guess = join(&shards[..2], 2).unwrap();
            assert_ne!(guess.as_bytes(), secret.as_slice());
        }
    }

    #[test]
    fn test_secret_debug_redacted() {
        let secret = Secret::new(vec![1, 2, 3]);
        let shown = format!("{secret:?}");
        assert!(shown.contains("REDACTED"));
        assert!(!shown.contains("[1, 2, 3]"));
    }

    proptest! {
        #[test]
        fn split_join_any_order(
            secret in prop::collection::vec(any::<u8>(), 1..64),
            t in 2u8..=5,
            extra in 0u8..=5,
            seed in any::<u64>(),
        ) {
            let n = (t + extra).clamp(3, 10);
            let shards = split(&secret, t, n).unwrap();

            // Rotate by a seed-chosen amount to vary which shards lead.
            let mut ordered = shards.clone();
            ordered.rotate_left((seed % u64::from(n)) as usize);

            let recovered = join(&ordered, t).unwrap();
            prop_assert_eq!(recovered.as_bytes(), secret.as_slice());
        }
    }
}
