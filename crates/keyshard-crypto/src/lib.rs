//! keyshard-crypto: everything that touches key material
//!
//! Shard pipeline:
//! ```text
//! secret ─ split (Shamir, GF(2^8)) ─▶ RawShard × n
//! RawShard ─ codec::encode ─▶ "KSHD" v1 payload ─ passphrase::encrypt ─▶ EncryptedShard
//! ```
//!
//! Passphrase layer: PBKDF2-HMAC-SHA256 (600 000 iterations) → AES-256-GCM,
//! encoded as base64(`salt(16) ‖ iv(12) ‖ ciphertext ‖ tag(16)`).
//!
//! Identity layer: Ed25519 keys sign transport messages; the same keys, mapped
//! to X25519, drive HKDF-SHA256 + XChaCha20-Poly1305 for `encrypt_to`.

pub mod codec;
pub mod identity;
pub mod passphrase;
pub mod split;

pub use codec::{open_shard, seal_shard, ShardHeader};
pub use identity::{decrypt_from, encrypt_to, DisposableIdentity, Keypair, PublicKey};
pub use passphrase::{validate_strength, KdfParams, StrengthReport, StrengthRule};
pub use split::{join, split, split_with, RawShard, Secret};

/// Size of a symmetric key in bytes (256-bit)
pub const KEY_SIZE: usize = 32;

/// Size of an AEAD authentication tag
pub const TAG_SIZE: usize = 16;

pub(crate) fn base64_encode(data: &[u8]) -> String {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    STANDARD.encode(data)
}

pub(crate) fn base64_decode(s: &str) -> Option<Vec<u8>> {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    STANDARD.decode(s.trim()).ok()
}
