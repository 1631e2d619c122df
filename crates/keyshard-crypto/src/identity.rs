//! Identities: Ed25519 keypairs, one-shot disposable identities, and
//! public-key encryption between them.
//!
//! `encrypt_to` format (base64 of):
//! ```text
//! [1 byte: version = 1][24 bytes: XChaCha20 nonce][ciphertext + 16-byte Poly1305 tag]
//! ```
//! Key agreement maps both Ed25519 keys to their X25519 (Montgomery) form and
//! runs ECDH; the shared point goes through HKDF-SHA256 with
//! `salt = sender_pub ‖ recipient_pub`. Encrypting to yourself is supported
//! and is how the owner seals its own manifest.

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    Key, XChaCha20Poly1305, XNonce,
};
use curve25519_dalek::edwards::CompressedEdwardsY;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use hkdf::Hkdf;
use keyshard_core::{KeyshardError, KeyshardResult};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256, Sha512};
use zeroize::Zeroizing;

use crate::{base64_decode, base64_encode, KEY_SIZE, TAG_SIZE};

/// Length of a public key in bytes
pub const PUBLIC_KEY_LEN: usize = 32;

const ENVELOPE_VERSION: u8 = 1;
const XNONCE_SIZE: usize = 24;
const HKDF_INFO: &[u8] = b"keyshard-encrypt-v1";

/// A 32-byte Ed25519 public key, hex on the wire.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PublicKey {
    key: VerifyingKey,
}

impl PublicKey {
    pub fn from_bytes(bytes: &[u8; PUBLIC_KEY_LEN]) -> KeyshardResult<Self> {
        VerifyingKey::from_bytes(bytes)
            .map(|key| Self { key })
            .map_err(|e| KeyshardError::InvalidKey(format!("not a valid Ed25519 point: {e}")))
    }

    pub fn from_hex(s: &str) -> KeyshardResult<Self> {
        let bytes = hex::decode(s.trim())
            .map_err(|e| KeyshardError::InvalidKey(format!("public key is not hex: {e}")))?;
        let arr: [u8; PUBLIC_KEY_LEN] = bytes.try_into().map_err(|v: Vec<u8>| {
            KeyshardError::InvalidKey(format!(
                "public key is {} bytes, expected {PUBLIC_KEY_LEN}",
                v.len()
            ))
        })?;
        Self::from_bytes(&arr)
    }

    pub fn to_bytes(&self) -> [u8; PUBLIC_KEY_LEN] {
        self.key.to_bytes()
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.key.to_bytes())
    }

    /// Verify an Ed25519 signature over `message`.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> KeyshardResult<()> {
        let sig = Signature::from_slice(signature)
            .map_err(|e| KeyshardError::InvalidKey(format!("malformed signature: {e}")))?;
        self.key
            .verify(message, &sig)
            .map_err(|_| KeyshardError::InvalidKey("signature does not verify".into()))
    }
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PublicKey({})", self.to_hex())
    }
}

impl std::fmt::Display for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// A long-lived Ed25519 keypair (the owner's or a trustee's).
///
/// The signing key is zeroized on drop by `ed25519-dalek`.
#[derive(Clone)]
pub struct Keypair {
    signing: SigningKey,
}

impl Keypair {
    /// Generate from the OS RNG, surfacing RNG failure instead of panicking.
    pub fn try_generate() -> KeyshardResult<Self> {
        let mut seed = Zeroizing::new([0u8; KEY_SIZE]);
        OsRng
            .try_fill_bytes(&mut seed[..])
            .map_err(|e| KeyshardError::KeyDerivationFailed(format!("OS RNG: {e}")))?;
        Ok(Self {
            signing: SigningKey::from_bytes(&seed),
        })
    }

    pub fn from_secret_bytes(seed: &[u8; KEY_SIZE]) -> Self {
        Self {
            signing: SigningKey::from_bytes(seed),
        }
    }

    pub fn from_secret_hex(s: &str) -> KeyshardResult<Self> {
        let bytes = Zeroizing::new(
            hex::decode(s.trim())
                .map_err(|e| KeyshardError::InvalidKey(format!("secret key is not hex: {e}")))?,
        );
        let seed: &[u8; KEY_SIZE] = bytes.as_slice().try_into().map_err(|_| {
            KeyshardError::InvalidKey(format!(
                "secret key is {} bytes, expected {KEY_SIZE}",
                bytes.len()
            ))
        })?;
        Ok(Self::from_secret_bytes(seed))
    }

    pub fn secret_hex(&self) -> Zeroizing<String> {
        Zeroizing::new(hex::encode(self.signing.to_bytes()))
    }

    pub fn public(&self) -> PublicKey {
        PublicKey {
            key: self.signing.verifying_key(),
        }
    }

    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing.sign(message).to_bytes()
    }

    /// The X25519 scalar for this key: the clamped lower half of SHA-512(seed),
    /// the same integer Ed25519 uses to derive the public key.
    fn x25519_scalar(&self) -> Zeroizing<[u8; 32]> {
        let digest = Sha512::digest(self.signing.to_bytes());
        let mut scalar = Zeroizing::new([0u8; 32]);
        scalar.copy_from_slice(&digest[..32]);
        scalar
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("public", &self.public())
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

/// A one-time identity that signs and encrypts exactly one shard message.
///
/// Not `Clone`: it is created, used, and dropped inside a single publish.
pub struct DisposableIdentity {
    keypair: Keypair,
}

impl DisposableIdentity {
    pub fn generate() -> KeyshardResult<Self> {
        Ok(Self {
            keypair: Keypair::try_generate()?,
        })
    }

    pub fn public(&self) -> PublicKey {
        self.keypair.public()
    }

    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }
}

impl std::fmt::Debug for DisposableIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DisposableIdentity")
            .field("public", &self.public())
            .finish()
    }
}

fn conversation_key(
    ours: &Keypair,
    theirs: &PublicKey,
    sender: &PublicKey,
    recipient: &PublicKey,
) -> KeyshardResult<Zeroizing<[u8; KEY_SIZE]>> {
    let their_point = CompressedEdwardsY(theirs.to_bytes())
        .decompress()
        .ok_or_else(|| KeyshardError::InvalidKey("public key does not decompress".into()))?
        .to_montgomery();

    let shared = Zeroizing::new(their_point.mul_clamped(*ours.x25519_scalar()).to_bytes());
    if shared.iter().all(|&b| b == 0) {
        return Err(KeyshardError::InvalidKey(
            "low-order public key rejected".into(),
        ));
    }

    let mut salt = [0u8; 2 * PUBLIC_KEY_LEN];
    salt[..PUBLIC_KEY_LEN].copy_from_slice(&sender.to_bytes());
    salt[PUBLIC_KEY_LEN..].copy_from_slice(&recipient.to_bytes());

    let hkdf = Hkdf::<Sha256>::new(Some(&salt[..]), &shared[..]);
    let mut okm = Zeroizing::new([0u8; KEY_SIZE]);
    hkdf.expand(HKDF_INFO, &mut okm[..])
        .map_err(|e| KeyshardError::KeyDerivationFailed(format!("HKDF expand: {e}")))?;
    Ok(okm)
}

/// Encrypt `plaintext` from `sender` so that only `recipient` can read it.
pub fn encrypt_to(
    sender: &Keypair,
    recipient: &PublicKey,
    plaintext: &[u8],
) -> KeyshardResult<String> {
    let sender_pub = sender.public();
    let key = conversation_key(sender, recipient, &sender_pub, recipient)?;
    let cipher = XChaCha20Poly1305::new(Key::from_slice(&key[..]));

    let mut nonce_bytes = [0u8; XNONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);

    let ciphertext = cipher
        .encrypt(
            XNonce::from_slice(&nonce_bytes),
            Payload {
                msg: plaintext,
                aad: &[ENVELOPE_VERSION],
            },
        )
        .map_err(|e| KeyshardError::EncryptionFailed(format!("XChaCha20-Poly1305: {e}")))?;

    let mut out = Vec::with_capacity(1 + XNONCE_SIZE + ciphertext.len());
    out.push(ENVELOPE_VERSION);
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(base64_encode(&out))
}

/// Decrypt a message `sender` encrypted to `recipient` with [`encrypt_to`].
pub fn decrypt_from(
    recipient: &Keypair,
    sender: &PublicKey,
    ciphertext: &str,
) -> KeyshardResult<Zeroizing<Vec<u8>>> {
    let raw = base64_decode(ciphertext).ok_or(KeyshardError::DecryptionFailed)?;
    if raw.len() < 1 + XNONCE_SIZE + TAG_SIZE || raw[0] != ENVELOPE_VERSION {
        return Err(KeyshardError::DecryptionFailed);
    }

    let recipient_pub = recipient.public();
    let key = conversation_key(recipient, sender, sender, &recipient_pub)?;
    let cipher = XChaCha20Poly1305::new(Key::from_slice(&key[..]));

    let (nonce, body) = raw[1..].split_at(XNONCE_SIZE);
    cipher
        .decrypt(
            XNonce::from_slice(nonce),
            Payload {
                msg: body,
                aad: &[ENVELOPE_VERSION],
            },
        )
        .map(Zeroizing::new)
        .map_err(|_| KeyshardError::DecryptionFailed)
}
