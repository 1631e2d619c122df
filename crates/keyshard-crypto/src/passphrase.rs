//! Passphrase-based sealing: PBKDF2-HMAC-SHA256 → AES-256-GCM
//!
//! Encoded format (v1, base64 of):
//! ```text
//! [16 bytes: salt][12 bytes: IV][N bytes: ciphertext][16 bytes: GCM tag]
//! ```
//!
//! Salt length, IV length, hash and iteration count are fixed for v1 and are
//! not carried in the output. Decrypting with any other parameters simply
//! fails authentication.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use keyshard_core::{KeyshardError, KeyshardResult};
use rand::RngCore;
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;
use zeroize::{Zeroize, Zeroizing};

use crate::{base64_decode, base64_encode, KEY_SIZE, TAG_SIZE};

/// PBKDF2 salt length in bytes
pub const SALT_SIZE: usize = 16;

/// AES-GCM nonce length in bytes
pub const IV_SIZE: usize = 12;

/// PBKDF2 work factor for format v1
pub const PBKDF2_ITERATIONS_V1: u32 = 600_000;

/// Minimum passphrase length, in characters
pub const MIN_PASSPHRASE_LEN: usize = 12;

/// A 256-bit key derived from a passphrase. Zeroized on drop.
pub struct PassphraseKey {
    bytes: [u8; KEY_SIZE],
}

impl PassphraseKey {
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl Drop for PassphraseKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for PassphraseKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PassphraseKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// PBKDF2 parameters.
///
/// `Default` is the v1 wire format. Anything else produces ciphertexts that
/// v1 readers cannot open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KdfParams {
    pub iterations: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            iterations: PBKDF2_ITERATIONS_V1,
        }
    }
}

/// One passphrase rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrengthRule {
    MinLength,
    Uppercase,
    Lowercase,
    Digit,
    Symbol,
}

impl std::fmt::Display for StrengthRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StrengthRule::MinLength => {
                write!(f, "must be at least {MIN_PASSPHRASE_LEN} characters")
            }
            StrengthRule::Uppercase => f.write_str("must contain an uppercase letter"),
            StrengthRule::Lowercase => f.write_str("must contain a lowercase letter"),
            StrengthRule::Digit => f.write_str("must contain a digit"),
            StrengthRule::Symbol => f.write_str("must contain a symbol"),
        }
    }
}

/// Outcome of [`validate_strength`]: every violated rule, not just the first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StrengthReport {
    pub valid: bool,
    pub errors: Vec<StrengthRule>,
}

impl StrengthReport {
    /// Turn a failing report into `WeakPassphrase`.
    pub fn into_result(self) -> KeyshardResult<()> {
        if self.valid {
            Ok(())
        } else {
            Err(KeyshardError::WeakPassphrase(
                self.errors.iter().map(ToString::to_string).collect(),
            ))
        }
    }
}

/// Check a passphrase against the length and character-class rules.
pub fn validate_strength(passphrase: &str) -> StrengthReport {
    let mut errors = Vec::new();

    if passphrase.chars().count() < MIN_PASSPHRASE_LEN {
        errors.push(StrengthRule::MinLength);
    }
    if !passphrase.chars().any(char::is_uppercase) {
        errors.push(StrengthRule::Uppercase);
    }
    if !passphrase.chars().any(char::is_lowercase) {
        errors.push(StrengthRule::Lowercase);
    }
    if !passphrase.chars().any(|c| c.is_ascii_digit()) {
        errors.push(StrengthRule::Digit);
    }
    if !passphrase
        .chars()
        .any(|c| !c.is_alphanumeric() && !c.is_whitespace())
    {
        errors.push(StrengthRule::Symbol);
    }

    StrengthReport {
        valid: errors.is_empty(),
        errors,
    }
}

/// Derive a 256-bit key from a passphrase and a 16-byte salt with PBKDF2-HMAC-SHA256.
pub fn derive_key(
    passphrase: &SecretString,
    salt: &[u8; SALT_SIZE],
    params: &KdfParams,
) -> KeyshardResult<PassphraseKey> {
    if params.iterations == 0 {
        return Err(KeyshardError::KeyDerivationFailed(
            "iteration count must be non-zero".into(),
        ));
    }

    let mut key = [0u8; KEY_SIZE];
    pbkdf2::pbkdf2_hmac::<Sha256>(
        passphrase.expose_secret().as_bytes(),
        salt,
        params.iterations,
        &mut key,
    );
    Ok(PassphraseKey { bytes: key })
}

/// Encrypt `plaintext` under a passphrase.
///
/// Returns base64(`salt ‖ iv ‖ ciphertext ‖ tag`) with a fresh salt and IV.
pub fn encrypt(
    plaintext: &[u8],
    passphrase: &SecretString,
    params: &KdfParams,
) -> KeyshardResult<String> {
    let mut salt = [0u8; SALT_SIZE];
    let mut iv = [0u8; IV_SIZE];
    let mut rng = rand::thread_rng();
    rng.fill_bytes(&mut salt);
    rng.fill_bytes(&mut iv);

    let key = derive_key(passphrase, &salt, params)?;
    let cipher = Aes256Gcm::new(key.as_bytes().into());

    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&iv), plaintext)
        .map_err(|e| KeyshardError::EncryptionFailed(format!("AES-256-GCM: {e}")))?;

    let mut out = Vec::with_capacity(SALT_SIZE + IV_SIZE + ciphertext.len());
    out.extend_from_slice(&salt);
    out.extend_from_slice(&iv);
    out.extend_from_slice(&ciphertext);
    Ok(base64_encode(&out))
}

/// Decrypt the output of [`encrypt`].
///
/// Malformed input and authentication failure both yield `DecryptionFailed`;
/// no partial plaintext is ever returned.
pub fn decrypt(
    encoded: &str,
    passphrase: &SecretString,
    params: &KdfParams,
) -> KeyshardResult<Zeroizing<Vec<u8>>> {
    let raw = base64_decode(encoded).ok_or(KeyshardError::DecryptionFailed)?;
    if raw.len() < SALT_SIZE + IV_SIZE + TAG_SIZE {
        return Err(KeyshardError::DecryptionFailed);
    }

    let (salt, rest) = raw.split_at(SALT_SIZE);
    let (iv, ciphertext) = rest.split_at(IV_SIZE);
    let mut salt_bytes = [0u8; SALT_SIZE];
    salt_bytes.copy_from_slice(salt);

    let key = derive_key(passphrase, &salt_bytes, params)?;
    let cipher = Aes256Gcm::new(key.as_bytes().into());

    cipher
        .decrypt(Nonce::from_slice(iv), ciphertext)
        .map(Zeroizing::new)
        .map_err(|_| KeyshardError::DecryptionFailed)
}
