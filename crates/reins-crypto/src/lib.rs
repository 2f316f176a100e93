//! Envelope encryption for short secret blobs.
//!
//! [`KeyEncryption`] derives a 256-bit AES-GCM key from a caller-supplied
//! master secret (PBKDF2-HMAC-SHA256, fixed salt tag) and produces
//! base64-encoded ciphertext/IV pairs. Decryption fails closed on a wrong
//! master secret or a tampered payload.

use std::sync::OnceLock;

use aes_gcm::{
    aead::{Aead, KeyInit, OsRng, Payload},
    Aes256Gcm,
};
use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine as _};
use pbkdf2::pbkdf2_hmac;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;

const KEY_DERIVATION_SALT: &[u8] = b"reins-byok-v1";
const KEY_DERIVATION_ITERATIONS: u32 = 100_000;
const AES_GCM_NONCE_BYTES: usize = 12;
const CRYPTO_ENVELOPE_AAD: &[u8] = b"reins-key-encryption-v1";

/// Stable wire code carried by every crypto-layer failure.
pub const CRYPTO_ERROR_CODE: &str = "AUTH_ERROR";

/// Convenience alias for results produced by the crypto layer.
pub type CryptoResult<T> = Result<T, CryptoError>;

/// Enumerates crypto-layer failures. All carry the `AUTH_ERROR` code.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("encryption key material has invalid length")]
    InvalidKey,
    #[error("encrypted payload encoding is invalid")]
    InvalidEncoding,
    #[error("initialization vector must be {expected} bytes, got {actual}")]
    InvalidIvLength { expected: usize, actual: usize },
    #[error("encrypted payload integrity check failed")]
    IntegrityCheckFailed,
    #[error("payload encryption failed")]
    EncryptionFailed,
}

impl CryptoError {
    /// Returns the stable wire code (`AUTH_ERROR` for every variant).
    pub fn code(&self) -> &'static str {
        CRYPTO_ERROR_CODE
    }
}

/// Base64-encoded AEAD output: ciphertext plus the fresh per-call IV.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EncryptedPayload {
    pub ciphertext: String,
    pub iv: String,
}

/// Symmetric authenticated encryption keyed from a master secret.
///
/// The derived key is computed once on first use and cached for the life of
/// the object; the KDF salt is a fixed process-wide tag so two objects built
/// from the same master secret interoperate.
pub struct KeyEncryption {
    master_secret: String,
    derived_key: OnceLock<[u8; 32]>,
}

impl KeyEncryption {
    /// Creates an encryptor for the given master secret.
    pub fn new(master_secret: impl Into<String>) -> Self {
        Self {
            master_secret: master_secret.into(),
            derived_key: OnceLock::new(),
        }
    }

    fn derived_key(&self) -> &[u8; 32] {
        self.derived_key.get_or_init(|| {
            let mut key = [0u8; 32];
            pbkdf2_hmac::<Sha256>(
                self.master_secret.as_bytes(),
                KEY_DERIVATION_SALT,
                KEY_DERIVATION_ITERATIONS,
                &mut key,
            );
            key
        })
    }

    fn cipher(&self) -> CryptoResult<Aes256Gcm> {
        Aes256Gcm::new_from_slice(self.derived_key()).map_err(|_| CryptoError::InvalidKey)
    }

    /// Encrypts `plaintext` under a fresh random 96-bit IV.
    ///
    /// Re-encrypting the same plaintext yields a distinct ciphertext/IV pair
    /// on every call.
    pub fn encrypt(&self, plaintext: &[u8]) -> CryptoResult<EncryptedPayload> {
        let cipher = self.cipher()?;
        let mut nonce = [0u8; AES_GCM_NONCE_BYTES];
        use aes_gcm::aead::rand_core::RngCore as _;
        OsRng.fill_bytes(&mut nonce);

        let ciphertext = cipher
            .encrypt(
                (&nonce).into(),
                Payload {
                    msg: plaintext,
                    aad: CRYPTO_ENVELOPE_AAD,
                },
            )
            .map_err(|_| CryptoError::EncryptionFailed)?;

        Ok(EncryptedPayload {
            ciphertext: BASE64_STANDARD.encode(ciphertext),
            iv: BASE64_STANDARD.encode(nonce),
        })
    }

    /// Decrypts a ciphertext/IV pair produced by [`KeyEncryption::encrypt`].
    ///
    /// Fails with [`CryptoError::IntegrityCheckFailed`] when the payload was
    /// tampered with or when the master secret differs from the one used to
    /// encrypt.
    pub fn decrypt(&self, ciphertext: &str, iv: &str) -> CryptoResult<Vec<u8>> {
        let cipher = self.cipher()?;
        let nonce = BASE64_STANDARD
            .decode(iv)
            .map_err(|_| CryptoError::InvalidEncoding)?;
        if nonce.len() != AES_GCM_NONCE_BYTES {
            return Err(CryptoError::InvalidIvLength {
                expected: AES_GCM_NONCE_BYTES,
                actual: nonce.len(),
            });
        }
        let raw = BASE64_STANDARD
            .decode(ciphertext)
            .map_err(|_| CryptoError::InvalidEncoding)?;

        cipher
            .decrypt(
                nonce.as_slice().into(),
                Payload {
                    msg: raw.as_slice(),
                    aad: CRYPTO_ENVELOPE_AAD,
                },
            )
            .map_err(|_| CryptoError::IntegrityCheckFailed)
    }
}
