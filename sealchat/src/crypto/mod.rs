//! Cryptographic layer for `SealChat`.
//!
//! - [`key::GlobalKey`] is the single room key shared by all participants.
//! - [`keystore::KeyStore`] keeps that key encrypted at rest under a
//!   passphrase-derived wrapping key and guards every read of it.
//! - [`cipher`] encrypts and decrypts message payloads and defines the
//!   `base64(nonce || ciphertext)` wire framing.
//!
//! Both at-rest and in-flight protection use AES-256-GCM with 12-byte
//! random nonces.

pub mod cipher;
pub mod key;
pub mod keystore;

use std::path::PathBuf;

/// Size of an AES-256-GCM key in bytes.
pub const KEY_SIZE: usize = 32;

/// Size of an AES-GCM nonce in bytes.
pub const NONCE_SIZE: usize = 12;

/// Errors that can occur during cryptographic operations.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// No global key is loaded. Distinct from [`CryptoError::Decryption`] so
    /// callers can tell "key missing" from "wrong key".
    #[error("no global key available: key store is not initialized")]
    NoKey,

    /// The blob is shorter than a nonce and cannot be split.
    #[error("ciphertext too short: {len} bytes, need at least {NONCE_SIZE}")]
    CiphertextTooShort {
        /// Length of the rejected blob.
        len: usize,
    },

    /// AEAD verification failed for a message (wrong key or tampered data).
    #[error("message decryption failed with key {key_id}: authentication tag mismatch")]
    Decryption {
        /// Identifier of the key that was tried.
        key_id: String,
    },

    /// The key store file could not be opened with the given passphrase.
    #[error("failed to decrypt key store {}: wrong passphrase or corrupted file", path.display())]
    KeyStoreDecryption {
        /// Key store path.
        path: PathBuf,
    },

    /// AEAD encryption failed.
    #[error("encryption failed with key {key_id}")]
    Encryption {
        /// Identifier of the key in use.
        key_id: String,
    },

    /// Encryption produced no ciphertext; such a payload is never sent.
    #[error("encryption produced an empty ciphertext")]
    EmptyCiphertext,

    /// The out-of-band shared secret is not 32 bytes of base64.
    #[error("invalid shared secret: {0}")]
    InvalidSharedSecret(String),

    /// A wire payload was not valid base64.
    #[error("invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),

    /// The encrypt/decrypt self-test did not reproduce its plaintext.
    #[error("encryption self-test failed: {0}")]
    SelfTest(String),

    /// Reading or writing the key store file failed.
    #[error("key store I/O error at {}: {source}", path.display())]
    Io {
        /// Path that was accessed.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The decrypted key store document could not be encoded or parsed.
    #[error("key store serialization error: {0}")]
    Serialization(String),
}
