//! Message payload encryption and its wire framing.
//!
//! On the wire an encrypted payload is `base64(nonce || ciphertext)` where
//! the nonce is [`NONCE_SIZE`] bytes and the ciphertext includes the
//! 16-byte GCM tag. Every call to [`encrypt`] draws a fresh random nonce.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use rand_core::{OsRng, RngCore};
use sealchat_proto::message::MessageKind;

use super::key::GlobalKey;
use super::{CryptoError, NONCE_SIZE};

/// Plaintext used by [`self_test`].
const SELF_TEST_PLAINTEXT: &[u8] = b"sealchat encryption self-test";

/// An encrypted payload plus the metadata that travels with it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedMessage {
    /// Username of the author.
    pub sender: String,
    /// When the payload was encrypted.
    pub created_at: DateTime<Utc>,
    /// Nonce used for this payload only.
    pub nonce: [u8; NONCE_SIZE],
    /// AEAD output, tag included. Never empty.
    pub ciphertext: Vec<u8>,
    /// Always `true` for values produced by [`encrypt`].
    pub encrypted: bool,
    /// Kind of the message carrying this payload.
    pub kind: MessageKind,
}

impl EncryptedMessage {
    /// `nonce || ciphertext`.
    #[must_use]
    pub fn to_wire_bytes(&self) -> Vec<u8> {
        let mut blob = Vec::with_capacity(NONCE_SIZE + self.ciphertext.len());
        blob.extend_from_slice(&self.nonce);
        blob.extend_from_slice(&self.ciphertext);
        blob
    }

    /// Rebuild from a raw `nonce || ciphertext` blob.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::CiphertextTooShort`] if the blob cannot hold
    /// a nonce.
    pub fn from_wire_bytes(
        sender: impl Into<String>,
        created_at: DateTime<Utc>,
        kind: MessageKind,
        blob: &[u8],
    ) -> Result<Self, CryptoError> {
        let (nonce, ciphertext) = split_blob(blob)?;
        Ok(Self {
            sender: sender.into(),
            created_at,
            nonce,
            ciphertext: ciphertext.to_vec(),
            encrypted: true,
            kind,
        })
    }

    /// Rebuild from the base64 `content` field.
    ///
    /// # Errors
    ///
    /// - [`CryptoError::Base64`] if the text is not base64.
    /// - [`CryptoError::CiphertextTooShort`] if the decoded blob is too short.
    pub fn from_wire_string(
        sender: impl Into<String>,
        created_at: DateTime<Utc>,
        kind: MessageKind,
        encoded: &str,
    ) -> Result<Self, CryptoError> {
        let (nonce, ciphertext) = decode_wire(encoded)?;
        Ok(Self {
            sender: sender.into(),
            created_at,
            nonce,
            ciphertext,
            encrypted: true,
            kind,
        })
    }
}

/// `base64(nonce || ciphertext)`, the value placed in `content`.
#[must_use]
pub fn encode_wire(message: &EncryptedMessage) -> String {
    STANDARD.encode(message.to_wire_bytes())
}

/// Reverse of [`encode_wire`].
///
/// # Errors
///
/// - [`CryptoError::Base64`] if the text is not base64.
/// - [`CryptoError::CiphertextTooShort`] if the decoded blob is too short.
pub fn decode_wire(encoded: &str) -> Result<([u8; NONCE_SIZE], Vec<u8>), CryptoError> {
    let blob = STANDARD.decode(encoded.trim())?;
    let (nonce, ciphertext) = split_blob(&blob)?;
    Ok((nonce, ciphertext.to_vec()))
}

/// Split `nonce || ciphertext`.
///
/// # Errors
///
/// Returns [`CryptoError::CiphertextTooShort`] for blobs under
/// [`NONCE_SIZE`] bytes.
pub fn split_blob(blob: &[u8]) -> Result<([u8; NONCE_SIZE], &[u8]), CryptoError> {
    if blob.len() < NONCE_SIZE {
        return Err(CryptoError::CiphertextTooShort { len: blob.len() });
    }
    let (nonce_bytes, ciphertext) = blob.split_at(NONCE_SIZE);
    let mut nonce = [0u8; NONCE_SIZE];
    nonce.copy_from_slice(nonce_bytes);
    Ok((nonce, ciphertext))
}

/// Encrypt `plaintext` under `key` with a fresh random nonce.
///
/// # Errors
///
/// - [`CryptoError::Encryption`] if the AEAD primitive fails.
/// - [`CryptoError::EmptyCiphertext`] if the output is empty.
pub fn encrypt(
    sender: &str,
    kind: MessageKind,
    plaintext: &[u8],
    key: &GlobalKey,
) -> Result<EncryptedMessage, CryptoError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));

    let mut nonce = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce);

    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| CryptoError::Encryption {
            key_id: key.key_id().to_string(),
        })?;
    if ciphertext.is_empty() {
        return Err(CryptoError::EmptyCiphertext);
    }

    Ok(EncryptedMessage {
        sender: sender.to_string(),
        created_at: Utc::now(),
        nonce,
        ciphertext,
        encrypted: true,
        kind,
    })
}

/// Decrypt and verify a payload.
///
/// # Errors
///
/// Returns [`CryptoError::Decryption`] on tag mismatch, including when the
/// payload was encrypted under a different key.
pub fn decrypt(message: &EncryptedMessage, key: &GlobalKey) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));
    cipher
        .decrypt(Nonce::from_slice(&message.nonce), message.ciphertext.as_slice())
        .map_err(|_| CryptoError::Decryption {
            key_id: key.key_id().to_string(),
        })
}

/// Encrypt then decrypt a known plaintext and compare.
///
/// # Errors
///
/// Returns [`CryptoError::SelfTest`] if the round trip does not reproduce
/// the plaintext, or the underlying error if either step fails.
pub fn self_test(key: &GlobalKey) -> Result<(), CryptoError> {
    let sealed = encrypt("self-test", MessageKind::Text, SELF_TEST_PLAINTEXT, key)?;
    let wire = encode_wire(&sealed);
    let reopened =
        EncryptedMessage::from_wire_string("self-test", sealed.created_at, sealed.kind, &wire)?;
    let plaintext = decrypt(&reopened, key)?;
    if plaintext != SELF_TEST_PLAINTEXT {
        return Err(CryptoError::SelfTest(format!(
            "round trip returned {} bytes that differ from the input",
            plaintext.len()
        )));
    }
    Ok(())
}
