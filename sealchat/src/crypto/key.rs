//! The room-wide symmetric key.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use rand_core::{OsRng, RngCore};
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::{CryptoError, KEY_SIZE};

/// A 32-byte AES-256-GCM key shared by everyone in the room.
///
/// The key bytes are zeroized on drop. The identifier is the hex encoding
/// of the first 8 bytes of `SHA-256(key)`, safe to log.
#[derive(Clone, ZeroizeOnDrop)]
pub struct GlobalKey {
    bytes: [u8; KEY_SIZE],
    #[zeroize(skip)]
    key_id: String,
    #[zeroize(skip)]
    created_at: DateTime<Utc>,
}

impl GlobalKey {
    /// Generate a fresh key from the OS CSPRNG.
    #[must_use]
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        OsRng.fill_bytes(&mut bytes);
        let key = Self::from_bytes(bytes, Utc::now());
        bytes.zeroize();
        key
    }

    /// Wrap existing key bytes.
    #[must_use]
    pub fn from_bytes(bytes: [u8; KEY_SIZE], created_at: DateTime<Utc>) -> Self {
        Self {
            key_id: key_id_for(&bytes),
            bytes,
            created_at,
        }
    }

    /// Import a key from the out-of-band base64 shared secret.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidSharedSecret`] if the value is not
    /// base64 or does not decode to exactly 32 bytes.
    pub fn from_shared_secret(encoded: &str) -> Result<Self, CryptoError> {
        let mut decoded = STANDARD
            .decode(encoded.trim())
            .map_err(|e| CryptoError::InvalidSharedSecret(format!("not valid base64: {e}")))?;
        if decoded.len() != KEY_SIZE {
            let len = decoded.len();
            decoded.zeroize();
            return Err(CryptoError::InvalidSharedSecret(format!(
                "decoded to {len} bytes, expected {KEY_SIZE}"
            )));
        }
        let mut bytes = [0u8; KEY_SIZE];
        bytes.copy_from_slice(&decoded);
        decoded.zeroize();
        let key = Self::from_bytes(bytes, Utc::now());
        bytes.zeroize();
        Ok(key)
    }

    /// Raw key bytes. Only the crypto layer should need these.
    #[must_use]
    pub(crate) const fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }

    /// Short, non-secret identifier for logs and error messages.
    #[must_use]
    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    /// When the key was generated or imported.
    #[must_use]
    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

impl PartialEq for GlobalKey {
    fn eq(&self, other: &Self) -> bool {
        self.bytes == other.bytes
    }
}

impl Eq for GlobalKey {}

impl std::fmt::Debug for GlobalKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GlobalKey")
            .field("key_id", &self.key_id)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

fn key_id_for(bytes: &[u8; KEY_SIZE]) -> String {
    use std::fmt::Write;
    let digest = Sha256::digest(bytes);
    digest[..8].iter().fold(String::new(), |mut output, b| {
        let _ = write!(output, "{b:02x}");
        output
    })
}
