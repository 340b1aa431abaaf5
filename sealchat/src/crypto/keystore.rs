//! Passphrase-protected storage for the [`GlobalKey`].
//!
//! The file on disk is `nonce(12) || AES-256-GCM(wrapping_key, document)`
//! where `wrapping_key = SHA-256(passphrase)` and `document` is the JSON
//!
//! ```json
//! { "global_key": { "key": "<base64>", "key_id": "...", "created_at": "..." },
//!   "version": 1 }
//! ```
//!
//! A wrong passphrase fails the GCM tag check, so it can never yield a
//! different-but-plausible key.
//!
//! Every read of the active key and every load/save goes through one
//! [`parking_lot::RwLock`]. Disk I/O may run under the lock; network I/O
//! must not, which is why callers get either a closure scope
//! ([`KeyStore::with_key`]) or a clone ([`KeyStore::global_key`]).

use std::io::Write;
use std::path::{Path, PathBuf};

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rand_core::{OsRng, RngCore};
use sealchat_proto::message::MessageKind;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, Zeroizing};

use super::cipher::{self, EncryptedMessage};
use super::key::GlobalKey;
use super::{CryptoError, KEY_SIZE, NONCE_SIZE};

/// Version written into, and required from, the key store document.
pub const KEYSTORE_VERSION: u32 = 1;

/// File name used under the per-user config directory.
pub const KEYSTORE_FILE_NAME: &str = "keystore.bin";

#[derive(Serialize, Deserialize)]
struct StoredKey {
    key: String,
    key_id: String,
    created_at: DateTime<Utc>,
}

impl Drop for StoredKey {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

#[derive(Serialize, Deserialize)]
struct KeyStoreDocument {
    global_key: StoredKey,
    version: u32,
}

/// Holds the session's single [`GlobalKey`] and its encrypted file.
#[derive(Debug)]
pub struct KeyStore {
    path: PathBuf,
    key: RwLock<Option<GlobalKey>>,
}

impl KeyStore {
    /// Create an uninitialized store backed by `path`. Nothing is read yet.
    #[must_use]
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            key: RwLock::new(None),
        }
    }

    /// `<config_dir>/sealchat/keystore.bin`, if a config directory exists.
    #[must_use]
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("sealchat").join(KEYSTORE_FILE_NAME))
    }

    /// Path of the backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Make a key active for this session.
    ///
    /// A `shared_secret` always wins: it is decoded, activated and then
    /// written to the file so the on-disk copy matches. A failed write in
    /// that case is logged and ignored. Without a shared secret, a missing
    /// file means a fresh key is generated and saved, and an existing file
    /// is loaded.
    ///
    /// # Errors
    ///
    /// - [`CryptoError::InvalidSharedSecret`] for a malformed shared secret.
    /// - [`CryptoError::KeyStoreDecryption`] for a wrong passphrase.
    /// - [`CryptoError::CiphertextTooShort`] for a truncated file.
    /// - [`CryptoError::Io`] / [`CryptoError::Serialization`] otherwise.
    pub fn initialize(
        &self,
        passphrase: &str,
        shared_secret: Option<&str>,
    ) -> Result<GlobalKey, CryptoError> {
        if let Some(secret) = shared_secret {
            let key = GlobalKey::from_shared_secret(secret)?;
            let mut guard = self.key.write();
            *guard = Some(key.clone());
            if let Err(e) = self.write_file(passphrase, &key) {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %e,
                    "could not persist shared key; continuing with it in memory"
                );
            }
            drop(guard);
            tracing::info!(key_id = %key.key_id(), "using shared key from environment");
            return Ok(key);
        }

        match self.load(passphrase) {
            Ok(key) => Ok(key),
            Err(CryptoError::Io { source, .. })
                if source.kind() == std::io::ErrorKind::NotFound =>
            {
                let key = GlobalKey::generate();
                let mut guard = self.key.write();
                self.write_file(passphrase, &key)?;
                *guard = Some(key.clone());
                drop(guard);
                tracing::info!(
                    key_id = %key.key_id(),
                    path = %self.path.display(),
                    "generated new global key"
                );
                Ok(key)
            }
            Err(e) => Err(e),
        }
    }

    /// Decrypt the file with `passphrase` and make its key active.
    ///
    /// # Errors
    ///
    /// - [`CryptoError::Io`] if the file cannot be read (including not found).
    /// - [`CryptoError::CiphertextTooShort`] if the file is under 12 bytes.
    /// - [`CryptoError::KeyStoreDecryption`] if the passphrase is wrong or
    ///   the file was tampered with.
    /// - [`CryptoError::Serialization`] if the document is malformed or has
    ///   an unsupported version.
    pub fn load(&self, passphrase: &str) -> Result<GlobalKey, CryptoError> {
        let mut guard = self.key.write();

        let blob = std::fs::read(&self.path).map_err(|source| CryptoError::Io {
            path: self.path.clone(),
            source,
        })?;
        let (nonce, ciphertext) = cipher::split_blob(&blob)?;

        let wrapping = wrapping_key(passphrase);
        let plaintext = Zeroizing::new(
            Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(wrapping.as_slice()))
                .decrypt(Nonce::from_slice(&nonce), ciphertext)
                .map_err(|_| CryptoError::KeyStoreDecryption {
                    path: self.path.clone(),
                })?,
        );

        let key = parse_document(&plaintext)?;
        *guard = Some(key.clone());
        drop(guard);

        tracing::debug!(key_id = %key.key_id(), "loaded global key from key store");
        Ok(key)
    }

    /// Encrypt the active key under `passphrase` and write it to disk.
    ///
    /// # Errors
    ///
    /// - [`CryptoError::NoKey`] if the store is uninitialized.
    /// - [`CryptoError::Io`] / [`CryptoError::Serialization`] on failure.
    pub fn save(&self, passphrase: &str) -> Result<(), CryptoError> {
        let guard = self.key.write();
        let key = guard.as_ref().ok_or(CryptoError::NoKey)?;
        self.write_file(passphrase, key)
    }

    /// Clone of the active key, or `None` before initialization.
    #[must_use]
    pub fn global_key(&self) -> Option<GlobalKey> {
        self.key.read().clone()
    }

    /// Whether a key is active.
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.key.read().is_some()
    }

    /// Run `f` with the active key while holding the read lock.
    ///
    /// `f` must not perform network I/O.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::NoKey`] if the store is uninitialized, or
    /// whatever `f` returns.
    pub fn with_key<T>(
        &self,
        f: impl FnOnce(&GlobalKey) -> Result<T, CryptoError>,
    ) -> Result<T, CryptoError> {
        let guard = self.key.read();
        let key = guard.as_ref().ok_or(CryptoError::NoKey)?;
        f(key)
    }

    /// [`cipher::encrypt`] with the active key.
    ///
    /// # Errors
    ///
    /// [`CryptoError::NoKey`] or any error from [`cipher::encrypt`].
    pub fn encrypt(
        &self,
        sender: &str,
        kind: MessageKind,
        plaintext: &[u8],
    ) -> Result<EncryptedMessage, CryptoError> {
        self.with_key(|key| cipher::encrypt(sender, kind, plaintext, key))
    }

    /// [`cipher::decrypt`] with the active key.
    ///
    /// # Errors
    ///
    /// [`CryptoError::NoKey`] or [`CryptoError::Decryption`].
    pub fn decrypt(&self, message: &EncryptedMessage) -> Result<Vec<u8>, CryptoError> {
        self.with_key(|key| cipher::decrypt(message, key))
    }

    /// [`cipher::self_test`] with the active key.
    ///
    /// # Errors
    ///
    /// [`CryptoError::NoKey`] or the self-test failure.
    pub fn self_test(&self) -> Result<(), CryptoError> {
        self.with_key(cipher::self_test)
    }

    /// Serialize, encrypt and atomically replace the file.
    ///
    /// Callers hold the write lock.
    fn write_file(&self, passphrase: &str, key: &GlobalKey) -> Result<(), CryptoError> {
        let document = KeyStoreDocument {
            global_key: StoredKey {
                key: STANDARD.encode(key.as_bytes()),
                key_id: key.key_id().to_string(),
                created_at: key.created_at(),
            },
            version: KEYSTORE_VERSION,
        };
        let json = Zeroizing::new(
            serde_json::to_vec(&document)
                .map_err(|e| CryptoError::Serialization(e.to_string()))?,
        );

        let mut nonce = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce);
        let wrapping = wrapping_key(passphrase);
        let ciphertext = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(wrapping.as_slice()))
            .encrypt(Nonce::from_slice(&nonce), json.as_slice())
            .map_err(|_| CryptoError::Encryption {
                key_id: key.key_id().to_string(),
            })?;

        let mut blob = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&ciphertext);
        write_atomic(&self.path, &blob)
    }
}

fn wrapping_key(passphrase: &str) -> Zeroizing<[u8; KEY_SIZE]> {
    let mut out = Zeroizing::new([0u8; KEY_SIZE]);
    out.copy_from_slice(&Sha256::digest(passphrase.as_bytes()));
    out
}

fn parse_document(plaintext: &[u8]) -> Result<GlobalKey, CryptoError> {
    let document: KeyStoreDocument = serde_json::from_slice(plaintext)
        .map_err(|e| CryptoError::Serialization(e.to_string()))?;
    if document.version != KEYSTORE_VERSION {
        return Err(CryptoError::Serialization(format!(
            "unsupported key store version {} (expected {KEYSTORE_VERSION})",
            document.version
        )));
    }

    let decoded = Zeroizing::new(
        STANDARD
            .decode(&document.global_key.key)
            .map_err(|e| CryptoError::Serialization(format!("stored key is not base64: {e}")))?,
    );
    if decoded.len() != KEY_SIZE {
        return Err(CryptoError::Serialization(format!(
            "stored key is {} bytes, expected {KEY_SIZE}",
            decoded.len()
        )));
    }
    let mut bytes = Zeroizing::new([0u8; KEY_SIZE]);
    bytes.copy_from_slice(&decoded);

    let key = GlobalKey::from_bytes(*bytes, document.global_key.created_at);
    if key.key_id() != document.global_key.key_id {
        tracing::warn!(
            stored = %document.global_key.key_id,
            computed = %key.key_id(),
            "key store key id does not match key bytes"
        );
    }
    Ok(key)
}

/// Write `<path>.tmp` with owner-only permissions, then rename over `path`.
fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), CryptoError> {
    let io_err = |source| CryptoError::Io {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).map_err(io_err)?;
    }

    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp_path = PathBuf::from(tmp_name);

    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options.open(&tmp_path).map_err(io_err)?;
    file.write_all(contents).map_err(io_err)?;
    file.sync_all().map_err(io_err)?;
    drop(file);

    std::fs::rename(&tmp_path, path).map_err(io_err)
}
