//! Wire format message types for the `SealChat` protocol.
//!
//! Field names follow the JSON shapes on the wire (`createdAt`, `adminKey`,
//! `type`), so the serde attributes here are part of the protocol.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Substring of the close reason the server sends when a username is
/// already connected. Clients treat it as a fatal, non-retryable rejection.
pub const DUPLICATE_USERNAME_REASON: &str = "username already taken";

/// Close code that accompanies [`DUPLICATE_USERNAME_REASON`].
pub const DUPLICATE_USERNAME_CLOSE_CODE: u16 = 4001;

/// First frame a client sends after the WebSocket opens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Handshake {
    /// Display name; must be unique among connected clients.
    pub username: String,
    /// Whether the client requests administrator rights.
    #[serde(default)]
    pub admin: bool,
    /// Admin secret, only present when `admin` is set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin_key: Option<String>,
}

impl Handshake {
    /// Builds a handshake, dropping the admin key unless `admin` is set.
    #[must_use]
    pub fn new(username: impl Into<String>, admin: bool, admin_key: Option<String>) -> Self {
        Self {
            username: username.into(),
            admin,
            admin_key: if admin { admin_key } else { None },
        }
    }
}

/// What a [`ChatMessage`] carries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MessageKind {
    /// Plain chat text.
    #[default]
    Text,
    /// A file transfer; see [`ChatMessage::file`].
    File,
    /// A command processed by the server. Never encrypted.
    AdminCommand,
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text => write!(f, "text"),
            Self::File => write!(f, "file"),
            Self::AdminCommand => write!(f, "adminCommand"),
        }
    }
}

/// File payload attached to a [`MessageKind::File`] message.
///
/// When the owning message is encrypted, `data` holds `nonce || ciphertext`
/// of the file contents rather than the raw bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileAttachment {
    /// Original file name.
    pub filename: String,
    /// Size of the plaintext file in bytes.
    pub size: u64,
    /// File bytes, base64 in JSON.
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

/// A chat frame as it travels over the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    /// Username of the author. The server overwrites it on relay.
    #[serde(default)]
    pub sender: String,
    /// Text, or `base64(nonce || ciphertext)` when `encrypted` is set.
    #[serde(default)]
    pub content: String,
    /// Creation time on the sending client.
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    /// Message kind.
    #[serde(rename = "type", default)]
    pub kind: MessageKind,
    /// Whether `content` (and `file.data`) are ciphertext.
    #[serde(default)]
    pub encrypted: bool,
    /// Attached file, for [`MessageKind::File`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<FileAttachment>,
}

impl ChatMessage {
    /// Creates an unencrypted text message stamped with the current time.
    #[must_use]
    pub fn text(sender: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            sender: sender.into(),
            content: content.into(),
            created_at: Utc::now(),
            kind: MessageKind::Text,
            encrypted: false,
            file: None,
        }
    }

    /// Creates an administrative command. These are never encrypted.
    #[must_use]
    pub fn admin_command(sender: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            kind: MessageKind::AdminCommand,
            ..Self::text(sender, command)
        }
    }
}

/// Serde adapter encoding `Vec<u8>` as standard base64.
mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}
