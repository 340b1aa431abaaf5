//! Events delivered from the session to its consumer.

use std::time::Duration;

use chrono::{DateTime, Utc};
use sealchat_proto::message::MessageKind;
use tokio::sync::mpsc;

/// Shown in place of a message body that could not be decrypted.
pub const UNDECRYPTABLE_PLACEHOLDER: &str = "[unable to decrypt message]";

/// Everything the session reports to the UI layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The handshake probe succeeded; the session is live.
    Connected,
    /// The connection was lost; another attempt follows after `delay`.
    Reconnecting {
        /// 1-based count of consecutive failures.
        attempt: u32,
        /// Wait before the next attempt.
        delay: Duration,
    },
    /// The server rejected this client for good. No reconnect follows.
    Fatal {
        /// Human-readable cause.
        reason: String,
    },
    /// A chat message from another participant.
    Message(ReceivedMessage),
    /// Current list of connected usernames.
    UserList(Vec<String>),
    /// The server rejected an admin credential or command.
    AuthFailed(String),
    /// Informational text from the server.
    Notice(String),
    /// Something degraded but the session continues.
    Warning(String),
    /// A local operation failed.
    Error(String),
}

/// A decoded inbound chat message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    /// Username as attested by the server.
    pub sender: String,
    /// Sender's creation time.
    pub created_at: DateTime<Utc>,
    /// Message kind.
    pub kind: MessageKind,
    /// Text content, or why it could not be read.
    pub body: Body,
    /// Attached file, if any.
    pub file: Option<ReceivedFile>,
}

/// Readable message content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    /// Plaintext, either sent in the clear or successfully decrypted.
    Plain(String),
    /// The payload was flagged encrypted and did not decrypt.
    Undecryptable {
        /// Error text, for logs or a details view.
        reason: String,
    },
}

impl Body {
    /// Text to display: the plaintext or [`UNDECRYPTABLE_PLACEHOLDER`].
    #[must_use]
    pub fn display_text(&self) -> &str {
        match self {
            Self::Plain(text) => text,
            Self::Undecryptable { .. } => UNDECRYPTABLE_PLACEHOLDER,
        }
    }

    /// Whether decryption failed.
    #[must_use]
    pub const fn is_undecryptable(&self) -> bool {
        matches!(self, Self::Undecryptable { .. })
    }
}

/// A received file attachment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFile {
    /// Original file name.
    pub filename: String,
    /// Declared plaintext size.
    pub size: u64,
    /// Plaintext bytes; `None` when decryption failed.
    pub data: Option<Vec<u8>>,
}

/// Producer half of the event queue. Never blocks.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::Sender<SessionEvent>,
}

impl EventSink {
    /// Queue `event`; if the queue is full or closed the event is dropped
    /// and logged. Returns whether it was queued.
    pub fn emit(&self, event: SessionEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(event)) => {
                tracing::warn!(?event, "event queue full, failed to deliver");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!("event queue closed, consumer gone");
                false
            }
        }
    }
}

/// Bounded event queue of `capacity` entries.
#[must_use]
pub fn channel(capacity: usize) -> (EventSink, mpsc::Receiver<SessionEvent>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (EventSink { tx }, rx)
}
