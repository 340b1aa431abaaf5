//! JSON encoding and the single classification step for inbound frames.
//!
//! [`decode_inbound`] turns a raw text frame into one of the closed set of
//! [`Inbound`] variants. A frame is first tried as a [`ChatMessage`] (it
//! must carry a non-empty sender), then as an [`Envelope`] routed by its
//! tag. Anything else is a [`CodecError`].

use serde::Serialize;

use crate::envelope::{AUTH_FAILED_TAG, Envelope, NOTICE_TAG, USERLIST_TAG};
use crate::message::{ChatMessage, Handshake};

/// Error type for codec encode/decode operations.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),
    /// The frame matches neither the chat-message nor the envelope shape.
    #[error("unrecognized frame")]
    Unrecognized,
    /// The frame is an envelope with a tag this side does not handle.
    #[error("unknown envelope type {0:?}")]
    UnknownEnvelope(String),
    /// A known envelope carried a payload of the wrong shape.
    #[error("malformed {tag} payload: {reason}")]
    MalformedPayload {
        /// Envelope tag.
        tag: String,
        /// What was wrong.
        reason: String,
    },
}

/// A decoded server-to-client frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// A chat message from another participant.
    Chat(ChatMessage),
    /// The current list of connected usernames.
    UserList(Vec<String>),
    /// An admin credential or command was rejected.
    AuthFailed(String),
    /// Informational text from the server.
    Notice(String),
}

/// Serializes any protocol value to a JSON text frame.
///
/// # Errors
///
/// Returns [`CodecError::Serialization`] if the value cannot be serialized.
pub fn encode<T: Serialize>(value: &T) -> Result<String, CodecError> {
    serde_json::to_string(value).map_err(|e| CodecError::Serialization(e.to_string()))
}

/// Parses the client's opening frame.
///
/// # Errors
///
/// Returns [`CodecError::Serialization`] if the text is not a handshake.
pub fn decode_handshake(text: &str) -> Result<Handshake, CodecError> {
    serde_json::from_str(text).map_err(|e| CodecError::Serialization(e.to_string()))
}

/// Parses a client-to-server chat frame.
///
/// # Errors
///
/// Returns [`CodecError::Serialization`] if the text is not a chat message.
pub fn decode_chat(text: &str) -> Result<ChatMessage, CodecError> {
    serde_json::from_str(text).map_err(|e| CodecError::Serialization(e.to_string()))
}

/// Classifies a server-to-client frame.
///
/// # Errors
///
/// - [`CodecError::Unrecognized`] if the frame is neither shape.
/// - [`CodecError::UnknownEnvelope`] for an envelope with an unhandled tag.
/// - [`CodecError::MalformedPayload`] if a known envelope has bad `data`.
pub fn decode_inbound(text: &str) -> Result<Inbound, CodecError> {
    if let Ok(chat) = serde_json::from_str::<ChatMessage>(text)
        && !chat.sender.is_empty()
    {
        return Ok(Inbound::Chat(chat));
    }

    let envelope: Envelope = serde_json::from_str(text).map_err(|_| CodecError::Unrecognized)?;
    route_envelope(envelope)
}

fn route_envelope(envelope: Envelope) -> Result<Inbound, CodecError> {
    match envelope.kind.as_str() {
        USERLIST_TAG => serde_json::from_value::<Vec<String>>(envelope.data)
            .map(Inbound::UserList)
            .map_err(|e| CodecError::MalformedPayload {
                tag: USERLIST_TAG.to_string(),
                reason: e.to_string(),
            }),
        AUTH_FAILED_TAG => Ok(Inbound::AuthFailed(payload_text(&envelope.data))),
        NOTICE_TAG => Ok(Inbound::Notice(payload_text(&envelope.data))),
        other => Err(CodecError::UnknownEnvelope(other.to_string())),
    }
}

/// Renders a string payload, falling back to the JSON text for other shapes.
fn payload_text(data: &serde_json::Value) -> String {
    match data {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}
