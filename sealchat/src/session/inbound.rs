//! Inbound frame dispatch.
//!
//! Each text frame is classified once by [`codec::decode_inbound`] and the
//! resulting variant is turned into a [`SessionEvent`]. Encrypted chat
//! payloads are opened with the key store; a payload that fails to open is
//! still delivered, marked [`Body::Undecryptable`].

use sealchat_proto::codec::{self, Inbound};
use sealchat_proto::message::ChatMessage;

use super::events::{Body, EventSink, ReceivedFile, ReceivedMessage, SessionEvent};
use crate::crypto::cipher::EncryptedMessage;
use crate::crypto::keystore::KeyStore;

/// Classify `frame` and emit the matching event. Unrecognized frames are
/// logged and dropped.
pub fn dispatch(frame: &str, keys: &KeyStore, events: &EventSink) {
    let inbound = match codec::decode_inbound(frame) {
        Ok(inbound) => inbound,
        Err(e) => {
            tracing::warn!(error = %e, len = frame.len(), "discarding unrecognized frame");
            return;
        }
    };

    let event = match inbound {
        Inbound::Chat(message) => SessionEvent::Message(open_message(message, keys)),
        Inbound::UserList(users) => SessionEvent::UserList(users),
        Inbound::AuthFailed(reason) => {
            tracing::warn!(reason = %reason, "server rejected admin credentials");
            SessionEvent::AuthFailed(reason)
        }
        Inbound::Notice(text) => SessionEvent::Notice(text),
    };
    events.emit(event);
}

/// Decrypt a chat message if it is flagged encrypted.
pub fn open_message(message: ChatMessage, keys: &KeyStore) -> ReceivedMessage {
    let ChatMessage {
        sender,
        content,
        created_at,
        kind,
        encrypted,
        file,
    } = message;

    if !encrypted {
        return ReceivedMessage {
            sender,
            created_at,
            kind,
            body: Body::Plain(content),
            file: file.map(|f| ReceivedFile {
                filename: f.filename,
                size: f.size,
                data: Some(f.data),
            }),
        };
    }

    let opened = EncryptedMessage::from_wire_string(sender.as_str(), created_at, kind, &content)
        .and_then(|sealed| keys.decrypt(&sealed));
    let body = match opened {
        Ok(plaintext) => Body::Plain(String::from_utf8_lossy(&plaintext).into_owned()),
        Err(e) => {
            let key_id = keys
                .global_key()
                .map_or_else(|| "none".to_string(), |k| k.key_id().to_string());
            tracing::warn!(
                sender = %sender,
                key_id = %key_id,
                error = %e,
                "could not decrypt received message"
            );
            Body::Undecryptable {
                reason: e.to_string(),
            }
        }
    };

    // Senders leave the attachment name empty and seal it in `content`.
    let file = file.map(|mut f| {
        if f.filename.is_empty()
            && let Body::Plain(caption) = &body
        {
            f.filename.clone_from(caption);
        }
        let data = EncryptedMessage::from_wire_bytes(sender.as_str(), created_at, kind, &f.data)
            .and_then(|sealed| keys.decrypt(&sealed));
        match data {
            Ok(bytes) => ReceivedFile {
                filename: f.filename,
                size: f.size,
                data: Some(bytes),
            },
            Err(e) => {
                tracing::warn!(
                    sender = %sender,
                    filename = %f.filename,
                    error = %e,
                    "could not decrypt received file"
                );
                ReceivedFile {
                    filename: f.filename,
                    size: f.size,
                    data: None,
                }
            }
        }
    });

    ReceivedMessage {
        sender,
        created_at,
        kind,
        body,
        file,
    }
}
