//! Shared protocol definitions for the `SealChat` wire format.
//!
//! Every frame on the wire is a JSON text message. Clients open with a
//! [`message::Handshake`], then exchange [`message::ChatMessage`]s; the
//! server additionally emits [`envelope::Envelope`] control frames.

pub mod codec;
pub mod envelope;
pub mod message;
