//! `SealChat` terminal chat client library.
//!
//! The client keeps one resilient WebSocket session to a `SealChat`
//! server and encrypts every chat payload with a room-wide key held in a
//! passphrase-protected key store.

pub mod config;
pub mod crypto;
pub mod session;
