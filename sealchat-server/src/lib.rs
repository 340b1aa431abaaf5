//! `SealChat` server library.
//!
//! Exposes the server for use in tests and embedding. The server accepts
//! WebSocket connections, validates the opening handshake, and fans chat
//! frames out to every other connected client without decrypting them.

pub mod config;
pub mod server;
