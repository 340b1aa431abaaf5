// Test-specific lint overrides: integration tests use unwrap/expect freely,
// and some pedantic/nursery lints are not appropriate for test code.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::doc_markdown,
    clippy::future_not_send,
    clippy::missing_panics_doc,
    clippy::missing_errors_doc
)]

//! End-to-end encryption through a real server.
//!
//! Two sessions loaded with the same shared key exchange text and files;
//! a raw WebSocket observer confirms the server only ever relays
//! ciphertext; a session holding a different key sees the placeholder
//! instead of failing.

use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use futures_util::{SinkExt, StreamExt};
use sealchat::crypto::keystore::KeyStore;
use sealchat::session::events::UNDECRYPTABLE_PLACEHOLDER;
use sealchat::session::{Body, SessionConfig, SessionEvent, SessionHandle, spawn_session};
use sealchat_proto::codec::{self, Inbound};
use sealchat_proto::message::{Handshake, MessageKind};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;

// =============================================================================
// Helpers
// =============================================================================

async fn start_server() -> String {
    let (addr, _handle) = sealchat_server::server::start_server("127.0.0.1:0")
        .await
        .expect("failed to start server");
    format!("ws://{addr}/ws")
}

fn shared_secret(byte: u8) -> String {
    STANDARD.encode([byte; 32])
}

/// A key store in its own scratch directory, loaded with `secret`.
fn key_store(tag: &str, secret: &str) -> Arc<KeyStore> {
    let dir = std::env::temp_dir().join(format!("sealchat-e2e-{}-{tag}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    let store = KeyStore::open(dir.join("keystore.bin"));
    store.initialize("test-passphrase", Some(secret)).unwrap();
    Arc::new(store)
}

fn session_config(url: &str, username: &str) -> SessionConfig {
    SessionConfig {
        grace_period: Duration::from_millis(50),
        ..SessionConfig::new(url, username)
    }
}

/// Start a session and wait until it reports `Connected`.
async fn connect(
    config: SessionConfig,
    keys: Arc<KeyStore>,
) -> (SessionHandle, mpsc::Receiver<SessionEvent>) {
    let (handle, mut rx) = spawn_session(config, keys);
    wait_for(&mut rx, |e| matches!(e, SessionEvent::Connected)).await;
    (handle, rx)
}

/// Wait for the first event matching `pred`, skipping others.
async fn wait_for(
    rx: &mut mpsc::Receiver<SessionEvent>,
    pred: impl Fn(&SessionEvent) -> bool,
) -> SessionEvent {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let event = tokio::time::timeout_at(deadline, rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed");
        if pred(&event) {
            return event;
        }
    }
}

async fn wait_for_message(rx: &mut mpsc::Receiver<SessionEvent>) -> sealchat::session::ReceivedMessage {
    match wait_for(rx, |e| matches!(e, SessionEvent::Message(_))).await {
        SessionEvent::Message(m) => m,
        _ => unreachable!(),
    }
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test]
async fn shared_key_text_round_trip() {
    let url = start_server().await;
    let secret = shared_secret(7);

    let (alice, _alice_rx) = connect(session_config(&url, "alice"), key_store("rt-alice", &secret)).await;
    let (bob, mut bob_rx) = connect(session_config(&url, "bob"), key_store("rt-bob", &secret)).await;

    alice.send_text("hello bob").await.unwrap();

    let msg = wait_for_message(&mut bob_rx).await;
    assert_eq!(msg.sender, "alice");
    assert_eq!(msg.kind, MessageKind::Text);
    assert_eq!(msg.body, Body::Plain("hello bob".to_string()));

    alice.shutdown().await;
    bob.shutdown().await;
}

#[tokio::test]
async fn server_only_relays_ciphertext() {
    let url = start_server().await;
    let secret = shared_secret(9);

    // A bare WebSocket client sees exactly what the server forwards.
    let (mut eve, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    let hello = codec::encode(&Handshake::new("eve", false, None)).unwrap();
    eve.send(tungstenite::Message::Text(hello.into())).await.unwrap();

    let (alice, _alice_rx) = connect(session_config(&url, "alice"), key_store("ct-alice", &secret)).await;
    alice.send_text("top secret").await.unwrap();

    let chat = loop {
        let frame = tokio::time::timeout(Duration::from_secs(10), eve.next())
            .await
            .expect("timed out")
            .expect("stream ended")
            .unwrap();
        if let tungstenite::Message::Text(text) = frame
            && let Ok(Inbound::Chat(chat)) = codec::decode_inbound(text.as_str())
        {
            break chat;
        }
    };

    assert_eq!(chat.sender, "alice");
    assert!(chat.encrypted);
    assert!(!chat.content.contains("top secret"));
    // nonce (12) + plaintext (10) + tag (16), base64 encoded
    assert_eq!(STANDARD.decode(&chat.content).unwrap().len(), 12 + 10 + 16);

    alice.shutdown().await;
}

#[tokio::test]
async fn encrypted_file_transfer() {
    let url = start_server().await;
    let secret = shared_secret(3);

    let (alice, _alice_rx) = connect(session_config(&url, "alice"), key_store("file-alice", &secret)).await;
    let (bob, mut bob_rx) = connect(session_config(&url, "bob"), key_store("file-bob", &secret)).await;

    let data: Vec<u8> = (0..=255).collect();
    alice.send_file("bytes.bin", data.clone()).await.unwrap();

    let msg = wait_for_message(&mut bob_rx).await;
    assert_eq!(msg.kind, MessageKind::File);
    assert_eq!(msg.body, Body::Plain("bytes.bin".to_string()));
    let file = msg.file.expect("file attachment");
    assert_eq!(file.filename, "bytes.bin");
    assert_eq!(file.size, 256);
    assert_eq!(file.data.as_deref(), Some(data.as_slice()));

    alice.shutdown().await;
    bob.shutdown().await;
}

#[tokio::test]
async fn wrong_key_yields_placeholder_and_session_survives() {
    let url = start_server().await;

    let (alice, mut alice_rx) =
        connect(session_config(&url, "alice"), key_store("wk-alice", &shared_secret(1))).await;
    let (carol, mut carol_rx) =
        connect(session_config(&url, "carol"), key_store("wk-carol", &shared_secret(2))).await;

    alice.send_text("can you read this?").await.unwrap();

    let msg = wait_for_message(&mut carol_rx).await;
    assert_eq!(msg.sender, "alice");
    assert!(msg.body.is_undecryptable());
    assert_eq!(msg.body.display_text(), UNDECRYPTABLE_PLACEHOLDER);

    // Carol's session is still up; her reply is unreadable to alice too.
    carol.send_text("no").await.unwrap();
    let reply = wait_for_message(&mut alice_rx).await;
    assert_eq!(reply.sender, "carol");
    assert!(reply.body.is_undecryptable());
    assert!(!carol.is_finished());

    alice.shutdown().await;
    carol.shutdown().await;
}

#[tokio::test]
async fn plaintext_session_is_readable_by_encrypted_peer() {
    let url = start_server().await;

    let plain_config = SessionConfig {
        encryption: false,
        ..session_config(&url, "dave")
    };
    let (dave, _dave_rx) = connect(plain_config, key_store("pt-dave", &shared_secret(4))).await;
    let (erin, mut erin_rx) =
        connect(session_config(&url, "erin"), key_store("pt-erin", &shared_secret(5))).await;

    dave.send_text("in the clear").await.unwrap();
    let msg = wait_for_message(&mut erin_rx).await;
    assert_eq!(msg.body, Body::Plain("in the clear".to_string()));

    dave.shutdown().await;
    erin.shutdown().await;
}
