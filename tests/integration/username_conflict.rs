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

//! A session whose username is already connected ends with a fatal event
//! and never retries, while the original holder is unaffected.

use std::sync::Arc;
use std::time::Duration;

use sealchat::crypto::keystore::KeyStore;
use sealchat::session::state::BackoffPolicy;
use sealchat::session::{Body, SessionConfig, SessionEvent, SessionHandle, spawn_session};
use sealchat_proto::message::DUPLICATE_USERNAME_REASON;
use tokio::sync::mpsc;

async fn start_server() -> String {
    let (addr, _handle) = sealchat_server::server::start_server("127.0.0.1:0")
        .await
        .expect("failed to start server");
    format!("ws://{addr}/ws")
}

fn key_store(tag: &str) -> Arc<KeyStore> {
    let dir = std::env::temp_dir().join(format!("sealchat-dup-{}-{tag}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    let store = KeyStore::open(dir.join("keystore.bin"));
    store
        .initialize("pw", Some("AwMDAwMDAwMDAwMDAwMDAwMDAwMDAwMDAwMDAwMDAwM="))
        .unwrap();
    Arc::new(store)
}

fn config(url: &str, username: &str) -> SessionConfig {
    SessionConfig {
        grace_period: Duration::from_millis(100),
        backoff: BackoffPolicy {
            initial: Duration::from_millis(50),
            max: Duration::from_millis(100),
        },
        ..SessionConfig::new(url, username)
    }
}

async fn next_event(rx: &mut mpsc::Receiver<SessionEvent>) -> SessionEvent {
    tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

async fn wait_for(
    rx: &mut mpsc::Receiver<SessionEvent>,
    pred: impl Fn(&SessionEvent) -> bool,
) -> SessionEvent {
    loop {
        let event = next_event(rx).await;
        if pred(&event) {
            return event;
        }
    }
}

async fn connect(url: &str, username: &str, tag: &str) -> (SessionHandle, mpsc::Receiver<SessionEvent>) {
    let (handle, mut rx) = spawn_session(config(url, username), key_store(tag));
    wait_for(&mut rx, |e| matches!(e, SessionEvent::Connected)).await;
    (handle, rx)
}

#[tokio::test]
async fn duplicate_username_is_fatal_without_retry() {
    let url = start_server().await;
    let (first, _first_rx) = connect(&url, "alice", "first").await;

    let (second, mut second_rx) = spawn_session(config(&url, "alice"), key_store("second"));

    let reason = loop {
        match next_event(&mut second_rx).await {
            SessionEvent::Fatal { reason } => break reason,
            SessionEvent::Reconnecting { .. } => panic!("duplicate username must not be retried"),
            SessionEvent::Connected => panic!("duplicate username must not connect"),
            _ => {}
        }
    };
    assert!(reason.contains(DUPLICATE_USERNAME_REASON), "reason: {reason}");

    // The supervisor task ends and the event stream closes.
    let closed = tokio::time::timeout(Duration::from_secs(5), async {
        while second_rx.recv().await.is_some() {}
    })
    .await;
    assert!(closed.is_ok(), "event channel should close after a fatal rejection");
    let finished = tokio::time::timeout(Duration::from_secs(5), async {
        while !second.is_finished() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(finished.is_ok(), "session task should end");
    assert!(second.send_text("anyone?").await.is_err());

    first.shutdown().await;
}

#[tokio::test]
async fn original_holder_keeps_chatting() {
    let url = start_server().await;
    let (alice, _alice_rx) = connect(&url, "alice", "holder-alice").await;
    let (bob, mut bob_rx) = connect(&url, "bob", "holder-bob").await;

    let (_impostor, mut impostor_rx) = spawn_session(config(&url, "alice"), key_store("holder-impostor"));
    wait_for(&mut impostor_rx, |e| matches!(e, SessionEvent::Fatal { .. })).await;

    alice.send_text("still here").await.unwrap();
    match wait_for(&mut bob_rx, |e| matches!(e, SessionEvent::Message(_))).await {
        SessionEvent::Message(msg) => {
            assert_eq!(msg.sender, "alice");
            assert_eq!(msg.body, Body::Plain("still here".to_string()));
        }
        _ => unreachable!(),
    }

    alice.shutdown().await;
    bob.shutdown().await;
}

#[tokio::test]
async fn username_is_free_again_after_holder_leaves() {
    let url = start_server().await;
    let (watcher, mut watcher_rx) = connect(&url, "watcher", "free-watcher").await;

    let (alice, _alice_rx) = connect(&url, "alice", "free-alice").await;
    wait_for(&mut watcher_rx, |e| {
        matches!(e, SessionEvent::UserList(users) if users.iter().any(|u| u == "alice"))
    })
    .await;

    alice.shutdown().await;
    wait_for(&mut watcher_rx, |e| {
        matches!(e, SessionEvent::UserList(users) if users == &["watcher".to_string()])
    })
    .await;

    let (again, _again_rx) = connect(&url, "alice", "free-again").await;
    assert!(!again.is_finished());

    again.shutdown().await;
    watcher.shutdown().await;
}
