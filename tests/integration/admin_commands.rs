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

//! Admin authentication and commands between real sessions and a server
//! configured with an admin key.

use std::sync::Arc;
use std::time::Duration;

use sealchat::crypto::keystore::KeyStore;
use sealchat::session::state::BackoffPolicy;
use sealchat::session::{Body, SessionConfig, SessionEvent, SessionHandle, spawn_session};
use sealchat_server::server::{ServerState, start_server_with_state};
use tokio::sync::mpsc;

const ADMIN_KEY: &str = "hunter2";

async fn start_server() -> String {
    let state = Arc::new(ServerState::new(Some(ADMIN_KEY.to_string())));
    let (addr, _handle) = start_server_with_state("127.0.0.1:0", state)
        .await
        .expect("failed to start server");
    format!("ws://{addr}/ws")
}

fn key_store(tag: &str) -> Arc<KeyStore> {
    let dir = std::env::temp_dir().join(format!("sealchat-admin-{}-{tag}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    let store = KeyStore::open(dir.join("keystore.bin"));
    store
        .initialize("pw", Some("BQUFBQUFBQUFBQUFBQUFBQUFBQUFBQUFBQUFBQUFBQU="))
        .unwrap();
    Arc::new(store)
}

fn config(url: &str, username: &str) -> SessionConfig {
    SessionConfig {
        grace_period: Duration::from_millis(50),
        backoff: BackoffPolicy {
            initial: Duration::from_millis(100),
            max: Duration::from_millis(200),
        },
        ..SessionConfig::new(url, username)
    }
}

fn admin_config(url: &str, username: &str, key: &str) -> SessionConfig {
    SessionConfig {
        admin: true,
        admin_key: Some(key.to_string()),
        ..config(url, username)
    }
}

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

async fn connect(config: SessionConfig, tag: &str) -> (SessionHandle, mpsc::Receiver<SessionEvent>) {
    let (handle, mut rx) = spawn_session(config, key_store(tag));
    wait_for(&mut rx, |e| matches!(e, SessionEvent::Connected)).await;
    (handle, rx)
}

#[tokio::test]
async fn wrong_admin_key_reports_auth_failed_but_stays_connected() {
    let url = start_server().await;
    let (root, mut root_rx) = connect(admin_config(&url, "root", "wrong"), "wrong-root").await;
    let (bob, mut bob_rx) = connect(config(&url, "bob"), "wrong-bob").await;

    wait_for(&mut root_rx, |e| matches!(e, SessionEvent::AuthFailed(_))).await;

    root.send_text("still a regular user").await.unwrap();
    match wait_for(&mut bob_rx, |e| matches!(e, SessionEvent::Message(_))).await {
        SessionEvent::Message(msg) => {
            assert_eq!(msg.body, Body::Plain("still a regular user".to_string()));
        }
        _ => unreachable!(),
    }

    root.shutdown().await;
    bob.shutdown().await;
}

#[tokio::test]
async fn admin_command_from_non_admin_is_refused() {
    let url = start_server().await;
    let (bob, mut bob_rx) = connect(config(&url, "bob"), "refused-bob").await;
    let (carol, mut carol_rx) = connect(config(&url, "carol"), "refused-carol").await;

    bob.send_admin_command("kick carol").await.unwrap();
    wait_for(&mut bob_rx, |e| matches!(e, SessionEvent::AuthFailed(_))).await;

    // Carol was not kicked: she can still reach bob.
    carol.send_text("phew").await.unwrap();
    wait_for(&mut bob_rx, |e| matches!(e, SessionEvent::Message(_))).await;
    assert!(
        tokio::time::timeout(Duration::from_millis(300), async {
            wait_for(&mut carol_rx, |e| matches!(e, SessionEvent::Reconnecting { .. })).await
        })
        .await
        .is_err(),
        "carol should not have been disconnected"
    );

    bob.shutdown().await;
    carol.shutdown().await;
}

#[tokio::test]
async fn kicked_session_reconnects() {
    let url = start_server().await;
    let (root, mut root_rx) = connect(admin_config(&url, "root", ADMIN_KEY), "kick-root").await;
    let (bob, mut bob_rx) = connect(config(&url, "bob"), "kick-bob").await;

    root.send_admin_command("kick bob").await.unwrap();

    match wait_for(&mut root_rx, |e| matches!(e, SessionEvent::Notice(_))).await {
        SessionEvent::Notice(text) => assert!(text.contains("bob"), "notice: {text}"),
        _ => unreachable!(),
    }

    // A kick is not a duplicate-name rejection, so bob retries and gets back in.
    wait_for(&mut bob_rx, |e| matches!(e, SessionEvent::Reconnecting { .. })).await;
    wait_for(&mut bob_rx, |e| matches!(e, SessionEvent::Connected)).await;
    wait_for(&mut root_rx, |e| {
        matches!(e, SessionEvent::UserList(users) if users.iter().any(|u| u == "bob"))
    })
    .await;

    root.shutdown().await;
    bob.shutdown().await;
}

#[tokio::test]
async fn unknown_admin_command_gets_notice() {
    let url = start_server().await;
    let (root, mut root_rx) = connect(admin_config(&url, "root", ADMIN_KEY), "unknown-root").await;

    root.send_admin_command("reboot").await.unwrap();
    match wait_for(&mut root_rx, |e| matches!(e, SessionEvent::Notice(_))).await {
        SessionEvent::Notice(text) => assert!(text.contains("reboot"), "notice: {text}"),
        _ => unreachable!(),
    }

    root.shutdown().await;
}
