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

//! Reconnect behaviour of a live session.
//!
//! A TCP proxy sits between the session and the server. Killing the proxy
//! tears down the client's socket without stopping the server, so the
//! session sees an ordinary network failure, backs off, and reconnects
//! once the proxy comes back on the same port.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use sealchat::crypto::keystore::KeyStore;
use sealchat::session::state::BackoffPolicy;
use sealchat::session::{Body, SessionConfig, SessionEvent, SessionHandle, spawn_session};
use tokio::sync::mpsc;

// =============================================================================
// TCP proxy
// =============================================================================

/// Forwards a local port to the server. [`TcpProxy::kill`] aborts every
/// connection task, which drops both streams and resets the sockets.
struct TcpProxy {
    accept_handle: tokio::task::JoinHandle<()>,
    conn_handles: Arc<Mutex<Vec<tokio::task::JoinHandle<()>>>>,
}

impl TcpProxy {
    async fn new(port: u16, backend: &str) -> Self {
        let listener = tokio::net::TcpListener::bind(format!("127.0.0.1:{port}"))
            .await
            .unwrap_or_else(|e| panic!("proxy: failed to bind to port {port}: {e}"));
        let backend = backend.to_string();
        let conn_handles: Arc<Mutex<Vec<tokio::task::JoinHandle<()>>>> =
            Arc::new(Mutex::new(Vec::new()));
        let tracked = Arc::clone(&conn_handles);

        let accept_handle = tokio::spawn(async move {
            while let Ok((mut client, _)) = listener.accept().await {
                let backend = backend.clone();
                let conn = tokio::spawn(async move {
                    let Ok(mut server) = tokio::net::TcpStream::connect(&backend).await else {
                        return;
                    };
                    let _ = tokio::io::copy_bidirectional(&mut client, &mut server).await;
                });
                tracked.lock().push(conn);
            }
        });

        Self {
            accept_handle,
            conn_handles,
        }
    }

    fn kill(self) {
        self.accept_handle.abort();
        for handle in self.conn_handles.lock().iter() {
            handle.abort();
        }
    }
}

// =============================================================================
// Helpers
// =============================================================================

async fn find_free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("failed to bind to port 0");
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    tokio::time::sleep(Duration::from_millis(50)).await;
    port
}

async fn start_server() -> String {
    let (addr, _handle) = sealchat_server::server::start_server("127.0.0.1:0")
        .await
        .expect("failed to start server");
    addr.to_string()
}

fn key_store(tag: &str) -> Arc<KeyStore> {
    let dir = std::env::temp_dir().join(format!("sealchat-reconnect-{}-{tag}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    let store = KeyStore::open(dir.join("keystore.bin"));
    store
        .initialize("pw", Some("BwcHBwcHBwcHBwcHBwcHBwcHBwcHBwcHBwcHBwcHBwc="))
        .unwrap();
    Arc::new(store)
}

fn fast_config(url: String, username: &str) -> SessionConfig {
    SessionConfig {
        grace_period: Duration::from_millis(50),
        connect_timeout: Duration::from_secs(2),
        backoff: BackoffPolicy {
            initial: Duration::from_millis(200),
            max: Duration::from_millis(800),
        },
        ..SessionConfig::new(url, username)
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

fn is_reconnecting(event: &SessionEvent) -> bool {
    matches!(event, SessionEvent::Reconnecting { .. })
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test]
async fn reconnects_after_connection_is_severed() {
    let server = start_server().await;
    let port = find_free_port().await;
    let proxy = TcpProxy::new(port, &server).await;

    let url = format!("ws://127.0.0.1:{port}/ws");
    let (handle, mut rx) = connect(fast_config(url, "alice"), "severed").await;

    proxy.kill();
    match wait_for(&mut rx, is_reconnecting).await {
        SessionEvent::Reconnecting { attempt, delay } => {
            assert_eq!(attempt, 1);
            assert_eq!(delay, Duration::from_millis(200));
        }
        _ => unreachable!(),
    }

    let _proxy = TcpProxy::new(port, &server).await;
    wait_for(&mut rx, |e| matches!(e, SessionEvent::Connected)).await;
    assert!(!handle.is_finished());

    handle.shutdown().await;
}

#[tokio::test]
async fn messages_sent_while_disconnected_arrive_in_order() {
    let server = start_server().await;
    let port = find_free_port().await;
    let proxy = TcpProxy::new(port, &server).await;

    let (bob, mut bob_rx) = connect(fast_config(format!("ws://{server}/ws"), "bob"), "queue-bob").await;
    let (alice, mut alice_rx) = connect(
        fast_config(format!("ws://127.0.0.1:{port}/ws"), "alice"),
        "queue-alice",
    )
    .await;

    proxy.kill();
    wait_for(&mut alice_rx, is_reconnecting).await;

    alice.send_text("first").await.unwrap();
    alice.send_text("second").await.unwrap();

    let _proxy = TcpProxy::new(port, &server).await;
    wait_for(&mut alice_rx, |e| matches!(e, SessionEvent::Connected)).await;

    let mut received = Vec::new();
    while received.len() < 2 {
        if let SessionEvent::Message(msg) =
            wait_for(&mut bob_rx, |e| matches!(e, SessionEvent::Message(_))).await
        {
            assert_eq!(msg.sender, "alice");
            if let Body::Plain(text) = msg.body {
                received.push(text);
            }
        }
    }
    assert_eq!(received, vec!["first".to_string(), "second".to_string()]);

    alice.shutdown().await;
    bob.shutdown().await;
}

#[tokio::test]
async fn backoff_doubles_up_to_cap_while_unreachable() {
    let port = find_free_port().await;
    let config = SessionConfig {
        backoff: BackoffPolicy {
            initial: Duration::from_millis(50),
            max: Duration::from_millis(100),
        },
        ..fast_config(format!("ws://127.0.0.1:{port}/ws"), "alice")
    };
    let (handle, mut rx) = spawn_session(config, key_store("backoff"));

    let mut seen = Vec::new();
    while seen.len() < 4 {
        if let SessionEvent::Reconnecting { attempt, delay } = wait_for(&mut rx, is_reconnecting).await
        {
            seen.push((attempt, delay));
        }
    }
    assert_eq!(
        seen,
        vec![
            (1, Duration::from_millis(50)),
            (2, Duration::from_millis(100)),
            (3, Duration::from_millis(100)),
            (4, Duration::from_millis(100)),
        ]
    );

    handle.shutdown().await;
}

#[tokio::test]
async fn shutdown_during_backoff_is_prompt() {
    let server = start_server().await;
    let port = find_free_port().await;
    let proxy = TcpProxy::new(port, &server).await;

    let config = SessionConfig {
        backoff: BackoffPolicy {
            initial: Duration::from_secs(30),
            max: Duration::from_secs(30),
        },
        ..fast_config(format!("ws://127.0.0.1:{port}/ws"), "alice")
    };
    let (handle, mut rx) = connect(config, "shutdown").await;

    proxy.kill();
    wait_for(&mut rx, is_reconnecting).await;

    tokio::time::timeout(Duration::from_secs(2), handle.shutdown())
        .await
        .expect("shutdown should not wait out the backoff");
}
