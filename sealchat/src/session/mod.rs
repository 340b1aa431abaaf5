//! The client session: one WebSocket connection kept alive across failures.
//!
//! [`spawn_session`] starts a supervisor task that owns the connection and
//! returns a [`SessionHandle`] for sending plus a receiver of
//! [`SessionEvent`]s for the UI.
//!
//! # Architecture
//!
//! ```text
//! UI ── Outgoing ──▶ supervisor ──▶ encrypt ──▶ outbox ──▶ socket
//! UI ◀─ SessionEvent ── reader task ◀── decrypt ◀───────── socket
//!                      keep-alive task ── ping ──────────▶ socket
//! ```
//!
//! While connected the reader and keep-alive tasks run beside the
//! supervisor. All three watch one [`CancellationToken`]; cancelling it
//! stops them and closes the socket. When the connection is lost the
//! supervisor walks the [`state::Lifecycle`] to `Reconnecting`, sleeps for
//! the backoff delay and tries again. A fatal rejection ends the task.

pub mod connect;
pub mod events;
pub mod inbound;
pub mod outbox;
pub mod state;

use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use sealchat_proto::codec::{self, CodecError};
use sealchat_proto::message::{ChatMessage, FileAttachment, MessageKind};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use crate::crypto::keystore::KeyStore;
use crate::crypto::{CryptoError, cipher};
use connect::{ConnectFailure, WsStream};
pub use events::{Body, EventSink, ReceivedFile, ReceivedMessage, SessionEvent};
use outbox::Outbox;
use state::{BackoffPolicy, Lifecycle};

type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;
type SharedSink = Arc<tokio::sync::Mutex<WsSink>>;

/// Default keep-alive ping interval.
pub const DEFAULT_KEEPALIVE: Duration = Duration::from_secs(50);

/// Default wait after the handshake before the probe ping.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_millis(500);

/// Default bound on opening the WebSocket.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default capacity of the event queue.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Default number of messages held while disconnected.
pub const DEFAULT_OUTBOUND_QUEUE_CAP: usize = 100;

/// Shortest keep-alive period the ping task will use.
pub const MIN_KEEPALIVE: Duration = Duration::from_millis(100);

/// Bound on the orderly close handshake at shutdown.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Immutable settings for one session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// `ws://` or `wss://` URL of the chat server.
    pub server_url: String,
    /// Username sent in the handshake.
    pub username: String,
    /// Request administrator rights.
    pub admin: bool,
    /// Admin secret; only sent when `admin` is set.
    pub admin_key: Option<String>,
    /// Encrypt outgoing text and files.
    pub encryption: bool,
    /// Interval between keep-alive pings.
    pub keepalive_interval: Duration,
    /// Wait between handshake and probe.
    pub grace_period: Duration,
    /// Bound on opening the WebSocket.
    pub connect_timeout: Duration,
    /// Reconnect delays.
    pub backoff: BackoffPolicy,
    /// Capacity of the event queue.
    pub event_capacity: usize,
    /// Messages held while disconnected.
    pub outbound_queue_cap: usize,
}

impl SessionConfig {
    /// Settings with defaults for everything but the server and username.
    #[must_use]
    pub fn new(server_url: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            username: username.into(),
            admin: false,
            admin_key: None,
            encryption: true,
            keepalive_interval: DEFAULT_KEEPALIVE,
            grace_period: DEFAULT_GRACE_PERIOD,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            backoff: BackoffPolicy::default(),
            event_capacity: DEFAULT_EVENT_CAPACITY,
            outbound_queue_cap: DEFAULT_OUTBOUND_QUEUE_CAP,
        }
    }
}

/// Errors returned to callers of [`SessionHandle`].
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The session task has ended.
    #[error("session is closed")]
    Closed,
    /// Encrypting an outgoing message failed.
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    /// Encoding an outgoing message failed.
    #[error(transparent)]
    Proto(#[from] CodecError),
}

/// Something the user wants sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outgoing {
    /// Chat text.
    Text(String),
    /// A file.
    File {
        /// Name shown to recipients.
        filename: String,
        /// File contents.
        data: Vec<u8>,
    },
    /// A server-processed command. Never encrypted.
    AdminCommand(String),
}

/// Caller's side of a running session.
#[derive(Debug)]
pub struct SessionHandle {
    outgoing: mpsc::Sender<Outgoing>,
    cancel: CancellationToken,
    task: tokio::task::JoinHandle<()>,
}

impl SessionHandle {
    /// Queue a message. It is sent now if connected, otherwise after the
    /// next successful reconnect.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Closed`] if the session has ended.
    pub async fn send(&self, message: Outgoing) -> Result<(), SessionError> {
        self.outgoing
            .send(message)
            .await
            .map_err(|_| SessionError::Closed)
    }

    /// Queue chat text.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Closed`] if the session has ended.
    pub async fn send_text(&self, text: impl Into<String>) -> Result<(), SessionError> {
        self.send(Outgoing::Text(text.into())).await
    }

    /// Queue a file.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Closed`] if the session has ended.
    pub async fn send_file(
        &self,
        filename: impl Into<String>,
        data: Vec<u8>,
    ) -> Result<(), SessionError> {
        self.send(Outgoing::File {
            filename: filename.into(),
            data,
        })
        .await
    }

    /// Queue an admin command.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Closed`] if the session has ended.
    pub async fn send_admin_command(&self, command: impl Into<String>) -> Result<(), SessionError> {
        self.send(Outgoing::AdminCommand(command.into())).await
    }

    /// Token that stops the session when cancelled.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Whether the session task has ended (shutdown or fatal rejection).
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop the session and wait for its tasks to exit.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            tracing::warn!(error = %e, "session task did not exit cleanly");
        }
    }
}

/// Start a session. Must be called inside a tokio runtime.
///
/// Runs the encryption self-test first when encryption is enabled; a
/// failure is reported as [`SessionEvent::Warning`] and the session
/// continues.
#[must_use]
pub fn spawn_session(
    config: SessionConfig,
    keys: Arc<KeyStore>,
) -> (SessionHandle, mpsc::Receiver<SessionEvent>) {
    let (events, event_rx) = events::channel(config.event_capacity);
    let (outgoing_tx, outgoing_rx) = mpsc::channel(config.outbound_queue_cap.max(1));
    let cancel = CancellationToken::new();

    let supervisor = Supervisor {
        lifecycle: Lifecycle::new(config.backoff),
        outbox: Outbox::new(config.outbound_queue_cap),
        config,
        keys,
        events,
        outgoing: outgoing_rx,
        cancel: cancel.clone(),
    };
    let task = tokio::spawn(supervisor.run());

    (
        SessionHandle {
            outgoing: outgoing_tx,
            cancel,
            task,
        },
        event_rx,
    )
}

/// Build the wire frame for `message`, encrypting it when the session has
/// encryption enabled. Admin commands are always sent in the clear.
/// An encrypted file carries its name only inside the sealed `content`;
/// the attachment's `filename` field is left empty.
///
/// # Errors
///
/// Returns [`SessionError::Crypto`] if encryption fails (for example no
/// key is loaded) or [`SessionError::Proto`] if encoding fails.
pub fn build_frame(
    message: Outgoing,
    config: &SessionConfig,
    keys: &KeyStore,
) -> Result<String, SessionError> {
    let sender = config.username.as_str();
    let chat = match message {
        Outgoing::AdminCommand(command) => ChatMessage::admin_command(sender, command),
        Outgoing::Text(text) if config.encryption => {
            let sealed = keys.encrypt(sender, MessageKind::Text, text.as_bytes())?;
            ChatMessage {
                content: cipher::encode_wire(&sealed),
                created_at: sealed.created_at,
                encrypted: true,
                ..ChatMessage::text(sender, "")
            }
        }
        Outgoing::Text(text) => ChatMessage::text(sender, text),
        Outgoing::File { filename, data } => {
            let size = u64::try_from(data.len()).unwrap_or(u64::MAX);
            if config.encryption {
                let caption = keys.encrypt(sender, MessageKind::File, filename.as_bytes())?;
                let body = keys.encrypt(sender, MessageKind::File, &data)?;
                ChatMessage {
                    content: cipher::encode_wire(&caption),
                    created_at: caption.created_at,
                    kind: MessageKind::File,
                    encrypted: true,
                    file: Some(FileAttachment {
                        filename: String::new(),
                        size,
                        data: body.to_wire_bytes(),
                    }),
                    ..ChatMessage::text(sender, "")
                }
            } else {
                ChatMessage {
                    content: filename.clone(),
                    kind: MessageKind::File,
                    file: Some(FileAttachment {
                        filename,
                        size,
                        data,
                    }),
                    ..ChatMessage::text(sender, "")
                }
            }
        }
    };
    Ok(codec::encode(&chat)?)
}

struct Supervisor {
    config: SessionConfig,
    keys: Arc<KeyStore>,
    events: EventSink,
    outgoing: mpsc::Receiver<Outgoing>,
    cancel: CancellationToken,
    lifecycle: Lifecycle,
    outbox: Outbox,
}

enum Step {
    Stop,
    Lost(ConnectFailure),
    Send(Outgoing),
}

impl Supervisor {
    async fn run(mut self) {
        if self.config.encryption {
            self.check_cipher();
        }

        loop {
            self.lifecycle.connect_started();
            let Some(failure) = self.connect_and_drive().await else {
                break;
            };

            if failure.is_fatal() {
                self.lifecycle.rejected();
                tracing::error!(
                    username = %self.config.username,
                    reason = %failure,
                    "server rejected session, not reconnecting"
                );
                self.events.emit(SessionEvent::Fatal {
                    reason: failure.to_string(),
                });
                return;
            }

            let Some((attempt, delay)) = self.lifecycle.connection_lost() else {
                break;
            };
            tracing::info!(
                attempt,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                reason = %failure,
                "scheduling reconnect"
            );
            self.events
                .emit(SessionEvent::Reconnecting { attempt, delay });

            if !self.wait_backoff(delay).await {
                break;
            }
        }

        self.lifecycle.shutdown();
        tracing::info!("session stopped");
    }

    fn check_cipher(&self) {
        if let Err(e) = self.keys.self_test() {
            tracing::warn!(
                error = %e,
                "ENCRYPTION SELF-TEST FAILED: outgoing messages may be unreadable"
            );
            self.events.emit(SessionEvent::Warning(format!(
                "encryption self-test failed: {e}"
            )));
        }
    }

    /// One connection from open to loss. `None` means stop.
    async fn connect_and_drive(&mut self) -> Option<ConnectFailure> {
        let cancel = self.cancel.clone();

        let mut ws = tokio::select! {
            () = cancel.cancelled() => return None,
            opened = connect::open(&self.config) => match opened {
                Ok(ws) => ws,
                Err(failure) => return Some(failure),
            },
        };
        self.lifecycle.socket_opened();

        let early = tokio::select! {
            () = cancel.cancelled() => return None,
            result = connect::handshake(&mut ws, &self.config) => match result {
                Ok(early) => early,
                Err(failure) => return Some(failure),
            },
        };

        self.lifecycle.probe_succeeded();
        tracing::info!(
            url = %self.config.server_url,
            username = %self.config.username,
            "connected"
        );
        self.events.emit(SessionEvent::Connected);
        for frame in &early {
            inbound::dispatch(frame, &self.keys, &self.events);
        }

        self.drive(ws).await
    }

    async fn drive(&mut self, ws: WsStream) -> Option<ConnectFailure> {
        let (sink, source) = ws.split();
        let sink: SharedSink = Arc::new(tokio::sync::Mutex::new(sink));
        let link = self.cancel.child_token();
        let (lost_tx, mut lost_rx) = mpsc::channel(2);

        let reader = tokio::spawn(read_loop(
            source,
            Arc::clone(&self.keys),
            self.events.clone(),
            lost_tx.clone(),
            link.clone(),
        ));
        let keepalive = tokio::spawn(keepalive_loop(
            Arc::clone(&sink),
            self.config.keepalive_interval,
            lost_tx,
            link.clone(),
        ));

        let outcome = match self.flush(&sink).await {
            Err(failure) => Some(failure),
            Ok(()) => loop {
                let step = tokio::select! {
                    () = self.cancel.cancelled() => Step::Stop,
                    lost = lost_rx.recv() => Step::Lost(lost.unwrap_or_else(|| {
                        ConnectFailure::Transient("connection tasks exited".to_string())
                    })),
                    next = self.outgoing.recv() => next.map_or(Step::Stop, Step::Send),
                };
                match step {
                    Step::Stop => break None,
                    Step::Lost(failure) => break Some(failure),
                    Step::Send(message) => {
                        self.enqueue(message);
                        if let Err(failure) = self.flush(&sink).await {
                            break Some(failure);
                        }
                    }
                }
            },
        };

        link.cancel();
        if outcome.is_none() {
            let mut sink = sink.lock().await;
            if tokio::time::timeout(CLOSE_TIMEOUT, sink.close()).await.is_err() {
                tracing::debug!("close handshake timed out");
            }
        }
        for (name, task) in [("reader", reader), ("keep-alive", keepalive)] {
            if let Err(e) = task.await {
                tracing::warn!(task = name, error = %e, "connection task panicked");
            }
        }
        outcome
    }

    /// Sleep out the backoff delay while still accepting messages.
    /// Returns `false` if the session should stop instead.
    async fn wait_backoff(&mut self, delay: Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            let step = tokio::select! {
                () = self.cancel.cancelled() => Step::Stop,
                () = &mut sleep => return true,
                next = self.outgoing.recv() => next.map_or(Step::Stop, Step::Send),
            };
            match step {
                Step::Send(message) => self.enqueue(message),
                Step::Stop | Step::Lost(_) => return false,
            }
        }
    }

    fn enqueue(&mut self, message: Outgoing) {
        match build_frame(message, &self.config, &self.keys) {
            Ok(frame) => {
                if self.outbox.push(frame).is_some() {
                    self.events.emit(SessionEvent::Warning(
                        "outbound queue full, oldest unsent message dropped".to_string(),
                    ));
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "could not prepare outgoing message");
                self.events
                    .emit(SessionEvent::Error(format!("message not sent: {e}")));
            }
        }
    }

    async fn flush(&mut self, sink: &SharedSink) -> Result<(), ConnectFailure> {
        while let Some(frame) = self.outbox.pop() {
            let result = sink
                .lock()
                .await
                .send(Message::Text(frame.clone().into()))
                .await;
            if let Err(e) = result {
                tracing::warn!(error = %e, pending = self.outbox.len() + 1, "write failed");
                self.outbox.requeue(frame);
                return Err(ConnectFailure::Transient(format!("write failed: {e}")));
            }
        }
        Ok(())
    }
}

async fn read_loop(
    mut source: WsSource,
    keys: Arc<KeyStore>,
    events: EventSink,
    lost: mpsc::Sender<ConnectFailure>,
    link: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            () = link.cancelled() => break,
            next = source.next() => next,
        };
        let failure = match next {
            Some(Ok(Message::Text(text))) => {
                inbound::dispatch(text.as_str(), &keys, &events);
                continue;
            }
            Some(Ok(Message::Close(frame))) => {
                let failure = connect::classify_close(frame.as_ref());
                tracing::info!(reason = %failure, "server closed connection");
                failure
            }
            Some(Ok(Message::Binary(data))) => {
                tracing::debug!(len = data.len(), "ignoring binary frame");
                continue;
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                tracing::warn!(error = %e, "WebSocket read error");
                ConnectFailure::Transient(e.to_string())
            }
            None => ConnectFailure::Transient("connection closed".to_string()),
        };
        let _ = lost.try_send(failure);
        break;
    }
    tracing::debug!("reader task exiting");
}

async fn keepalive_loop(
    sink: SharedSink,
    every: Duration,
    lost: mpsc::Sender<ConnectFailure>,
    link: CancellationToken,
) {
    let every = every.max(MIN_KEEPALIVE);
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            () = link.cancelled() => break,
            _ = ticker.tick() => {
                let result = sink.lock().await.send(Message::Ping(Vec::new().into())).await;
                if let Err(e) = result {
                    tracing::warn!(error = %e, "keep-alive ping failed");
                    let _ = lost.try_send(ConnectFailure::Transient(format!(
                        "keep-alive failed: {e}"
                    )));
                    break;
                }
                tracing::trace!("keep-alive ping sent");
            }
        }
    }
    tracing::debug!("keep-alive task exiting");
}
