//! Chat server core: shared state, WebSocket handler, client registry, and
//! message fan-out.
//!
//! Every connection starts with a [`Handshake`] frame. The server registers
//! the username (refusing names already connected), optionally grants admin
//! rights, then relays chat frames to every other client. It never looks
//! inside `content`; encrypted and plain messages are forwarded alike.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use sealchat_proto::codec;
use sealchat_proto::envelope::Envelope;
use sealchat_proto::message::{
    ChatMessage, DUPLICATE_USERNAME_CLOSE_CODE, DUPLICATE_USERNAME_REASON, Handshake, MessageKind,
};
use serde::Serialize;
use tokio::sync::{RwLock, mpsc};

/// Default maximum size of one inbound WebSocket message (1 MiB).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Close code sent to a client removed by an administrator.
pub const KICKED_CLOSE_CODE: u16 = 4002;

/// Close reason sent to a client removed by an administrator.
pub const KICKED_REASON: &str = "kicked by admin";

/// One registered connection.
struct Client {
    /// Distinguishes this connection from a later one with the same name.
    id: u64,
    tx: mpsc::UnboundedSender<Message>,
    admin: bool,
}

/// Shared server state holding the client registry.
pub struct ServerState {
    clients: RwLock<HashMap<String, Client>>,
    next_id: AtomicU64,
    admin_key: Option<String>,
    max_frame_size: usize,
}

impl Default for ServerState {
    fn default() -> Self {
        Self::new(None)
    }
}

impl ServerState {
    /// Creates an empty registry. Without an admin key, admin handshakes
    /// are always refused.
    #[must_use]
    pub fn new(admin_key: Option<String>) -> Self {
        Self::with_config(admin_key, DEFAULT_MAX_FRAME_SIZE)
    }

    /// Creates an empty registry with a custom inbound frame limit.
    #[must_use]
    pub fn with_config(admin_key: Option<String>, max_frame_size: usize) -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            admin_key: admin_key.filter(|k| !k.is_empty()),
            max_frame_size,
        }
    }

    /// Registers `username` unless it is already connected.
    ///
    /// Returns the connection id, or `None` for a duplicate. The check and
    /// the insert happen under one write lock.
    async fn register(
        &self,
        username: &str,
        tx: mpsc::UnboundedSender<Message>,
        admin: bool,
    ) -> Option<u64> {
        let mut clients = self.clients.write().await;
        if clients.contains_key(username) {
            return None;
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        clients.insert(username.to_string(), Client { id, tx, admin });
        Some(id)
    }

    /// Removes `username` if it still belongs to connection `id`.
    async fn unregister(&self, username: &str, id: u64) -> bool {
        let mut clients = self.clients.write().await;
        if clients.get(username).is_some_and(|c| c.id == id) {
            clients.remove(username);
            true
        } else {
            false
        }
    }

    /// Connected usernames, sorted.
    pub async fn usernames(&self) -> Vec<String> {
        let mut names: Vec<String> = self.clients.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Whether `username` currently holds admin rights.
    pub async fn is_admin(&self, username: &str) -> bool {
        self.clients
            .read()
            .await
            .get(username)
            .is_some_and(|c| c.admin)
    }

    fn admin_key_matches(&self, offered: Option<&str>) -> bool {
        match (self.admin_key.as_deref(), offered) {
            (Some(expected), Some(offered)) => expected == offered,
            _ => false,
        }
    }

    /// Queues a frame for one client. Unknown names are ignored.
    async fn send_to(&self, username: &str, msg: Message) -> bool {
        self.clients
            .read()
            .await
            .get(username)
            .is_some_and(|c| c.tx.send(msg).is_ok())
    }

    /// Queues a frame for every client except `skip`.
    async fn broadcast(&self, text: &str, skip: Option<&str>) {
        let clients = self.clients.read().await;
        for (name, client) in clients.iter() {
            if skip == Some(name.as_str()) {
                continue;
            }
            if client.tx.send(Message::Text(text.into())).is_err() {
                tracing::debug!(username = %name, "client writer gone, skipping broadcast");
            }
        }
    }

    async fn broadcast_user_list(&self) {
        let users = self.usernames().await;
        if let Some(frame) = encode_frame(&Envelope::user_list(&users)) {
            self.broadcast(&frame, None).await;
        }
    }

    async fn send_envelope(&self, username: &str, envelope: &Envelope) {
        if let Some(frame) = encode_frame(envelope) {
            self.send_to(username, Message::Text(frame.into())).await;
        }
    }
}

/// Handles one WebSocket connection from handshake to disconnect.
pub async fn handle_socket(socket: WebSocket, state: Arc<ServerState>) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let Some(handshake) = wait_for_handshake(&mut ws_receiver).await else {
        tracing::warn!("connection closed before handshake");
        return;
    };
    let username = handshake.username.clone();

    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    let admin_requested = handshake.admin;
    let admin = admin_requested && state.admin_key_matches(handshake.admin_key.as_deref());

    let Some(conn_id) = state.register(&username, tx, admin).await else {
        tracing::info!(username = %username, "rejecting duplicate username");
        let close = Message::Close(Some(CloseFrame {
            code: DUPLICATE_USERNAME_CLOSE_CODE,
            reason: DUPLICATE_USERNAME_REASON.into(),
        }));
        if let Err(e) = ws_sender.send(close).await {
            tracing::debug!(error = %e, "failed to send duplicate-username close");
        }
        return;
    };

    tracing::info!(username = %username, admin, "client joined");

    if admin_requested && !admin {
        tracing::warn!(username = %username, "admin authentication failed");
        state
            .send_envelope(&username, &Envelope::auth_failed("invalid admin key"))
            .await;
    }
    state.broadcast_user_list().await;

    // Forward queued frames to the socket; a close frame ends the writer.
    let writer_username = username.clone();
    let mut write_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let closing = matches!(msg, Message::Close(_));
            if ws_sender.send(msg).await.is_err() {
                tracing::warn!(username = %writer_username, "WebSocket write failed");
                break;
            }
            if closing {
                break;
            }
        }
    });

    let reader_username = username.clone();
    let reader_state = Arc::clone(&state);
    let mut read_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_receiver.next().await {
            match msg {
                Message::Text(text) => {
                    handle_text_frame(&reader_username, text.as_str(), &reader_state).await;
                }
                Message::Close(_) => {
                    tracing::info!(username = %reader_username, "received close frame");
                    break;
                }
                _ => {
                    // Pings are answered by the WebSocket layer.
                }
            }
        }
    });

    tokio::select! {
        _ = &mut read_task => {
            write_task.abort();
        }
        _ = &mut write_task => {
            read_task.abort();
        }
    }

    if state.unregister(&username, conn_id).await {
        tracing::info!(username = %username, "client left");
        state.broadcast_user_list().await;
    }
}

/// Waits for the first text frame and parses it as a [`Handshake`].
async fn wait_for_handshake(
    receiver: &mut (impl StreamExt<Item = Result<Message, axum::Error>> + Unpin),
) -> Option<Handshake> {
    while let Some(Ok(msg)) = receiver.next().await {
        match msg {
            Message::Text(text) => {
                return match codec::decode_handshake(text.as_str()) {
                    Ok(hs) if hs.username.trim().is_empty() => {
                        tracing::warn!("handshake with empty username");
                        None
                    }
                    Ok(hs) => Some(hs),
                    Err(e) => {
                        tracing::warn!(error = %e, "first frame is not a handshake");
                        None
                    }
                };
            }
            Message::Binary(_) | Message::Close(_) => return None,
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }
    None
}

async fn handle_text_frame(username: &str, text: &str, state: &Arc<ServerState>) {
    let mut message = match codec::decode_chat(text) {
        Ok(m) => m,
        Err(e) => {
            tracing::warn!(username = %username, error = %e, "dropping unparseable frame");
            return;
        }
    };

    if message.kind == MessageKind::AdminCommand {
        handle_admin_command(username, &message, state).await;
        return;
    }

    message.sender = username.to_string();
    tracing::debug!(
        username = %username,
        kind = %message.kind,
        encrypted = message.encrypted,
        "relaying chat message"
    );
    if let Some(frame) = encode_frame(&message) {
        state.broadcast(&frame, Some(username)).await;
    }
}

async fn handle_admin_command(username: &str, message: &ChatMessage, state: &Arc<ServerState>) {
    if !state.is_admin(username).await {
        tracing::warn!(username = %username, "admin command from non-admin");
        state
            .send_envelope(username, &Envelope::auth_failed("admin rights required"))
            .await;
        return;
    }

    let command = message.content.trim();
    tracing::info!(username = %username, command = %command, "admin command");

    let (verb, arg) = command
        .split_once(char::is_whitespace)
        .map_or((command, ""), |(v, a)| (v, a.trim()));

    match verb {
        "kick" if !arg.is_empty() => kick(username, arg, state).await,
        _ => {
            state
                .send_envelope(
                    username,
                    &Envelope::notice(format!("unknown admin command: {command}")),
                )
                .await;
        }
    }
}

async fn kick(admin: &str, target: &str, state: &Arc<ServerState>) {
    let close = Message::Close(Some(CloseFrame {
        code: KICKED_CLOSE_CODE,
        reason: KICKED_REASON.into(),
    }));
    if state.send_to(target, close).await {
        tracing::info!(admin = %admin, target = %target, "client kicked");
        if let Some(frame) = encode_frame(&Envelope::notice(format!("{target} was kicked"))) {
            state.broadcast(&frame, Some(target)).await;
        }
    } else {
        state
            .send_envelope(admin, &Envelope::notice(format!("no such user: {target}")))
            .await;
    }
}

fn encode_frame<T: Serialize>(value: &T) -> Option<String> {
    match codec::encode(value) {
        Ok(frame) => Some(frame),
        Err(e) => {
            tracing::error!(error = %e, "failed to encode outbound frame");
            None
        }
    }
}

/// Starts the server on the given address with default state.
///
/// Binds to `addr` (use `127.0.0.1:0` in tests) and returns the bound
/// address and a [`tokio::task::JoinHandle`] for the server task.
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server(
    addr: &str,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
> {
    start_server_with_state(addr, Arc::new(ServerState::default())).await
}

/// Starts the server with a pre-configured [`ServerState`].
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server_with_state(
    addr: &str,
    state: Arc<ServerState>,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
> {
    let app = axum::Router::new()
        .route("/ws", axum::routing::get(ws_handler))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;

    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "server error");
        }
    });

    Ok((bound_addr, handle))
}

async fn ws_handler(
    ws: axum::extract::ws::WebSocketUpgrade,
    axum::extract::State(state): axum::extract::State<Arc<ServerState>>,
) -> impl axum::response::IntoResponse {
    ws.max_message_size(state.max_frame_size)
        .on_upgrade(move |socket| handle_socket(socket, state))
}
