//! Opening a connection and running the handshake.
//!
//! Failures are split into [`ConnectFailure::Fatal`] (the server will never
//! accept this username) and [`ConnectFailure::Transient`] (retry later).
//! The fatal signals are an HTTP 403 on upgrade, a close frame carrying the
//! duplicate-username marker, and the socket dying right after the
//! handshake.

use futures_util::{SinkExt, StreamExt};
use sealchat_proto::codec;
use sealchat_proto::message::{DUPLICATE_USERNAME_CLOSE_CODE, DUPLICATE_USERNAME_REASON, Handshake};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use super::SessionConfig;

/// The client's WebSocket stream.
pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Why a connection attempt or a live connection ended.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectFailure {
    /// Non-retryable rejection.
    #[error("rejected by server: {0}")]
    Fatal(String),
    /// Anything worth retrying.
    #[error("connection lost: {0}")]
    Transient(String),
}

impl ConnectFailure {
    /// Whether this failure ends the session.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }
}

/// Open the WebSocket, bounded by the connect timeout.
///
/// # Errors
///
/// [`ConnectFailure::Fatal`] on HTTP 403, [`ConnectFailure::Transient`]
/// for timeouts and every other error.
pub async fn open(config: &SessionConfig) -> Result<WsStream, ConnectFailure> {
    let url = config.server_url.as_str();
    let (ws, _response) = tokio::time::timeout(config.connect_timeout, connect_async(url))
        .await
        .map_err(|_| {
            tracing::warn!(url, "WebSocket connect timed out");
            ConnectFailure::Transient("connect timed out".to_string())
        })?
        .map_err(|e| {
            tracing::warn!(url, error = %e, "WebSocket connect failed");
            classify_connect_error(e)
        })?;
    Ok(ws)
}

/// Send the handshake, wait out the grace period, then probe with a ping.
///
/// Text frames that arrive during the grace period (typically the first
/// user list) are returned so the caller can dispatch them.
///
/// # Errors
///
/// See the module docs for which outcomes are fatal.
pub async fn handshake(
    ws: &mut WsStream,
    config: &SessionConfig,
) -> Result<Vec<String>, ConnectFailure> {
    let hello = Handshake::new(
        config.username.as_str(),
        config.admin,
        config.admin_key.clone(),
    );
    let frame = codec::encode(&hello).map_err(|e| ConnectFailure::Transient(e.to_string()))?;
    ws.send(Message::Text(frame.into())).await.map_err(|e| {
        tracing::warn!(error = %e, "failed to send handshake");
        ConnectFailure::Transient(format!("failed to send handshake: {e}"))
    })?;
    tracing::debug!(username = %config.username, admin = config.admin, "handshake sent");

    let mut early = Vec::new();
    let deadline = tokio::time::Instant::now() + config.grace_period;
    loop {
        match tokio::time::timeout_at(deadline, ws.next()).await {
            Err(_) => break,
            Ok(Some(Ok(Message::Text(text)))) => early.push(text.as_str().to_owned()),
            Ok(Some(Ok(Message::Close(frame)))) => return Err(classify_close(frame.as_ref())),
            Ok(Some(Ok(_))) => {}
            Ok(Some(Err(e))) => return Err(classify_post_handshake(&e)),
            Ok(None) => {
                return Err(ConnectFailure::Fatal(
                    "connection closed immediately after handshake".to_string(),
                ));
            }
        }
    }

    ws.send(Message::Ping(Vec::new().into()))
        .await
        .map_err(|e| classify_post_handshake(&e))?;
    Ok(early)
}

/// Map a close frame to a failure class.
#[must_use]
pub fn classify_close(frame: Option<&CloseFrame>) -> ConnectFailure {
    match frame {
        Some(frame)
            if u16::from(frame.code) == DUPLICATE_USERNAME_CLOSE_CODE
                || frame.reason.as_str().contains(DUPLICATE_USERNAME_REASON) =>
        {
            ConnectFailure::Fatal(frame.reason.as_str().to_owned())
        }
        Some(frame) => ConnectFailure::Transient(format!(
            "closed by server ({}): {}",
            u16::from(frame.code),
            frame.reason.as_str()
        )),
        None => ConnectFailure::Transient("closed by server".to_string()),
    }
}

/// Whether a WebSocket error means the peer reset or already closed the
/// connection.
#[must_use]
pub fn is_reset_or_closed(err: &WsError) -> bool {
    use std::io::ErrorKind;
    use tokio_tungstenite::tungstenite::error::ProtocolError;

    match err {
        WsError::ConnectionClosed | WsError::AlreadyClosed => true,
        WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => true,
        WsError::Io(io) => matches!(
            io.kind(),
            ErrorKind::ConnectionReset
                | ErrorKind::ConnectionAborted
                | ErrorKind::BrokenPipe
                | ErrorKind::UnexpectedEof
        ),
        _ => false,
    }
}

fn classify_post_handshake(err: &WsError) -> ConnectFailure {
    if is_reset_or_closed(err) {
        tracing::error!(error = %err, "connection dropped right after handshake");
        ConnectFailure::Fatal(format!("connection dropped right after handshake: {err}"))
    } else {
        ConnectFailure::Transient(err.to_string())
    }
}

fn classify_connect_error(err: WsError) -> ConnectFailure {
    match err {
        WsError::Http(response) if response.status().as_u16() == 403 => {
            ConnectFailure::Fatal("server refused the connection (HTTP 403)".to_string())
        }
        WsError::Http(response) => {
            ConnectFailure::Transient(format!("HTTP error: status {}", response.status()))
        }
        other => ConnectFailure::Transient(other.to_string()),
    }
}
