//! `SealChat` server.
//!
//! An axum WebSocket server that relays chat frames between `SealChat`
//! clients. Encrypted payloads pass through untouched.
//!
//! # Usage
//!
//! ```bash
//! # Run on default address 0.0.0.0:8080
//! cargo run --bin sealchat-server
//!
//! # Custom address and an admin secret
//! SEALCHAT_ADMIN_KEY=hunter2 cargo run --bin sealchat-server -- --bind 127.0.0.1:9000
//! ```

use std::sync::Arc;

use clap::Parser;
use sealchat_server::config::{ServerCliArgs, ServerConfig};
use sealchat_server::server::{self, ServerState};

#[tokio::main]
async fn main() {
    let cli = ServerCliArgs::parse();

    let config = match ServerConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            std::process::exit(1);
        }
    };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    tracing::info!(
        addr = %config.bind_addr,
        admin_enabled = config.admin_key.is_some(),
        "starting sealchat server"
    );

    let state = Arc::new(ServerState::with_config(
        config.admin_key.clone(),
        config.max_frame_size,
    ));

    match server::start_server_with_state(&config.bind_addr, state).await {
        Ok((bound_addr, handle)) => {
            tracing::info!(addr = %bound_addr, "server listening");
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "server task failed");
            }
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to start server");
            std::process::exit(1);
        }
    }
}
