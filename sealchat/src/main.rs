//! `SealChat` line-mode client.
//!
//! Reads lines from stdin and prints session events to stdout. Lines
//! starting with `/` are commands:
//!
//! - `/file <path>` sends a file
//! - `/admin <command>` sends an admin command (e.g. `/admin kick bob`)
//! - `/quit` exits
//!
//! ```bash
//! cargo run --bin sealchat -- --server-url ws://127.0.0.1:8080/ws --username alice
//!
//! # Share one room key between clients without a handshake
//! SEALCHAT_SHARED_KEY=$(head -c32 /dev/urandom | base64) cargo run --bin sealchat -- -u bob
//! ```

use std::io::Write as _;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use chrono::Local;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing_appender::non_blocking::WorkerGuard;

use sealchat::config::{CliArgs, ClientConfig};
use sealchat::crypto::keystore::KeyStore;
use sealchat::session::{Outgoing, SessionEvent, SessionHandle, spawn_session};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = CliArgs::parse();

    let config = match ClientConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    // Logs go to a file so they never interleave with chat output.
    let _log_guard = init_logging(&cli.log_level, cli.log_file.as_deref());
    tracing::info!("sealchat starting");

    let session_config = match config.to_session_config() {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Error: {e}");
            return ExitCode::FAILURE;
        }
    };

    let passphrase = match cli.passphrase.clone() {
        Some(p) => p,
        None => match prompt_passphrase() {
            Ok(p) => p,
            Err(e) => {
                eprintln!("Error reading passphrase: {e}");
                return ExitCode::FAILURE;
            }
        },
    };

    // A malformed shared key or a wrong passphrase stops startup here.
    let keys = Arc::new(KeyStore::open(&config.keystore_path));
    match keys.initialize(&passphrase, cli.shared_key.as_deref()) {
        Ok(key) => tracing::info!(key_id = %key.key_id(), "key store ready"),
        Err(e) => {
            tracing::error!(error = %e, "key store initialization failed");
            eprintln!("Error: {e}");
            return ExitCode::FAILURE;
        }
    }
    drop(passphrase);

    println!(
        "Connecting to {} as {}{}",
        session_config.server_url,
        session_config.username,
        if session_config.encryption {
            ""
        } else {
            " (encryption off)"
        }
    );

    let (handle, events) = spawn_session(session_config, keys);
    let code = run(handle, events).await;

    tracing::info!("sealchat exiting");
    code
}

/// Initialize file-based logging.
///
/// Returns a [`WorkerGuard`] that must be held until shutdown to ensure all
/// buffered log entries are flushed.
fn init_logging(level: &str, file_path: Option<&Path>) -> Option<WorkerGuard> {
    let default_path = std::env::temp_dir().join("sealchat.log");
    let log_path = file_path.unwrap_or(&default_path);

    let log_dir = log_path.parent()?;
    let file_name = log_path.file_name()?.to_str()?;

    let file_appender = tracing_appender::rolling::never(log_dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_writer(non_blocking)
        .with_env_filter(env_filter)
        .with_ansi(false)
        .init();

    Some(guard)
}

fn prompt_passphrase() -> std::io::Result<String> {
    // Input is echoed; SEALCHAT_PASSPHRASE avoids the prompt.
    eprint!("Key store passphrase (input is visible): ");
    std::io::stderr().flush()?;
    let mut line = String::new();
    std::io::stdin().read_line(&mut line)?;
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

/// What a line of input asks for.
#[derive(Debug, PartialEq, Eq)]
enum Input {
    Send(Outgoing),
    SendFile(String),
    Quit,
    Nothing,
    Unknown(String),
}

fn parse_input(line: &str) -> Input {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Input::Nothing;
    }
    let Some(command) = trimmed.strip_prefix('/') else {
        return Input::Send(Outgoing::Text(line.to_string()));
    };

    let (name, rest) = command
        .split_once(char::is_whitespace)
        .map_or((command, ""), |(n, r)| (n, r.trim()));
    match name {
        "quit" | "exit" => Input::Quit,
        "file" if !rest.is_empty() => Input::SendFile(rest.to_string()),
        "admin" if !rest.is_empty() => Input::Send(Outgoing::AdminCommand(rest.to_string())),
        _ => Input::Unknown(trimmed.to_string()),
    }
}

enum Step {
    Event(Option<SessionEvent>),
    Line(std::io::Result<Option<String>>),
}

/// Main loop: forward stdin lines to the session and print its events.
async fn run(handle: SessionHandle, mut events: mpsc::Receiver<SessionEvent>) -> ExitCode {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut code = ExitCode::SUCCESS;

    loop {
        let step = tokio::select! {
            event = events.recv() => Step::Event(event),
            line = lines.next_line() => Step::Line(line),
        };

        match step {
            Step::Event(Some(SessionEvent::Fatal { reason })) => {
                println!("*** Disconnected permanently: {reason}");
                code = ExitCode::FAILURE;
                break;
            }
            Step::Event(Some(event)) => print_event(&event),
            Step::Event(None) | Step::Line(Ok(None)) => break,
            Step::Line(Err(e)) => {
                tracing::warn!(error = %e, "stdin read failed");
                break;
            }
            Step::Line(Ok(Some(line))) => {
                let outgoing = match parse_input(&line) {
                    Input::Quit => break,
                    Input::Nothing => continue,
                    Input::Unknown(cmd) => {
                        println!("*** Unknown command: {cmd}");
                        continue;
                    }
                    Input::Send(outgoing) => outgoing,
                    Input::SendFile(path) => match read_file(&path).await {
                        Ok(outgoing) => outgoing,
                        Err(e) => {
                            println!("*** Could not read {path}: {e}");
                            continue;
                        }
                    },
                };
                if let Err(e) = handle.send(outgoing).await {
                    println!("*** {e}");
                    break;
                }
            }
        }
    }

    handle.shutdown().await;
    code
}

async fn read_file(path: &str) -> std::io::Result<Outgoing> {
    let data = tokio::fs::read(path).await?;
    let filename = Path::new(path)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(path)
        .to_string();
    Ok(Outgoing::File { filename, data })
}

fn print_event(event: &SessionEvent) {
    match event {
        SessionEvent::Connected => println!("*** Connected"),
        SessionEvent::Reconnecting { attempt, delay } => println!(
            "*** Connection lost, reconnecting in {}s (attempt {attempt})",
            delay.as_secs_f32()
        ),
        SessionEvent::Fatal { reason } => println!("*** Disconnected permanently: {reason}"),
        SessionEvent::Message(message) => {
            let time = message.created_at.with_timezone(&Local).format("%H:%M");
            match &message.file {
                Some(file) if file.data.is_some() => println!(
                    "[{time}] {} sent file {} ({} bytes)",
                    message.sender, file.filename, file.size
                ),
                Some(file) => println!(
                    "[{time}] {} sent file {} (unable to decrypt)",
                    message.sender, file.filename
                ),
                None => println!(
                    "[{time}] <{}> {}",
                    message.sender,
                    message.body.display_text()
                ),
            }
        }
        SessionEvent::UserList(users) => println!("*** Online: {}", users.join(", ")),
        SessionEvent::AuthFailed(reason) => println!("*** Admin authentication failed: {reason}"),
        SessionEvent::Notice(text) => println!("*** {text}"),
        SessionEvent::Warning(text) => println!("*** Warning: {text}"),
        SessionEvent::Error(text) => println!("*** Error: {text}"),
    }
}
