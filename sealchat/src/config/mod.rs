//! Configuration system for the `SealChat` client.
//!
//! Supports layered configuration with the following priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/sealchat/config.toml`)
//! 4. Compiled defaults
//!
//! Missing config file is not an error (defaults are used). An explicit
//! `--config` path that doesn't exist is an error.
//!
//! The admin secret, passphrase and shared key are never read from the
//! file; they come from the command line or the environment only.

use std::path::PathBuf;
use std::time::Duration;

use crate::crypto::keystore::{KEYSTORE_FILE_NAME, KeyStore};
use crate::session::state::BackoffPolicy;
use crate::session::{
    DEFAULT_CONNECT_TIMEOUT, DEFAULT_EVENT_CAPACITY, DEFAULT_GRACE_PERIOD, DEFAULT_KEEPALIVE,
    DEFAULT_OUTBOUND_QUEUE_CAP, SessionConfig,
};

/// Default chat server URL.
pub const DEFAULT_SERVER_URL: &str = "ws://127.0.0.1:8080/ws";

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        /// Path that was attempted.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Failed to parse the TOML configuration.
    #[error("failed to parse config file: {0}")]
    ParseToml(#[from] toml::de::Error),

    /// No username was given anywhere.
    #[error("no username configured (use --username, SEALCHAT_USERNAME or [network] username)")]
    MissingUsername,

    /// A timing setting that must be positive was zero.
    #[error("[network] {field} must be greater than zero")]
    ZeroDuration {
        /// Name of the setting in the config file.
        field: &'static str,
    },
}

// ---------------------------------------------------------------------------
// TOML file structs (all fields Option for partial overrides)
// ---------------------------------------------------------------------------

/// Top-level TOML config file structure.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ConfigFile {
    network: NetworkFileConfig,
    security: SecurityFileConfig,
    admin: AdminFileConfig,
}

/// `[network]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct NetworkFileConfig {
    server_url: Option<String>,
    username: Option<String>,
    keepalive_secs: Option<u64>,
    grace_period_ms: Option<u64>,
    connect_timeout_secs: Option<u64>,
    initial_backoff_ms: Option<u64>,
    max_backoff_secs: Option<u64>,
    event_capacity: Option<usize>,
    outbound_queue_cap: Option<usize>,
}

/// `[security]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct SecurityFileConfig {
    encryption: Option<bool>,
    keystore_path: Option<PathBuf>,
}

/// `[admin]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct AdminFileConfig {
    admin: Option<bool>,
}

// ---------------------------------------------------------------------------
// Resolved configuration (concrete types, all fields populated)
// ---------------------------------------------------------------------------

/// Fully resolved client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    // -- Network --
    /// Chat server WebSocket URL.
    pub server_url: String,
    /// Username for the handshake.
    pub username: Option<String>,
    /// Interval between keep-alive pings.
    pub keepalive_interval: Duration,
    /// Wait between handshake and probe.
    pub grace_period: Duration,
    /// Timeout for opening the WebSocket.
    pub connect_timeout: Duration,
    /// Reconnect backoff bounds.
    pub backoff: BackoffPolicy,
    /// Capacity of the session event queue.
    pub event_capacity: usize,
    /// Messages held while disconnected.
    pub outbound_queue_cap: usize,

    // -- Security --
    /// Encrypt outgoing messages.
    pub encryption: bool,
    /// Location of the encrypted key store.
    pub keystore_path: PathBuf,

    // -- Admin --
    /// Request admin rights.
    pub admin: bool,
    /// Admin secret (CLI/env only).
    pub admin_key: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_SERVER_URL.to_string(),
            username: None,
            keepalive_interval: DEFAULT_KEEPALIVE,
            grace_period: DEFAULT_GRACE_PERIOD,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            backoff: BackoffPolicy::default(),
            event_capacity: DEFAULT_EVENT_CAPACITY,
            outbound_queue_cap: DEFAULT_OUTBOUND_QUEUE_CAP,
            encryption: true,
            keystore_path: KeyStore::default_path()
                .unwrap_or_else(|| std::env::temp_dir().join(KEYSTORE_FILE_NAME)),
            admin: false,
            admin_key: None,
        }
    }
}

impl ClientConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// If `--config` is given and the file does not exist, returns an
    /// error. Otherwise the default path is tried and silently ignored if
    /// missing.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the explicit config file cannot be read
    /// or parsed.
    pub fn load(cli: &CliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        Ok(Self::resolve(cli, &file))
    }

    /// Resolve a `ClientConfig` from CLI args and a parsed config file.
    ///
    /// Priority: CLI > file > default. Separated from `load()` to enable
    /// unit testing without CLI parsing.
    #[must_use]
    fn resolve(cli: &CliArgs, file: &ConfigFile) -> Self {
        let defaults = Self::default();
        let net = &file.network;

        Self {
            server_url: cli
                .server_url
                .clone()
                .or_else(|| net.server_url.clone())
                .unwrap_or(defaults.server_url),
            username: cli.username.clone().or_else(|| net.username.clone()),
            keepalive_interval: net
                .keepalive_secs
                .map_or(defaults.keepalive_interval, Duration::from_secs),
            grace_period: net
                .grace_period_ms
                .map_or(defaults.grace_period, Duration::from_millis),
            connect_timeout: net
                .connect_timeout_secs
                .map_or(defaults.connect_timeout, Duration::from_secs),
            backoff: BackoffPolicy {
                initial: net
                    .initial_backoff_ms
                    .map_or(defaults.backoff.initial, Duration::from_millis),
                max: net
                    .max_backoff_secs
                    .map_or(defaults.backoff.max, Duration::from_secs),
            },
            event_capacity: net.event_capacity.unwrap_or(defaults.event_capacity),
            outbound_queue_cap: net
                .outbound_queue_cap
                .unwrap_or(defaults.outbound_queue_cap),
            encryption: if cli.no_encryption {
                false
            } else {
                file.security.encryption.unwrap_or(defaults.encryption)
            },
            keystore_path: cli
                .keystore
                .clone()
                .or_else(|| file.security.keystore_path.clone())
                .unwrap_or(defaults.keystore_path),
            admin: cli.admin || file.admin.admin.unwrap_or(defaults.admin),
            admin_key: cli.admin_key.clone(),
        }
    }

    /// Build the immutable [`SessionConfig`] for the connection manager.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingUsername`] if no username is set, or
    /// [`ConfigError::ZeroDuration`] if the keep-alive, connect timeout or
    /// either backoff bound is zero.
    pub fn to_session_config(&self) -> Result<SessionConfig, ConfigError> {
        let username = self
            .username
            .clone()
            .filter(|u| !u.trim().is_empty())
            .ok_or(ConfigError::MissingUsername)?;

        for (field, value) in [
            ("keepalive_secs", self.keepalive_interval),
            ("connect_timeout_secs", self.connect_timeout),
            ("initial_backoff_ms", self.backoff.initial),
            ("max_backoff_secs", self.backoff.max),
        ] {
            if value.is_zero() {
                return Err(ConfigError::ZeroDuration { field });
            }
        }

        Ok(SessionConfig {
            server_url: self.server_url.clone(),
            username,
            admin: self.admin,
            admin_key: self.admin_key.clone(),
            encryption: self.encryption,
            keepalive_interval: self.keepalive_interval,
            grace_period: self.grace_period,
            connect_timeout: self.connect_timeout,
            backoff: self.backoff,
            event_capacity: self.event_capacity,
            outbound_queue_cap: self.outbound_queue_cap,
        })
    }
}

/// CLI arguments parsed by clap.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "Terminal chat with end-to-end encrypted rooms")]
pub struct CliArgs {
    /// WebSocket URL of the chat server.
    #[arg(long, env = "SEALCHAT_SERVER_URL")]
    pub server_url: Option<String>,

    /// Username to join with.
    #[arg(short, long, env = "SEALCHAT_USERNAME")]
    pub username: Option<String>,

    /// Request administrator rights.
    #[arg(long)]
    pub admin: bool,

    /// Administrator secret.
    #[arg(long, env = "SEALCHAT_ADMIN_KEY", hide_env_values = true)]
    pub admin_key: Option<String>,

    /// Send messages unencrypted.
    #[arg(long)]
    pub no_encryption: bool,

    /// Passphrase protecting the key store. If absent it is prompted for,
    /// and the prompt echoes what you type; prefer `SEALCHAT_PASSPHRASE`.
    #[arg(long, env = "SEALCHAT_PASSPHRASE", hide_env_values = true)]
    pub passphrase: Option<String>,

    /// Base64 room key shared out of band; overrides the stored key.
    #[arg(long, env = "SEALCHAT_SHARED_KEY", hide = true, hide_env_values = true)]
    pub shared_key: Option<String>,

    /// Key store location (default: `~/.config/sealchat/keystore.bin`).
    #[arg(long)]
    pub keystore: Option<PathBuf>,

    /// Path to config file (default: `~/.config/sealchat/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "SEALCHAT_LOG")]
    pub log_level: String,

    /// Path to log file (default: `$TMPDIR/sealchat.log`).
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

/// Load and parse a TOML config file.
///
/// If `explicit_path` is `Some`, the file must exist (error if not).
/// If `explicit_path` is `None`, the default path is tried and missing file
/// is treated as empty config.
fn load_config_file(explicit_path: Option<&std::path::Path>) -> Result<ConfigFile, ConfigError> {
    let path = if let Some(p) = explicit_path {
        let contents = std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFile {
            path: p.to_path_buf(),
            source: e,
        })?;
        return Ok(toml::from_str(&contents)?);
    } else {
        let Some(config_dir) = dirs::config_dir() else {
            return Ok(ConfigFile::default());
        };
        config_dir.join("sealchat").join("config.toml")
    };

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}
