//! Configuration file management.
//!
//! `config.toml` lives in `$NEARMEET_DATA_DIR` (or the platform data
//! directory) unless `--config` names another file. A missing file means
//! defaults; command-line flags are applied on top by `main`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use nearmeet_crypto::kdf::{self, KdfParams, DEFAULT_ITERATIONS};
use nearmeet_crypto::keys::{Salt, SymmetricKey};
use nearmeet_transport::client::{ClientConfig as TransportClientConfig, ReconnectPolicy};
use nearmeet_transport::server::{ServerConfig as TransportServerConfig, DEFAULT_MAX_FRAME_ERRORS};
use nearmeet_types::validate;
use serde::{Deserialize, Serialize};

/// Minimum passphrase length checked by the strength warning.
const MIN_PASSPHRASE_LENGTH: usize = 8;

/// Complete daemon configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Listener settings (server mode).
    #[serde(default)]
    pub server: ServerSection,
    /// Outbound connection settings (client mode).
    #[serde(default)]
    pub client: ClientSection,
    /// Payload encryption.
    #[serde(default)]
    pub security: SecuritySection,
    /// Logging.
    #[serde(default)]
    pub log: LogSection,
}

/// `[server]`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_bind_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_max_clients")]
    pub max_clients: usize,
    #[serde(default = "default_timeout_secs")]
    pub io_timeout_secs: u64,
    /// Consecutive bad frames before a peer is dropped.
    #[serde(default = "default_max_frame_errors")]
    pub max_frame_errors: u32,
}

/// `[client]`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_username")]
    pub username: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_reconnect_attempts")]
    pub reconnect_attempts: u32,
    #[serde(default = "default_reconnect_interval")]
    pub reconnect_interval_secs: u64,
    #[serde(default)]
    pub auto_reconnect: bool,
    /// 0 disables heartbeats.
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
}

/// `[security]`
#[derive(Clone, Serialize, Deserialize)]
pub struct SecuritySection {
    #[serde(default)]
    pub encryption_enabled: bool,
    /// Shared passphrase the session key is derived from.
    #[serde(default)]
    pub passphrase: String,
    /// Hex-encoded 16-byte salt, shared by all peers.
    #[serde(default)]
    pub salt: String,
    #[serde(default = "default_kdf_iterations")]
    pub kdf_iterations: u32,
}

/// `[log]`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSection {
    /// "error" | "warn" | "info" | "debug" | "trace".
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default value functions

fn default_bind_host() -> String {
    nearmeet_types::DEFAULT_BIND_HOST.to_string()
}

fn default_host() -> String {
    nearmeet_types::DEFAULT_HOST.to_string()
}

fn default_port() -> u16 {
    nearmeet_types::DEFAULT_PORT
}

fn default_max_clients() -> usize {
    nearmeet_types::MAX_CLIENTS
}

fn default_timeout_secs() -> u64 {
    nearmeet_types::DEFAULT_TIMEOUT_SECS
}

fn default_max_frame_errors() -> u32 {
    DEFAULT_MAX_FRAME_ERRORS
}

fn default_username() -> String {
    nearmeet_types::DEFAULT_USERNAME.to_string()
}

fn default_reconnect_attempts() -> u32 {
    nearmeet_types::RECONNECT_ATTEMPTS
}

fn default_reconnect_interval() -> u64 {
    nearmeet_types::RECONNECT_INTERVAL_SECS
}

fn default_heartbeat_interval() -> u64 {
    nearmeet_types::HEARTBEAT_INTERVAL_SECS
}

fn default_kdf_iterations() -> u32 {
    DEFAULT_ITERATIONS
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_bind_host(),
            port: default_port(),
            max_clients: default_max_clients(),
            io_timeout_secs: default_timeout_secs(),
            max_frame_errors: default_max_frame_errors(),
        }
    }
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            username: default_username(),
            timeout_secs: default_timeout_secs(),
            reconnect_attempts: default_reconnect_attempts(),
            reconnect_interval_secs: default_reconnect_interval(),
            auto_reconnect: false,
            heartbeat_interval_secs: default_heartbeat_interval(),
        }
    }
}

impl Default for SecuritySection {
    fn default() -> Self {
        Self {
            encryption_enabled: false,
            passphrase: String::new(),
            salt: String::new(),
            kdf_iterations: default_kdf_iterations(),
        }
    }
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

// Keeps the passphrase out of logs.
impl std::fmt::Debug for SecuritySection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecuritySection")
            .field("encryption_enabled", &self.encryption_enabled)
            .field("passphrase", &"<redacted>")
            .field("salt", &self.salt)
            .field("kdf_iterations", &self.kdf_iterations)
            .finish()
    }
}

impl DaemonConfig {
    /// Load from `path`, or from the default config file location.
    ///
    /// Falls back to defaults if the file does not exist.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let config_path = path.map_or_else(Self::config_path, Path::to_path_buf);
        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)
                .with_context(|| format!("reading {}", config_path.display()))?;
            Self::parse(&content).with_context(|| format!("parsing {}", config_path.display()))
        } else {
            Ok(Self::default())
        }
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Reject values the transport cannot run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        validate::validate_port(self.server.port).context("[server] port")?;
        validate::validate_port(self.client.port).context("[client] port")?;
        validate::validate_username(&self.client.username).context("[client] username")?;
        anyhow::ensure!(self.server.max_clients > 0, "[server] max_clients must be positive");
        anyhow::ensure!(
            self.server.max_frame_errors > 0,
            "[server] max_frame_errors must be positive"
        );
        anyhow::ensure!(
            self.server.io_timeout_secs > 0 && self.client.timeout_secs > 0,
            "timeouts must be positive"
        );
        if self.security.encryption_enabled {
            anyhow::ensure!(
                !self.security.passphrase.is_empty() && !self.security.salt.is_empty(),
                "[security] encryption requires both passphrase and salt"
            );
        }
        Ok(())
    }

    /// Derive the session key, when encryption is enabled.
    pub fn session_key(&self) -> anyhow::Result<Option<SymmetricKey>> {
        let security = &self.security;
        if !security.encryption_enabled {
            return Ok(None);
        }
        if let Err(e) = validate::validate_password(&security.passphrase, MIN_PASSPHRASE_LENGTH) {
            tracing::warn!("weak passphrase: {e}");
        }
        let salt = Salt::from_hex(&security.salt).context("[security] salt")?;
        let params = KdfParams::with_iterations(security.kdf_iterations)?;
        let (key, _) = kdf::derive_key(&security.passphrase, Some(&salt), params)?;
        Ok(Some(key))
    }

    pub fn server_config(&self, key: Option<SymmetricKey>) -> TransportServerConfig {
        TransportServerConfig {
            max_clients: self.server.max_clients,
            io_timeout: Duration::from_secs(self.server.io_timeout_secs),
            max_frame_errors: self.server.max_frame_errors,
            key,
        }
    }

    pub fn client_config(&self, key: Option<SymmetricKey>) -> TransportClientConfig {
        let client = &self.client;
        TransportClientConfig {
            connect_timeout: Duration::from_secs(client.timeout_secs),
            read_timeout: Duration::from_secs(client.timeout_secs),
            reconnect: ReconnectPolicy {
                auto_reconnect: client.auto_reconnect,
                max_attempts: client.reconnect_attempts,
                interval: Duration::from_secs(client.reconnect_interval_secs),
            },
            heartbeat_interval: (client.heartbeat_interval_secs > 0)
                .then(|| Duration::from_secs(client.heartbeat_interval_secs)),
            key,
        }
    }

    /// Get the config file path.
    fn config_path() -> PathBuf {
        Self::default_data_dir().join("config.toml")
    }

    /// Platform-specific default data directory.
    fn default_data_dir() -> PathBuf {
        if let Ok(dir) = std::env::var("NEARMEET_DATA_DIR") {
            return PathBuf::from(dir);
        }
        #[cfg(target_os = "macos")]
        {
            dirs_fallback("Library/Application Support/NearMeet")
        }
        #[cfg(target_os = "windows")]
        {
            dirs_fallback("NearMeet")
        }
        #[cfg(not(any(target_os = "macos", target_os = "windows")))]
        {
            dirs_fallback(".nearmeet")
        }
    }
}

/// Fallback home directory resolution.
fn dirs_fallback(subpath: &str) -> PathBuf {
    std::env::var("HOME")
        .map(|h| PathBuf::from(h).join(subpath))
        .unwrap_or_else(|_| std::env::temp_dir().join("nearmeet"))
}
