//! Gateway configuration, loaded from a TOML file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::engine::EngineConfig;
use crate::transport::ListenAddr;

/// Top-level gateway configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Worker loop count (network loops beyond the reserved ones).
    pub workers: usize,

    /// Concurrent accept tasks per listener.
    pub accept_tasks: usize,

    /// Bound addresses. Defaults to plain TCP on localhost.
    pub listeners: Vec<ListenerEntry>,

    /// Session persistence settings.
    pub session: SessionConfig,

    /// Wire protocol settings.
    pub protocol: ProtocolConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workers: 4,
            accept_tasks: 2,
            listeners: vec![ListenerEntry::default_tcp()],
            session: SessionConfig::default(),
            protocol: ProtocolConfig::default(),
        }
    }
}

impl Config {
    /// Loads the configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;
        let config: Self = toml::from_str(&text).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.listeners.is_empty() {
            return Err(ConfigError::Invalid {
                reason: "at least one listener is required".into(),
            });
        }
        for entry in &self.listeners {
            entry.listen_addr()?;
        }
        Ok(())
    }

    /// The engine tuning derived from this config.
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            api_path: self.protocol.api_path.clone(),
            cookie_name: self.protocol.cookie_name.clone(),
            native_ua_prefix: self.protocol.native_ua_prefix.clone(),
            ping_interval: Duration::from_secs(self.protocol.ping_interval_secs),
            liveness_timeout: Duration::from_secs(self.protocol.liveness_timeout_secs),
            session_ttl: Duration::from_secs(self.session.ttl_secs),
            max_message_bytes: self.protocol.max_message_bytes,
        }
    }

    /// How often the expiry sweep runs.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.session.sweep_interval_secs)
    }
}

/// One bound address.
#[derive(Debug, Clone, Deserialize)]
pub struct ListenerEntry {
    /// Transport kind: tcp, tls, or unix.
    pub kind: ListenerKind,

    /// Socket address for tcp/tls listeners.
    pub addr: Option<String>,

    /// Socket path for unix listeners.
    pub path: Option<PathBuf>,

    /// PEM certificate chain for tls listeners.
    pub cert: Option<PathBuf>,

    /// PEM private key for tls listeners.
    pub key: Option<PathBuf>,

    /// Restrict a dual-stack v6 address to v6 only.
    #[serde(default)]
    pub ipv6_only: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListenerKind {
    Tcp,
    Tls,
    Unix,
}

impl ListenerEntry {
    fn default_tcp() -> Self {
        Self {
            kind: ListenerKind::Tcp,
            addr: Some("127.0.0.1:7310".into()),
            path: None,
            cert: None,
            key: None,
            ipv6_only: false,
        }
    }

    /// Resolves this entry into a bindable address.
    pub fn listen_addr(&self) -> Result<ListenAddr, ConfigError> {
        match self.kind {
            ListenerKind::Tcp => Ok(ListenAddr::Tcp(self.socket_addr()?)),
            ListenerKind::Tls => {
                if self.cert.is_none() || self.key.is_none() {
                    return Err(ConfigError::Invalid {
                        reason: "tls listener requires cert and key".into(),
                    });
                }
                Ok(ListenAddr::Tls(self.socket_addr()?))
            }
            ListenerKind::Unix => {
                let path = self.path.clone().ok_or_else(|| ConfigError::Invalid {
                    reason: "unix listener requires a path".into(),
                })?;
                Ok(ListenAddr::Unix(path))
            }
        }
    }

    fn socket_addr(&self) -> Result<std::net::SocketAddr, ConfigError> {
        let raw = self.addr.as_deref().ok_or_else(|| ConfigError::Invalid {
            reason: "tcp/tls listener requires an addr".into(),
        })?;
        raw.parse().map_err(|_| ConfigError::Invalid {
            reason: format!("invalid socket address: {raw}"),
        })
    }
}

/// Session persistence settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// SQLite database path.
    pub db_path: PathBuf,

    /// Session TTL of inactivity, in seconds.
    pub ttl_secs: u64,

    /// Interval between expiry sweeps, in seconds.
    pub sweep_interval_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("bazaar-sessions.db"),
            ttl_secs: 30 * 24 * 3600,
            sweep_interval_secs: 60,
        }
    }
}

/// Wire protocol settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Namespace upgrade targets must live under.
    pub api_path: String,

    /// Session cookie name.
    pub cookie_name: String,

    /// User-Agent prefix identifying the native app.
    pub native_ua_prefix: String,

    /// Seconds of outbound idleness before a liveness ping.
    pub ping_interval_secs: u64,

    /// Seconds a connection may go without proof of liveness.
    pub liveness_timeout_secs: u64,

    /// Upper bound on one inbound message, in bytes.
    pub max_message_bytes: usize,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        let engine = EngineConfig::default();
        Self {
            api_path: engine.api_path,
            cookie_name: engine.cookie_name,
            native_ua_prefix: engine.native_ua_prefix,
            ping_interval_secs: engine.ping_interval.as_secs(),
            liveness_timeout_secs: engine.liveness_timeout.as_secs(),
            max_message_bytes: engine.max_message_bytes,
        }
    }
}

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {error}")]
    Io { path: PathBuf, error: String },

    #[error("failed to parse {path}: {error}")]
    Parse { path: PathBuf, error: String },

    #[error("invalid configuration: {reason}")]
    Invalid { reason: String },
}
