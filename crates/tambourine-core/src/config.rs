use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{Result, TambourineError};

/// Default backend address used when neither the config file nor the user
/// settings name one.
pub const DEFAULT_SERVER_URL: &str = "http://127.0.0.1:8765";

/// Top-level configuration for the Tambourine client.
///
/// Loaded from `~/.tambourine/config.toml` by default. Holds process-level
/// tuning only; user-editable preferences live in the settings store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub transport: TransportConfig,
}

impl AppConfig {
    /// Load configuration from a TOML file.
    ///
    /// Returns an error if the file cannot be read, parsed, or fails validation.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&content)?;
        config.validate()?;
        info!("Configuration loaded from {}", path.display());
        Ok(config)
    }

    /// Load configuration from a TOML file, falling back to defaults if the
    /// file does not exist or cannot be parsed.
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                warn!(
                    "Failed to load config from {}: {}. Using defaults.",
                    path.display(),
                    e
                );
                Self::default()
            }
        }
    }

    /// Save the current configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        info!("Configuration saved to {}", path.display());
        Ok(())
    }

    /// Reject values the connection machine cannot run with.
    pub fn validate(&self) -> Result<()> {
        let c = &self.connection;
        if c.connect_timeout_secs == 0 {
            return Err(invalid("connection.connect_timeout_secs", "must be > 0"));
        }
        if c.response_timeout_secs == 0 {
            return Err(invalid("connection.response_timeout_secs", "must be > 0"));
        }
        if c.health_check_interval_secs == 0 {
            return Err(invalid(
                "connection.health_check_interval_secs",
                "must be > 0",
            ));
        }
        if c.backoff_base_ms > c.backoff_max_ms {
            return Err(invalid(
                "connection.backoff_base_ms",
                "must not exceed backoff_max_ms",
            ));
        }
        if self.server.request_timeout_secs == 0 {
            return Err(invalid("server.request_timeout_secs", "must be > 0"));
        }
        Ok(())
    }
}

fn invalid(field: &str, message: &str) -> TambourineError {
    TambourineError::InvalidSetting {
        field: field.to_string(),
        message: message.to_string(),
    }
}

/// General application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Data directory for the settings and history database.
    pub data_dir: String,
    /// Log level: trace, debug, info, warn, error.
    pub log_level: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            data_dir: "~/.tambourine/data".to_string(),
            log_level: "info".to_string(),
        }
    }
}

/// Backend HTTP endpoint settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Base URL of the backend, used until the user picks another one.
    pub url: String,
    /// Timeout for registration, verification and signalling requests.
    pub request_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_SERVER_URL.to_string(),
            request_timeout_secs: 10,
        }
    }
}

impl ServerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Timers and backoff for the connection state machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub connect_timeout_secs: u64,
    pub response_timeout_secs: u64,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// How often a ready session's readiness flag is polled.
    pub health_check_interval_secs: u64,
    /// Connect on startup without waiting for a user action.
    pub auto_connect: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 30,
            response_timeout_secs: 10,
            backoff_base_ms: 1000,
            backoff_max_ms: 30_000,
            health_check_interval_secs: 5,
            auto_connect: true,
        }
    }
}

impl ConnectionConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_secs(self.response_timeout_secs)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }
}

/// Peer connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// STUN/TURN URLs handed to the peer connection.
    pub ice_servers: Vec<String>,
    /// Label of the ordered data channel carrying protocol messages.
    pub data_channel_label: String,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            data_channel_label: "rtvi".to_string(),
        }
    }
}
