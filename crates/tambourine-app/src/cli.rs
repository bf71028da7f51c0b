//! CLI argument definitions for the Tambourine client.
//!
//! Priority resolution: CLI args > env vars > config file > defaults.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Tambourine: voice dictation client for a Tambourine backend.
#[derive(Parser, Debug)]
#[command(name = "tambourine", version, about)]
pub struct CliArgs {
    /// Path to the configuration file.
    #[arg(short = 'c', long = "config", global = true)]
    pub config: Option<PathBuf>,

    /// Data directory for the settings and history database.
    #[arg(short = 'd', long = "data-dir", global = true)]
    pub data_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short = 'l', long = "log-level", global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Connect to the backend and read dictation commands from stdin.
    Run {
        /// Backend URL, overriding the stored setting for this run.
        #[arg(short = 's', long = "server")]
        server: Option<String>,
    },
    /// Inspect or clear the persisted client identity.
    Identity {
        #[command(subcommand)]
        action: IdentityAction,
    },
    /// Browse the dictation history.
    History {
        #[command(subcommand)]
        action: HistoryAction,
    },
    /// Read or change user settings.
    Settings {
        #[command(subcommand)]
        action: SettingsAction,
    },
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum IdentityAction {
    Show,
    /// Forget the identity; a new one is registered on the next connect.
    Reset,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum HistoryAction {
    List {
        #[arg(short = 'n', long = "limit")]
        limit: Option<usize>,
    },
    Delete {
        id: uuid::Uuid,
    },
    Clear,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum SettingsAction {
    Show,
    /// Store a value. Anything that is not valid JSON is stored as a string.
    Set { key: String, value: String },
    Reset { key: String },
}

impl CliArgs {
    /// The subcommand to run; `run` with no overrides when none was given.
    pub fn command(&self) -> Command {
        self.command
            .clone()
            .unwrap_or(Command::Run { server: None })
    }

    /// Resolve the configuration file path.
    ///
    /// Priority: --config flag > TAMBOURINE_CONFIG env var > platform default
    /// (~/.tambourine/config.toml).
    pub fn resolve_config_path(&self) -> PathBuf {
        if let Some(ref p) = self.config {
            return p.clone();
        }
        if let Ok(p) = std::env::var("TAMBOURINE_CONFIG") {
            return PathBuf::from(p);
        }
        default_config_path()
    }

    /// Priority: --data-dir flag > config file value.
    pub fn resolve_data_dir(&self) -> Option<String> {
        self.data_dir
            .as_ref()
            .map(|p| p.to_string_lossy().to_string())
    }

    /// Priority: --log-level flag > config file value.
    pub fn resolve_log_level(&self) -> Option<String> {
        self.log_level.clone()
    }
}

/// Parse a `settings set` value: JSON when it parses, a plain string otherwise.
pub fn parse_setting_value(raw: &str) -> serde_json::Value {
    serde_json::from_str(raw).unwrap_or_else(|_| serde_json::Value::String(raw.to_string()))
}

/// Default config file path for the current platform.
fn default_config_path() -> PathBuf {
    #[cfg(target_os = "windows")]
    if let Ok(home) = std::env::var("USERPROFILE") {
        return PathBuf::from(home).join(".tambourine").join("config.toml");
    }
    #[cfg(not(target_os = "windows"))]
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".tambourine").join("config.toml");
    }
    PathBuf::from("config.toml")
}
