//! Tambourine client binary - composition root.
//!
//! 1. Parse CLI arguments and load configuration from TOML
//! 2. Initialize tracing
//! 3. Open the settings and history database
//! 4. Run the requested subcommand (the interactive client by default)

mod cli;
mod platform;
mod run;
mod services;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use tambourine_core::config::AppConfig;
use tambourine_core::error::TambourineError;
use tambourine_core::events::EventRelay;
use tambourine_core::types::StoreKey;
use tambourine_session::{IdentityRegistry, IdentityService};
use tambourine_storage::{Database, HistoryStore, SettingsStore};

use cli::{CliArgs, Command, HistoryAction, IdentityAction, SettingsAction};
use services::SettingsService;

/// Expand ~ to home directory in a path string.
fn resolve_data_dir(data_dir: &str) -> PathBuf {
    if data_dir.starts_with("~/") || data_dir.starts_with("~\\") {
        #[cfg(target_os = "windows")]
        let home = std::env::var("USERPROFILE").unwrap_or_else(|_| ".".to_string());
        #[cfg(not(target_os = "windows"))]
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        PathBuf::from(home).join(&data_dir[2..])
    } else {
        PathBuf::from(data_dir)
    }
}

fn parse_key(name: &str) -> Result<StoreKey, TambourineError> {
    StoreKey::parse(name).ok_or_else(|| TambourineError::InvalidSetting {
        field: name.to_string(),
        message: "unknown setting".to_string(),
    })
}

fn identity_command(
    action: IdentityAction,
    config: &AppConfig,
    store: SettingsStore,
) -> Result<(), Box<dyn std::error::Error>> {
    let registry = IdentityRegistry::new(Arc::new(store), config.server.request_timeout())?;
    match action {
        IdentityAction::Show => match registry.load()? {
            Some(identity) => println!("{}", identity.as_str()),
            None => println!("no identity registered"),
        },
        IdentityAction::Reset => {
            registry.clear()?;
            tracing::info!("Client identity cleared");
        }
    }
    Ok(())
}

fn history_command(
    action: HistoryAction,
    history: HistoryStore,
) -> Result<(), Box<dyn std::error::Error>> {
    match action {
        HistoryAction::List { limit } => {
            for entry in history.list(limit)? {
                println!("{}", serde_json::to_string(&entry)?);
            }
        }
        HistoryAction::Delete { id } => {
            if !history.delete(id)? {
                return Err(format!("no history entry {}", id).into());
            }
        }
        HistoryAction::Clear => {
            let removed = history.clear()?;
            println!("removed {} entries", removed);
        }
    }
    Ok(())
}

fn settings_command(
    action: SettingsAction,
    settings: SettingsService,
) -> Result<(), Box<dyn std::error::Error>> {
    let current = match action {
        SettingsAction::Show => settings.load(),
        SettingsAction::Set { key, value } => {
            settings.update(parse_key(&key)?, cli::parse_setting_value(&value))?
        }
        SettingsAction::Reset { key } => settings.reset(parse_key(&key)?)?,
    };
    println!("{}", serde_json::to_string_pretty(&current)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = CliArgs::parse();

    // Config.
    let config_file = args.resolve_config_path();
    let mut config = AppConfig::load_or_default(&config_file);
    if let Some(dir) = args.resolve_data_dir() {
        config.general.data_dir = dir;
    }

    // Tracing. RUST_LOG wins over --log-level, which wins over the config file.
    let level = args
        .resolve_log_level()
        .unwrap_or_else(|| config.general.log_level.clone());
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&level)),
        )
        .with_writer(std::io::stderr)
        .init();

    tracing::info!("Starting Tambourine v{}", env!("CARGO_PKG_VERSION"));
    tracing::debug!(path = %config_file.display(), "Configuration resolved");

    // Storage.
    let data_dir = resolve_data_dir(&config.general.data_dir);
    if let Err(e) = std::fs::create_dir_all(&data_dir) {
        tracing::error!(path = %data_dir.display(), error = %e, "Failed to create data directory");
        return Err(e.into());
    }
    let db_path = data_dir.join("tambourine.db");
    let db = Arc::new(Database::new(&db_path)?);
    tracing::info!(path = %db_path.display(), "SQLite database opened");

    match args.command() {
        Command::Run { server } => run::run(config, db, server).await,
        Command::Identity { action } => identity_command(action, &config, SettingsStore::new(db)),
        Command::History { action } => history_command(action, HistoryStore::new(db)),
        Command::Settings { action } => settings_command(
            action,
            SettingsService::new(SettingsStore::new(db), EventRelay::new(), None),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_data_dir_keeps_plain_paths() {
        assert_eq!(resolve_data_dir("/var/lib/tambourine"), PathBuf::from("/var/lib/tambourine"));
    }

    #[test]
    fn test_resolve_data_dir_expands_home() {
        let resolved = resolve_data_dir("~/.tambourine/data");
        assert!(resolved.ends_with(".tambourine/data"));
        assert!(!resolved.to_string_lossy().starts_with('~'));
    }

    #[test]
    fn test_parse_key_rejects_unknown_names() {
        assert_eq!(parse_key("server_url").unwrap(), StoreKey::ServerUrl);
        assert!(matches!(
            parse_key("volume"),
            Err(TambourineError::InvalidSetting { .. })
        ));
    }
}
