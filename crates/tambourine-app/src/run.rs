//! Interactive session: one connection machine driven by stdin commands.
//!
//! Relay events are printed to stdout as JSON lines so another process can
//! follow the connection the way a UI surface would.

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tracing::{info, warn};

use tambourine_core::config::AppConfig;
use tambourine_core::events::{EventRelay, RelayEvent};
use tambourine_core::types::{KeyValueStore, StoreKey};
use tambourine_session::{
    ConnectionMachine, IdentityRegistry, MachineDeps, MachineHandle, MachineSnapshot,
};
use tambourine_storage::{Database, HistoryStore, SettingsStore};
use tambourine_transport::WebRtcTransportFactory;

use crate::cli::parse_setting_value;
use crate::platform::{LogTextInjector, NoCaptureDevice};
use crate::services::{HistorySink, SettingsService};

/// A line typed on stdin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplCommand {
    Start,
    Stop,
    Hold,
    Connect,
    Disconnect,
    Reconnect,
    Providers,
    Paste,
    Status,
    /// `set <key> <value>`: change a setting on the live connection.
    Set { key: String, value: String },
    Quit,
}

impl ReplCommand {
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("set ") {
            let (key, value) = rest.trim().split_once(char::is_whitespace)?;
            return Some(ReplCommand::Set {
                key: key.to_string(),
                value: value.trim().to_string(),
            });
        }
        let cmd = match line.to_ascii_lowercase().as_str() {
            "start" | "toggle" => ReplCommand::Start,
            "stop" => ReplCommand::Stop,
            "hold" => ReplCommand::Hold,
            "connect" => ReplCommand::Connect,
            "disconnect" => ReplCommand::Disconnect,
            "reconnect" => ReplCommand::Reconnect,
            "providers" => ReplCommand::Providers,
            "paste" => ReplCommand::Paste,
            "status" => ReplCommand::Status,
            "quit" | "exit" => ReplCommand::Quit,
            _ => return None,
        };
        Some(cmd)
    }
}

/// Server URL for this run.
///
/// Priority: --server flag > stored `server_url` setting > config file.
pub fn resolve_server_url(
    cli_server: Option<String>,
    store: &dyn KeyValueStore,
    stored_url: &str,
    config_url: &str,
) -> String {
    if let Some(url) = cli_server.filter(|u| !u.trim().is_empty()) {
        return url;
    }
    match store.get(StoreKey::ServerUrl.as_str()) {
        Ok(Some(_)) => stored_url.to_string(),
        _ => config_url.to_string(),
    }
}

pub fn status_json(snapshot: &MachineSnapshot) -> serde_json::Value {
    serde_json::json!({
        "state": snapshot.state,
        "retryCount": snapshot.retry_count,
        "lastError": snapshot.last_error,
        "generation": snapshot.generation,
        "clientUUID": snapshot.identity.as_ref().map(|i| i.as_str().to_string()),
        "serverUrl": snapshot.server_url,
    })
}

/// Build the machine, connect if configured to, and process stdin until
/// `quit` or end of input.
pub async fn run(
    config: AppConfig,
    db: Arc<Database>,
    server: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let relay = EventRelay::new();
    let settings_store = SettingsStore::new(Arc::clone(&db));
    let request_timeout = config.server.request_timeout();

    let identity = Arc::new(IdentityRegistry::new(
        Arc::new(settings_store.clone()),
        request_timeout,
    )?);
    let transports = Arc::new(WebRtcTransportFactory::new(
        config.transport.clone(),
        request_timeout,
    )?);
    let sink = Arc::new(HistorySink::new(
        HistoryStore::new(Arc::clone(&db)),
        Arc::new(LogTextInjector),
        relay.clone(),
    ));

    let machine = ConnectionMachine::spawn(MachineDeps {
        identity,
        transports,
        audio: Arc::new(NoCaptureDevice),
        transcripts: sink.clone(),
        relay: relay.clone(),
        config: config.connection.clone(),
    });
    let settings = SettingsService::new(settings_store.clone(), relay.clone(), Some(machine.clone()));

    let current = settings.load();
    machine.update_config(current.snapshot())?;
    let server_url = resolve_server_url(
        server,
        &settings_store,
        &current.server_url,
        &config.server.url,
    );
    info!(server_url = %server_url, "Tambourine client ready");

    let printer = tokio::spawn(print_events(relay.subscribe()));

    if config.connection.auto_connect {
        machine.connect(server_url.clone())?;
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }
        let Some(command) = ReplCommand::parse(&line) else {
            eprintln!("unknown command: {}", line.trim());
            continue;
        };
        if command == ReplCommand::Quit {
            break;
        }
        if let Err(e) = execute(&command, &machine, &settings, &sink, &server_url) {
            warn!(command = ?command, error = %e, "Command failed");
        }
    }

    machine.shutdown().await?;
    printer.abort();
    info!("Tambourine client stopped");
    Ok(())
}

fn execute(
    command: &ReplCommand,
    machine: &MachineHandle,
    settings: &SettingsService,
    sink: &HistorySink,
    server_url: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        ReplCommand::Start => machine.start_recording()?,
        ReplCommand::Stop => machine.stop_recording()?,
        ReplCommand::Hold => {
            machine.prepare_recording()?;
            machine.start_recording()?;
        }
        ReplCommand::Connect => {
            let url = machine
                .snapshot()
                .server_url
                .unwrap_or_else(|| server_url.to_string());
            machine.connect(url)?;
        }
        ReplCommand::Disconnect => machine.disconnect()?,
        ReplCommand::Reconnect => machine.reconnect()?,
        ReplCommand::Providers => machine.request_providers()?,
        ReplCommand::Paste => {
            if !sink.paste_last()? {
                eprintln!("history is empty");
            }
        }
        ReplCommand::Status => println!("{}", status_json(&machine.snapshot())),
        ReplCommand::Set { key, value } => {
            let key = StoreKey::parse(key).ok_or_else(|| format!("unknown setting: {}", key))?;
            settings.update(key, parse_setting_value(value))?;
        }
        ReplCommand::Quit => {}
    }
    Ok(())
}

async fn print_events(mut events: broadcast::Receiver<RelayEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => match serde_json::to_string(&event) {
                Ok(line) => println!("{}", line),
                Err(e) => warn!(error = %e, "Failed to encode relay event"),
            },
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Event printer lagged behind the relay");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
