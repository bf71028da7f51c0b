//! Local broadcast events mirrored to every UI surface.
//!
//! Each surface subscribes to the same `EventRelay`, so none of them ever
//! reads connection state that diverges from another.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::types::{ConnectionState, ProviderInfo};

/// Capacity of the relay channel. Slow subscribers observe `Lagged`.
pub const RELAY_CAPACITY: usize = 256;

/// Backend reply to a configuration message, tagged by `type`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ConfigResponse {
    ConfigUpdated {
        setting: String,
        value: serde_json::Value,
    },
    ConfigError {
        setting: String,
        error: String,
    },
}

impl ConfigResponse {
    pub fn setting(&self) -> &str {
        match self {
            ConfigResponse::ConfigUpdated { setting, .. }
            | ConfigResponse::ConfigError { setting, .. } => setting,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, ConfigResponse::ConfigError { .. })
    }
}

/// Notifications published to UI surfaces.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "kebab-case")]
#[non_exhaustive]
pub enum RelayEvent {
    ConnectionStateChanged {
        state: ConnectionState,
    },
    ReconnectStarted {},
    ReconnectResult {
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    SettingsChanged {},
    HistoryChanged {},
    ConfigResponse(ConfigResponse),
    AvailableProviders {
        stt: Vec<ProviderInfo>,
        llm: Vec<ProviderInfo>,
    },
}

impl RelayEvent {
    /// Event name as published on the bus.
    pub fn event_name(&self) -> &'static str {
        match self {
            RelayEvent::ConnectionStateChanged { .. } => "connection-state-changed",
            RelayEvent::ReconnectStarted {} => "reconnect-started",
            RelayEvent::ReconnectResult { .. } => "reconnect-result",
            RelayEvent::SettingsChanged {} => "settings-changed",
            RelayEvent::HistoryChanged {} => "history-changed",
            RelayEvent::ConfigResponse(_) => "config-response",
            RelayEvent::AvailableProviders { .. } => "available-providers",
        }
    }
}

/// In-process publish/subscribe bus for `RelayEvent`s.
#[derive(Clone, Debug)]
pub struct EventRelay {
    tx: broadcast::Sender<RelayEvent>,
}

impl Default for EventRelay {
    fn default() -> Self {
        Self::new()
    }
}

impl EventRelay {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(RELAY_CAPACITY);
        Self { tx }
    }

    /// Publish an event. Returns the number of subscribers that received it.
    pub fn emit(&self, event: RelayEvent) -> usize {
        tracing::trace!(event = event.event_name(), "Relay event");
        // No subscribers is not an error: surfaces may attach later.
        self.tx.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RelayEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
