//! Application services wiring storage, the relay and the connection machine.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use tambourine_core::error::Result;
use tambourine_core::events::{EventRelay, RelayEvent};
use tambourine_core::types::{AppSettings, HistoryEntry, StoreKey};
use tambourine_session::{MachineHandle, TranscriptSink};
use tambourine_storage::{HistoryStore, SettingsStore, SettingsUpdate};

use crate::platform::TextInjector;

// =============================================================================
// Transcript delivery
// =============================================================================

/// Types finished transcripts and records them in the history.
pub struct HistorySink {
    history: HistoryStore,
    injector: Arc<dyn TextInjector>,
    relay: EventRelay,
}

impl HistorySink {
    pub fn new(history: HistoryStore, injector: Arc<dyn TextInjector>, relay: EventRelay) -> Self {
        Self {
            history,
            injector,
            relay,
        }
    }

    /// Re-type the newest history entry. Returns false when history is empty.
    pub fn paste_last(&self) -> Result<bool> {
        match self.history.latest()? {
            Some(entry) => {
                self.injector.inject(&entry.text)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[async_trait]
impl TranscriptSink for HistorySink {
    async fn deliver(&self, text: String) {
        if let Err(e) = self.injector.inject(&text) {
            warn!(error = %e, "Text injection failed");
        }
        match self.history.add(&HistoryEntry::new(text.trim())) {
            Ok(()) => {
                self.relay.emit(RelayEvent::HistoryChanged {});
            }
            Err(e) => warn!(error = %e, "Failed to record transcript in history"),
        }
    }
}

// =============================================================================
// Settings
// =============================================================================

/// Settings access that keeps UI surfaces and the connection machine in step.
pub struct SettingsService {
    store: SettingsStore,
    relay: EventRelay,
    machine: Option<MachineHandle>,
}

impl SettingsService {
    /// `machine` is `None` for one-shot CLI commands with no live connection.
    pub fn new(store: SettingsStore, relay: EventRelay, machine: Option<MachineHandle>) -> Self {
        Self {
            store,
            relay,
            machine,
        }
    }

    pub fn load(&self) -> AppSettings {
        self.store.load()
    }

    pub fn update(&self, key: StoreKey, value: serde_json::Value) -> Result<AppSettings> {
        let update = self.store.update(key, value)?;
        self.publish(&update)?;
        Ok(update.current)
    }

    pub fn reset(&self, key: StoreKey) -> Result<AppSettings> {
        let update = self.store.reset(key)?;
        self.publish(&update)?;
        Ok(update.current)
    }

    fn publish(&self, update: &SettingsUpdate) -> Result<()> {
        info!(key = %update.key, "Setting updated");
        self.relay.emit(RelayEvent::SettingsChanged {});

        let Some(machine) = &self.machine else {
            return Ok(());
        };
        if update.snapshot_changed() {
            debug!(key = %update.key, "Pushing config snapshot to the connection machine");
            machine.update_config(update.current.snapshot())?;
        }
        if update.server_changed() {
            machine.change_server(update.current.server_url.clone())?;
        }
        Ok(())
    }
}
