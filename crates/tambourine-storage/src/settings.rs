//! Key-value settings store.
//!
//! Every user setting is one row holding a JSON document under its
//! `StoreKey` name. The client identity lives in the same table under its
//! own key, written by the identity registry through `KeyValueStore`.

use std::sync::Arc;

use rusqlite::OptionalExtension;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use tambourine_core::error::{Result, TambourineError};
use tambourine_core::types::{validate_stt_timeout, AppSettings, HotkeyKind, KeyValueStore, StoreKey};

use crate::db::Database;

/// Outcome of a successful settings update.
#[derive(Debug, Clone)]
pub struct SettingsUpdate {
    pub key: StoreKey,
    pub previous: AppSettings,
    pub current: AppSettings,
}

impl SettingsUpdate {
    /// Whether the backend-relevant snapshot changed.
    pub fn snapshot_changed(&self) -> bool {
        self.previous.snapshot() != self.current.snapshot()
    }

    pub fn server_changed(&self) -> bool {
        self.previous.server_url != self.current.server_url
    }
}

/// SQLite-backed settings and identity store.
#[derive(Debug, Clone)]
pub struct SettingsStore {
    db: Arc<Database>,
}

impl SettingsStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    fn get_json<T: DeserializeOwned>(&self, key: StoreKey) -> Option<T> {
        let raw = match self.get(key.as_str()) {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to read setting");
                return None;
            }
        };
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(key = %key, error = %e, "Ignoring malformed setting");
                None
            }
        }
    }

    fn set_json<T: Serialize>(&self, key: StoreKey, value: &T) -> Result<()> {
        let raw = serde_json::to_string(value)?;
        self.set(key.as_str(), &raw)
    }

    /// Load all settings, substituting defaults for missing or malformed keys.
    pub fn load(&self) -> AppSettings {
        let d = AppSettings::default();
        AppSettings {
            toggle_hotkey: self
                .get_json(StoreKey::ToggleHotkey)
                .unwrap_or(d.toggle_hotkey),
            hold_hotkey: self.get_json(StoreKey::HoldHotkey).unwrap_or(d.hold_hotkey),
            paste_last_hotkey: self
                .get_json(StoreKey::PasteLastHotkey)
                .unwrap_or(d.paste_last_hotkey),
            selected_mic_id: self
                .get_json(StoreKey::SelectedMicId)
                .unwrap_or(d.selected_mic_id),
            sound_enabled: self
                .get_json(StoreKey::SoundEnabled)
                .unwrap_or(d.sound_enabled),
            cleanup_prompt_sections: self
                .get_json(StoreKey::CleanupPromptSections)
                .unwrap_or(d.cleanup_prompt_sections),
            stt_provider: self
                .get_json(StoreKey::SttProvider)
                .unwrap_or(d.stt_provider),
            llm_provider: self
                .get_json(StoreKey::LlmProvider)
                .unwrap_or(d.llm_provider),
            auto_mute_audio: self
                .get_json(StoreKey::AutoMuteAudio)
                .unwrap_or(d.auto_mute_audio),
            stt_timeout_seconds: self
                .get_json(StoreKey::SttTimeoutSeconds)
                .unwrap_or(d.stt_timeout_seconds),
            server_url: self.get_json(StoreKey::ServerUrl).unwrap_or(d.server_url),
        }
    }

    /// Validate and persist one setting given as a JSON value.
    pub fn update(&self, key: StoreKey, value: serde_json::Value) -> Result<SettingsUpdate> {
        let previous = self.load();
        let mut current = previous.clone();
        apply(&mut current, key, value)?;
        self.persist(key, &current)?;
        debug!(key = %key, "Setting updated");
        Ok(SettingsUpdate {
            key,
            previous,
            current,
        })
    }

    /// Remove a persisted setting so its default applies again.
    pub fn reset(&self, key: StoreKey) -> Result<SettingsUpdate> {
        let previous = self.load();
        self.delete(key.as_str())?;
        let current = self.load();
        Ok(SettingsUpdate {
            key,
            previous,
            current,
        })
    }

    fn persist(&self, key: StoreKey, s: &AppSettings) -> Result<()> {
        match key {
            StoreKey::ToggleHotkey => self.set_json(key, &s.toggle_hotkey),
            StoreKey::HoldHotkey => self.set_json(key, &s.hold_hotkey),
            StoreKey::PasteLastHotkey => self.set_json(key, &s.paste_last_hotkey),
            StoreKey::SelectedMicId => self.set_json(key, &s.selected_mic_id),
            StoreKey::SoundEnabled => self.set_json(key, &s.sound_enabled),
            StoreKey::CleanupPromptSections => self.set_json(key, &s.cleanup_prompt_sections),
            StoreKey::SttProvider => self.set_json(key, &s.stt_provider),
            StoreKey::LlmProvider => self.set_json(key, &s.llm_provider),
            StoreKey::AutoMuteAudio => self.set_json(key, &s.auto_mute_audio),
            StoreKey::SttTimeoutSeconds => self.set_json(key, &s.stt_timeout_seconds),
            StoreKey::ServerUrl => self.set_json(key, &s.server_url),
        }
    }
}

fn parse<T: DeserializeOwned>(key: StoreKey, value: serde_json::Value) -> Result<T> {
    serde_json::from_value(value).map_err(|e| TambourineError::InvalidSetting {
        field: key.as_str().to_string(),
        message: e.to_string(),
    })
}

fn apply(s: &mut AppSettings, key: StoreKey, value: serde_json::Value) -> Result<()> {
    if let Some(kind) = HotkeyKind::from_store_key(key) {
        let hotkey = parse(key, value)?;
        s.check_hotkey_conflict(&hotkey, kind)?;
        match kind {
            HotkeyKind::Toggle => s.toggle_hotkey = hotkey,
            HotkeyKind::Hold => s.hold_hotkey = hotkey,
            HotkeyKind::PasteLast => s.paste_last_hotkey = hotkey,
        }
        return Ok(());
    }

    match key {
        StoreKey::SelectedMicId => s.selected_mic_id = parse(key, value)?,
        StoreKey::SoundEnabled => s.sound_enabled = parse(key, value)?,
        StoreKey::CleanupPromptSections => s.cleanup_prompt_sections = parse(key, value)?,
        StoreKey::SttProvider => s.stt_provider = parse(key, value)?,
        StoreKey::LlmProvider => s.llm_provider = parse(key, value)?,
        StoreKey::AutoMuteAudio => s.auto_mute_audio = parse(key, value)?,
        StoreKey::SttTimeoutSeconds => {
            let timeout: Option<f64> = parse(key, value)?;
            if let Some(t) = timeout {
                validate_stt_timeout(t)?;
            }
            s.stt_timeout_seconds = timeout;
        }
        StoreKey::ServerUrl => {
            let url: String = parse(key, value)?;
            let url = url.trim().trim_end_matches('/').to_string();
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(TambourineError::InvalidSetting {
                    field: key.as_str().to_string(),
                    message: "must be an http(s) URL".to_string(),
                });
            }
            s.server_url = url;
        }
        StoreKey::ToggleHotkey | StoreKey::HoldHotkey | StoreKey::PasteLastHotkey => {}
    }
    Ok(())
}

impl KeyValueStore for SettingsStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT value FROM settings WHERE key = ?1",
                rusqlite::params![key],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| TambourineError::Storage(format!("Failed to read {}: {}", key, e)))
        })
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO settings (key, value, updated_at)
                 VALUES (?1, ?2, strftime('%s', 'now'))
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value,
                                                updated_at = excluded.updated_at",
                rusqlite::params![key, value],
            )
            .map_err(|e| TambourineError::Storage(format!("Failed to write {}: {}", key, e)))?;
            Ok(())
        })
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.db.with_conn(|conn| {
            conn.execute("DELETE FROM settings WHERE key = ?1", rusqlite::params![key])
                .map_err(|e| TambourineError::Storage(format!("Failed to delete {}: {}", key, e)))?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tambourine_core::types::{CleanupPromptSections, HotkeyConfig, PromptSection};

    fn store() -> SettingsStore {
        SettingsStore::new(Arc::new(Database::in_memory().unwrap()))
    }

    // =========================================================================
    // Key-value access
    // =========================================================================

    #[test]
    fn test_get_set_delete() {
        let store = store();
        assert_eq!(store.get("client_uuid").unwrap(), None);

        store.set("client_uuid", "abc").unwrap();
        assert_eq!(store.get("client_uuid").unwrap().as_deref(), Some("abc"));

        store.set("client_uuid", "def").unwrap();
        assert_eq!(store.get("client_uuid").unwrap().as_deref(), Some("def"));

        store.delete("client_uuid").unwrap();
        assert_eq!(store.get("client_uuid").unwrap(), None);

        // Deleting a missing key is not an error.
        store.delete("client_uuid").unwrap();
    }

    // =========================================================================
    // Typed settings
    // =========================================================================

    #[test]
    fn test_load_defaults_when_empty() {
        assert_eq!(store().load(), AppSettings::default());
    }

    #[test]
    fn test_load_ignores_malformed_value() {
        let store = store();
        store.set("sound_enabled", "not json").unwrap();
        assert!(store.load().sound_enabled);
    }

    #[test]
    fn test_update_provider_changes_snapshot() {
        let store = store();
        let update = store.update(StoreKey::SttProvider, json!("whisper")).unwrap();
        assert!(update.snapshot_changed());
        assert!(!update.server_changed());
        assert_eq!(store.load().stt_provider, "whisper");
    }

    #[test]
    fn test_update_prompt_sections() {
        let store = store();
        let sections = CleanupPromptSections {
            main: PromptSection::Auto { enabled: true },
            advanced: PromptSection::Manual {
                enabled: true,
                content: "Keep code blocks.".into(),
            },
            dictionary: PromptSection::Auto { enabled: false },
        };
        store
            .update(
                StoreKey::CleanupPromptSections,
                serde_json::to_value(&sections).unwrap(),
            )
            .unwrap();
        assert_eq!(store.load().cleanup_prompt_sections, Some(sections));
    }

    #[test]
    fn test_update_non_synced_key_keeps_snapshot() {
        let store = store();
        let update = store.update(StoreKey::SoundEnabled, json!(false)).unwrap();
        assert!(!update.snapshot_changed());
        assert!(!store.load().sound_enabled);
    }

    #[test]
    fn test_update_rejects_out_of_range_timeout() {
        let store = store();
        let err = store
            .update(StoreKey::SttTimeoutSeconds, json!(42.0))
            .unwrap_err();
        assert!(matches!(err, TambourineError::InvalidSetting { .. }));
        assert_eq!(store.load().stt_timeout_seconds, None);

        store.update(StoreKey::SttTimeoutSeconds, json!(1.5)).unwrap();
        assert_eq!(store.load().stt_timeout_seconds, Some(1.5));

        store.update(StoreKey::SttTimeoutSeconds, json!(null)).unwrap();
        assert_eq!(store.load().stt_timeout_seconds, None);
    }

    #[test]
    fn test_update_rejects_conflicting_hotkey() {
        let store = store();
        let hold = serde_json::to_value(HotkeyConfig::default_hold()).unwrap();
        let err = store.update(StoreKey::ToggleHotkey, hold).unwrap_err();
        assert!(matches!(err, TambourineError::HotkeyConflict { .. }));
        assert_eq!(store.load().toggle_hotkey, HotkeyConfig::default_toggle());
    }

    #[test]
    fn test_update_rejects_wrong_type() {
        let err = store()
            .update(StoreKey::SoundEnabled, json!("yes"))
            .unwrap_err();
        assert!(matches!(err, TambourineError::InvalidSetting { .. }));
    }

    #[test]
    fn test_update_server_url_normalizes() {
        let store = store();
        let update = store
            .update(StoreKey::ServerUrl, json!(" http://10.0.0.2:8765/ "))
            .unwrap();
        assert!(update.server_changed());
        assert_eq!(store.load().server_url, "http://10.0.0.2:8765");

        assert!(store.update(StoreKey::ServerUrl, json!("ftp://x")).is_err());
    }

    #[test]
    fn test_reset_restores_default() {
        let store = store();
        store.update(StoreKey::LlmProvider, json!("ollama")).unwrap();
        let update = store.reset(StoreKey::LlmProvider).unwrap();
        assert_eq!(update.previous.llm_provider, "ollama");
        assert_eq!(update.current.llm_provider, "auto");
    }
}
