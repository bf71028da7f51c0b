//! Shared domain types for the Tambourine client.
//!
//! Newtypes, settings value objects, and the key-value store seam used by
//! both the storage crate and the session crate.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::DEFAULT_SERVER_URL;
use crate::error::{Result, TambourineError};

// =============================================================================
// Identity
// =============================================================================

/// Opaque token identifying this client instance to the backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientIdentity(pub String);

impl ClientIdentity {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ClientIdentity {
    fn from(value: String) -> Self {
        Self(value)
    }
}

// =============================================================================
// Key-value store seam
// =============================================================================

/// Minimal string key-value store consulted for settings and identity.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
    fn delete(&self, key: &str) -> Result<()>;
}

/// Keys of the user settings persisted in the key-value store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreKey {
    ToggleHotkey,
    HoldHotkey,
    PasteLastHotkey,
    SelectedMicId,
    SoundEnabled,
    CleanupPromptSections,
    SttProvider,
    LlmProvider,
    AutoMuteAudio,
    SttTimeoutSeconds,
    ServerUrl,
}

impl StoreKey {
    pub const ALL: [StoreKey; 11] = [
        StoreKey::ToggleHotkey,
        StoreKey::HoldHotkey,
        StoreKey::PasteLastHotkey,
        StoreKey::SelectedMicId,
        StoreKey::SoundEnabled,
        StoreKey::CleanupPromptSections,
        StoreKey::SttProvider,
        StoreKey::LlmProvider,
        StoreKey::AutoMuteAudio,
        StoreKey::SttTimeoutSeconds,
        StoreKey::ServerUrl,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            StoreKey::ToggleHotkey => "toggle_hotkey",
            StoreKey::HoldHotkey => "hold_hotkey",
            StoreKey::PasteLastHotkey => "paste_last_hotkey",
            StoreKey::SelectedMicId => "selected_mic_id",
            StoreKey::SoundEnabled => "sound_enabled",
            StoreKey::CleanupPromptSections => "cleanup_prompt_sections",
            StoreKey::SttProvider => "stt_provider",
            StoreKey::LlmProvider => "llm_provider",
            StoreKey::AutoMuteAudio => "auto_mute_audio",
            StoreKey::SttTimeoutSeconds => "stt_timeout_seconds",
            StoreKey::ServerUrl => "server_url",
        }
    }

    /// Parse a store key from its persisted name.
    pub fn parse(name: &str) -> Option<StoreKey> {
        StoreKey::ALL.into_iter().find(|k| k.as_str() == name)
    }

    /// Whether a change to this key alters the synchronized config snapshot.
    pub fn is_synced(self) -> bool {
        matches!(
            self,
            StoreKey::CleanupPromptSections
                | StoreKey::SttProvider
                | StoreKey::LlmProvider
                | StoreKey::SttTimeoutSeconds
        )
    }
}

impl fmt::Display for StoreKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// =============================================================================
// Hotkeys
// =============================================================================

const DEFAULT_HOTKEY_MODIFIERS: [&str; 2] = ["ctrl", "alt"];

/// A global hotkey combination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HotkeyConfig {
    pub modifiers: Vec<String>,
    pub key: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl HotkeyConfig {
    fn with_key(key: &str) -> Self {
        Self {
            modifiers: DEFAULT_HOTKEY_MODIFIERS.iter().map(|m| m.to_string()).collect(),
            key: key.to_string(),
            enabled: true,
        }
    }

    pub fn default_toggle() -> Self {
        Self::with_key("Space")
    }

    pub fn default_hold() -> Self {
        Self::with_key("Backquote")
    }

    pub fn default_paste_last() -> Self {
        Self::with_key("Period")
    }

    /// Render as `ctrl+alt+Space`, modifiers lowercased.
    pub fn to_shortcut_string(&self) -> String {
        let mut parts: Vec<String> = self.modifiers.iter().map(|m| m.to_lowercase()).collect();
        parts.push(self.key.clone());
        parts.join("+")
    }

    /// Case-insensitive comparison, ignoring modifier order.
    pub fn is_same_as(&self, other: &HotkeyConfig) -> bool {
        if !self.key.eq_ignore_ascii_case(&other.key) {
            return false;
        }
        if self.modifiers.len() != other.modifiers.len() {
            return false;
        }
        self.modifiers
            .iter()
            .all(|a| other.modifiers.iter().any(|b| a.eq_ignore_ascii_case(b)))
    }
}

/// Which of the three global hotkeys a value belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HotkeyKind {
    Toggle,
    Hold,
    PasteLast,
}

impl HotkeyKind {
    pub fn store_key(self) -> StoreKey {
        match self {
            HotkeyKind::Toggle => StoreKey::ToggleHotkey,
            HotkeyKind::Hold => StoreKey::HoldHotkey,
            HotkeyKind::PasteLast => StoreKey::PasteLastHotkey,
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            HotkeyKind::Toggle => "toggle",
            HotkeyKind::Hold => "hold",
            HotkeyKind::PasteLast => "paste last",
        }
    }

    pub fn from_store_key(key: StoreKey) -> Option<HotkeyKind> {
        match key {
            StoreKey::ToggleHotkey => Some(HotkeyKind::Toggle),
            StoreKey::HoldHotkey => Some(HotkeyKind::Hold),
            StoreKey::PasteLastHotkey => Some(HotkeyKind::PasteLast),
            _ => None,
        }
    }
}

// =============================================================================
// Prompt sections and providers
// =============================================================================

/// One section of the cleanup prompt, tagged by `mode`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum PromptSection {
    /// Use the backend's built-in prompt.
    Auto { enabled: bool },
    /// Use user-supplied content.
    Manual { enabled: bool, content: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupPromptSections {
    pub main: PromptSection,
    pub advanced: PromptSection,
    pub dictionary: PromptSection,
}

/// A speech-to-text or language-model provider offered by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderInfo {
    pub value: String,
    pub label: String,
    pub is_local: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

// =============================================================================
// Settings
// =============================================================================

pub const STT_TIMEOUT_MIN_SECS: f64 = 0.1;
pub const STT_TIMEOUT_MAX_SECS: f64 = 10.0;

/// Complete user settings as persisted in the key-value store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppSettings {
    pub toggle_hotkey: HotkeyConfig,
    pub hold_hotkey: HotkeyConfig,
    pub paste_last_hotkey: HotkeyConfig,
    pub selected_mic_id: Option<String>,
    pub sound_enabled: bool,
    pub cleanup_prompt_sections: Option<CleanupPromptSections>,
    pub stt_provider: String,
    pub llm_provider: String,
    pub auto_mute_audio: bool,
    pub stt_timeout_seconds: Option<f64>,
    pub server_url: String,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            toggle_hotkey: HotkeyConfig::default_toggle(),
            hold_hotkey: HotkeyConfig::default_hold(),
            paste_last_hotkey: HotkeyConfig::default_paste_last(),
            selected_mic_id: None,
            sound_enabled: true,
            cleanup_prompt_sections: None,
            stt_provider: "auto".to_string(),
            llm_provider: "auto".to_string(),
            auto_mute_audio: false,
            stt_timeout_seconds: None,
            server_url: DEFAULT_SERVER_URL.to_string(),
        }
    }
}

impl AppSettings {
    pub fn hotkey(&self, kind: HotkeyKind) -> &HotkeyConfig {
        match kind {
            HotkeyKind::Toggle => &self.toggle_hotkey,
            HotkeyKind::Hold => &self.hold_hotkey,
            HotkeyKind::PasteLast => &self.paste_last_hotkey,
        }
    }

    /// Returns an error if `candidate` is already bound to a hotkey other than `kind`.
    pub fn check_hotkey_conflict(&self, candidate: &HotkeyConfig, kind: HotkeyKind) -> Result<()> {
        for other in [HotkeyKind::Toggle, HotkeyKind::Hold, HotkeyKind::PasteLast] {
            if other != kind && candidate.is_same_as(self.hotkey(other)) {
                return Err(TambourineError::HotkeyConflict {
                    hotkey: candidate.to_shortcut_string(),
                    conflicts_with: other.display_name().to_string(),
                });
            }
        }
        Ok(())
    }

    /// The backend-relevant subset tracked for synchronization.
    pub fn snapshot(&self) -> ConfigSnapshot {
        ConfigSnapshot {
            prompt_sections: self.cleanup_prompt_sections.clone(),
            stt_provider: Some(self.stt_provider.clone()),
            llm_provider: Some(self.llm_provider.clone()),
            stt_timeout_seconds: self.stt_timeout_seconds,
        }
    }
}

/// Validate an STT timeout against the range the backend accepts.
pub fn validate_stt_timeout(value: f64) -> Result<()> {
    if !(STT_TIMEOUT_MIN_SECS..=STT_TIMEOUT_MAX_SECS).contains(&value) {
        return Err(TambourineError::InvalidSetting {
            field: StoreKey::SttTimeoutSeconds.as_str().to_string(),
            message: format!(
                "must be between {} and {} seconds",
                STT_TIMEOUT_MIN_SECS, STT_TIMEOUT_MAX_SECS
            ),
        });
    }
    Ok(())
}

/// Settings the backend needs, compared field by field between syncs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigSnapshot {
    pub prompt_sections: Option<CleanupPromptSections>,
    pub stt_provider: Option<String>,
    pub llm_provider: Option<String>,
    pub stt_timeout_seconds: Option<f64>,
}

// =============================================================================
// Connection state
// =============================================================================

/// Lifecycle state of the backend connection, as shown to every UI surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Initializing,
    Connecting,
    Idle,
    Recording,
    Processing,
    Retrying,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Initializing => "initializing",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Idle => "idle",
            ConnectionState::Recording => "recording",
            ConnectionState::Processing => "processing",
            ConnectionState::Retrying => "retrying",
        };
        write!(f, "{}", name)
    }
}

impl ConnectionState {
    /// States in which a ready transport session is held.
    pub fn is_connected(self) -> bool {
        matches!(
            self,
            ConnectionState::Idle | ConnectionState::Recording | ConnectionState::Processing
        )
    }

    /// States in which a transport session may exist.
    pub fn holds_session(self) -> bool {
        self == ConnectionState::Connecting || self.is_connected()
    }
}

// =============================================================================
// History
// =============================================================================

/// One completed dictation, newest entries listed first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_text: Option<String>,
}

impl HistoryEntry {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            text: text.into(),
            raw_text: None,
        }
    }
}
