//! Tambourine Storage crate - SQLite persistence for settings, identity and history.
//!
//! Provides a WAL-mode SQLite database with migrations, a string key-value
//! store backing user settings and the client identity, and the dictation
//! history list.

pub mod db;
pub mod history;
pub mod migrations;
pub mod settings;

pub use db::Database;
pub use history::{HistoryStore, MAX_HISTORY_ENTRIES};
pub use settings::{SettingsStore, SettingsUpdate};
