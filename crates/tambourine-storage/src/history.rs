//! Dictation history, newest first, capped at `MAX_HISTORY_ENTRIES`.

use std::sync::Arc;

use chrono::{TimeZone, Utc};
use uuid::Uuid;

use tambourine_core::error::{Result, TambourineError};
use tambourine_core::types::HistoryEntry;

use crate::db::Database;

pub const MAX_HISTORY_ENTRIES: usize = 500;

#[derive(Debug, Clone)]
pub struct HistoryStore {
    db: Arc<Database>,
}

impl HistoryStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Append an entry and drop the oldest ones beyond the cap.
    pub fn add(&self, entry: &HistoryEntry) -> Result<()> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO history (id, timestamp, text, raw_text) VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![
                    entry.id.to_string(),
                    entry.timestamp.timestamp_millis(),
                    entry.text,
                    entry.raw_text,
                ],
            )
            .map_err(|e| TambourineError::Storage(format!("Failed to save history entry: {}", e)))?;

            conn.execute(
                "DELETE FROM history WHERE id NOT IN (
                    SELECT id FROM history ORDER BY timestamp DESC, rowid DESC LIMIT ?1
                 )",
                rusqlite::params![MAX_HISTORY_ENTRIES as i64],
            )
            .map_err(|e| TambourineError::Storage(format!("Failed to trim history: {}", e)))?;
            Ok(())
        })
    }

    /// List entries, newest first.
    pub fn list(&self, limit: Option<usize>) -> Result<Vec<HistoryEntry>> {
        let limit = limit.unwrap_or(MAX_HISTORY_ENTRIES).min(MAX_HISTORY_ENTRIES) as i64;
        self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, timestamp, text, raw_text FROM history
                     ORDER BY timestamp DESC, rowid DESC LIMIT ?1",
                )
                .map_err(|e| TambourineError::Storage(e.to_string()))?;

            let rows = stmt
                .query_map(rusqlite::params![limit], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, Option<String>>(3)?,
                    ))
                })
                .map_err(|e| TambourineError::Storage(e.to_string()))?;

            let mut entries = Vec::new();
            for row in rows {
                let (id, millis, text, raw_text) =
                    row.map_err(|e| TambourineError::Storage(e.to_string()))?;
                let id = Uuid::parse_str(&id)
                    .map_err(|e| TambourineError::Storage(format!("Bad history id: {}", e)))?;
                let timestamp = Utc
                    .timestamp_millis_opt(millis)
                    .single()
                    .ok_or_else(|| TambourineError::Storage(format!("Bad timestamp: {}", millis)))?;
                entries.push(HistoryEntry {
                    id,
                    timestamp,
                    text,
                    raw_text,
                });
            }
            Ok(entries)
        })
    }

    /// The most recent entry, used by the paste-last hotkey.
    pub fn latest(&self) -> Result<Option<HistoryEntry>> {
        Ok(self.list(Some(1))?.into_iter().next())
    }

    /// Delete one entry. Returns whether it existed.
    pub fn delete(&self, id: Uuid) -> Result<bool> {
        self.db.with_conn(|conn| {
            let n = conn
                .execute(
                    "DELETE FROM history WHERE id = ?1",
                    rusqlite::params![id.to_string()],
                )
                .map_err(|e| TambourineError::Storage(e.to_string()))?;
            Ok(n > 0)
        })
    }

    /// Remove every entry. Returns how many were removed.
    pub fn clear(&self) -> Result<usize> {
        self.db.with_conn(|conn| {
            conn.execute("DELETE FROM history", [])
                .map_err(|e| TambourineError::Storage(e.to_string()))
        })
    }
}
