use std::path::Path;

use anyhow::{Context, Result};
use doselog_core::{JournalError, SlotStorage};
use rusqlite::{params, Connection, OptionalExtension};

const CREATE_SLOTS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS slots (
  key TEXT PRIMARY KEY,
  value TEXT NOT NULL
);
";

/// SQLite-backed named slot storage. Each slot is one row; `set` is a
/// synchronous upsert, so the new value is durable when the call returns.
pub struct SqliteSlots {
    conn: Connection,
}

impl SqliteSlots {
    /// Open (creating if needed) slot storage at the given database path.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or initialized.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        conn.execute_batch(CREATE_SLOTS_SQL).context("failed to create slots table")?;

        Ok(Self { conn })
    }
}

impl SlotStorage for SqliteSlots {
    fn get(&self, key: &str) -> Result<Option<String>, JournalError> {
        let mut stmt = self
            .conn
            .prepare("SELECT value FROM slots WHERE key = ?1")
            .map_err(|err| JournalError::Storage(format!("failed to prepare slot read: {err}")))?;

        stmt.query_row(params![key], |row| row.get::<_, String>(0))
            .optional()
            .map_err(|err| JournalError::Storage(format!("failed to read slot {key}: {err}")))
    }

    fn set(&mut self, key: &str, value: &str) -> Result<(), JournalError> {
        self.conn
            .execute(
                "INSERT INTO slots(key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![key, value],
            )
            .map_err(|err| JournalError::Storage(format!("failed to write slot {key}: {err}")))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;

    use doselog_core::{
        build_entry, default_questions, EntryStore, FormSession, SchemaStore, ENTRIES_SLOT,
    };
    use ulid::Ulid;

    use super::*;

    fn unique_temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("doselog-slots-{}.sqlite3", Ulid::new()))
    }

    fn cleanup(path: &Path) {
        for suffix in ["", "-wal", "-shm"] {
            let candidate = if suffix.is_empty() {
                path.to_path_buf()
            } else {
                PathBuf::from(format!("{}{}", path.display(), suffix))
            };
            if candidate.exists() {
                let _ = fs::remove_file(&candidate);
            }
        }
    }

    #[test]
    fn slot_round_trips_across_connections() -> Result<()> {
        let db_path = unique_temp_db_path();

        {
            let mut slots = SqliteSlots::open(&db_path)?;
            slots.set("greeting", "hello")?;
            slots.set("greeting", "hello again")?;
        }

        let slots = SqliteSlots::open(&db_path)?;
        assert_eq!(slots.get("greeting")?, Some("hello again".to_string()));
        assert_eq!(slots.get("missing")?, None);

        cleanup(&db_path);
        Ok(())
    }

    #[test]
    fn entry_collection_survives_reopen() -> Result<()> {
        let db_path = unique_temp_db_path();
        let schema = default_questions();

        {
            let slots = SqliteSlots::open(&db_path)?;
            let mut store = EntryStore::new(slots);
            let mut session = FormSession::from_schema(&schema);
            session.set("mood", serde_json::json!(8));
            store.append(build_entry(&session, &schema))?;
        }

        let store = EntryStore::new(SqliteSlots::open(&db_path)?);
        let entries = store.load_all()?;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].fields.get("mood"), Some(&serde_json::json!(8)));

        cleanup(&db_path);
        Ok(())
    }

    #[test]
    fn schema_slot_is_independent_from_entry_slot() -> Result<()> {
        let db_path = unique_temp_db_path();

        let mut schema_store = SchemaStore::new(SqliteSlots::open(&db_path)?);
        schema_store.save(&default_questions()[..2])?;

        let entry_slots = SqliteSlots::open(&db_path)?;
        assert_eq!(entry_slots.get(ENTRIES_SLOT)?, None);
        let loaded = schema_store.load()?;
        assert_eq!(loaded.len(), 2);

        cleanup(&db_path);
        Ok(())
    }
}
