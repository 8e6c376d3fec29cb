//! SQLite-based store implementation

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tally_util::SeriesId;
use tracing::{debug, warn};

use crate::{AuditEvent, AuditEventType, Store, StoreError, StoreResult};

/// SQLite-based store
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a store at the given path
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        if let Some(parent) = path.as_ref().parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Create an in-memory store (for testing)
    pub fn in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn conn(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Database("store lock poisoned".into()))
    }

    fn init_schema(&self) -> StoreResult<()> {
        let conn = self.conn()?;

        conn.execute_batch(
            r#"
            -- Audit log (append-only)
            CREATE TABLE IF NOT EXISTS audit_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                event_json TEXT NOT NULL
            );

            -- Last saved record per series
            CREATE TABLE IF NOT EXISTS series_records (
                series_id TEXT PRIMARY KEY,
                record_json TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_audit_timestamp ON audit_log(timestamp);
            "#,
        )?;

        debug!("Store schema initialized");
        Ok(())
    }
}

impl Store for SqliteStore {
    fn append_audit(&self, mut event: AuditEvent) -> StoreResult<()> {
        let conn = self.conn()?;
        let event_json = serde_json::to_string(&event.event)?;

        conn.execute(
            "INSERT INTO audit_log (timestamp, event_json) VALUES (?, ?)",
            params![event.timestamp.to_rfc3339(), event_json],
        )?;

        event.id = conn.last_insert_rowid();
        debug!(event_id = event.id, "Audit event appended");

        Ok(())
    }

    fn get_recent_audits(&self, limit: usize) -> StoreResult<Vec<AuditEvent>> {
        let conn = self.conn()?;

        let mut stmt = conn.prepare(
            "SELECT id, timestamp, event_json FROM audit_log ORDER BY id DESC LIMIT ?",
        )?;

        let rows = stmt.query_map([limit], |row| {
            let id: i64 = row.get(0)?;
            let timestamp_str: String = row.get(1)?;
            let event_json: String = row.get(2)?;
            Ok((id, timestamp_str, event_json))
        })?;

        let mut events = Vec::new();
        for row in rows {
            let (id, timestamp_str, event_json) = row?;
            let timestamp = DateTime::parse_from_rfc3339(&timestamp_str)
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now());
            let event: AuditEventType = serde_json::from_str(&event_json)?;

            events.push(AuditEvent {
                id,
                timestamp,
                event,
            });
        }

        Ok(events)
    }

    fn load_record(&self, series_id: &SeriesId) -> StoreResult<Option<Value>> {
        let conn = self.conn()?;

        let json: Option<String> = conn
            .query_row(
                "SELECT record_json FROM series_records WHERE series_id = ?",
                [series_id.as_str()],
                |row| row.get(0),
            )
            .optional()?;

        match json {
            Some(s) => Ok(Some(serde_json::from_str(&s)?)),
            None => Ok(None),
        }
    }

    fn save_record(&self, series_id: &SeriesId, record: &Value) -> StoreResult<()> {
        let conn = self.conn()?;
        let json = serde_json::to_string(record)?;

        conn.execute(
            r#"
            INSERT INTO series_records (series_id, record_json, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(series_id)
            DO UPDATE SET record_json = excluded.record_json,
                          updated_at = excluded.updated_at
            "#,
            params![series_id.as_str(), json, Utc::now().to_rfc3339()],
        )?;

        debug!(series_id = %series_id, "Series record saved");
        Ok(())
    }

    fn delete_record(&self, series_id: &SeriesId) -> StoreResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "DELETE FROM series_records WHERE series_id = ?",
            [series_id.as_str()],
        )?;
        Ok(())
    }

    fn list_records(&self) -> StoreResult<Vec<SeriesId>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT series_id FROM series_records ORDER BY series_id")?;
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .map(|id| id.map(SeriesId::from))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    fn is_healthy(&self) -> bool {
        match self.conn.lock() {
            Ok(conn) => conn.query_row("SELECT 1", [], |_| Ok(())).is_ok(),
            Err(_) => {
                warn!("Store lock poisoned");
                false
            }
        }
    }
}
