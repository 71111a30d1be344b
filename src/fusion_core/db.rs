//! SQLite handle and schema loader
//!
//! All stores share one connection behind a mutex. The lock is held for a
//! single statement or transaction and never across an `.await`.

use super::error::StoreError;
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Schema files from `/sql/`, applied in order. Every statement uses
/// `IF NOT EXISTS`, so running them on each startup is safe.
const SCHEMA_FILES: &[(&str, &str)] = &[
    ("01_event_windows.sql", include_str!("../../sql/01_event_windows.sql")),
    ("02_modality_findings.sql", include_str!("../../sql/02_modality_findings.sql")),
    ("03_decisions.sql", include_str!("../../sql/03_decisions.sql")),
    ("04_subscribers.sql", include_str!("../../sql/04_subscribers.sql")),
    ("05_delivery_records.sql", include_str!("../../sql/05_delivery_records.sql")),
    ("06_decision_dispatches.sql", include_str!("../../sql/06_decision_dispatches.sql")),
    ("07_spool_offsets.sql", include_str!("../../sql/07_spool_offsets.sql")),
];

/// Run schema migrations against an open connection
pub fn run_schema_migrations(conn: &Connection) -> Result<(), StoreError> {
    log::info!("🔧 Running schema migrations");

    for (filename, sql) in SCHEMA_FILES {
        log::debug!("   ├─ Executing: {}", filename);
        conn.execute_batch(sql)?;
    }

    log::info!("✅ All schema migrations completed successfully");
    Ok(())
}

/// Shared SQLite connection used by the signal store, subscriber registry
/// and delivery ledger
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) a database file and apply the schema
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db_path = db_path.as_ref();

        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(db_path)?;

        // journal_mode answers with the mode now in effect
        let journal_mode: String =
            conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        log::info!("📊 Opened SQLite database ({}): {}", journal_mode, db_path.display());

        run_schema_migrations(&conn)?;
        Ok(Self::from_connection(conn))
    }

    /// Private in-memory database, used by tests and dry runs
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        run_schema_migrations(&conn)?;
        Ok(Self::from_connection(conn))
    }

    fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    pub(crate) fn with_conn<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut guard = self.conn.lock().map_err(|_| StoreError::LockPoisoned)?;
        f(&mut guard)
    }
}

pub(crate) fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| StoreError::Corrupt(format!("timestamp out of range: {}", ms)))
}
