//! SQLite database module for the event queue
//!
//! One database file holds the tables this crate owns together with the
//! read model of the host tables it consumes.
//!
//! ## Tables
//!
//! - `lerq_queue` - Append-only denormalized event records
//! - `lerq_provider_register` - Registered capture routine providers
//! - `lerq_settings` - Capture toggles and object type selection
//! - `settings` - Host key-value settings (backfill task info lives here)
//! - `object_data`, `object_reference`, `tree`, `rbac_fa`, `rbac_ua`, `usr_data`,
//!   `udf_definition`, `udf_text`, `udf_clob`, `ut_lp_marks`, `crs_settings` - Host tables

pub mod schema;
pub mod queue;
pub mod providers;
pub mod settings;
pub mod host;

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::Connection;
use tracing::{debug, info};

use crate::error::StorageError;

/// SQLite database for the queue and its collaborators
pub struct QueueDb {
    conn: Mutex<Connection>,
}

impl QueueDb {
    /// Open or create `lerq.db` inside the storage directory
    pub fn open(storage_dir: &Path) -> Result<Self, StorageError> {
        let db_path = storage_dir.join("lerq.db");
        info!(path = %db_path.display(), "Opening queue database");

        let conn = Connection::open(&db_path)
            .map_err(|e| StorageError::Internal(format!("Failed to open SQLite: {}", e)))?;

        // Capture callbacks and a backfill slice may hold the file concurrently
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA busy_timeout=5000;")
            .map_err(|e| StorageError::Internal(format!("Failed to set PRAGMA: {}", e)))?;

        Self::from_connection(conn)
    }

    /// Throwaway database for tests
    pub fn open_in_memory() -> Result<Self, StorageError> {
        debug!("Opening in-memory queue database");
        let conn = Connection::open_in_memory()
            .map_err(|e| StorageError::Internal(format!("Failed to open in-memory SQLite: {}", e)))?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self, StorageError> {
        schema::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StorageError> {
        self.conn
            .lock()
            .map_err(|e| StorageError::Internal(format!("Lock poisoned: {}", e)))
    }

    /// Run a read operation against the connection
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, StorageError>
    where
        F: FnOnce(&Connection) -> Result<T, StorageError>,
    {
        f(&*self.lock()?)
    }

    /// Run an operation that needs a transaction
    pub fn with_conn_mut<F, T>(&self, f: F) -> Result<T, StorageError>
    where
        F: FnOnce(&mut Connection) -> Result<T, StorageError>,
    {
        f(&mut *self.lock()?)
    }

    pub fn stats(&self) -> Result<DbStats, StorageError> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT (SELECT COUNT(*) FROM lerq_queue), \
                        (SELECT COUNT(*) FROM lerq_provider_register), \
                        (SELECT MAX(id) FROM lerq_queue)",
                [],
                |row| {
                    Ok(DbStats {
                        queue_records: row.get::<_, i64>(0)? as u64,
                        providers: row.get::<_, i64>(1)? as u64,
                        last_record_id: row.get(2)?,
                    })
                },
            )
            .map_err(|e| StorageError::Internal(format!("Stats query failed: {}", e)))
        })
    }
}

/// Queue size for operator status output
#[derive(Debug, Clone, serde::Serialize)]
pub struct DbStats {
    pub queue_records: u64,
    pub providers: u64,
    pub last_record_id: Option<i64>,
}

// Re-exports
pub use queue::{NewQueueRecord, QueueFilter, QueueRow, TimeDirection};
pub use providers::ProviderRow;
pub use settings::SettingsRow;
