//! SQLite storage for account links and topic performance
//!
//! A single `Database` handle owns the connection; `LinkStore` and
//! `PerformanceStore` borrow it through `with_conn` / `with_conn_mut`.
//!
//! ## Tables
//!
//! - `link_codes` - verification codes; verified rows are the durable links
//! - `topic_performance` - per (external user, topic) correctness counters
//!
//! Several `Database` handles may point at the same file. WAL mode plus a
//! busy timeout make concurrent writers queue instead of failing.

pub mod schema;
pub mod links;
pub mod performance;

use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use rusqlite::Connection;
use tracing::{debug, info};

use crate::error::StorageError;

/// How long a writer waits for another connection's lock
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// SQLite database handle
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open or create the database file
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        info!("Opening SQLite database at {:?}", path);

        let conn = Connection::open(path)
            .map_err(|e| StorageError::db("Failed to open SQLite", e))?;

        conn.busy_timeout(BUSY_TIMEOUT)
            .map_err(|e| StorageError::db("Failed to set busy timeout", e))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(|e| StorageError::db("Failed to set PRAGMA", e))?;

        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init_schema()?;

        Ok(db)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self, StorageError> {
        debug!("Opening in-memory SQLite database");

        let conn = Connection::open_in_memory()
            .map_err(|e| StorageError::db("Failed to open in-memory SQLite", e))?;

        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init_schema()?;

        Ok(db)
    }

    fn init_schema(&self) -> Result<(), StorageError> {
        self.with_conn(schema::init_schema)
    }

    /// Run a read or single-statement write against the connection
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, StorageError>
    where
        F: FnOnce(&Connection) -> Result<T, StorageError>,
    {
        let conn = self.conn.lock()
            .map_err(|e| StorageError::Internal(format!("Lock poisoned: {}", e)))?;
        f(&conn)
    }

    /// Run an operation that needs a transaction
    pub fn with_conn_mut<F, T>(&self, f: F) -> Result<T, StorageError>
    where
        F: FnOnce(&mut Connection) -> Result<T, StorageError>,
    {
        let mut conn = self.conn.lock()
            .map_err(|e| StorageError::Internal(format!("Lock poisoned: {}", e)))?;
        f(&mut conn)
    }

    /// Row counts for health output
    pub fn stats(&self) -> Result<DbStats, StorageError> {
        self.with_conn(|conn| {
            let count = |sql: &str| -> Result<u64, StorageError> {
                conn.query_row(sql, [], |row| row.get::<_, i64>(0))
                    .map(|n| n as u64)
                    .map_err(|e| StorageError::db("Count query failed", e))
            };

            Ok(DbStats {
                pending_codes: count("SELECT COUNT(*) FROM link_codes WHERE state = 'pending'")?,
                linked_accounts: count("SELECT COUNT(*) FROM link_codes WHERE state = 'verified'")?,
                performance_records: count("SELECT COUNT(*) FROM topic_performance")?,
            })
        })
    }
}

/// Database statistics
#[derive(Debug, Clone, serde::Serialize)]
pub struct DbStats {
    pub pending_codes: u64,
    pub linked_accounts: u64,
    pub performance_records: u64,
}

// Re-exports
pub use links::{Link, LinkStatus, LinkStore, VerificationCode, CodeState};
pub use performance::{PerformanceRecord, PerformanceStore, UserSummary};
