//! SQLite handle shared by every ledger
//!
//! The database is the only synchronization point between the admin process,
//! spawned job processes and concurrent provider loops. Every mutation is a
//! single insert/upsert so no caller needs a read-modify-write.

use crate::error::Result;
use rusqlite::Connection;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

/// Embedded copy of `sql/*.sql`, in migration order.
const EMBEDDED_SCHEMA: [(&str, &str); 4] = [
    ("01_job_runs.sql", include_str!("../sql/01_job_runs.sql")),
    ("02_rpc_calls.sql", include_str!("../sql/02_rpc_calls.sql")),
    ("03_receipts.sql", include_str!("../sql/03_receipts.sql")),
    ("04_projections.sql", include_str!("../sql/04_projections.sql")),
];

/// Current wall-clock time in milliseconds since the epoch.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Apply the PRAGMAs every connection uses (WAL, NORMAL sync, busy timeout).
///
/// Job processes and the admin process open the same file, so writers wait
/// on the busy timeout instead of failing with SQLITE_BUSY.
pub fn apply_pragmas(conn: &Connection) -> rusqlite::Result<()> {
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.pragma_update(None, "wal_autocheckpoint", 1000)?;
    conn.busy_timeout(std::time::Duration::from_secs(5))?;
    Ok(())
}

/// Cloneable handle to a single SQLite connection.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) the database file, creating the parent directory if needed.
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        if let Some(parent) = db_path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(db_path)?;
        apply_pragmas(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Apply the embedded schema. Idempotent.
    pub fn init_schema(&self) -> Result<()> {
        let conn = self.lock();
        for (name, sql) in EMBEDDED_SCHEMA {
            log::debug!("applying schema {}", name);
            conn.execute_batch(sql)?;
        }
        Ok(())
    }

    /// Run `f` with exclusive access to the connection.
    pub fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.lock();
        f(&conn)
    }

    /// Run `f` inside a transaction that commits only when `f` succeeds.
    pub fn with_transaction<T>(
        &self,
        f: impl FnOnce(&rusqlite::Transaction<'_>) -> Result<T>,
    ) -> Result<T> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        // A panic while holding the lock cannot leave a half-applied statement
        // behind, so a poisoned connection is still usable.
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
