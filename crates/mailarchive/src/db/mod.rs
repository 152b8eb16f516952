//! SQLite persistence for sources, archived emails, attachments, queue
//! jobs and the audit log. Repositories are free functions over a
//! [`Database`] handle.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use rusqlite::Connection;

pub mod attachment_repo;
pub mod audit_repo;
pub mod email_repo;
pub mod error;
pub mod job_repo;
pub mod migrations;
pub mod source_repo;

pub use error::DatabaseError;

/// Busy timeout applied to file-backed connections.
const BUSY_TIMEOUT_MS: u32 = 5_000;

/// Shared handle over one SQLite connection. Clones share the connection;
/// every repository call takes the lock for its whole statement batch.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Opens the archive database at `path`, creating parent directories,
    /// and migrates it to the latest schema.
    pub fn open(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).map_err(|source| DatabaseError::Io {
                path: dir.to_path_buf(),
                source,
            })?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch(&format!(
            "PRAGMA journal_mode=WAL; PRAGMA busy_timeout={};",
            BUSY_TIMEOUT_MS
        ))?;
        let db = Self::migrated(conn)?;
        log::info!("Archive database ready at {}", path.display());
        Ok(db)
    }

    /// A private in-memory database, used by tests and dry runs.
    pub fn open_in_memory() -> Result<Self, DatabaseError> {
        Self::migrated(Connection::open_in_memory()?)
    }

    fn migrated(conn: Connection) -> Result<Self, DatabaseError> {
        // Cascading source deletes rely on this.
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        migrations::run_all(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, DatabaseError> {
        self.conn.lock().map_err(|_| DatabaseError::LockPoisoned)
    }

    /// Runs `f` with the connection locked.
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, DatabaseError>
    where
        F: FnOnce(&Connection) -> Result<T, DatabaseError>,
    {
        f(&*self.lock()?)
    }

    /// Runs `f` inside a transaction that commits only when `f` succeeds.
    pub fn with_transaction<F, T>(&self, f: F) -> Result<T, DatabaseError>
    where
        F: FnOnce(&rusqlite::Transaction<'_>) -> Result<T, DatabaseError>,
    {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }
}

/// Returns the canonical database path: `~/.mailarchive/data/mailarchive.db`.
pub fn default_database_path() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".mailarchive").join("data").join("mailarchive.db"))
}

/// Current UTC time in the RFC 3339 form every table stores.
pub(crate) fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}
