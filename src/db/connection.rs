//! SQLite connection pool setup.
//!
//! A single database file in WAL mode holds all persisted state. Reads go
//! through the pool; SQLite serializes writes internally, and the generous
//! busy timeout keeps concurrent novel analyses from tripping over each
//! other's write locks.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;

use crate::FabulaError;

/// Open (or create) the database file and apply WAL pragmas.
pub async fn connect(path: &Path) -> Result<SqlitePool, FabulaError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(Duration::from_secs(5))
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(8)
        .connect_with(options)
        .await?;
    Ok(pool)
}

/// In-memory database for tests. Pinned to a single connection so the
/// database survives for the pool's whole lifetime.
pub async fn connect_memory() -> Result<SqlitePool, FabulaError> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")
        .map_err(|e| FabulaError::Database(e.to_string()))?
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await?;
    Ok(pool)
}
