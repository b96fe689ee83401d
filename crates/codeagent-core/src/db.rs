//! `SQLite` connection helpers and the storage error type.

use std::path::Path;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use tracing::info;

/// Writers wait this long on a locked database before failing.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const FILE_POOL_SIZE: u32 = 5;

#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Query error: {0}")]
    Query(String),

    /// A unique constraint rejected the write.
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl From<sqlx::Error> for DatabaseError {
    fn from(e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                Self::Conflict(db.message().to_string())
            }
            _ => Self::Query(e.to_string()),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for DatabaseError {
    fn from(e: sqlx::migrate::MigrateError) -> Self {
        Self::Migration(e.to_string())
    }
}

/// Where a pool connects.
#[derive(Debug, Clone, Copy)]
pub enum Location<'a> {
    File(&'a Path),
    /// Private database that lives as long as its pool.
    Memory,
}

/// Connect a pool with foreign keys on.
///
/// File databases get WAL journaling, a busy timeout and their parent
/// directory created. In-memory databases use one connection that never
/// idles out, since closing it would drop the data.
pub async fn connect(location: Location<'_>) -> Result<Pool<Sqlite>, DatabaseError> {
    let (options, pool) = match location {
        Location::File(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).map_err(|e| DatabaseError::Io(e.to_string()))?;
            }
            let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))
                .map_err(|e| DatabaseError::Connection(e.to_string()))?
                .create_if_missing(true)
                .journal_mode(SqliteJournalMode::Wal)
                .busy_timeout(BUSY_TIMEOUT);
            (options, SqlitePoolOptions::new().max_connections(FILE_POOL_SIZE))
        }
        Location::Memory => {
            let options = SqliteConnectOptions::from_str("sqlite::memory:")
                .map_err(|e| DatabaseError::Connection(e.to_string()))?;
            let pool = SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None);
            (options, pool)
        }
    };

    let pool = pool
        .connect_with(options.foreign_keys(true))
        .await
        .map_err(|e| DatabaseError::Connection(e.to_string()))?;
    if let Location::File(path) = location {
        info!(path = %path.display(), "Database opened");
    }
    Ok(pool)
}

/// Milliseconds since the Unix epoch.
#[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
pub fn unix_timestamp_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
