//! Session database handle.

use std::path::Path;

use sqlx::{Pool, Sqlite};
use tracing::info;

use codeagent_core::db::{Location, connect};
pub use codeagent_core::db::DatabaseError;

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

/// Migrated `SQLite` database holding sessions, turns and delegations.
#[derive(Clone)]
pub struct Database {
    pool: Pool<Sqlite>,
}

impl Database {
    /// Open or create the database file and apply pending migrations.
    pub async fn open(path: &Path) -> Result<Self, DatabaseError> {
        Self::migrated(connect(Location::File(path)).await?).await
    }

    /// Fresh private database, used by tests.
    pub async fn open_in_memory() -> Result<Self, DatabaseError> {
        Self::migrated(connect(Location::Memory).await?).await
    }

    async fn migrated(pool: Pool<Sqlite>) -> Result<Self, DatabaseError> {
        MIGRATOR.run(&pool).await?;
        info!(
            migrations = MIGRATOR.iter().count(),
            "Session database migrations complete"
        );
        Ok(Self { pool })
    }

    pub const fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }
}
