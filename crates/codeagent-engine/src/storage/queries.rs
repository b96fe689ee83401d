//! Database queries for the session store.

use codeagent_core::db::unix_timestamp_millis;
use codeagent_core::model::SessionStatus;

use super::db::{Database, DatabaseError};
use super::models::{DelegationRow, SessionRow, TurnRow};

impl Database {
    // =========================================================================
    // Session queries
    // =========================================================================

    /// Create a new session.
    pub async fn create_session(
        &self,
        id: &str,
        workspace_root: &str,
        trusted: bool,
    ) -> Result<SessionRow, DatabaseError> {
        let now = unix_timestamp_millis();

        sqlx::query(
            r"
            INSERT INTO sessions (id, workspace_root, trusted, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ",
        )
        .bind(id)
        .bind(workspace_root)
        .bind(i64::from(trusted))
        .bind(now)
        .bind(now)
        .execute(self.pool())
        .await?;

        self.get_session(id).await
    }

    /// Get a session by ID.
    pub async fn get_session(&self, id: &str) -> Result<SessionRow, DatabaseError> {
        sqlx::query_as::<_, SessionRow>("SELECT * FROM sessions WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Session {id}")))
    }

    /// Update session status.
    pub async fn update_session_status(
        &self,
        id: &str,
        status: SessionStatus,
    ) -> Result<(), DatabaseError> {
        let now = unix_timestamp_millis();

        let result = sqlx::query("UPDATE sessions SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(now)
            .bind(id)
            .execute(self.pool())
            .await?;

        if result.rows_affected() == 0 {
            return Err(DatabaseError::NotFound(format!("Session {id}")));
        }
        Ok(())
    }

    /// Mark a session archived. Archiving twice keeps the first timestamp.
    pub async fn archive_session(&self, id: &str) -> Result<(), DatabaseError> {
        let now = unix_timestamp_millis();

        let result = sqlx::query(
            "UPDATE sessions SET archived_at = COALESCE(archived_at, ?), updated_at = ? WHERE id = ?",
        )
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(self.pool())
        .await?;

        if result.rows_affected() == 0 {
            return Err(DatabaseError::NotFound(format!("Session {id}")));
        }
        Ok(())
    }

    /// List sessions, most recently updated first.
    pub async fn list_sessions(
        &self,
        include_archived: bool,
        limit: u32,
    ) -> Result<Vec<SessionRow>, DatabaseError> {
        let sessions = if include_archived {
            sqlx::query_as::<_, SessionRow>(
                "SELECT * FROM sessions ORDER BY updated_at DESC, created_at DESC LIMIT ?",
            )
            .bind(limit)
            .fetch_all(self.pool())
            .await?
        } else {
            sqlx::query_as::<_, SessionRow>(
                "SELECT * FROM sessions WHERE archived_at IS NULL ORDER BY updated_at DESC, created_at DESC LIMIT ?",
            )
            .bind(limit)
            .fetch_all(self.pool())
            .await?
        };

        Ok(sessions)
    }

    /// Touch `updated_at` after an append.
    pub async fn touch_session(&self, id: &str) -> Result<(), DatabaseError> {
        sqlx::query("UPDATE sessions SET updated_at = ? WHERE id = ?")
            .bind(unix_timestamp_millis())
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    // =========================================================================
    // Turn queries
    // =========================================================================

    /// Highest committed seq and latest timestamp (both 0 for an empty log).
    pub async fn turn_cursor(&self, session_id: &str) -> Result<(i64, i64), DatabaseError> {
        let cursor: (i64, i64) = sqlx::query_as(
            "SELECT COALESCE(MAX(seq), 0), COALESCE(MAX(created_at), 0) FROM turns WHERE session_id = ?",
        )
        .bind(session_id)
        .fetch_one(self.pool())
        .await?;
        Ok(cursor)
    }

    /// Insert a turn. A second answer for the same request is a `Conflict`.
    pub async fn insert_turn(&self, row: &TurnRow) -> Result<(), DatabaseError> {
        sqlx::query(
            r"
            INSERT INTO turns (session_id, seq, thread_id, author, kind, content, answers_request, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ",
        )
        .bind(&row.session_id)
        .bind(row.seq)
        .bind(&row.thread_id)
        .bind(&row.author)
        .bind(&row.kind)
        .bind(&row.content)
        .bind(&row.answers_request)
        .bind(row.created_at)
        .execute(self.pool())
        .await?;

        Ok(())
    }

    /// All turns of a session in seq order.
    pub async fn list_turns(&self, session_id: &str) -> Result<Vec<TurnRow>, DatabaseError> {
        let turns = sqlx::query_as::<_, TurnRow>(
            "SELECT * FROM turns WHERE session_id = ? ORDER BY seq ASC",
        )
        .bind(session_id)
        .fetch_all(self.pool())
        .await?;

        Ok(turns)
    }

    // =========================================================================
    // Delegation queries
    // =========================================================================

    /// Insert the records opened by one `delegated` turn, atomically.
    pub async fn insert_delegations(&self, rows: &[DelegationRow]) -> Result<(), DatabaseError> {
        let mut tx = self.pool().begin().await?;
        for row in rows {
            sqlx::query(
                r"
                INSERT INTO delegations
                    (id, session_id, parent_thread_id, parent_turn_seq, position, target,
                     sub_task, depth, declared_paths, status, closed_turn_seq)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ",
            )
            .bind(&row.id)
            .bind(&row.session_id)
            .bind(&row.parent_thread_id)
            .bind(row.parent_turn_seq)
            .bind(row.position)
            .bind(&row.target)
            .bind(&row.sub_task)
            .bind(row.depth)
            .bind(&row.declared_paths)
            .bind(&row.status)
            .bind(row.closed_turn_seq)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Close an open delegation, recording the merging turn.
    pub async fn close_delegation(
        &self,
        session_id: &str,
        id: &str,
        closed_turn_seq: i64,
    ) -> Result<(), DatabaseError> {
        let result = sqlx::query(
            "UPDATE delegations SET status = 'closed', closed_turn_seq = ? WHERE session_id = ? AND id = ? AND status = 'open'",
        )
        .bind(closed_turn_seq)
        .bind(session_id)
        .bind(id)
        .execute(self.pool())
        .await?;

        if result.rows_affected() == 0 {
            return Err(DatabaseError::NotFound(format!("Open delegation {id}")));
        }
        Ok(())
    }

    /// All delegations of a session in creation order.
    pub async fn list_delegations(
        &self,
        session_id: &str,
    ) -> Result<Vec<DelegationRow>, DatabaseError> {
        let rows = sqlx::query_as::<_, DelegationRow>(
            "SELECT * FROM delegations WHERE session_id = ? ORDER BY parent_turn_seq ASC, position ASC",
        )
        .bind(session_id)
        .fetch_all(self.pool())
        .await?;

        Ok(rows)
    }
}
