//! Durable session store.
//!
//! Sessions are an append-only turn log plus a delegation tree. Writes to
//! one session are serialised by a per-session async lock; distinct
//! sessions proceed concurrently. Every append is committed before it
//! returns.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use codeagent_core::db::unix_timestamp_millis;
use codeagent_core::model::{
    DelegationRecord, DelegationSpec, DelegationStatus, NewTurn, Session, SessionStatus, Turn,
    TurnContent, derive_status,
};

use crate::storage::{Database, DatabaseError, DelegationRow, SessionRow, TurnRow};

/// Errors from the session store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Session not found: {0}")]
    NotFound(String),

    #[error("Session {session_id} is {status} and cannot be resumed")]
    Terminal {
        session_id: String,
        status: SessionStatus,
    },

    #[error("Session {0} is archived")]
    Archived(String),

    #[error("Tool request {request_id} in session {session_id} is already answered")]
    AlreadyAnswered {
        session_id: String,
        request_id: String,
    },

    #[error("Corrupt session data: {0}")]
    Corrupt(#[from] codeagent_core::Error),

    #[error("Database error: {0}")]
    Database(DatabaseError),
}

impl From<DatabaseError> for StoreError {
    fn from(e: DatabaseError) -> Self {
        match e {
            DatabaseError::NotFound(what) => Self::NotFound(what),
            other => Self::Database(other),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        Self::Corrupt(e.into())
    }
}

/// Listing entry for a stored session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub id: String,
    pub status: SessionStatus,
    pub workspace_root: PathBuf,
    pub trusted: bool,
    pub created_at: i64,
    pub updated_at: i64,
    pub archived_at: Option<i64>,
}

/// Persistent store for sessions and their transcripts.
#[derive(Clone)]
pub struct SessionStore {
    db: Database,
    /// Live only while some writer holds or awaits the lock.
    locks: Arc<Mutex<HashMap<String, Weak<Mutex<()>>>>>,
}

impl SessionStore {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Write lock for one session.
    async fn lock(&self, session_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks.retain(|_, lock| lock.strong_count() > 0);
            if let Some(lock) = locks.get(session_id).and_then(Weak::upgrade) {
                lock
            } else {
                let lock = Arc::new(Mutex::new(()));
                locks.insert(session_id.to_string(), Arc::downgrade(&lock));
                lock
            }
        };
        lock.lock_owned().await
    }

    /// Create a session and commit its `session_opened` turn.
    pub async fn create(&self, workspace_root: &Path, trusted: bool) -> Result<Session, StoreError> {
        let id = uuid::Uuid::new_v4().to_string();
        self.db
            .create_session(&id, &workspace_root.display().to_string(), trusted)
            .await?;
        self.append(
            &id,
            NewTurn::system(
                id.clone(),
                TurnContent::SessionOpened {
                    workspace_root: workspace_root.to_path_buf(),
                    trusted,
                },
            ),
        )
        .await?;

        info!(session_id = %id, workspace = %workspace_root.display(), trusted, "Session created");
        self.load(&id).await
    }

    /// Append one turn, assigning the next seq. Returns the committed turn.
    pub async fn append(&self, session_id: &str, turn: NewTurn) -> Result<Turn, StoreError> {
        let _guard = self.lock(session_id).await;

        // Surface a missing session as NotFound rather than a foreign key failure.
        self.db.get_session(session_id).await?;

        let (last_seq, last_at) = self.db.turn_cursor(session_id).await?;
        let committed = Turn {
            seq: last_seq + 1,
            thread_id: turn.thread_id,
            author: turn.author,
            content: turn.content,
            created_at: unix_timestamp_millis().max(last_at),
        };

        let answers_request = committed.content.answered_request().map(ToString::to_string);
        let row = TurnRow {
            session_id: session_id.to_string(),
            seq: committed.seq,
            thread_id: committed.thread_id.clone(),
            author: serde_json::to_string(&committed.author)?,
            kind: committed.content.kind().to_string(),
            content: serde_json::to_string(&committed.content)?,
            answers_request: answers_request.clone(),
            created_at: committed.created_at,
        };

        match self.db.insert_turn(&row).await {
            Ok(()) => {}
            Err(DatabaseError::Conflict(_)) => {
                let request_id = answers_request.unwrap_or_default();
                warn!(session_id, request_id = %request_id, "Rejected second answer for tool request");
                return Err(StoreError::AlreadyAnswered {
                    session_id: session_id.to_string(),
                    request_id,
                });
            }
            Err(e) => return Err(e.into()),
        }
        self.db.touch_session(session_id).await?;

        debug!(
            session_id,
            seq = committed.seq,
            thread_id = %committed.thread_id,
            kind = committed.content.kind(),
            "Turn appended"
        );
        Ok(committed)
    }

    /// Load a session with its full transcript and delegation tree.
    ///
    /// The returned status is recomputed from the transcript.
    pub async fn load(&self, session_id: &str) -> Result<Session, StoreError> {
        let row = self.db.get_session(session_id).await?;
        let turns = self
            .db
            .list_turns(session_id)
            .await?
            .into_iter()
            .map(Turn::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        let delegations = self
            .db
            .list_delegations(session_id)
            .await?
            .into_iter()
            .map(DelegationRecord::try_from)
            .collect::<Result<Vec<_>, _>>()?;

        let status = derive_status(&row.id, &turns);
        if row.status()? != status {
            debug!(session_id, stored = %row.status, derived = %status, "Stored status lags transcript");
        }

        Ok(Session {
            status,
            workspace_root: row.workspace_root(),
            trusted: row.trusted(),
            turns,
            delegations,
            created_at: row.created_at,
            updated_at: row.updated_at,
            archived_at: row.archived_at,
            id: row.id,
        })
    }

    /// Load a session that can continue: not archived and not terminal.
    pub async fn resume(&self, session_id: &str) -> Result<Session, StoreError> {
        let session = self.load(session_id).await?;
        if session.archived_at.is_some() {
            return Err(StoreError::Archived(session_id.to_string()));
        }
        if session.status.is_terminal() {
            return Err(StoreError::Terminal {
                session_id: session_id.to_string(),
                status: session.status,
            });
        }
        Ok(session)
    }

    pub async fn set_status(&self, session_id: &str, status: SessionStatus) -> Result<(), StoreError> {
        let _guard = self.lock(session_id).await;
        self.db.update_session_status(session_id, status).await?;
        debug!(session_id, status = %status, "Session status updated");
        Ok(())
    }

    /// Record the delegations opened by the `delegated` turn at `parent_turn_seq`.
    pub async fn record_delegations(
        &self,
        session_id: &str,
        parent_thread_id: &str,
        parent_turn_seq: i64,
        depth: u32,
        specs: &[DelegationSpec],
    ) -> Result<Vec<DelegationRecord>, StoreError> {
        let _guard = self.lock(session_id).await;

        let records: Vec<DelegationRecord> = specs
            .iter()
            .map(|spec| DelegationRecord {
                id: spec.delegation_id.clone(),
                parent_thread_id: parent_thread_id.to_string(),
                parent_turn_seq,
                target: spec.target,
                sub_task: spec.sub_task.clone(),
                depth,
                declared_paths: spec.paths.clone(),
                status: DelegationStatus::Open,
                closed_turn_seq: None,
            })
            .collect();

        let mut rows = Vec::with_capacity(records.len());
        for (position, record) in (0_i64..).zip(&records) {
            rows.push(DelegationRow {
                id: record.id.clone(),
                session_id: session_id.to_string(),
                parent_thread_id: record.parent_thread_id.clone(),
                parent_turn_seq,
                position,
                target: record.target.as_str().to_string(),
                sub_task: record.sub_task.clone(),
                depth: i64::from(depth),
                declared_paths: serde_json::to_string(&record.declared_paths)?,
                status: DelegationStatus::Open.as_str().to_string(),
                closed_turn_seq: None,
            });
        }
        self.db.insert_delegations(&rows).await?;

        debug!(session_id, parent_thread_id, count = records.len(), depth, "Delegations recorded");
        Ok(records)
    }

    /// Close a delegation once its result has been merged at `closed_turn_seq`.
    pub async fn close_delegation(
        &self,
        session_id: &str,
        delegation_id: &str,
        closed_turn_seq: i64,
    ) -> Result<(), StoreError> {
        let _guard = self.lock(session_id).await;
        self.db
            .close_delegation(session_id, delegation_id, closed_turn_seq)
            .await?;
        Ok(())
    }

    /// Archive a session. Its transcript stays readable.
    pub async fn close(&self, session_id: &str) -> Result<(), StoreError> {
        let _guard = self.lock(session_id).await;
        self.db.archive_session(session_id).await?;
        info!(session_id, "Session archived");
        Ok(())
    }

    pub async fn list(
        &self,
        include_archived: bool,
        limit: u32,
    ) -> Result<Vec<SessionSummary>, StoreError> {
        self.db
            .list_sessions(include_archived, limit)
            .await?
            .into_iter()
            .map(|row| summary(&row))
            .collect()
    }
}

fn summary(row: &SessionRow) -> Result<SessionSummary, StoreError> {
    Ok(SessionSummary {
        id: row.id.clone(),
        status: row.status()?,
        workspace_root: row.workspace_root(),
        trusted: row.trusted(),
        created_at: row.created_at,
        updated_at: row.updated_at,
        archived_at: row.archived_at,
    })
}
