//! Database rows and their conversion into the session model.

use std::path::PathBuf;

use codeagent_core::Error;
use codeagent_core::model::{DelegationRecord, SessionStatus, Turn};

/// Session record from the database.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SessionRow {
    pub id: String,
    pub status: String,
    pub workspace_root: String,
    pub trusted: i64,
    pub created_at: i64,
    pub updated_at: i64,
    pub archived_at: Option<i64>,
}

impl SessionRow {
    pub fn status(&self) -> Result<SessionStatus, Error> {
        self.status.parse()
    }

    pub fn workspace_root(&self) -> PathBuf {
        PathBuf::from(&self.workspace_root)
    }

    pub const fn trusted(&self) -> bool {
        self.trusted != 0
    }
}

/// Turn record from the database. `author` and `content` hold JSON text.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct TurnRow {
    pub session_id: String,
    pub seq: i64,
    pub thread_id: String,
    pub author: String,
    pub kind: String,
    pub content: String,
    pub answers_request: Option<String>,
    pub created_at: i64,
}

impl TryFrom<TurnRow> for Turn {
    type Error = Error;

    fn try_from(row: TurnRow) -> Result<Self, Self::Error> {
        Ok(Self {
            seq: row.seq,
            thread_id: row.thread_id,
            author: serde_json::from_str(&row.author)?,
            content: serde_json::from_str(&row.content)?,
            created_at: row.created_at,
        })
    }
}

/// Delegation record from the database.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DelegationRow {
    pub id: String,
    pub session_id: String,
    pub parent_thread_id: String,
    pub parent_turn_seq: i64,
    pub position: i64,
    pub target: String,
    pub sub_task: String,
    pub depth: i64,
    pub declared_paths: String,
    pub status: String,
    pub closed_turn_seq: Option<i64>,
}

impl TryFrom<DelegationRow> for DelegationRecord {
    type Error = Error;

    fn try_from(row: DelegationRow) -> Result<Self, Self::Error> {
        let depth = u32::try_from(row.depth).map_err(|_| Error::UnknownVariant {
            kind: "delegation depth",
            value: row.depth.to_string(),
        })?;
        Ok(Self {
            target: row.target.parse()?,
            status: row.status.parse()?,
            declared_paths: serde_json::from_str(&row.declared_paths)?,
            id: row.id,
            parent_thread_id: row.parent_thread_id,
            parent_turn_seq: row.parent_turn_seq,
            sub_task: row.sub_task,
            depth,
            closed_turn_seq: row.closed_turn_seq,
        })
    }
}
