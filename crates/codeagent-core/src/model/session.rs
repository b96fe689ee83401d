//! Session aggregate: transcript, delegation tree and derived state.

use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::turn::{Author, ProfileId, Turn, TurnContent};
use crate::error::Error;

/// Session status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    AwaitingApproval,
    Completed,
    Failed,
}

impl SessionStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::AwaitingApproval => "awaiting_approval",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "awaiting_approval" => Ok(Self::AwaitingApproval),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(Error::UnknownVariant {
                kind: "session status",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DelegationStatus {
    Open,
    Closed,
}

impl DelegationStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Closed => "closed",
        }
    }
}

impl FromStr for DelegationStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(Self::Open),
            "closed" => Ok(Self::Closed),
            other => Err(Error::UnknownVariant {
                kind: "delegation status",
                value: other.to_string(),
            }),
        }
    }
}

/// Edge of the delegation tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelegationRecord {
    /// Delegation id; doubles as the sub-session thread id.
    pub id: String,
    pub parent_thread_id: String,
    /// Seq of the `delegated` turn that opened this record.
    pub parent_turn_seq: i64,
    pub target: ProfileId,
    pub sub_task: String,
    /// Root thread is depth 0; a direct delegation from root is depth 1.
    pub depth: u32,
    pub declared_paths: Vec<String>,
    pub status: DelegationStatus,
    pub closed_turn_seq: Option<i64>,
}

/// A destructive call waiting for an external decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingApproval {
    pub request_id: String,
    pub thread_id: String,
    pub tool: String,
    pub reason: String,
    pub requested_seq: i64,
}

/// One end-to-end interaction and its full history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub status: SessionStatus,
    pub workspace_root: PathBuf,
    pub trusted: bool,
    pub turns: Vec<Turn>,
    pub delegations: Vec<DelegationRecord>,
    pub created_at: i64,
    pub updated_at: i64,
    pub archived_at: Option<i64>,
}

impl Session {
    /// Turns belonging to one thread, in order.
    pub fn thread<'a>(&'a self, thread_id: &'a str) -> impl Iterator<Item = &'a Turn> + 'a {
        self.turns.iter().filter(move |t| t.thread_id == thread_id)
    }

    pub fn last_seq(&self) -> i64 {
        self.turns.last().map_or(0, |t| t.seq)
    }

    pub fn delegation(&self, id: &str) -> Option<&DelegationRecord> {
        self.delegations.iter().find(|d| d.id == id)
    }

    /// Open delegations spawned from `parent_thread_id`, in creation order.
    pub fn open_delegations(&self, parent_thread_id: &str) -> Vec<&DelegationRecord> {
        self.delegations
            .iter()
            .filter(|d| d.parent_thread_id == parent_thread_id && d.status == DelegationStatus::Open)
            .collect()
    }

    /// Profiles on the chain from the root down to (and including) `thread_id`.
    pub fn ancestry(&self, thread_id: &str) -> Vec<ProfileId> {
        let mut chain = Vec::new();
        let mut current = thread_id;
        while let Some(record) = self.delegation(current) {
            chain.push(record.target);
            current = &record.parent_thread_id;
        }
        chain.push(ProfileId::Root);
        chain.reverse();
        chain
    }

    /// Whether a tool request already has a result or a denial.
    pub fn is_answered(&self, request_id: &str) -> bool {
        self.turns
            .iter()
            .any(|t| t.content.answered_request() == Some(request_id))
    }

    pub fn is_approved(&self, request_id: &str) -> bool {
        self.turns.iter().any(|t| {
            matches!(&t.content, TurnContent::Approved { request_id: id, .. } if id == request_id)
        })
    }

    /// Confirmation requests that have neither been approved nor answered.
    pub fn pending_approvals(&self) -> Vec<PendingApproval> {
        self.turns
            .iter()
            .filter_map(|t| match &t.content {
                TurnContent::ConfirmationRequested {
                    request_id,
                    tool,
                    reason,
                    ..
                } if !self.is_approved(request_id) && !self.is_answered(request_id) => {
                    Some(PendingApproval {
                        request_id: request_id.clone(),
                        thread_id: t.thread_id.clone(),
                        tool: tool.clone(),
                        reason: reason.clone(),
                        requested_seq: t.seq,
                    })
                }
                _ => None,
            })
            .collect()
    }

    /// Tools granted for the rest of the session by "remember" approvals.
    pub fn session_grants(&self) -> BTreeSet<String> {
        let remembered: HashSet<&str> = self
            .turns
            .iter()
            .filter_map(|t| match &t.content {
                TurnContent::Approved {
                    request_id,
                    remember_for_session: true,
                } => Some(request_id.as_str()),
                _ => None,
            })
            .collect();

        self.turns
            .iter()
            .filter_map(|t| match &t.content {
                TurnContent::ConfirmationRequested {
                    request_id, tool, ..
                } if remembered.contains(request_id.as_str()) => Some(tool.clone()),
                _ => None,
            })
            .collect()
    }

    /// Status recomputed from the transcript alone.
    pub fn derived_status(&self) -> SessionStatus {
        derive_status(&self.id, &self.turns)
    }
}

/// Replay a turn sequence and compute the status it implies.
///
/// A root `final_answer` completes the session, a `failed` turn fails it, and
/// a later user message in the root thread reopens a completed session.
/// Otherwise the session is awaiting approval while any confirmation
/// request is unresolved.
pub fn derive_status(root_thread_id: &str, turns: &[Turn]) -> SessionStatus {
    let mut terminal: Option<SessionStatus> = None;
    let mut pending: HashSet<&str> = HashSet::new();

    for turn in turns {
        let root = turn.thread_id == root_thread_id;
        match &turn.content {
            TurnContent::Message { .. } if root && turn.author == Author::User => {
                if terminal != Some(SessionStatus::Failed) {
                    terminal = None;
                }
            }
            TurnContent::FinalAnswer { .. } if root => {
                if terminal.is_none() {
                    terminal = Some(SessionStatus::Completed);
                }
            }
            TurnContent::Failed { .. } => terminal = Some(SessionStatus::Failed),
            TurnContent::ConfirmationRequested { request_id, .. } => {
                pending.insert(request_id.as_str());
            }
            TurnContent::Approved { request_id, .. } => {
                pending.remove(request_id.as_str());
            }
            other => {
                if let Some(id) = other.answered_request() {
                    pending.remove(id);
                }
            }
        }
    }

    match terminal {
        Some(status) => status,
        None if pending.is_empty() => SessionStatus::Active,
        None => SessionStatus::AwaitingApproval,
    }
}
