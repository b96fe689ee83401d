//! Turn types: the append-only units of a session transcript.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::Error;

/// Sensitivity tier of a tool. Ordered: read-only < mutating < destructive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskClass {
    ReadOnly,
    Mutating,
    Destructive,
}

impl RiskClass {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::ReadOnly => "read_only",
            Self::Mutating => "mutating",
            Self::Destructive => "destructive",
        }
    }
}

impl fmt::Display for RiskClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifier of a capability profile.
///
/// The set is closed; profiles are resolved through a static registry
/// built at startup, never by name lookup at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProfileId {
    /// Generalist profile that receives the user's request.
    Root,
    CodeReviewer,
    TestWriter,
    Documenter,
    Debugger,
    Refactorer,
}

impl ProfileId {
    /// All profiles in registration order.
    pub const ALL: [Self; 6] = [
        Self::Root,
        Self::CodeReviewer,
        Self::TestWriter,
        Self::Documenter,
        Self::Debugger,
        Self::Refactorer,
    ];

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Root => "root",
            Self::CodeReviewer => "code_reviewer",
            Self::TestWriter => "test_writer",
            Self::Documenter => "documenter",
            Self::Debugger => "debugger",
            Self::Refactorer => "refactorer",
        }
    }
}

impl fmt::Display for ProfileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProfileId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| Error::UnknownVariant {
                kind: "profile",
                value: s.to_string(),
            })
    }
}

/// Who contributed a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "role", content = "profile", rename_all = "snake_case")]
pub enum Author {
    User,
    Profile(ProfileId),
    System,
}

/// A tool invocation requested by a profile.
///
/// The risk class is deliberately absent: it is read from the tool
/// registry at dispatch time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub id: String,
    pub profile: ProfileId,
    pub tool: String,
    #[serde(default)]
    pub args: Map<String, Value>,
}

/// Outcome of an executed tool call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCallResult {
    /// The request this result answers.
    pub request_id: String,
    pub success: bool,
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Files created or modified by the call.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files_touched: Vec<PathBuf>,
}

/// Why a tool call was refused before (or instead of) running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenialKind {
    UnknownTool,
    InvalidArguments,
    PathEscapesWorkspace,
    PermissionDenied,
}

impl DenialKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::UnknownTool => "unknown_tool",
            Self::InvalidArguments => "invalid_arguments",
            Self::PathEscapesWorkspace => "path_escapes_workspace",
            Self::PermissionDenied => "permission_denied",
        }
    }
}

impl fmt::Display for DenialKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Denial {
    pub request_id: String,
    pub kind: DenialKind,
    pub reason: String,
}

/// One sub-task handed to another profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelegationSpec {
    /// Also the thread id of the sub-session.
    pub delegation_id: String,
    pub target: ProfileId,
    pub sub_task: String,
    /// Workspace paths the sub-task expects to modify.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub paths: Vec<String>,
}

/// Cause recorded when a session fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    DelegationDepthExceeded,
    CollaboratorTimeout,
    CollaboratorMalformedResponse,
    CollaboratorUnavailable,
    StepLimitExceeded,
    Cancelled,
}

impl FailureKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::DelegationDepthExceeded => "delegation_depth_exceeded",
            Self::CollaboratorTimeout => "collaborator_timeout",
            Self::CollaboratorMalformedResponse => "collaborator_malformed_response",
            Self::CollaboratorUnavailable => "collaborator_unavailable",
            Self::StepLimitExceeded => "step_limit_exceeded",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Content of a turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnContent {
    /// First turn of every session; pins the policy inputs.
    SessionOpened {
        workspace_root: PathBuf,
        trusted: bool,
    },
    Message {
        text: String,
    },
    ToolCalls {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text: Option<String>,
        requests: Vec<ToolCallRequest>,
    },
    ToolResult {
        result: ToolCallResult,
    },
    Denied {
        denial: Denial,
    },
    ConfirmationRequested {
        request_id: String,
        tool: String,
        risk_class: RiskClass,
        reason: String,
    },
    Approved {
        request_id: String,
        #[serde(default)]
        remember_for_session: bool,
    },
    Delegated {
        delegations: Vec<DelegationSpec>,
    },
    DelegationResult {
        delegation_id: String,
        text: String,
    },
    FinalAnswer {
        text: String,
    },
    /// System note shown to the active profile (e.g. a corrective instruction).
    Notice {
        text: String,
    },
    Failed {
        kind: FailureKind,
        message: String,
    },
}

impl TurnContent {
    /// Request id this turn answers, if it is a tool result or a denial.
    pub fn answered_request(&self) -> Option<&str> {
        match self {
            Self::ToolResult { result } => Some(&result.request_id),
            Self::Denied { denial } => Some(&denial.request_id),
            _ => None,
        }
    }

    pub const fn kind(&self) -> &'static str {
        match self {
            Self::SessionOpened { .. } => "session_opened",
            Self::Message { .. } => "message",
            Self::ToolCalls { .. } => "tool_calls",
            Self::ToolResult { .. } => "tool_result",
            Self::Denied { .. } => "denied",
            Self::ConfirmationRequested { .. } => "confirmation_requested",
            Self::Approved { .. } => "approved",
            Self::Delegated { .. } => "delegated",
            Self::DelegationResult { .. } => "delegation_result",
            Self::FinalAnswer { .. } => "final_answer",
            Self::Notice { .. } => "notice",
            Self::Failed { .. } => "failed",
        }
    }
}

/// A committed turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    /// Turn id; strictly increasing within a session.
    pub seq: i64,
    /// Root thread id equals the session id; sub-sessions use their delegation id.
    pub thread_id: String,
    pub author: Author,
    pub content: TurnContent,
    /// Milliseconds since the Unix epoch, non-decreasing within a session.
    pub created_at: i64,
}

/// A turn that has not been committed yet.
#[derive(Debug, Clone, PartialEq)]
pub struct NewTurn {
    pub thread_id: String,
    pub author: Author,
    pub content: TurnContent,
}

impl NewTurn {
    pub fn new(thread_id: impl Into<String>, author: Author, content: TurnContent) -> Self {
        Self {
            thread_id: thread_id.into(),
            author,
            content,
        }
    }

    pub fn system(thread_id: impl Into<String>, content: TurnContent) -> Self {
        Self::new(thread_id, Author::System, content)
    }
}
