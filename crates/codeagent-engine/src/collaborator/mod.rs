//! LLM collaborator seam.
//!
//! The orchestrator reaches the language model through one `complete`
//! capability. Replies are already classified: a final answer, tool calls,
//! or a delegation request.

mod openai;

use async_trait::async_trait;
use serde_json::{Map, Value};

use codeagent_core::model::{ProfileId, Turn};

use crate::tools::ToolSpec;

pub use openai::OpenAiCollaborator;

/// Everything the collaborator sees for one planning step.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub profile: ProfileId,
    pub description: String,
    /// Behavioural contract of the active profile.
    pub contract: String,
    /// Turns of the active thread, in order.
    pub transcript: Vec<Turn>,
    /// Tools the profile may call.
    pub tools: Vec<ToolSpec>,
    /// Profiles the active profile may delegate to; empty disables delegation.
    pub delegates: Vec<ProfileId>,
    /// Corrective instruction after a rejected reply.
    pub corrective: Option<String>,
}

/// A tool call proposed by the collaborator.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallDraft {
    pub tool: String,
    pub args: Map<String, Value>,
}

/// One sub-task proposed for delegation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelegationTask {
    pub target: ProfileId,
    pub sub_task: String,
    /// Workspace paths the sub-task expects to modify.
    pub paths: Vec<String>,
}

/// Classified collaborator reply.
#[derive(Debug, Clone, PartialEq)]
pub enum Completion {
    FinalAnswer {
        text: String,
    },
    ToolCalls {
        text: Option<String>,
        calls: Vec<ToolCallDraft>,
    },
    Delegation {
        tasks: Vec<DelegationTask>,
    },
}

impl Completion {
    /// Reject replies that carry nothing to act on.
    pub fn validate(self) -> Result<Self, CollaboratorError> {
        match &self {
            Self::ToolCalls { calls, .. } if calls.is_empty() => {
                Err(CollaboratorError::Malformed("tool call reply without calls".into()))
            }
            Self::Delegation { tasks } if tasks.is_empty() => {
                Err(CollaboratorError::Malformed("delegation reply without tasks".into()))
            }
            Self::Delegation { tasks } if tasks.iter().any(|t| t.sub_task.trim().is_empty()) => {
                Err(CollaboratorError::Malformed("delegation with an empty sub-task".into()))
            }
            _ => Ok(self),
        }
    }
}

/// Collaborator failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CollaboratorError {
    #[error("Collaborator timed out")]
    Timeout,

    #[error("Malformed collaborator reply: {0}")]
    Malformed(String),

    #[error("Collaborator unavailable: {0}")]
    Transport(String),
}

/// The LLM backend.
#[async_trait]
pub trait Collaborator: Send + Sync {
    async fn complete(&self, request: CompletionRequest) -> Result<Completion, CollaboratorError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_replies_are_malformed() {
        let calls = Completion::ToolCalls {
            text: None,
            calls: Vec::new(),
        };
        assert!(matches!(calls.validate(), Err(CollaboratorError::Malformed(_))));

        let tasks = Completion::Delegation { tasks: Vec::new() };
        assert!(matches!(tasks.validate(), Err(CollaboratorError::Malformed(_))));

        let answer = Completion::FinalAnswer { text: "ok".into() };
        assert_eq!(answer.clone().validate(), Ok(answer));
    }
}
