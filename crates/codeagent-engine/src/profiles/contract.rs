//! Output contracts: conditions a profile must meet before its final answer.

use std::collections::HashMap;

use codeagent_core::model::{Session, TurnContent};

/// Prefix of the notice appended when a final answer breaks the contract.
pub const CONTRACT_NOTICE_PREFIX: &str = "Output contract not met:";

/// Termination predicate of a profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputContract {
    /// Any final answer is accepted.
    Unrestricted,
    /// At least one successful call of the named tool in the profile's thread.
    RequiresSuccessfulTool(&'static str),
}

impl OutputContract {
    /// Check the contract against one thread. `Err` carries the reason.
    pub fn check(&self, session: &Session, thread_id: &str) -> Result<(), String> {
        match self {
            Self::Unrestricted => Ok(()),
            Self::RequiresSuccessfulTool(tool) => {
                let mut requested: HashMap<&str, &str> = HashMap::new();
                for turn in session.thread(thread_id) {
                    match &turn.content {
                        TurnContent::ToolCalls { requests, .. } => {
                            for request in requests {
                                requested.insert(&request.id, &request.tool);
                            }
                        }
                        TurnContent::ToolResult { result }
                            if result.success
                                && requested.get(result.request_id.as_str()) == Some(tool) =>
                        {
                            return Ok(());
                        }
                        _ => {}
                    }
                }
                Err(format!(
                    "call {tool} successfully at least once before giving a final answer"
                ))
            }
        }
    }
}

/// Whether the thread already received a contract notice.
pub fn has_contract_notice(session: &Session, thread_id: &str) -> bool {
    session.thread(thread_id).any(|t| {
        matches!(&t.content, TurnContent::Notice { text } if text.starts_with(CONTRACT_NOTICE_PREFIX))
    })
}
