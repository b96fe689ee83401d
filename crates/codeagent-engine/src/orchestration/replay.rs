//! Transcript replay: what a thread has to do next.
//!
//! The orchestrator keeps no state outside the session. Every step is
//! decided by reading the thread's committed turns, which is what makes a
//! crashed or suspended run resumable at the last committed turn.

use codeagent_core::model::{DelegationSpec, Session, ToolCallRequest, TurnContent};

/// Next step for one thread.
#[derive(Debug, Clone, PartialEq)]
pub enum NextAction {
    /// Ask the collaborator.
    Plan,
    /// Tool requests of the latest `tool_calls` turn still lacking an answer.
    Dispatch { requests: Vec<ToolCallRequest> },
    /// Delegations of a committed `delegated` turn that were never recorded
    /// nor refused.
    OpenDelegations {
        parent_turn_seq: i64,
        specs: Vec<DelegationSpec>,
    },
    /// The thread ended with a final answer.
    Finished { text: String, completed_at: i64 },
}

pub fn next_action(session: &Session, thread_id: &str) -> NextAction {
    let turns: Vec<_> = session.thread(thread_id).collect();
    let Some(last) = turns.last() else {
        return NextAction::Plan;
    };
    if let TurnContent::FinalAnswer { text } = &last.content {
        return NextAction::Finished {
            text: text.clone(),
            completed_at: last.created_at,
        };
    }

    for turn in turns.iter().rev() {
        match &turn.content {
            TurnContent::ToolCalls { requests, .. } => {
                let requests: Vec<ToolCallRequest> = requests
                    .iter()
                    .filter(|r| !session.is_answered(&r.id))
                    .cloned()
                    .collect();
                if !requests.is_empty() {
                    return NextAction::Dispatch { requests };
                }
                break;
            }
            TurnContent::Delegated { delegations } => {
                let specs: Vec<DelegationSpec> = delegations
                    .iter()
                    .filter(|d| {
                        session.delegation(&d.delegation_id).is_none()
                            && !session.is_answered(&d.delegation_id)
                    })
                    .cloned()
                    .collect();
                if !specs.is_empty() {
                    return NextAction::OpenDelegations {
                        parent_turn_seq: turn.seq,
                        specs,
                    };
                }
                break;
            }
            _ => {}
        }
    }
    NextAction::Plan
}

#[cfg(test)]
mod tests {
    use super::*;
    use codeagent_core::model::{
        Author, DelegationRecord, DelegationStatus, ProfileId, SessionStatus, ToolCallResult,
        Turn,
    };
    use serde_json::Map;
    use std::path::PathBuf;

    fn session(contents: Vec<TurnContent>) -> Session {
        Session {
            id: "s".into(),
            status: SessionStatus::Active,
            workspace_root: PathBuf::from("/ws"),
            trusted: false,
            turns: (1..)
                .zip(contents)
                .map(|(seq, content)| Turn {
                    seq,
                    thread_id: "s".into(),
                    author: Author::System,
                    content,
                    created_at: seq * 10,
                })
                .collect(),
            delegations: Vec::new(),
            created_at: 0,
            updated_at: 0,
            archived_at: None,
        }
    }

    fn calls(ids: &[&str]) -> TurnContent {
        TurnContent::ToolCalls {
            text: None,
            requests: ids
                .iter()
                .map(|id| ToolCallRequest {
                    id: (*id).into(),
                    profile: ProfileId::Root,
                    tool: "read_file".into(),
                    args: Map::new(),
                })
                .collect(),
        }
    }

    fn result(id: &str) -> TurnContent {
        TurnContent::ToolResult {
            result: ToolCallResult {
                request_id: id.into(),
                success: true,
                output: String::new(),
                error: None,
                files_touched: Vec::new(),
            },
        }
    }

    fn message(text: &str) -> TurnContent {
        TurnContent::Message { text: text.into() }
    }

    #[test]
    fn fresh_thread_plans() {
        assert_eq!(next_action(&session(vec![message("hi")]), "s"), NextAction::Plan);
        assert_eq!(next_action(&session(vec![]), "other"), NextAction::Plan);
    }

    #[test]
    fn unanswered_requests_are_dispatched() {
        let s = session(vec![message("hi"), calls(&["r1", "r2"]), result("r1")]);
        match next_action(&s, "s") {
            NextAction::Dispatch { requests } => {
                assert_eq!(requests.len(), 1);
                assert_eq!(requests[0].id, "r2");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn answered_requests_go_back_to_planning() {
        let s = session(vec![message("hi"), calls(&["r1"]), result("r1")]);
        assert_eq!(next_action(&s, "s"), NextAction::Plan);
    }

    #[test]
    fn final_answer_finishes() {
        let s = session(vec![
            message("hi"),
            TurnContent::FinalAnswer { text: "done".into() },
        ]);
        assert_eq!(
            next_action(&s, "s"),
            NextAction::Finished {
                text: "done".into(),
                completed_at: 20,
            }
        );
    }

    #[test]
    fn follow_up_message_replans() {
        let s = session(vec![
            message("hi"),
            TurnContent::FinalAnswer { text: "done".into() },
            message("more"),
        ]);
        assert_eq!(next_action(&s, "s"), NextAction::Plan);
    }

    #[test]
    fn unrecorded_delegations_are_reopened() {
        let spec = |id: &str| DelegationSpec {
            delegation_id: id.into(),
            target: ProfileId::CodeReviewer,
            sub_task: "review".into(),
            paths: Vec::new(),
        };
        let mut s = session(vec![
            message("hi"),
            TurnContent::Delegated {
                delegations: vec![spec("d1"), spec("d2")],
            },
        ]);
        s.delegations.push(DelegationRecord {
            id: "d1".into(),
            parent_thread_id: "s".into(),
            parent_turn_seq: 2,
            target: ProfileId::CodeReviewer,
            sub_task: "review".into(),
            depth: 1,
            declared_paths: Vec::new(),
            status: DelegationStatus::Open,
            closed_turn_seq: None,
        });
        match next_action(&s, "s") {
            NextAction::OpenDelegations {
                parent_turn_seq,
                specs,
            } => {
                assert_eq!(parent_turn_seq, 2);
                assert_eq!(specs, vec![spec("d2")]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
