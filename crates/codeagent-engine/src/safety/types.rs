//! Safety gate types.

use std::collections::BTreeSet;

use codeagent_core::Workspace;
use codeagent_core::model::DenialKind;

/// Outcome of authorizing a tool call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    Allow,
    Deny { kind: DenialKind, reason: String },
    RequireConfirmation { reason: String },
}

impl GateDecision {
    pub fn deny(kind: DenialKind, reason: impl Into<String>) -> Self {
        Self::Deny {
            kind,
            reason: reason.into(),
        }
    }
}

/// Session facts the gate needs, all derived from the transcript.
#[derive(Debug, Clone, Copy)]
pub struct GateContext<'a> {
    pub session_id: &'a str,
    pub workspace: &'a Workspace,
    /// Trusted sessions run destructive tools without confirmation.
    pub trusted: bool,
    /// Tools approved for the rest of the session.
    pub grants: &'a BTreeSet<String>,
}
