//! Session model shared by the store, the safety gate and the orchestrator.
//!
//! Everything here is plain data: sessions own an append-only turn sequence
//! and a delegation tree, and their status can always be recomputed from
//! the turns alone.

mod session;
mod turn;

pub use session::{
    DelegationRecord, DelegationStatus, PendingApproval, Session, SessionStatus, derive_status,
};
pub use turn::{
    Author, DelegationSpec, Denial, DenialKind, FailureKind, NewTurn, ProfileId, RiskClass,
    ToolCallRequest, ToolCallResult, Turn, TurnContent,
};
