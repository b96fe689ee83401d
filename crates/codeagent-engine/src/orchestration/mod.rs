//! Orchestration: the state machine that plans, dispatches tools,
//! delegates to sub-sessions and merges their answers.
//!
//! - [`Orchestrator`] drives one session run at a time per session
//! - [`phase`] holds the phase transition table
//! - [`fanout`] decides whether sibling delegations may run concurrently
//! - [`replay`] derives each thread's next step from its transcript

pub mod fanout;
mod orchestrator;
pub mod phase;
pub mod replay;
pub mod retry;

pub use orchestrator::{Confirmation, Orchestrator, OrchestratorError, RunOutcome};
pub use phase::Phase;
pub use retry::RetryPolicy;
