//! Safety policy enforcement for tool calls.

mod gate;
mod types;

pub use gate::SafetyGate;
pub use types::{GateContext, GateDecision};
