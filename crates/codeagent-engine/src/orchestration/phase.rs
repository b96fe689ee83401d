//! Orchestration phases and their transition table.

use std::fmt;

use tracing::{error, trace};

/// Phase of one thread's control loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Not started, or suspended.
    Idle,
    /// Waiting on the collaborator.
    Planning,
    /// Sub-sessions running.
    Delegating,
    /// Tool requests going through the gate.
    ToolPending,
    /// Folding sub-session answers into the parent thread.
    Merging,
    Done,
    Failed,
}

impl Phase {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Planning => "planning",
            Self::Delegating => "delegating",
            Self::ToolPending => "tool_pending",
            Self::Merging => "merging",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether `from -> to` is a legal transition.
pub const fn can_transition(from: Phase, to: Phase) -> bool {
    use Phase::{Delegating, Done, Failed, Idle, Merging, Planning, ToolPending};
    match (from, to) {
        // Any live phase can fail.
        (Idle | Planning | Delegating | ToolPending | Merging, Failed) => true,
        // Resuming picks up wherever the transcript left off.
        (Idle, Planning | ToolPending | Delegating | Done) => true,
        // Corrective retries stay in planning.
        (Planning, Planning | ToolPending | Delegating | Done) => true,
        // Pausing or suspending returns a thread to idle.
        (Planning | ToolPending, Idle) => true,
        (ToolPending, Planning) => true,
        (Delegating, Merging | Idle) => true,
        (Merging, Planning | Delegating | Idle) => true,
        _ => false,
    }
}

/// Tracks the phase of one thread and flags illegal transitions.
#[derive(Debug)]
pub struct PhaseTracker {
    thread_id: String,
    current: Phase,
}

impl PhaseTracker {
    pub fn new(thread_id: impl Into<String>) -> Self {
        Self {
            thread_id: thread_id.into(),
            current: Phase::Idle,
        }
    }

    pub const fn current(&self) -> Phase {
        self.current
    }

    /// Move to `to`. Illegal transitions are bugs: logged, then applied.
    pub fn advance(&mut self, to: Phase) {
        if self.current == to && to != Phase::Planning {
            return;
        }
        if can_transition(self.current, to) {
            trace!(thread_id = %self.thread_id, from = %self.current, to = %to, "Phase transition");
        } else {
            error!(thread_id = %self.thread_id, from = %self.current, to = %to, "Invalid phase transition");
        }
        self.current = to;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_is_legal() {
        let path = [
            Phase::Idle,
            Phase::Planning,
            Phase::ToolPending,
            Phase::Planning,
            Phase::Delegating,
            Phase::Merging,
            Phase::Planning,
            Phase::Done,
        ];
        for pair in path.windows(2) {
            assert!(can_transition(pair[0], pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn terminal_phases_are_final() {
        for to in [Phase::Idle, Phase::Planning, Phase::ToolPending, Phase::Failed] {
            assert!(!can_transition(Phase::Done, to));
            assert!(!can_transition(Phase::Failed, to));
        }
        assert!(Phase::Done.is_terminal());
        assert!(!Phase::Merging.is_terminal());
    }

    #[test]
    fn tool_results_cannot_jump_to_done() {
        assert!(!can_transition(Phase::ToolPending, Phase::Done));
        assert!(!can_transition(Phase::Delegating, Phase::Planning));
    }

    #[test]
    fn tracker_applies_transitions() {
        let mut tracker = PhaseTracker::new("t");
        tracker.advance(Phase::Planning);
        tracker.advance(Phase::ToolPending);
        tracker.advance(Phase::ToolPending);
        assert_eq!(tracker.current(), Phase::ToolPending);
    }
}
