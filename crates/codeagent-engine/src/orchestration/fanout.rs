//! Fan-out planning for delegations opened by one `delegated` turn.
//!
//! Sub-sessions run concurrently only when every task declares the paths it
//! will modify and no two declarations overlap. Anything else runs serially
//! in profile registration order. Results are merged by completion time,
//! then profile registration order, then request order.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use codeagent_core::model::DelegationRecord;

use crate::profiles::ProfileRegistry;

/// Fallback when the configured limit is zero.
const DEFAULT_MAX_PARALLEL: usize = 4;

fn normalize(path: &str) -> &str {
    let mut p = path.trim();
    while let Some(rest) = p.strip_prefix("./") {
        p = rest;
    }
    let p = p.trim_end_matches('/');
    if p.is_empty() { "." } else { p }
}

/// Whether two declared paths can touch the same file.
fn overlaps(a: &str, b: &str) -> bool {
    let (a, b) = (normalize(a), normalize(b));
    if a == "." || b == "." || a == b {
        return true;
    }
    let nested = |outer: &str, inner: &str| {
        inner
            .strip_prefix(outer)
            .is_some_and(|rest| rest.starts_with('/'))
    };
    nested(a, b) || nested(b, a)
}

/// Whether the records may run as concurrent sub-sessions.
pub fn can_run_concurrently(records: &[DelegationRecord]) -> bool {
    if records.len() < 2 {
        return false;
    }
    if records.iter().any(|r| r.declared_paths.is_empty()) {
        return false;
    }
    for (i, left) in records.iter().enumerate() {
        for right in &records[i + 1..] {
            let clash = left
                .declared_paths
                .iter()
                .any(|a| right.declared_paths.iter().any(|b| overlaps(a, b)));
            if clash {
                debug!(left = %left.id, right = %right.id, "Declared paths overlap");
                return false;
            }
        }
    }
    true
}

/// Serial execution order: profile registration order, then request order.
pub fn serial_order(records: &[DelegationRecord]) -> Vec<DelegationRecord> {
    let mut ordered = records.to_vec();
    ordered.sort_by_key(|r| ProfileRegistry::registration_index(r.target));
    ordered
}

/// A finished sub-session waiting to be merged into its parent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinishedChild {
    pub record: DelegationRecord,
    /// Position of the task in the delegation request.
    pub position: usize,
    pub text: String,
    /// Commit time (ms) of the child's final answer.
    pub completed_at: i64,
}

/// Sort finished children into merge order.
pub fn merge_order(mut finished: Vec<FinishedChild>) -> Vec<FinishedChild> {
    finished.sort_by_key(|c| {
        (
            c.completed_at,
            ProfileRegistry::registration_index(c.record.target),
            c.position,
        )
    });
    finished
}

/// Limits how many sub-sessions of one fan-out run at once.
pub struct DelegationPool {
    semaphore: Arc<Semaphore>,
}

/// Slot in a [`DelegationPool`], returned on drop.
pub struct DelegationPermit {
    _permit: Option<OwnedSemaphorePermit>,
}

impl DelegationPool {
    pub fn new(max_parallel: usize) -> Self {
        let limit = if max_parallel == 0 {
            DEFAULT_MAX_PARALLEL
        } else {
            max_parallel
        };
        Self {
            semaphore: Arc::new(Semaphore::new(limit)),
        }
    }

    /// Wait for a free slot.
    pub async fn acquire(&self) -> DelegationPermit {
        // The semaphore is never closed, so a failed acquire only happens
        // after shutdown; run unthrottled in that case.
        let permit = Arc::clone(&self.semaphore).acquire_owned().await.ok();
        DelegationPermit { _permit: permit }
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}
