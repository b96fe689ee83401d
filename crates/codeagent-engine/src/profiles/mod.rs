//! Capability profiles ("subagents").
//!
//! The set is closed and built once at startup. A profile is configuration
//! only: an allowed tool subset and contract text for the collaborator.

mod contract;
mod registry;

pub use contract::{CONTRACT_NOTICE_PREFIX, OutputContract, has_contract_notice};
pub use registry::{CapabilityProfile, ProfileRegistry};
