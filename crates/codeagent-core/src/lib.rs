//! `codeagent` Core Library
//!
//! Shared functionality for `codeagent` components:
//! - Session, turn and delegation model
//! - Configuration resolution and hierarchy
//! - Safety policy rule matching
//! - Workspace path containment
//! - Common error types

pub mod config;
pub mod db;
pub mod error;
pub mod model;
pub mod policy;
pub mod tracing_init;
pub mod workspace;

pub use config::Config;
pub use error::{Error, Result};
pub use policy::{PolicyAction, PolicyEngine, PolicyRule};
pub use workspace::{Workspace, WorkspaceError};
