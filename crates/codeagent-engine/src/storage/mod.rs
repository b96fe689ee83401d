//! `SQLite` storage for codeagent sessions.
//!
//! Persists sessions, their turn log and the delegation tree.

mod db;
mod models;
mod queries;

pub use db::{Database, DatabaseError};
pub use models::{DelegationRow, SessionRow, TurnRow};
