//! Session persistence.
//!
//! The store owns the durable transcript; everything else (status,
//! pending approvals, session grants) is derived from it.

mod store;

pub use store::{SessionStore, SessionSummary, StoreError};
