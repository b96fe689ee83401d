//! `codeagent` Engine Library
//!
//! Core functionality for the coding agent:
//! - Tool registry and the built-in workspace tools
//! - Safety gate for every tool invocation
//! - Capability profiles (specialised subagents)
//! - LLM collaborator seam with an OpenAI-compatible client
//! - SQLite session store with resumable transcripts
//! - Orchestrator and session controller

pub mod collaborator;
pub mod controller;
pub mod orchestration;
pub mod profiles;
pub mod repl;
pub mod safety;
pub mod session;
pub mod storage;
pub mod tools;
