//! Shared fixtures: a scripted collaborator and a wired-up controller.

#![allow(dead_code, clippy::unwrap_used)]

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use tempfile::TempDir;
use tokio::sync::Mutex;

use codeagent_core::PolicyEngine;
use codeagent_core::config::{OrchestratorConfig, ToolsConfig};
use codeagent_core::model::{ProfileId, RiskClass, Turn, TurnContent};
use codeagent_engine::collaborator::{
    Collaborator, CollaboratorError, Completion, CompletionRequest, DelegationTask, ToolCallDraft,
};
use codeagent_engine::controller::{SessionController, StartOptions};
use codeagent_engine::orchestration::{Confirmation, Orchestrator};
use codeagent_engine::profiles::ProfileRegistry;
use codeagent_engine::safety::SafetyGate;
use codeagent_engine::session::SessionStore;
use codeagent_engine::storage::Database;
use codeagent_engine::tools::builtin::{EditFile, Grep, ListDir, ReadFile, RunShell, WriteFile};
use codeagent_engine::tools::{
    ToolContext, ToolError, ToolHandler, ToolOutput, ToolRegistry, ToolSpec,
};

/// One scripted collaborator reply.
pub enum Step {
    Reply(Completion),
    /// Reply after a real-time delay.
    Delayed(Duration, Completion),
    Fail(CollaboratorError),
}

/// Collaborator that replays per-profile scripts and records every request.
#[derive(Default)]
pub struct ScriptedCollaborator {
    scripts: Mutex<HashMap<ProfileId, VecDeque<Step>>>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedCollaborator {
    pub async fn script(&self, profile: ProfileId, steps: Vec<Step>) {
        self.scripts
            .lock()
            .await
            .entry(profile)
            .or_default()
            .extend(steps);
    }

    pub async fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().await.clone()
    }

    pub async fn requests_for(&self, profile: ProfileId) -> Vec<CompletionRequest> {
        self.requests()
            .await
            .into_iter()
            .filter(|r| r.profile == profile)
            .collect()
    }
}

#[async_trait]
impl Collaborator for ScriptedCollaborator {
    async fn complete(&self, request: CompletionRequest) -> Result<Completion, CollaboratorError> {
        let profile = request.profile;
        self.requests.lock().await.push(request);
        let step = self
            .scripts
            .lock()
            .await
            .get_mut(&profile)
            .and_then(VecDeque::pop_front);
        match step {
            Some(Step::Reply(completion)) => Ok(completion),
            Some(Step::Delayed(delay, completion)) => {
                tokio::time::sleep(delay).await;
                Ok(completion)
            }
            Some(Step::Fail(e)) => Err(e),
            None => Ok(answer(&format!("{profile} has nothing more to say"))),
        }
    }
}

pub fn answer(text: &str) -> Completion {
    Completion::FinalAnswer {
        text: text.to_string(),
    }
}

pub fn call(tool: &str, args: Value) -> Completion {
    calls(&[(tool, args)])
}

pub fn calls(items: &[(&str, Value)]) -> Completion {
    Completion::ToolCalls {
        text: None,
        calls: items
            .iter()
            .map(|(tool, args)| ToolCallDraft {
                tool: (*tool).to_string(),
                args: args.as_object().cloned().unwrap_or_else(Map::new),
            })
            .collect(),
    }
}

pub fn delegate(tasks: &[(ProfileId, &str, &[&str])]) -> Completion {
    Completion::Delegation {
        tasks: tasks
            .iter()
            .map(|(target, sub_task, paths)| DelegationTask {
                target: *target,
                sub_task: (*sub_task).to_string(),
                paths: paths.iter().map(ToString::to_string).collect(),
            })
            .collect(),
    }
}

/// `run_shell` that counts invocations before running the real handler.
pub struct CountingShell {
    inner: RunShell,
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl ToolHandler for CountingShell {
    async fn call(
        &self,
        ctx: &ToolContext,
        args: &Map<String, Value>,
    ) -> Result<ToolOutput, ToolError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.call(ctx, args).await
    }
}

fn spec(name: &str, risk_class: RiskClass, path_args: &[&str]) -> ToolSpec {
    ToolSpec {
        name: name.to_string(),
        risk_class,
        description: format!("{name} tool"),
        parameters: json!({"type": "object"}),
        path_args: path_args.iter().map(ToString::to_string).collect(),
    }
}

/// Built-in tools with an observable `run_shell`.
pub fn tool_registry(shell_calls: Arc<AtomicUsize>) -> ToolRegistry {
    let config = ToolsConfig::default();
    let mut registry = ToolRegistry::new();
    registry
        .register(spec("list_dir", RiskClass::ReadOnly, &["path"]), Arc::new(ListDir))
        .unwrap();
    registry
        .register(
            spec("read_file", RiskClass::ReadOnly, &["path"]),
            Arc::new(ReadFile::new(&config)),
        )
        .unwrap();
    registry
        .register(
            spec("grep", RiskClass::ReadOnly, &["path"]),
            Arc::new(Grep::new(&config)),
        )
        .unwrap();
    registry
        .register(spec("write_file", RiskClass::Mutating, &["path"]), Arc::new(WriteFile))
        .unwrap();
    registry
        .register(spec("edit_file", RiskClass::Mutating, &["path"]), Arc::new(EditFile))
        .unwrap();
    registry
        .register(
            spec("run_shell", RiskClass::Destructive, &[]),
            Arc::new(CountingShell {
                inner: RunShell::new(&config),
                calls: shell_calls,
            }),
        )
        .unwrap();
    registry
}

pub fn test_config() -> OrchestratorConfig {
    OrchestratorConfig {
        retry_backoff_ms: 1,
        collaborator_timeout_secs: 5,
        ..OrchestratorConfig::default()
    }
}

pub struct Harness {
    pub controller: SessionController,
    pub collaborator: Arc<ScriptedCollaborator>,
    pub shell_calls: Arc<AtomicUsize>,
    pub workspace: TempDir,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_config(test_config()).await
    }

    pub async fn with_config(config: OrchestratorConfig) -> Self {
        Self::with_policy(config, PolicyEngine::new()).await
    }

    pub async fn with_policy(config: OrchestratorConfig, policy: PolicyEngine) -> Self {
        let shell_calls = Arc::new(AtomicUsize::new(0));
        let tools = Arc::new(tool_registry(Arc::clone(&shell_calls)));
        let profiles = Arc::new(ProfileRegistry::new(&tools));
        let gate = Arc::new(SafetyGate::new(policy, Arc::clone(&tools)));
        let collaborator = Arc::new(ScriptedCollaborator::default());
        let store = SessionStore::new(Database::open_in_memory().await.unwrap());
        let orchestrator = Orchestrator::new(
            config,
            store,
            tools,
            profiles,
            gate,
            Arc::clone(&collaborator) as Arc<dyn Collaborator>,
        );
        Self {
            controller: SessionController::new(orchestrator),
            collaborator,
            shell_calls,
            workspace: tempfile::tempdir().unwrap(),
        }
    }

    pub async fn start(&self, message: &str) -> String {
        self.start_with(message, false).await
    }

    pub async fn start_with(&self, message: &str, trusted: bool) -> String {
        self.controller
            .start(
                message,
                StartOptions {
                    workspace_root: self.workspace.path().to_path_buf(),
                    trusted,
                },
            )
            .await
            .unwrap()
    }

    pub async fn run(&self, session_id: &str, confirmation: Option<Confirmation>) -> Vec<Turn> {
        self.controller
            .run_to_end(session_id, confirmation)
            .await
            .unwrap()
    }

    pub fn shell_calls(&self) -> usize {
        self.shell_calls.load(Ordering::SeqCst)
    }
}

/// Content kinds of a turn list, for compact assertions.
pub fn kinds(turns: &[Turn]) -> Vec<&'static str> {
    turns.iter().map(|t| t.content.kind()).collect()
}

pub fn thread<'a>(turns: &'a [Turn], thread_id: &str) -> Vec<&'a Turn> {
    turns.iter().filter(|t| t.thread_id == thread_id).collect()
}

pub fn final_answer(turns: &[Turn], thread_id: &str) -> Option<String> {
    turns.iter().rev().find_map(|t| match &t.content {
        TurnContent::FinalAnswer { text } if t.thread_id == thread_id => Some(text.clone()),
        _ => None,
    })
}
