//! Tool registry: named, typed capabilities with a declared risk class.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use codeagent_core::Workspace;
use codeagent_core::model::{DenialKind, RiskClass, ToolCallResult};

/// Static description of a tool.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolSpec {
    pub name: String,
    pub risk_class: RiskClass,
    pub description: String,
    /// JSON schema of the arguments object.
    pub parameters: Value,
    /// Argument names that carry workspace paths.
    pub path_args: Vec<String>,
}

/// Successful handler output.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolOutput {
    pub output: String,
    pub files_touched: Vec<PathBuf>,
}

impl ToolOutput {
    pub fn text(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            files_touched: Vec::new(),
        }
    }
}

/// Tool invocation errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ToolError {
    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    /// A path argument resolved outside the workspace.
    #[error("{0}")]
    PathEscapesWorkspace(String),

    /// The handler ran and failed; reported as an unsuccessful result.
    #[error("{0}")]
    Failed(String),
}

/// A call that never produced a result; recorded as a denial.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub kind: DenialKind,
    pub reason: String,
}

/// Registration errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("Tool already registered: {0}")]
    Duplicate(String),
}

/// Per-call context handed to handlers.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub session_id: String,
    pub workspace: Workspace,
}

/// A tool implementation.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, ctx: &ToolContext, args: &Map<String, Value>)
    -> Result<ToolOutput, ToolError>;
}

struct RegisteredTool {
    spec: ToolSpec,
    handler: Arc<dyn ToolHandler>,
}

/// Registry of tools, iterated in registration order.
///
/// Built once at startup and shared behind an `Arc`.
#[derive(Default)]
pub struct ToolRegistry {
    tools: Vec<RegisteredTool>,
    index: HashMap<String, usize>,
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.names().collect::<Vec<_>>())
            .finish()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool. Names are unique.
    pub fn register(
        &mut self,
        spec: ToolSpec,
        handler: Arc<dyn ToolHandler>,
    ) -> Result<(), RegistryError> {
        if self.index.contains_key(&spec.name) {
            return Err(RegistryError::Duplicate(spec.name));
        }
        debug!(tool = %spec.name, risk_class = %spec.risk_class, "Tool registered");
        self.index.insert(spec.name.clone(), self.tools.len());
        self.tools.push(RegisteredTool { spec, handler });
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&ToolSpec> {
        self.index.get(name).map(|&i| &self.tools[i].spec)
    }

    pub fn risk_class(&self, name: &str) -> Option<RiskClass> {
        self.get(name).map(|spec| spec.risk_class)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tools.iter().map(|t| t.spec.name.as_str())
    }

    /// Specs in registration order.
    pub fn specs(&self) -> impl Iterator<Item = &ToolSpec> {
        self.tools.iter().map(|t| &t.spec)
    }

    /// Run a tool.
    ///
    /// Unknown tools, rejected arguments and workspace escapes are
    /// rejections; a handler failure is an unsuccessful result. Nothing is
    /// retried.
    pub async fn invoke(
        &self,
        ctx: &ToolContext,
        request_id: &str,
        name: &str,
        args: &Map<String, Value>,
    ) -> Result<ToolCallResult, Rejection> {
        let Some(tool) = self.index.get(name).map(|&i| &self.tools[i]) else {
            return Err(Rejection {
                kind: DenialKind::UnknownTool,
                reason: format!("unknown tool: {name}"),
            });
        };

        debug!(session_id = %ctx.session_id, request_id, tool = name, "Invoking tool");
        match tool.handler.call(ctx, args).await {
            Ok(out) => Ok(ToolCallResult {
                request_id: request_id.to_string(),
                success: true,
                output: out.output,
                error: None,
                files_touched: out.files_touched,
            }),
            Err(ToolError::Failed(message)) => {
                warn!(session_id = %ctx.session_id, request_id, tool = name, error = %message, "Tool failed");
                Ok(ToolCallResult {
                    request_id: request_id.to_string(),
                    success: false,
                    output: String::new(),
                    error: Some(message),
                    files_touched: Vec::new(),
                })
            }
            Err(ToolError::InvalidArguments(reason)) => Err(Rejection {
                kind: DenialKind::InvalidArguments,
                reason,
            }),
            Err(ToolError::PathEscapesWorkspace(reason)) => {
                warn!(session_id = %ctx.session_id, request_id, tool = name, reason = %reason, "Path escapes workspace");
                Err(Rejection {
                    kind: DenialKind::PathEscapesWorkspace,
                    reason,
                })
            }
        }
    }
}

/// Deserialize a handler's arguments object.
pub fn parse_args<T: serde::de::DeserializeOwned>(
    args: &Map<String, Value>,
) -> Result<T, ToolError> {
    serde_json::from_value(Value::Object(args.clone()))
        .map_err(|e| ToolError::InvalidArguments(e.to_string()))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Echo {
        calls: AtomicUsize,
    }

    #[derive(serde::Deserialize)]
    struct EchoArgs {
        text: String,
    }

    #[async_trait]
    impl ToolHandler for Echo {
        async fn call(
            &self,
            _ctx: &ToolContext,
            args: &Map<String, Value>,
        ) -> Result<ToolOutput, ToolError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let args: EchoArgs = parse_args(args)?;
            if args.text == "boom" {
                return Err(ToolError::Failed("exploded".into()));
            }
            Ok(ToolOutput::text(args.text))
        }
    }

    fn spec(name: &str) -> ToolSpec {
        ToolSpec {
            name: name.into(),
            risk_class: RiskClass::ReadOnly,
            description: "echo".into(),
            parameters: serde_json::json!({"type": "object"}),
            path_args: Vec::new(),
        }
    }

    fn ctx() -> ToolContext {
        ToolContext {
            session_id: "s".into(),
            workspace: Workspace::at("/ws-none"),
        }
    }

    fn args(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    fn registry() -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        registry
            .register(spec("echo"), Arc::new(Echo { calls: AtomicUsize::new(0) }))
            .unwrap();
        registry
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut registry = registry();
        let err = registry
            .register(spec("echo"), Arc::new(Echo { calls: AtomicUsize::new(0) }))
            .unwrap_err();
        assert_eq!(err, RegistryError::Duplicate("echo".into()));
    }

    #[test]
    fn iteration_follows_registration_order() {
        let mut registry = ToolRegistry::new();
        for name in ["c", "a", "b"] {
            registry
                .register(spec(name), Arc::new(Echo { calls: AtomicUsize::new(0) }))
                .unwrap();
        }
        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["c", "a", "b"]);
    }

    #[tokio::test]
    async fn invoke_success() {
        let result = registry()
            .invoke(&ctx(), "r1", "echo", &args(serde_json::json!({"text": "hi"})))
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.output, "hi");
        assert_eq!(result.request_id, "r1");
    }

    #[tokio::test]
    async fn unknown_tool_is_an_error() {
        let err = registry()
            .invoke(&ctx(), "r1", "nope", &Map::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind, DenialKind::UnknownTool);
        assert_eq!(err.reason, "unknown tool: nope");
    }

    #[tokio::test]
    async fn bad_arguments_are_an_error() {
        let err = registry()
            .invoke(&ctx(), "r1", "echo", &args(serde_json::json!({"txt": 1})))
            .await
            .unwrap_err();
        assert_eq!(err.kind, DenialKind::InvalidArguments);
    }

    #[tokio::test]
    async fn workspace_escape_is_a_rejection() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ToolContext {
            session_id: "s".into(),
            workspace: Workspace::open(dir.path()).unwrap(),
        };
        let mut registry = ToolRegistry::new();
        registry
            .register(
                ToolSpec {
                    path_args: vec!["path".into()],
                    ..spec("read_file")
                },
                Arc::new(crate::tools::builtin::ReadFile::new(
                    &codeagent_core::config::ToolsConfig::default(),
                )),
            )
            .unwrap();
        let err = registry
            .invoke(&ctx, "r1", "read_file", &args(serde_json::json!({"path": "../../etc/passwd"})))
            .await
            .unwrap_err();
        assert_eq!(err.kind, DenialKind::PathEscapesWorkspace);
    }

    #[tokio::test]
    async fn handler_failure_is_an_unsuccessful_result() {
        let result = registry()
            .invoke(&ctx(), "r1", "echo", &args(serde_json::json!({"text": "boom"})))
            .await
            .unwrap();
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("exploded"));
    }
}
