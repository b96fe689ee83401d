//! Shell command tool.

use std::fmt::Write as _;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};
use tokio::process::Command;
use tracing::{info, warn};

use codeagent_core::config::ToolsConfig;

use crate::tools::registry::{ToolContext, ToolError, ToolHandler, ToolOutput, parse_args};

/// Substrings that are refused even after approval (case-insensitive).
const REFUSED_PATTERNS: &[&str] = &["rm -rf /", "format", "del /q"];

#[derive(Deserialize)]
struct RunShellArgs {
    command: String,
    #[serde(default)]
    timeout: Option<i64>,
}

/// Run `sh -c <command>` in the workspace root.
pub struct RunShell {
    default_timeout_secs: u64,
    max_timeout_secs: u64,
}

impl RunShell {
    pub const fn new(config: &ToolsConfig) -> Self {
        Self {
            default_timeout_secs: config.shell_default_timeout_secs,
            max_timeout_secs: config.shell_max_timeout_secs,
        }
    }

    fn timeout(&self, requested: Option<i64>) -> Result<Duration, ToolError> {
        let Some(secs) = requested else {
            return Ok(Duration::from_secs(self.default_timeout_secs));
        };
        let secs = u64::try_from(secs)
            .ok()
            .filter(|&s| s > 0)
            .ok_or_else(|| {
                ToolError::InvalidArguments(format!("timeout must be positive, got {secs}"))
            })?;
        if secs > self.max_timeout_secs {
            return Err(ToolError::InvalidArguments(format!(
                "timeout {secs} exceeds maximum allowed {} seconds",
                self.max_timeout_secs
            )));
        }
        Ok(Duration::from_secs(secs))
    }
}

/// First refused pattern contained in `command`.
pub fn refused_pattern(command: &str) -> Option<&'static str> {
    let lower = command.to_lowercase();
    REFUSED_PATTERNS.iter().copied().find(|p| lower.contains(p))
}

#[async_trait]
impl ToolHandler for RunShell {
    async fn call(
        &self,
        ctx: &ToolContext,
        args: &Map<String, Value>,
    ) -> Result<ToolOutput, ToolError> {
        let args: RunShellArgs = parse_args(args)?;
        let timeout = self.timeout(args.timeout)?;
        let command = args.command.trim();
        if command.is_empty() {
            return Err(ToolError::InvalidArguments("command cannot be empty".into()));
        }
        if let Some(pattern) = refused_pattern(command) {
            warn!(session_id = %ctx.session_id, command, pattern, "Refused dangerous command");
            return Err(ToolError::Failed(format!(
                "command contains potentially dangerous operation: {pattern}"
            )));
        }

        info!(session_id = %ctx.session_id, command, timeout_secs = timeout.as_secs(), "Running shell command");
        let child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(ctx.workspace.root())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ToolError::Failed(format!("failed to spawn shell: {e}")))?;

        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(|e| ToolError::Failed(format!("failed to wait for shell: {e}")))?,
            Err(_) => {
                return Err(ToolError::Failed(format!(
                    "command timed out after {} seconds",
                    timeout.as_secs()
                )));
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let code = output.status.code().unwrap_or(-1);

        let mut text = String::new();
        if !stdout.is_empty() {
            text.push_str(&stdout);
            if !stdout.ends_with('\n') {
                text.push('\n');
            }
        }
        if !stderr.is_empty() {
            let _ = writeln!(text, "STDERR:\n{}", stderr.trim_end());
        }
        let _ = write!(text, "Command executed with exit code: {code}");
        if code != 0 {
            text.push_str(" (non-zero exit code indicates potential error)");
        }

        Ok(ToolOutput::text(text))
    }
}
