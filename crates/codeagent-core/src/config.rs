//! Configuration resolution for codeagent.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (~/.config/codeagent/settings.json)
//! 3. Project config (<workspace>/.codeagent/settings.json)
//! 4. Environment variables
//! 5. CLI arguments (highest priority, applied by the binary)

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::policy::PolicyRule;

/// Complete codeagent configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub workspace: WorkspaceConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub policy: PolicyConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            orchestrator: OrchestratorConfig::default(),
            workspace: WorkspaceConfig::default(),
            tools: ToolsConfig::default(),
            policy: PolicyConfig::default(),
            llm: LlmConfig::default(),
            storage: StorageConfig::default(),
            log_level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Orchestrator limits and retry behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Deepest allowed delegation chain (root is depth 0).
    pub max_delegation_depth: u32,
    /// Retries after a collaborator timeout or transport error.
    pub max_collaborator_retries: u32,
    /// First backoff delay; doubled on each retry.
    pub retry_backoff_ms: u64,
    /// Per-call collaborator timeout.
    pub collaborator_timeout_secs: u64,
    /// Collaborator calls allowed in one run before the session fails.
    pub max_steps_per_run: u32,
    /// Capacity of the bounded channel feeding a turn stream.
    pub stream_capacity: usize,
    /// Sub-sessions of one fan-out allowed to run at the same time.
    pub max_parallel_delegations: usize,
}

impl OrchestratorConfig {
    pub const fn collaborator_timeout(&self) -> Duration {
        Duration::from_secs(self.collaborator_timeout_secs)
    }

    pub const fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_delegation_depth: 3,
            max_collaborator_retries: 2,
            retry_backoff_ms: 500,
            collaborator_timeout_secs: 120,
            max_steps_per_run: 64,
            stream_capacity: 32,
            max_parallel_delegations: 4,
        }
    }
}

/// Workspace settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkspaceConfig {
    /// Workspace root; the current directory when unset.
    pub root: Option<PathBuf>,
    /// Sessions started in trusted mode run destructive tools without confirmation.
    pub trusted_mode: bool,
}

/// Built-in tool limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    pub shell_default_timeout_secs: u64,
    pub shell_max_timeout_secs: u64,
    /// Largest file `read_file` will return.
    pub max_read_bytes: u64,
    /// Cap on matches reported by `grep`.
    pub max_grep_matches: usize,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            shell_default_timeout_secs: 30,
            shell_max_timeout_secs: 300,
            max_read_bytes: 1024 * 1024, // 1 MB
            max_grep_matches: 200,
        }
    }
}

/// Safety policy configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    pub rules: Vec<PolicyRule>,
}

/// LLM backend settings for the OpenAI-compatible collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub model: String,
    pub base_url: String,
    pub api_key: Option<String>,
    pub temperature: f32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4o".to_string(),
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: None,
            temperature: 0.0,
        }
    }
}

/// Session storage settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// `SQLite` database file; `database_path()` when unset.
    pub database_path: Option<PathBuf>,
}

impl StorageConfig {
    /// Resolved database path.
    pub fn resolved_path(&self) -> Option<PathBuf> {
        self.database_path.clone().or_else(database_path)
    }
}

/// Configuration source priority (lowest to highest).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConfigSource {
    Default = 0,
    Global = 1,
    Project = 2,
    Environment = 3,
    Cli = 4,
}

/// Load configuration with hierarchical resolution.
pub fn load_config(project_dir: Option<&Path>) -> Result<Config> {
    let mut config = Config::default();

    if let Some(global_path) = global_config_path()
        && global_path.exists()
    {
        let global = load_config_file(&global_path)?;
        merge_config(&mut config, global);
    }

    if let Some(dir) = project_dir {
        let project_path = project_config_path(dir);
        if project_path.exists() {
            let mut project = load_config_file(&project_path)?;
            for rule in &mut project.policy.rules {
                rule.source = crate::policy::RuleSource::Project;
            }
            merge_config(&mut config, project);
        }
    }

    apply_env_overrides(&mut config, |key| std::env::var(key).ok());

    Ok(config)
}

/// Project config location inside a workspace.
pub fn project_config_path(workspace: &Path) -> PathBuf {
    workspace.join(".codeagent").join("settings.json")
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("codeagent").join("settings.json"))
}

/// Default session database path (`~/.codeagent/sessions.db`).
pub fn database_path() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".codeagent").join("sessions.db"))
}

fn load_config_file(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

fn merge_config(base: &mut Config, overlay: Config) {
    base.orchestrator = overlay.orchestrator;
    base.tools = overlay.tools;
    base.llm.model = overlay.llm.model;
    base.llm.base_url = overlay.llm.base_url;
    base.llm.temperature = overlay.llm.temperature;
    if overlay.llm.api_key.is_some() {
        base.llm.api_key = overlay.llm.api_key;
    }

    if overlay.workspace.root.is_some() {
        base.workspace.root = overlay.workspace.root;
    }
    base.workspace.trusted_mode = overlay.workspace.trusted_mode;

    if overlay.storage.database_path.is_some() {
        base.storage.database_path = overlay.storage.database_path;
    }
    base.log_level = overlay.log_level;

    // Rules accumulate; priority decides between global and project rules.
    base.policy.rules.extend(overlay.policy.rules);
}

fn apply_env_overrides(config: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(n) = var("CODEAGENT_MAX_DELEGATION_DEPTH").and_then(|v| v.parse().ok()) {
        config.orchestrator.max_delegation_depth = n;
    }
    if let Some(n) = var("CODEAGENT_MAX_STEPS").and_then(|v| v.parse().ok()) {
        config.orchestrator.max_steps_per_run = n;
    }
    if let Some(n) = var("CODEAGENT_COLLABORATOR_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
        config.orchestrator.collaborator_timeout_secs = n;
    }
    if let Some(val) = var("CODEAGENT_TRUSTED") {
        config.workspace.trusted_mode = matches!(val.as_str(), "1" | "true" | "yes");
    }
    if let Some(val) = var("CODEAGENT_WORKSPACE") {
        config.workspace.root = Some(PathBuf::from(val));
    }
    if let Some(val) = var("CODEAGENT_DATABASE") {
        config.storage.database_path = Some(PathBuf::from(val));
    }
    if let Some(val) = var("CODEAGENT_LOG_LEVEL") {
        config.log_level = val;
    }
    if let Some(val) = var("MODEL_NAME") {
        config.llm.model = val;
    }
    if let Some(val) = var("OPENAI_API_KEY") {
        config.llm.api_key = Some(val);
    }
    if let Some(val) = var("OPENAI_API_BASE") {
        config.llm.base_url = val;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::policy::{PolicyAction, RuleSource};
    use std::collections::HashMap;

    #[test]
    fn default_delegation_depth_is_three() {
        let config = Config::default();
        assert_eq!(config.orchestrator.max_delegation_depth, 3);
    }

    #[test]
    fn default_shell_timeouts() {
        let config = Config::default();
        assert_eq!(config.tools.shell_default_timeout_secs, 30);
        assert_eq!(config.tools.shell_max_timeout_secs, 300);
    }

    #[test]
    fn partial_file_keeps_section_defaults() {
        let config: Config =
            serde_json::from_str(r#"{"orchestrator":{"max_delegation_depth":5}}"#).unwrap();
        assert_eq!(config.orchestrator.max_delegation_depth, 5);
        assert_eq!(config.orchestrator.stream_capacity, 32);
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn env_overrides_apply() {
        let env: HashMap<&str, &str> = [
            ("MODEL_NAME", "local-model"),
            ("OPENAI_API_BASE", "http://localhost:8000/v1"),
            ("CODEAGENT_TRUSTED", "true"),
            ("CODEAGENT_MAX_DELEGATION_DEPTH", "not-a-number"),
        ]
        .into_iter()
        .collect();
        let mut config = Config::default();
        apply_env_overrides(&mut config, |k| env.get(k).map(ToString::to_string));

        assert_eq!(config.llm.model, "local-model");
        assert_eq!(config.llm.base_url, "http://localhost:8000/v1");
        assert!(config.workspace.trusted_mode);
        assert_eq!(config.orchestrator.max_delegation_depth, 3);
    }

    #[test]
    fn project_config_rules_are_tagged() {
        let dir = tempfile::tempdir().unwrap();
        let path = project_config_path(dir.path());
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(
            &path,
            r#"{"policy":{"rules":[{"id":"no-shell","tool_pattern":"run_shell","action":"deny"}]}}"#,
        )
        .unwrap();

        let config = load_config(Some(dir.path())).unwrap();
        let rule = config
            .policy
            .rules
            .iter()
            .find(|r| r.id == "no-shell")
            .expect("project rule loaded");
        assert_eq!(rule.action, PolicyAction::Deny);
        assert_eq!(rule.source, RuleSource::Project);
    }

    #[test]
    fn invalid_project_config_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = project_config_path(dir.path());
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "{not json").unwrap();

        let err = load_config(Some(dir.path())).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
