//! Built-in tools and their registration.

mod fs;
mod shell;

use std::sync::Arc;

use serde_json::json;

use codeagent_core::config::ToolsConfig;
use codeagent_core::model::RiskClass;

use super::registry::{RegistryError, ToolRegistry, ToolSpec};

pub use fs::{EditFile, Grep, ListDir, ReadFile, WriteFile};
pub use shell::{RunShell, refused_pattern};

fn spec(
    name: &str,
    risk_class: RiskClass,
    description: &str,
    parameters: serde_json::Value,
    path_args: &[&str],
) -> ToolSpec {
    ToolSpec {
        name: name.to_string(),
        risk_class,
        description: description.to_string(),
        parameters,
        path_args: path_args.iter().map(ToString::to_string).collect(),
    }
}

/// Register the built-in tools in their canonical order.
pub fn register_builtins(
    registry: &mut ToolRegistry,
    config: &ToolsConfig,
) -> Result<(), RegistryError> {
    registry.register(
        spec(
            "list_dir",
            RiskClass::ReadOnly,
            "List the entries of a workspace directory.",
            json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string", "description": "Directory relative to the workspace root"}
                }
            }),
            &["path"],
        ),
        Arc::new(ListDir),
    )?;
    registry.register(
        spec(
            "read_file",
            RiskClass::ReadOnly,
            "Read a text file with line numbers.",
            json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string"},
                    "offset": {"type": "integer", "minimum": 0, "description": "Lines to skip"},
                    "limit": {"type": "integer", "minimum": 1, "description": "Lines to return"}
                },
                "required": ["path"]
            }),
            &["path"],
        ),
        Arc::new(ReadFile::new(config)),
    )?;
    registry.register(
        spec(
            "grep",
            RiskClass::ReadOnly,
            "Search workspace files for a regular expression.",
            json!({
                "type": "object",
                "properties": {
                    "pattern": {"type": "string"},
                    "path": {"type": "string", "description": "File or directory to search"}
                },
                "required": ["pattern"]
            }),
            &["path"],
        ),
        Arc::new(Grep::new(config)),
    )?;
    registry.register(
        spec(
            "write_file",
            RiskClass::Mutating,
            "Create or overwrite a file in the workspace.",
            json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string"},
                    "content": {"type": "string"}
                },
                "required": ["path", "content"]
            }),
            &["path"],
        ),
        Arc::new(WriteFile),
    )?;
    registry.register(
        spec(
            "edit_file",
            RiskClass::Mutating,
            "Replace an exact string in a file. old_string must be unique unless replace_all is set.",
            json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string"},
                    "old_string": {"type": "string"},
                    "new_string": {"type": "string"},
                    "replace_all": {"type": "boolean"}
                },
                "required": ["path", "old_string", "new_string"]
            }),
            &["path"],
        ),
        Arc::new(EditFile),
    )?;
    registry.register(
        spec(
            "run_shell",
            RiskClass::Destructive,
            "Run a shell command in the workspace root.",
            json!({
                "type": "object",
                "properties": {
                    "command": {"type": "string"},
                    "timeout": {"type": "integer", "description": "Seconds, default 30, max 300"}
                },
                "required": ["command"]
            }),
            &[],
        ),
        Arc::new(RunShell::new(config)),
    )?;
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn builtins_register_in_order_with_risk_classes() {
        let mut registry = ToolRegistry::new();
        register_builtins(&mut registry, &ToolsConfig::default()).unwrap();
        assert_eq!(
            registry.names().collect::<Vec<_>>(),
            vec!["list_dir", "read_file", "grep", "write_file", "edit_file", "run_shell"]
        );
        assert_eq!(registry.risk_class("grep"), Some(RiskClass::ReadOnly));
        assert_eq!(registry.risk_class("edit_file"), Some(RiskClass::Mutating));
        assert_eq!(registry.risk_class("run_shell"), Some(RiskClass::Destructive));
        assert!(register_builtins(&mut registry, &ToolsConfig::default()).is_err());
    }
}
