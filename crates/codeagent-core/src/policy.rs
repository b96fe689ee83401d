//! Safety policy rules.
//!
//! Rules override the safety gate's risk-class defaults, except that an
//! allow rule never lifts confirmation from a destructive tool. They are tried
//! in priority order and the first match decides; with no match the gate
//! falls back to the tool's risk class.
//!
//! ```json
//! {"id": "no-push", "tool_pattern": "run_shell", "command_prefix": "git push", "action": "deny"}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyRule {
    pub id: String,
    /// Exact tool name, a trailing glob (`write_*`) or `*`.
    pub tool_pattern: String,
    /// Restrict the rule to calls whose `command` argument starts with this.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_prefix: Option<String>,
    pub action: PolicyAction,
    /// Lower values are tried first.
    #[serde(default)]
    pub priority: u32,
    /// Shown to the user as the reason for the decision.
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub source: RuleSource,
}

impl PolicyRule {
    fn applies_to(&self, tool: &str, args: &Map<String, Value>) -> bool {
        let tool_matches = match self.tool_pattern.strip_suffix('*') {
            Some(prefix) => tool.starts_with(prefix),
            None => self.tool_pattern == tool,
        };
        if !tool_matches {
            return false;
        }
        match &self.command_prefix {
            None => true,
            Some(prefix) => args
                .get("command")
                .and_then(Value::as_str)
                .is_some_and(|command| command.trim_start().starts_with(prefix.as_str())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyAction {
    Allow,
    Deny,
    /// Ask on every call, even when the session holds a grant.
    Confirm,
}

/// Where a rule was configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RuleSource {
    #[default]
    Global,
    Project,
}

/// Outcome of the first matching rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyDecision {
    pub action: PolicyAction,
    pub rule_id: String,
    pub reason: Option<String>,
}

/// Ordered rule set consulted by the safety gate.
#[derive(Debug, Default, Clone)]
pub struct PolicyEngine {
    rules: Vec<PolicyRule>,
}

impl PolicyEngine {
    /// No rules: every decision falls through to risk classes.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rules(rules: Vec<PolicyRule>) -> Self {
        let mut engine = Self::new();
        engine.add_rules(rules);
        engine
    }

    /// Merge more rules. Equal priorities keep insertion order.
    pub fn add_rules(&mut self, rules: Vec<PolicyRule>) {
        self.rules.extend(rules);
        self.rules.sort_by_key(|r| r.priority);
    }

    /// First rule matching this call, if any.
    pub fn evaluate(&self, tool: &str, args: &Map<String, Value>) -> Option<PolicyDecision> {
        self.rules
            .iter()
            .find(|rule| rule.applies_to(tool, args))
            .map(|rule| PolicyDecision {
                action: rule.action,
                rule_id: rule.id.clone(),
                reason: rule.description.clone(),
            })
    }

    pub fn rules(&self) -> &[PolicyRule] {
        &self.rules
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rule(id: &str, pattern: &str, action: PolicyAction, priority: u32) -> PolicyRule {
        PolicyRule {
            id: id.to_string(),
            tool_pattern: pattern.to_string(),
            command_prefix: None,
            action,
            priority,
            description: None,
            source: RuleSource::Global,
        }
    }

    fn shell(command: &str) -> Map<String, Value> {
        json!({ "command": command }).as_object().cloned().unwrap()
    }

    #[test]
    fn tool_patterns() {
        let none = Map::new();
        assert!(rule("a", "run_shell", PolicyAction::Deny, 0).applies_to("run_shell", &none));
        assert!(!rule("a", "run_shell", PolicyAction::Deny, 0).applies_to("read_file", &none));
        assert!(rule("b", "write_*", PolicyAction::Deny, 0).applies_to("write_file", &none));
        assert!(!rule("b", "write_*", PolicyAction::Deny, 0).applies_to("edit_file", &none));
        assert!(rule("c", "*", PolicyAction::Deny, 0).applies_to("anything", &none));
    }

    #[test]
    fn empty_engine_has_no_opinion() {
        assert!(PolicyEngine::new().evaluate("run_shell", &Map::new()).is_none());
    }

    #[test]
    fn lower_priority_value_wins() {
        let engine = PolicyEngine::with_rules(vec![
            rule("all-confirm", "*", PolicyAction::Confirm, 200),
            rule("shell-deny", "run_shell", PolicyAction::Deny, 10),
        ]);
        let decision = engine.evaluate("run_shell", &shell("ls")).unwrap();
        assert_eq!(decision.action, PolicyAction::Deny);
        assert_eq!(decision.rule_id, "shell-deny");

        let decision = engine.evaluate("write_file", &Map::new()).unwrap();
        assert_eq!(decision.action, PolicyAction::Confirm);
    }

    #[test]
    fn command_prefix_narrows_shell_rules() {
        let mut tests_ok = rule("tests-ok", "run_shell", PolicyAction::Allow, 0);
        tests_ok.command_prefix = Some("cargo test".into());
        let engine = PolicyEngine::with_rules(vec![tests_ok]);

        assert_eq!(
            engine
                .evaluate("run_shell", &shell("  cargo test --all"))
                .unwrap()
                .action,
            PolicyAction::Allow
        );
        assert!(engine.evaluate("run_shell", &shell("cargo publish")).is_none());
        assert!(engine.evaluate("run_shell", &Map::new()).is_none());
    }

    #[test]
    fn add_rules_keeps_priority_order() {
        let mut engine = PolicyEngine::with_rules(vec![rule("a", "*", PolicyAction::Allow, 100)]);
        engine.add_rules(vec![rule("b", "write_*", PolicyAction::Deny, 50)]);
        assert_eq!(engine.rules()[0].id, "b");
        assert_eq!(
            engine.evaluate("write_file", &Map::new()).unwrap().action,
            PolicyAction::Deny
        );
    }

    #[test]
    fn rule_deserializes_with_defaults() {
        let rule: PolicyRule = serde_json::from_str(
            r#"{"id":"r1","tool_pattern":"run_shell","action":"confirm"}"#,
        )
        .unwrap();
        assert_eq!(rule.priority, 0);
        assert_eq!(rule.source, RuleSource::Global);
        assert_eq!(rule.action, PolicyAction::Confirm);
        assert!(rule.command_prefix.is_none());
    }
}
