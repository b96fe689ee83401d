//! Safety gate.
//!
//! Intercepts every tool invocation. Evaluation order:
//! 1. unknown tool, or tool outside the profile's allowed set
//! 2. configured policy rules (first match by priority); an allow rule
//!    still leaves destructive tools to step 3
//! 3. the tool's risk class

use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use codeagent_core::model::{DenialKind, RiskClass, ToolCallRequest};
use codeagent_core::{PolicyAction, PolicyEngine};

use super::types::{GateContext, GateDecision};
use crate::profiles::CapabilityProfile;
use crate::tools::{ToolRegistry, ToolSpec};

/// Decides whether a tool call may run.
#[derive(Debug)]
pub struct SafetyGate {
    policy: PolicyEngine,
    tools: Arc<ToolRegistry>,
}

impl SafetyGate {
    pub const fn new(policy: PolicyEngine, tools: Arc<ToolRegistry>) -> Self {
        Self { policy, tools }
    }

    /// Authorize one request for `profile`.
    pub fn authorize(
        &self,
        profile: &CapabilityProfile,
        request: &ToolCallRequest,
        ctx: &GateContext<'_>,
    ) -> GateDecision {
        let decision = self.evaluate(profile, request, ctx);
        debug!(
            session_id = ctx.session_id,
            profile = %profile.id,
            tool = %request.tool,
            request_id = %request.id,
            decision = ?decision,
            "Gate decision"
        );
        decision
    }

    fn evaluate(
        &self,
        profile: &CapabilityProfile,
        request: &ToolCallRequest,
        ctx: &GateContext<'_>,
    ) -> GateDecision {
        let Some(spec) = self.tools.get(&request.tool) else {
            return GateDecision::deny(
                DenialKind::UnknownTool,
                format!("unknown tool: {}", request.tool),
            );
        };

        if !profile.allows(&request.tool) {
            return GateDecision::deny(
                DenialKind::PermissionDenied,
                format!("profile {} may not use {}", profile.id, request.tool),
            );
        }

        if let Some(rule) = self.policy.evaluate(&request.tool, &request.args) {
            let reason = rule
                .reason
                .unwrap_or_else(|| format!("policy rule {}", rule.rule_id));
            return match rule.action {
                PolicyAction::Deny => GateDecision::deny(DenialKind::PermissionDenied, reason),
                // Rules never loosen a destructive tool.
                PolicyAction::Allow => Self::by_risk_class(spec, request, ctx),
                PolicyAction::Confirm => match Self::check_paths(spec, request, ctx) {
                    GateDecision::Allow if !ctx.grants.contains(&request.tool) => {
                        GateDecision::RequireConfirmation { reason }
                    }
                    other => other,
                },
            };
        }

        Self::by_risk_class(spec, request, ctx)
    }

    fn by_risk_class(spec: &ToolSpec, request: &ToolCallRequest, ctx: &GateContext<'_>) -> GateDecision {
        let granted = ctx.trusted || ctx.grants.contains(&request.tool);
        match spec.risk_class {
            RiskClass::ReadOnly => GateDecision::Allow,
            RiskClass::Mutating => Self::check_paths(spec, request, ctx),
            RiskClass::Destructive => match Self::check_paths(spec, request, ctx) {
                GateDecision::Allow if !granted => GateDecision::RequireConfirmation {
                    reason: format!("{} is destructive and needs confirmation", request.tool),
                },
                other => other,
            },
        }
    }

    /// Every declared path argument of a mutating or destructive tool must
    /// resolve inside the workspace.
    fn check_paths(spec: &ToolSpec, request: &ToolCallRequest, ctx: &GateContext<'_>) -> GateDecision {
        if spec.risk_class == RiskClass::ReadOnly {
            return GateDecision::Allow;
        }
        for name in &spec.path_args {
            let Some(Value::String(path)) = request.args.get(name) else {
                continue;
            };
            if !ctx.workspace.contains(path) {
                return GateDecision::deny(
                    DenialKind::PathEscapesWorkspace,
                    format!("{path} is outside the workspace"),
                );
            }
        }
        GateDecision::Allow
    }
}
