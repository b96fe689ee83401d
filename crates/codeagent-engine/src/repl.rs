//! Line-oriented rendering and prompts for the interactive binary.

use std::fmt::Write as _;

use codeagent_core::model::{Author, PendingApproval, Turn, TurnContent};

use crate::orchestration::Confirmation;

/// Longest tool output echoed to the terminal.
const MAX_OUTPUT_CHARS: usize = 2000;

fn author_label(author: Author) -> String {
    match author {
        Author::User => "user".to_string(),
        Author::System => "system".to_string(),
        Author::Profile(profile) => profile.to_string(),
    }
}

fn truncate(text: &str) -> String {
    if text.chars().count() <= MAX_OUTPUT_CHARS {
        return text.to_string();
    }
    let mut cut: String = text.chars().take(MAX_OUTPUT_CHARS).collect();
    cut.push_str("\n... (truncated)");
    cut
}

/// Render a committed turn for the terminal. `None` hides it.
///
/// Sub-session turns are indented under their thread so nested
/// delegations read as an outline.
pub fn render_turn(turn: &Turn, root_thread_id: &str) -> Option<String> {
    let who = author_label(turn.author);
    let body = match &turn.content {
        TurnContent::SessionOpened { .. } => return None,
        TurnContent::Message { .. } if turn.author == Author::User => return None,
        TurnContent::Message { text } => format!("[{who}] {text}"),
        TurnContent::ToolCalls { text, requests } => {
            let mut out = String::new();
            if let Some(text) = text.as_deref().filter(|t| !t.trim().is_empty()) {
                let _ = writeln!(out, "[{who}] {text}");
            }
            for request in requests {
                let args = serde_json::Value::Object(request.args.clone());
                let _ = writeln!(out, "[{who}] -> {}({args})", request.tool);
            }
            out.trim_end().to_string()
        }
        TurnContent::ToolResult { result } => match &result.error {
            Some(error) => format!("[tool error] {error}"),
            None => format!("[tool] {}", truncate(&result.output)),
        },
        TurnContent::Denied { denial } => {
            format!("[denied: {}] {}", denial.kind, denial.reason)
        }
        TurnContent::ConfirmationRequested {
            tool,
            risk_class,
            reason,
            ..
        } => format!("[confirm {risk_class} {tool}] {reason}"),
        TurnContent::Approved {
            remember_for_session,
            ..
        } => {
            if *remember_for_session {
                "[approved for this session]".to_string()
            } else {
                "[approved]".to_string()
            }
        }
        TurnContent::Delegated { delegations } => {
            let targets: Vec<String> = delegations
                .iter()
                .map(|d| format!("{}: {}", d.target, d.sub_task))
                .collect();
            format!("[{who}] delegating\n  {}", targets.join("\n  "))
        }
        TurnContent::DelegationResult { text, .. } => format!("[{who} result] {text}"),
        TurnContent::FinalAnswer { text } => format!("[{who}] {text}"),
        TurnContent::Notice { text } => format!("[notice] {text}"),
        TurnContent::Failed { kind, message } => format!("[failed: {kind}] {message}"),
    };

    if turn.thread_id == root_thread_id {
        Some(body)
    } else {
        Some(
            body.lines()
                .map(|line| format!("    {line}"))
                .collect::<Vec<_>>()
                .join("\n"),
        )
    }
}

/// Question shown for a pending approval.
pub fn approval_prompt(pending: &PendingApproval) -> String {
    format!(
        "Allow {}? {} [y]es / [n]o / [a]lways this session: ",
        pending.tool, pending.reason
    )
}

/// Interpret an answer to [`approval_prompt`]. `None` means ask again.
pub fn parse_approval(pending: &PendingApproval, answer: &str) -> Option<Confirmation> {
    let id = pending.request_id.clone();
    match answer.trim().to_ascii_lowercase().as_str() {
        "y" | "yes" => Some(Confirmation::approve(id)),
        "n" | "no" => Some(Confirmation::reject(id)),
        "a" | "always" => Some(Confirmation {
            request_id: id,
            approved: true,
            remember_for_session: true,
        }),
        _ => None,
    }
}
