//! OpenAI-compatible `/chat/completions` collaborator.
//!
//! Tools are sent as function definitions; delegation is exposed as one
//! extra `delegate_task` function. Delegation ids double as tool call ids
//! so results can be threaded back to the model.

use std::fmt::Write as _;

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::{debug, warn};

use codeagent_core::config::LlmConfig;
use codeagent_core::model::{Author, ProfileId, TurnContent};

use super::{
    Collaborator, CollaboratorError, Completion, CompletionRequest, DelegationTask, ToolCallDraft,
};

/// Name of the function that requests delegation.
pub const DELEGATE_FUNCTION: &str = "delegate_task";

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<Value>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<Value>,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: AssistantMessage,
}

#[derive(Debug, Deserialize)]
struct AssistantMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<FunctionCall>>,
}

#[derive(Debug, Deserialize)]
struct FunctionCall {
    function: FunctionBody,
}

#[derive(Debug, Deserialize)]
struct FunctionBody {
    name: String,
    #[serde(default)]
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct DelegateArgs {
    target: String,
    sub_task: String,
    #[serde(default)]
    paths: Vec<String>,
}

/// Collaborator backed by an OpenAI-compatible HTTP API.
#[derive(Debug)]
pub struct OpenAiCollaborator {
    http: reqwest::Client,
    base_url: String,
    model: String,
    temperature: f32,
}

impl OpenAiCollaborator {
    pub fn new(config: &LlmConfig) -> Result<Self, CollaboratorError> {
        if config.base_url.is_empty() {
            return Err(CollaboratorError::Transport("base_url is empty".into()));
        }

        let mut headers = HeaderMap::new();
        if let Some(key) = config.api_key.as_deref().filter(|k| !k.is_empty()) {
            let value = HeaderValue::from_str(&format!("Bearer {key}"))
                .map_err(|_| CollaboratorError::Transport("Invalid API key format".into()))?;
            headers.insert(AUTHORIZATION, value);
        }

        // reqwest is built with rustls-no-provider; an Err means one is already installed.
        let _ = rustls::crypto::ring::default_provider().install_default();

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .build()
            .map_err(|e| CollaboratorError::Transport(e.to_string()))?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            temperature: config.temperature,
        })
    }

    fn url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }
}

#[async_trait]
impl Collaborator for OpenAiCollaborator {
    async fn complete(&self, request: CompletionRequest) -> Result<Completion, CollaboratorError> {
        let body = ChatRequest {
            model: &self.model,
            messages: build_messages(&request),
            tools: build_tools(&request),
            temperature: self.temperature,
        };
        debug!(profile = %request.profile, model = %self.model, messages = body.messages.len(), "Calling collaborator");

        let resp = self
            .http
            .post(self.url())
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    CollaboratorError::Timeout
                } else {
                    CollaboratorError::Transport(e.to_string())
                }
            })?;

        let status = resp.status();
        if !status.is_success() {
            let detail = resp.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), "Collaborator returned an error status");
            return Err(CollaboratorError::Transport(format!(
                "HTTP {}: {}",
                status.as_u16(),
                detail.chars().take(500).collect::<String>()
            )));
        }

        let text = resp
            .text()
            .await
            .map_err(|e| CollaboratorError::Transport(e.to_string()))?;
        let parsed: ChatResponse = serde_json::from_str(&text)
            .map_err(|e| CollaboratorError::Malformed(format!("invalid response body: {e}")))?;
        classify(parsed)
    }
}

fn system_prompt(request: &CompletionRequest) -> String {
    let mut prompt = format!(
        "You are the {} profile of a coding agent. {}\n\n{}",
        request.profile, request.description, request.contract
    );
    if !request.delegates.is_empty() {
        let names: Vec<&str> = request.delegates.iter().map(ProfileId::as_str).collect();
        let _ = write!(
            prompt,
            "\n\nYou may hand sub-tasks to these specialists with {DELEGATE_FUNCTION}: {}. \
             List the files each sub-task will modify in `paths`.",
            names.join(", ")
        );
    }
    if let Some(corrective) = &request.corrective {
        prompt.push_str("\n\nCorrection: ");
        prompt.push_str(corrective);
    }
    prompt
}

fn call_message(id: &str, name: &str, args: &Value) -> Value {
    json!({
        "id": id,
        "type": "function",
        "function": {"name": name, "arguments": args.to_string()},
    })
}

/// Translate a thread transcript into chat messages.
fn build_messages(request: &CompletionRequest) -> Vec<Value> {
    let mut messages = vec![json!({"role": "system", "content": system_prompt(request)})];

    for turn in &request.transcript {
        match &turn.content {
            TurnContent::Message { text } => {
                let content = match turn.author {
                    Author::Profile(from) => format!("Task from {from}: {text}"),
                    Author::User | Author::System => text.clone(),
                };
                messages.push(json!({"role": "user", "content": content}));
            }
            TurnContent::ToolCalls { text, requests } => {
                let calls: Vec<Value> = requests
                    .iter()
                    .map(|r| call_message(&r.id, &r.tool, &Value::Object(r.args.clone())))
                    .collect();
                messages.push(json!({"role": "assistant", "content": text, "tool_calls": calls}));
            }
            TurnContent::ToolResult { result } => {
                let content = match &result.error {
                    Some(error) if !result.success => format!("Error: {error}"),
                    _ => result.output.clone(),
                };
                messages.push(json!({"role": "tool", "tool_call_id": result.request_id, "content": content}));
            }
            TurnContent::Denied { denial } => {
                messages.push(json!({
                    "role": "tool",
                    "tool_call_id": denial.request_id,
                    "content": format!("Denied ({}): {}", denial.kind, denial.reason),
                }));
            }
            TurnContent::Delegated { delegations } => {
                let calls: Vec<Value> = delegations
                    .iter()
                    .map(|d| {
                        call_message(
                            &d.delegation_id,
                            DELEGATE_FUNCTION,
                            &json!({"target": d.target, "sub_task": d.sub_task, "paths": d.paths}),
                        )
                    })
                    .collect();
                messages.push(json!({"role": "assistant", "content": null, "tool_calls": calls}));
            }
            TurnContent::DelegationResult {
                delegation_id,
                text,
            } => {
                messages.push(json!({"role": "tool", "tool_call_id": delegation_id, "content": text}));
            }
            TurnContent::FinalAnswer { text } => {
                messages.push(json!({"role": "assistant", "content": text}));
            }
            TurnContent::Notice { text } => {
                messages.push(json!({"role": "user", "content": format!("[system notice] {text}")}));
            }
            TurnContent::SessionOpened { .. }
            | TurnContent::ConfirmationRequested { .. }
            | TurnContent::Approved { .. }
            | TurnContent::Failed { .. } => {}
        }
    }
    messages
}

fn build_tools(request: &CompletionRequest) -> Vec<Value> {
    let mut tools: Vec<Value> = request
        .tools
        .iter()
        .map(|spec| {
            json!({
                "type": "function",
                "function": {
                    "name": spec.name,
                    "description": spec.description,
                    "parameters": spec.parameters,
                },
            })
        })
        .collect();

    if !request.delegates.is_empty() {
        let targets: Vec<&str> = request.delegates.iter().map(ProfileId::as_str).collect();
        tools.push(json!({
            "type": "function",
            "function": {
                "name": DELEGATE_FUNCTION,
                "description": "Hand a sub-task to a specialist profile and wait for its answer.",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "target": {"type": "string", "enum": targets},
                        "sub_task": {"type": "string"},
                        "paths": {"type": "array", "items": {"type": "string"}},
                    },
                    "required": ["target", "sub_task"],
                },
            },
        }));
    }
    tools
}

fn parse_arguments(raw: &str) -> Result<Map<String, Value>, CollaboratorError> {
    if raw.trim().is_empty() {
        return Ok(Map::new());
    }
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(CollaboratorError::Malformed(
            "tool arguments are not a JSON object".into(),
        )),
        Err(e) => Err(CollaboratorError::Malformed(format!(
            "tool arguments are not valid JSON: {e}"
        ))),
    }
}

/// Classify an assistant message as answer, tool calls or delegation.
fn classify(response: ChatResponse) -> Result<Completion, CollaboratorError> {
    let message = response
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| CollaboratorError::Malformed("response has no choices".into()))?
        .message;

    let tool_calls = message.tool_calls.unwrap_or_default();
    if tool_calls.is_empty() {
        let text = message.content.unwrap_or_default();
        if text.trim().is_empty() {
            return Err(CollaboratorError::Malformed("empty reply".into()));
        }
        return Ok(Completion::FinalAnswer { text });
    }

    let (delegations, calls): (Vec<_>, Vec<_>) = tool_calls
        .into_iter()
        .partition(|c| c.function.name == DELEGATE_FUNCTION);

    if !delegations.is_empty() {
        if !calls.is_empty() {
            warn!(dropped = calls.len(), "Dropping tool calls issued alongside a delegation");
        }
        let tasks = delegations
            .into_iter()
            .map(|call| -> Result<DelegationTask, CollaboratorError> {
                let args: DelegateArgs = serde_json::from_value(Value::Object(parse_arguments(
                    &call.function.arguments,
                )?))
                .map_err(|e| CollaboratorError::Malformed(format!("bad delegation: {e}")))?;
                let target = args.target.parse::<ProfileId>().map_err(|_| {
                    CollaboratorError::Malformed(format!("unknown profile: {}", args.target))
                })?;
                Ok(DelegationTask {
                    target,
                    sub_task: args.sub_task,
                    paths: args.paths,
                })
            })
            .collect::<Result<Vec<_>, CollaboratorError>>()?;
        return Completion::Delegation { tasks }.validate();
    }

    let calls = calls
        .into_iter()
        .map(|call| -> Result<ToolCallDraft, CollaboratorError> {
            Ok(ToolCallDraft {
                args: parse_arguments(&call.function.arguments)?,
                tool: call.function.name,
            })
        })
        .collect::<Result<Vec<_>, CollaboratorError>>()?;
    Completion::ToolCalls {
        text: message.content.filter(|t| !t.trim().is_empty()),
        calls,
    }
    .validate()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use codeagent_core::model::{
        Denial, DenialKind, DelegationSpec, ToolCallRequest, ToolCallResult, Turn,
    };

    fn response(value: Value) -> ChatResponse {
        serde_json::from_value(value).unwrap()
    }

    fn request(transcript: Vec<TurnContent>, delegates: Vec<ProfileId>) -> CompletionRequest {
        CompletionRequest {
            profile: ProfileId::Root,
            description: "Generalist.".into(),
            contract: "Be helpful.".into(),
            transcript: (1..)
                .zip(transcript)
                .map(|(seq, content)| Turn {
                    seq,
                    thread_id: "s".into(),
                    author: Author::Profile(ProfileId::Root),
                    content,
                    created_at: seq,
                })
                .collect(),
            tools: Vec::new(),
            delegates,
            corrective: None,
        }
    }

    #[test]
    fn plain_content_is_a_final_answer() {
        let completion = classify(response(json!({
            "choices": [{"message": {"role": "assistant", "content": "All done."}}]
        })))
        .unwrap();
        assert_eq!(completion, Completion::FinalAnswer { text: "All done.".into() });
    }

    #[test]
    fn function_calls_become_tool_calls() {
        let completion = classify(response(json!({
            "choices": [{"message": {"content": "", "tool_calls": [
                {"id": "c1", "type": "function", "function": {"name": "read_file", "arguments": "{\"path\":\"a.rs\"}"}}
            ]}}]
        })))
        .unwrap();
        let Completion::ToolCalls { text, calls } = completion else {
            panic!("expected tool calls");
        };
        assert_eq!(text, None);
        assert_eq!(calls[0].tool, "read_file");
        assert_eq!(calls[0].args["path"], "a.rs");
    }

    #[test]
    fn delegate_function_becomes_delegation() {
        let completion = classify(response(json!({
            "choices": [{"message": {"tool_calls": [
                {"id": "c1", "type": "function", "function": {"name": "delegate_task",
                  "arguments": "{\"target\":\"test_writer\",\"sub_task\":\"write tests\",\"paths\":[\"tests/\"]}"}},
                {"id": "c2", "type": "function", "function": {"name": "read_file", "arguments": "{}"}}
            ]}}]
        })))
        .unwrap();
        assert_eq!(
            completion,
            Completion::Delegation {
                tasks: vec![DelegationTask {
                    target: ProfileId::TestWriter,
                    sub_task: "write tests".into(),
                    paths: vec!["tests/".into()],
                }]
            }
        );
    }

    #[test]
    fn bad_replies_are_malformed() {
        for body in [
            json!({"choices": []}),
            json!({"choices": [{"message": {"content": "  "}}]}),
            json!({"choices": [{"message": {"tool_calls": [
                {"function": {"name": "read_file", "arguments": "not json"}}
            ]}}]}),
            json!({"choices": [{"message": {"tool_calls": [
                {"function": {"name": "delegate_task", "arguments": "{\"target\":\"planner\",\"sub_task\":\"x\"}"}}
            ]}}]}),
        ] {
            assert!(matches!(
                classify(response(body)),
                Err(CollaboratorError::Malformed(_))
            ));
        }
    }

    #[test]
    fn transcript_threads_tool_results_to_calls() {
        let req = request(
            vec![
                TurnContent::Message { text: "fix it".into() },
                TurnContent::ToolCalls {
                    text: None,
                    requests: vec![ToolCallRequest {
                        id: "r1".into(),
                        profile: ProfileId::Root,
                        tool: "run_shell".into(),
                        args: Map::new(),
                    }],
                },
                TurnContent::Denied {
                    denial: Denial {
                        request_id: "r1".into(),
                        kind: DenialKind::PermissionDenied,
                        reason: "rejected".into(),
                    },
                },
                TurnContent::Delegated {
                    delegations: vec![DelegationSpec {
                        delegation_id: "d1".into(),
                        target: ProfileId::Debugger,
                        sub_task: "debug".into(),
                        paths: Vec::new(),
                    }],
                },
                TurnContent::DelegationResult {
                    delegation_id: "d1".into(),
                    text: "found it".into(),
                },
                TurnContent::ToolResult {
                    result: ToolCallResult {
                        request_id: "r2".into(),
                        success: false,
                        output: String::new(),
                        error: Some("boom".into()),
                        files_touched: Vec::new(),
                    },
                },
            ],
            vec![ProfileId::Debugger],
        );
        let messages = build_messages(&req);
        assert_eq!(messages[0]["role"], "system");
        assert!(messages[0]["content"].as_str().unwrap().contains("debugger"));
        assert_eq!(messages[1]["content"], "Task from root: fix it");
        assert_eq!(messages[2]["tool_calls"][0]["id"], "r1");
        assert_eq!(messages[3]["tool_call_id"], "r1");
        assert_eq!(messages[3]["content"], "Denied (permission_denied): rejected");
        assert_eq!(messages[4]["tool_calls"][0]["function"]["name"], DELEGATE_FUNCTION);
        assert_eq!(messages[5]["tool_call_id"], "d1");
        assert_eq!(messages[6]["content"], "Error: boom");

        let tools = build_tools(&req);
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0]["function"]["parameters"]["properties"]["target"]["enum"][0], "debugger");
    }

    #[test]
    fn missing_base_url_is_rejected() {
        let config = LlmConfig {
            base_url: String::new(),
            ..LlmConfig::default()
        };
        assert!(OpenAiCollaborator::new(&config).is_err());
    }
}
