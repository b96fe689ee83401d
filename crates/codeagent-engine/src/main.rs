//! `codeagent`
//!
//! Interactive coding agent. Reads requests line by line, drives the
//! orchestrator and prints committed turns as they arrive.

#![allow(clippy::print_stdout, clippy::print_stderr)]

use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser;
use futures::StreamExt;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tracing::info;

use codeagent_core::PolicyEngine;
use codeagent_core::config::{Config, load_config};
use codeagent_engine::collaborator::OpenAiCollaborator;
use codeagent_engine::controller::{SessionController, StartOptions};
use codeagent_engine::orchestration::{Confirmation, Orchestrator};
use codeagent_engine::profiles::ProfileRegistry;
use codeagent_engine::repl::{approval_prompt, parse_approval, render_turn};
use codeagent_engine::safety::SafetyGate;
use codeagent_engine::session::SessionStore;
use codeagent_engine::storage::Database;
use codeagent_engine::tools::{ToolRegistry, register_builtins};

#[derive(Parser, Debug)]
#[command(name = "codeagent")]
#[command(version, about = "Coding agent with specialised subagents")]
struct Args {
    /// Workspace root (created if missing)
    #[arg(short, long, env = "CODEAGENT_WORKSPACE")]
    workspace: Option<PathBuf>,

    /// Run destructive tools without asking
    #[arg(long)]
    trusted: bool,

    /// Session to continue
    #[arg(short, long)]
    session: Option<String>,

    /// Single request to run non-interactively
    #[arg(short, long)]
    prompt: Option<String>,

    /// Session database file
    #[arg(long, env = "CODEAGENT_DATABASE")]
    db_path: Option<PathBuf>,

    /// Model name
    #[arg(long, env = "MODEL_NAME")]
    model: Option<String>,

    /// OpenAI-compatible API base URL
    #[arg(long, env = "OPENAI_API_BASE")]
    base_url: Option<String>,

    /// Deepest delegation chain
    #[arg(long)]
    max_delegation_depth: Option<u32>,

    /// Log level filter (e.g. "info", "debug")
    #[arg(long, env = "CODEAGENT_LOG_LEVEL")]
    log_level: Option<String>,

    /// Output logs as JSON
    #[arg(long, env = "CODEAGENT_LOG_JSON")]
    log_json: bool,

    /// List stored sessions and exit
    #[arg(long)]
    list: bool,
}

impl Args {
    /// CLI flags take precedence over every config file and environment.
    fn apply(&self, config: &mut Config) {
        if let Some(workspace) = &self.workspace {
            config.workspace.root = Some(workspace.clone());
        }
        if self.trusted {
            config.workspace.trusted_mode = true;
        }
        if let Some(path) = &self.db_path {
            config.storage.database_path = Some(path.clone());
        }
        if let Some(model) = &self.model {
            config.llm.model.clone_from(model);
        }
        if let Some(url) = &self.base_url {
            config.llm.base_url.clone_from(url);
        }
        if let Some(depth) = self.max_delegation_depth {
            config.orchestrator.max_delegation_depth = depth;
        }
        if let Some(level) = &self.log_level {
            config.log_level.clone_from(level);
        }
    }
}

type Input = Lines<BufReader<Stdin>>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let cwd = std::env::current_dir().context("cannot read current directory")?;
    let project_dir = args.workspace.clone().unwrap_or(cwd);
    let mut config = load_config(Some(&project_dir))?;
    args.apply(&mut config);

    codeagent_core::tracing_init::init_tracing(
        &format!("codeagent_engine={}", config.log_level),
        args.log_json,
    );

    let workspace_root = config.workspace.root.clone().unwrap_or(project_dir);
    let db_path = config
        .storage
        .resolved_path()
        .context("cannot determine the session database path")?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        workspace = %workspace_root.display(),
        db = %db_path.display(),
        model = %config.llm.model,
        "Starting codeagent"
    );

    let store = SessionStore::new(Database::open(&db_path).await?);

    if args.list {
        for summary in store.list(false, 50).await? {
            println!(
                "{}  {:<18} {}",
                summary.id,
                summary.status,
                summary.workspace_root.display()
            );
        }
        return Ok(());
    }

    let mut tools = ToolRegistry::new();
    register_builtins(&mut tools, &config.tools)?;
    let tools = Arc::new(tools);
    let profiles = Arc::new(ProfileRegistry::new(&tools));
    let gate = Arc::new(SafetyGate::new(
        PolicyEngine::with_rules(config.policy.rules.clone()),
        Arc::clone(&tools),
    ));
    let collaborator = Arc::new(OpenAiCollaborator::new(&config.llm)?);
    let controller = SessionController::new(Orchestrator::new(
        config.orchestrator.clone(),
        store,
        tools,
        profiles,
        gate,
        collaborator,
    ));

    let options = StartOptions {
        workspace_root,
        trusted: config.workspace.trusted_mode,
    };
    let mut input = BufReader::new(tokio::io::stdin()).lines();
    let mut session_id = args.session.clone();

    if let Some(prompt) = &args.prompt {
        let id = submit(&controller, session_id.as_deref(), prompt, &options).await?;
        drive(&controller, &id, &mut input).await?;
        println!("session: {id}");
        return Ok(());
    }

    if let Some(id) = &session_id {
        println!("Continuing session {id}");
        let status = controller.load(id).await?.status;
        if !status.is_terminal() {
            drive(&controller, id, &mut input).await?;
        }
    }

    loop {
        print!("> ");
        std::io::stdout().flush()?;
        let Some(line) = input.next_line().await? else {
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if matches!(line, "exit" | "quit") {
            break;
        }

        let id = match submit(&controller, session_id.as_deref(), line, &options).await {
            Ok(id) => id,
            Err(e) => {
                eprintln!("error: {e}");
                continue;
            }
        };
        drive(&controller, &id, &mut input).await?;
        session_id = Some(id);
    }

    if let Some(id) = session_id {
        println!("session: {id}");
    }
    Ok(())
}

/// Start a new session or add the request to an existing one.
async fn submit(
    controller: &SessionController,
    session_id: Option<&str>,
    text: &str,
    options: &StartOptions,
) -> anyhow::Result<String> {
    match session_id {
        Some(id) => {
            controller.post_message(id, text).await?;
            Ok(id.to_string())
        }
        None => Ok(controller.start(text, options.clone()).await?),
    }
}

/// Run a session until it stops, asking for approvals along the way.
async fn drive(
    controller: &SessionController,
    session_id: &str,
    input: &mut Input,
) -> anyhow::Result<()> {
    let mut confirmation: Option<Confirmation> = None;
    loop {
        let mut stream = controller.resume(session_id, confirmation.take()).await?;
        loop {
            tokio::select! {
                item = stream.next() => match item {
                    Some(Ok(turn)) => {
                        if let Some(text) = render_turn(&turn, session_id) {
                            println!("{text}");
                        }
                    }
                    Some(Err(e)) => eprintln!("error: {e}"),
                    None => break,
                },
                _ = tokio::signal::ctrl_c() => {
                    eprintln!("cancelling...");
                    controller.cancel(session_id).await?;
                }
            }
        }

        let Some(pending) = controller
            .pending_approvals(session_id)
            .await?
            .into_iter()
            .next()
        else {
            return Ok(());
        };

        confirmation = loop {
            print!("{}", approval_prompt(&pending));
            std::io::stdout().flush()?;
            let Some(answer) = input.next_line().await? else {
                return Ok(());
            };
            if let Some(c) = parse_approval(&pending, &answer) {
                break Some(c);
            }
        };
    }
}
