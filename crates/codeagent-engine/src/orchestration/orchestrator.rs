//! The orchestrator: drives a session's threads to a final answer.
//!
//! A run replays the session transcript to find where each thread stands,
//! then alternates between planning (collaborator calls), tool dispatch
//! through the safety gate, and delegation to sub-sessions. Every turn is
//! committed to the store before the run moves on and before it is handed
//! to the caller's stream.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use futures::future::{BoxFuture, FutureExt, join_all};
use tokio::sync::{Mutex, mpsc, watch};
use tracing::{debug, info, warn};

use codeagent_core::Workspace;
use codeagent_core::config::OrchestratorConfig;
use codeagent_core::model::{
    Author, DelegationRecord, DelegationSpec, DelegationStatus, Denial, DenialKind, FailureKind,
    NewTurn, ProfileId, RiskClass, Session, ToolCallRequest, ToolCallResult, Turn, TurnContent,
};

use super::fanout::{self, DelegationPool, FinishedChild};
use super::phase::{Phase, PhaseTracker};
use super::replay::{NextAction, next_action};
use super::retry::RetryPolicy;
use crate::collaborator::{
    Collaborator, CollaboratorError, Completion, CompletionRequest, DelegationTask, ToolCallDraft,
};
use crate::profiles::{CONTRACT_NOTICE_PREFIX, ProfileRegistry, has_contract_notice};
use crate::safety::{GateContext, GateDecision, SafetyGate};
use crate::session::{SessionStore, StoreError};
use crate::tools::{ToolContext, ToolRegistry};

/// External decision on a pending confirmation request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Confirmation {
    pub request_id: String,
    pub approved: bool,
    /// Grant the tool for the rest of the session.
    pub remember_for_session: bool,
}

impl Confirmation {
    pub fn approve(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            approved: true,
            remember_for_session: false,
        }
    }

    pub fn reject(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            approved: false,
            remember_for_session: false,
        }
    }
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The root profile gave its final answer.
    Completed,
    /// Suspended on a confirmation request.
    AwaitingApproval,
    Failed(FailureKind),
    /// The turn consumer went away; resume continues from the last commit.
    Paused,
}

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("No pending approval {request_id} in session {session_id}")]
    UnknownApproval {
        session_id: String,
        request_id: String,
    },
}

/// Why a thread stopped before its final answer.
#[derive(Debug)]
enum Halt {
    Suspended,
    Paused,
    Failed { kind: FailureKind, message: String },
    Store(StoreError),
}

impl Halt {
    fn failed(kind: FailureKind, message: impl Into<String>) -> Self {
        Self::Failed {
            kind,
            message: message.into(),
        }
    }

    fn cancelled() -> Self {
        Self::failed(FailureKind::Cancelled, "cancelled by request")
    }

    const fn severity(&self) -> u8 {
        match self {
            Self::Suspended => 0,
            Self::Paused => 1,
            Self::Failed { .. } => 2,
            Self::Store(_) => 3,
        }
    }

    /// Keep whichever of two sibling halts matters more.
    fn worst(current: Option<Self>, next: Self) -> Self {
        match current {
            Some(current) if current.severity() >= next.severity() => current,
            _ => next,
        }
    }
}

/// A thread's final answer.
#[derive(Debug, Clone)]
struct Answer {
    text: String,
    completed_at: i64,
}

/// Collaborator reply after retries.
enum Reply {
    Usable(Completion),
    Malformed(String),
}

/// State shared by every thread of one run.
struct RunCtx {
    session_id: String,
    session: Mutex<Session>,
    workspace: Workspace,
    confirmation: Option<Confirmation>,
    cancel: watch::Receiver<bool>,
    sink: mpsc::Sender<Turn>,
    steps: AtomicU32,
}

impl RunCtx {
    fn cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Resolves once cancellation is requested; never if the sender is gone.
    async fn cancellation(&self) {
        let mut cancel = self.cancel.clone();
        if cancel.wait_for(|c| *c).await.is_err() {
            std::future::pending::<()>().await;
        }
    }

    fn confirmation_for(&self, request_id: &str) -> Option<&Confirmation> {
        self.confirmation
            .as_ref()
            .filter(|c| c.request_id == request_id)
    }
}

/// Drives sessions. Cheap to clone; everything shared is behind an `Arc`.
#[derive(Clone)]
pub struct Orchestrator {
    config: OrchestratorConfig,
    retry: RetryPolicy,
    store: SessionStore,
    tools: Arc<ToolRegistry>,
    profiles: Arc<ProfileRegistry>,
    gate: Arc<SafetyGate>,
    collaborator: Arc<dyn Collaborator>,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        store: SessionStore,
        tools: Arc<ToolRegistry>,
        profiles: Arc<ProfileRegistry>,
        gate: Arc<SafetyGate>,
        collaborator: Arc<dyn Collaborator>,
    ) -> Self {
        Self {
            retry: RetryPolicy::from_config(&config),
            config,
            store,
            tools,
            profiles,
            gate,
            collaborator,
        }
    }

    pub const fn store(&self) -> &SessionStore {
        &self.store
    }

    pub const fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Run a session until it completes, fails, suspends or loses its consumer.
    ///
    /// Committed turns are sent to `sink` in commit order. A `confirmation`
    /// must name a pending approval of this session.
    pub async fn run(
        &self,
        session_id: &str,
        confirmation: Option<Confirmation>,
        cancel: watch::Receiver<bool>,
        sink: mpsc::Sender<Turn>,
    ) -> Result<RunOutcome, OrchestratorError> {
        let session = self.store.resume(session_id).await?;
        if let Some(c) = &confirmation
            && !session
                .pending_approvals()
                .iter()
                .any(|p| p.request_id == c.request_id)
        {
            return Err(OrchestratorError::UnknownApproval {
                session_id: session_id.to_string(),
                request_id: c.request_id.clone(),
            });
        }

        info!(
            session_id,
            status = %session.status,
            confirmation = confirmation.as_ref().map(|c| c.request_id.as_str()),
            "Run started"
        );
        let ctx = RunCtx {
            session_id: session.id.clone(),
            workspace: Workspace::at(&session.workspace_root),
            session: Mutex::new(session),
            confirmation,
            cancel,
            sink,
            steps: AtomicU32::new(0),
        };

        let result = self
            .drive_thread(&ctx, ctx.session_id.clone(), ProfileId::Root, 0)
            .await;
        let outcome = match result {
            Ok(_) => RunOutcome::Completed,
            Err(Halt::Suspended) => RunOutcome::AwaitingApproval,
            Err(Halt::Paused) => RunOutcome::Paused,
            Err(Halt::Failed { kind, message }) => {
                self.record_failure(&ctx, kind, message).await?;
                RunOutcome::Failed(kind)
            }
            Err(Halt::Store(e)) => return Err(e.into()),
        };

        let status = ctx.session.lock().await.derived_status();
        self.store.set_status(session_id, status).await?;
        info!(session_id, status = %status, outcome = ?outcome, "Run finished");
        Ok(outcome)
    }

    async fn record_failure(
        &self,
        ctx: &RunCtx,
        kind: FailureKind,
        message: String,
    ) -> Result<(), StoreError> {
        warn!(session_id = %ctx.session_id, kind = %kind, message = %message, "Session failed");
        let turn = NewTurn::system(
            ctx.session_id.clone(),
            TurnContent::Failed { kind, message },
        );
        match self.commit(ctx, turn).await {
            Ok(_) | Err(Halt::Paused) => Ok(()),
            Err(Halt::Store(e)) => Err(e),
            Err(other) => {
                warn!(session_id = %ctx.session_id, halt = ?other, "Unexpected halt while recording failure");
                Ok(())
            }
        }
    }

    /// Commit a turn, mirror it into the run's session, then stream it.
    ///
    /// The session lock is held until the turn is handed to the stream so
    /// concurrent threads emit turns in commit order.
    async fn commit(&self, ctx: &RunCtx, turn: NewTurn) -> Result<Turn, Halt> {
        let mut session = ctx.session.lock().await;
        let committed = self
            .store
            .append(&ctx.session_id, turn)
            .await
            .map_err(Halt::Store)?;
        session.turns.push(committed.clone());
        if ctx.sink.send(committed.clone()).await.is_err() {
            debug!(session_id = %ctx.session_id, seq = committed.seq, "Turn consumer gone, pausing");
            return Err(Halt::Paused);
        }
        Ok(committed)
    }

    fn drive_thread<'a>(
        &'a self,
        ctx: &'a RunCtx,
        thread_id: String,
        profile: ProfileId,
        depth: u32,
    ) -> BoxFuture<'a, Result<Answer, Halt>> {
        async move {
            let mut phase = PhaseTracker::new(thread_id.clone());
            let result = self
                .thread_loop(ctx, &thread_id, profile, depth, &mut phase)
                .await;
            match &result {
                Ok(_) => phase.advance(Phase::Done),
                Err(Halt::Failed { .. } | Halt::Store(_)) => phase.advance(Phase::Failed),
                Err(Halt::Suspended | Halt::Paused) => phase.advance(Phase::Idle),
            }
            result
        }
        .boxed()
    }

    async fn thread_loop(
        &self,
        ctx: &RunCtx,
        thread_id: &str,
        profile: ProfileId,
        depth: u32,
        phase: &mut PhaseTracker,
    ) -> Result<Answer, Halt> {
        loop {
            if ctx.cancelled() {
                return Err(Halt::cancelled());
            }

            let (open, action) = {
                let session = ctx.session.lock().await;
                let open: Vec<DelegationRecord> = session
                    .open_delegations(thread_id)
                    .into_iter()
                    .cloned()
                    .collect();
                (open, next_action(&session, thread_id))
            };

            if !open.is_empty() {
                phase.advance(Phase::Delegating);
                self.run_delegations(ctx, thread_id, profile, open).await?;
                phase.advance(Phase::Merging);
                continue;
            }

            match action {
                NextAction::Finished { text, completed_at } => {
                    return Ok(Answer { text, completed_at });
                }
                NextAction::OpenDelegations {
                    parent_turn_seq,
                    specs,
                } => {
                    self.open_delegations(ctx, thread_id, profile, parent_turn_seq, depth + 1, specs)
                        .await?;
                }
                NextAction::Dispatch { requests } => {
                    phase.advance(Phase::ToolPending);
                    self.dispatch(ctx, thread_id, profile, requests).await?;
                }
                NextAction::Plan => {
                    phase.advance(Phase::Planning);
                    self.plan(ctx, thread_id, profile, depth).await?;
                }
            }
        }
    }

    // =========================================================================
    // Planning
    // =========================================================================

    async fn plan(
        &self,
        ctx: &RunCtx,
        thread_id: &str,
        profile: ProfileId,
        depth: u32,
    ) -> Result<(), Halt> {
        let step = ctx.steps.fetch_add(1, Ordering::SeqCst) + 1;
        if step > self.config.max_steps_per_run {
            return Err(Halt::failed(
                FailureKind::StepLimitExceeded,
                format!(
                    "run exceeded {} collaborator calls",
                    self.config.max_steps_per_run
                ),
            ));
        }

        let mut corrected = false;
        let completion = loop {
            let request = self.completion_request(ctx, thread_id, profile, depth).await;
            match self.call_collaborator(ctx, request).await? {
                Reply::Usable(completion) => break completion,
                Reply::Malformed(reason) if !corrected => {
                    corrected = true;
                    warn!(session_id = %ctx.session_id, thread_id, profile = %profile, reason = %reason, "Malformed reply, sending corrective notice");
                    self.commit(
                        ctx,
                        NewTurn::system(
                            thread_id,
                            TurnContent::Notice {
                                text: format!(
                                    "Your previous reply could not be used ({reason}). Reply with \
                                     a final answer, one or more tool calls, or a delegation."
                                ),
                            },
                        ),
                    )
                    .await?;
                }
                Reply::Malformed(reason) => {
                    return Err(Halt::failed(
                        FailureKind::CollaboratorMalformedResponse,
                        format!("{profile} replied malformed twice: {reason}"),
                    ));
                }
            }
        };

        match completion {
            Completion::FinalAnswer { text } => {
                self.final_answer(ctx, thread_id, profile, text).await
            }
            Completion::ToolCalls { text, calls } => {
                self.tool_calls(ctx, thread_id, profile, text, calls).await
            }
            Completion::Delegation { tasks } => {
                self.delegate(ctx, thread_id, profile, depth, tasks).await
            }
        }
    }

    async fn completion_request(
        &self,
        ctx: &RunCtx,
        thread_id: &str,
        profile: ProfileId,
        depth: u32,
    ) -> CompletionRequest {
        let capability = self.profiles.get(profile);
        let session = ctx.session.lock().await;
        let transcript: Vec<Turn> = session.thread(thread_id).cloned().collect();
        let corrective = match transcript.last().map(|t| &t.content) {
            Some(TurnContent::Notice { text }) => Some(text.clone()),
            _ => None,
        };
        let delegates = if depth >= self.config.max_delegation_depth {
            Vec::new()
        } else {
            let chain = session.ancestry(thread_id);
            ProfileId::ALL
                .into_iter()
                .filter(|p| !chain.contains(p))
                .collect()
        };

        CompletionRequest {
            profile,
            description: capability.description.to_string(),
            contract: capability.contract.to_string(),
            transcript,
            tools: self
                .profiles
                .tool_specs(profile, &self.tools)
                .into_iter()
                .cloned()
                .collect(),
            delegates,
            corrective,
        }
    }

    /// Call the collaborator with timeout, retries and cancellation.
    async fn call_collaborator(
        &self,
        ctx: &RunCtx,
        request: CompletionRequest,
    ) -> Result<Reply, Halt> {
        let mut retries = 0;
        loop {
            let call = tokio::time::timeout(
                self.config.collaborator_timeout(),
                self.collaborator.complete(request.clone()),
            );
            let result = tokio::select! {
                biased;
                () = ctx.cancellation() => return Err(Halt::cancelled()),
                reply = call => reply.unwrap_or(Err(CollaboratorError::Timeout)),
            };

            let error = match result.and_then(Completion::validate) {
                Ok(completion) => return Ok(Reply::Usable(completion)),
                Err(CollaboratorError::Malformed(reason)) => return Ok(Reply::Malformed(reason)),
                Err(e) => e,
            };

            if !self.retry.allows(retries) {
                let kind = match error {
                    CollaboratorError::Timeout => FailureKind::CollaboratorTimeout,
                    _ => FailureKind::CollaboratorUnavailable,
                };
                return Err(Halt::failed(
                    kind,
                    format!("{error} (after {retries} retries)"),
                ));
            }

            let delay = self.retry.backoff(retries);
            retries += 1;
            warn!(
                session_id = %ctx.session_id,
                profile = %request.profile,
                error = %error,
                retry = retries,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "Collaborator call failed, retrying"
            );
            tokio::select! {
                biased;
                () = ctx.cancellation() => return Err(Halt::cancelled()),
                () = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn final_answer(
        &self,
        ctx: &RunCtx,
        thread_id: &str,
        profile: ProfileId,
        text: String,
    ) -> Result<(), Halt> {
        let verdict = {
            let session = ctx.session.lock().await;
            self.profiles
                .get(profile)
                .output_contract
                .check(&session, thread_id)
                .map_err(|reason| (reason, has_contract_notice(&session, thread_id)))
        };

        match verdict {
            Ok(()) => {
                self.commit(
                    ctx,
                    NewTurn::new(thread_id, Author::Profile(profile), TurnContent::FinalAnswer { text }),
                )
                .await?;
                info!(session_id = %ctx.session_id, thread_id, profile = %profile, "Final answer");
                Ok(())
            }
            Err((reason, false)) => {
                debug!(session_id = %ctx.session_id, thread_id, profile = %profile, reason = %reason, "Output contract not met");
                self.commit(
                    ctx,
                    NewTurn::system(
                        thread_id,
                        TurnContent::Notice {
                            text: format!("{CONTRACT_NOTICE_PREFIX} {reason}"),
                        },
                    ),
                )
                .await?;
                Ok(())
            }
            Err((reason, true)) => Err(Halt::failed(
                FailureKind::CollaboratorMalformedResponse,
                format!("{profile} ignored its output contract: {reason}"),
            )),
        }
    }

    async fn tool_calls(
        &self,
        ctx: &RunCtx,
        thread_id: &str,
        profile: ProfileId,
        text: Option<String>,
        calls: Vec<ToolCallDraft>,
    ) -> Result<(), Halt> {
        let requests: Vec<ToolCallRequest> = calls
            .into_iter()
            .map(|call| ToolCallRequest {
                id: uuid::Uuid::new_v4().to_string(),
                profile,
                tool: call.tool,
                args: call.args,
            })
            .collect();
        debug!(session_id = %ctx.session_id, thread_id, profile = %profile, count = requests.len(), "Tool calls requested");
        self.commit(
            ctx,
            NewTurn::new(
                thread_id,
                Author::Profile(profile),
                TurnContent::ToolCalls { text, requests },
            ),
        )
        .await?;
        Ok(())
    }

    // =========================================================================
    // Tool dispatch
    // =========================================================================

    async fn dispatch(
        &self,
        ctx: &RunCtx,
        thread_id: &str,
        profile: ProfileId,
        requests: Vec<ToolCallRequest>,
    ) -> Result<(), Halt> {
        let capability = self.profiles.get(profile);
        for request in requests {
            if ctx.cancelled() {
                return Err(Halt::cancelled());
            }

            let (approved, pending, trusted, grants) = {
                let session = ctx.session.lock().await;
                (
                    session.is_approved(&request.id),
                    session
                        .pending_approvals()
                        .iter()
                        .any(|p| p.request_id == request.id),
                    session.trusted,
                    session.session_grants(),
                )
            };

            if approved {
                self.execute(ctx, thread_id, &request).await?;
                continue;
            }

            if pending {
                match ctx.confirmation_for(&request.id) {
                    Some(c) if c.approved => {
                        info!(session_id = %ctx.session_id, request_id = %request.id, tool = %request.tool, remember = c.remember_for_session, "Confirmation approved");
                        self.commit(
                            ctx,
                            NewTurn::new(
                                thread_id,
                                Author::User,
                                TurnContent::Approved {
                                    request_id: request.id.clone(),
                                    remember_for_session: c.remember_for_session,
                                },
                            ),
                        )
                        .await?;
                        self.execute(ctx, thread_id, &request).await?;
                    }
                    Some(_) => {
                        info!(session_id = %ctx.session_id, request_id = %request.id, tool = %request.tool, "Confirmation rejected");
                        self.deny(
                            ctx,
                            thread_id,
                            &request.id,
                            DenialKind::PermissionDenied,
                            "rejected by the user".to_string(),
                        )
                        .await?;
                    }
                    None => return Err(Halt::Suspended),
                }
                continue;
            }

            let decision = self.gate.authorize(
                capability,
                &request,
                &GateContext {
                    session_id: &ctx.session_id,
                    workspace: &ctx.workspace,
                    trusted,
                    grants: &grants,
                },
            );
            match decision {
                GateDecision::Allow => {
                    self.execute(ctx, thread_id, &request).await?;
                }
                GateDecision::Deny { kind, reason } => {
                    self.deny(ctx, thread_id, &request.id, kind, reason).await?;
                }
                GateDecision::RequireConfirmation { reason } => {
                    let risk_class = self
                        .tools
                        .risk_class(&request.tool)
                        .unwrap_or(RiskClass::Destructive);
                    info!(session_id = %ctx.session_id, thread_id, request_id = %request.id, tool = %request.tool, "Awaiting confirmation");
                    self.commit(
                        ctx,
                        NewTurn::system(
                            thread_id,
                            TurnContent::ConfirmationRequested {
                                request_id: request.id.clone(),
                                tool: request.tool.clone(),
                                risk_class,
                                reason,
                            },
                        ),
                    )
                    .await?;
                    return Err(Halt::Suspended);
                }
            }
        }
        Ok(())
    }

    async fn execute(
        &self,
        ctx: &RunCtx,
        thread_id: &str,
        request: &ToolCallRequest,
    ) -> Result<(), Halt> {
        let tool_ctx = ToolContext {
            session_id: ctx.session_id.clone(),
            workspace: ctx.workspace.clone(),
        };
        let content = match self
            .tools
            .invoke(&tool_ctx, &request.id, &request.tool, &request.args)
            .await
        {
            Ok(result) => TurnContent::ToolResult { result },
            Err(rejection) => denial(&request.id, rejection.kind, rejection.reason),
        };
        self.commit(ctx, NewTurn::system(thread_id, content)).await?;
        Ok(())
    }

    async fn deny(
        &self,
        ctx: &RunCtx,
        thread_id: &str,
        request_id: &str,
        kind: DenialKind,
        reason: String,
    ) -> Result<(), Halt> {
        debug!(session_id = %ctx.session_id, thread_id, request_id, kind = %kind, reason = %reason, "Denied");
        self.commit(ctx, NewTurn::system(thread_id, denial(request_id, kind, reason)))
            .await?;
        Ok(())
    }

    // =========================================================================
    // Delegation
    // =========================================================================

    async fn delegate(
        &self,
        ctx: &RunCtx,
        thread_id: &str,
        profile: ProfileId,
        depth: u32,
        tasks: Vec<DelegationTask>,
    ) -> Result<(), Halt> {
        let child_depth = depth + 1;
        if child_depth > self.config.max_delegation_depth {
            return Err(Halt::failed(
                FailureKind::DelegationDepthExceeded,
                format!(
                    "{profile} tried to delegate at depth {child_depth}, limit is {}",
                    self.config.max_delegation_depth
                ),
            ));
        }

        let specs: Vec<DelegationSpec> = tasks
            .into_iter()
            .map(|task| DelegationSpec {
                delegation_id: uuid::Uuid::new_v4().to_string(),
                target: task.target,
                sub_task: task.sub_task,
                paths: task.paths,
            })
            .collect();
        let delegated = self
            .commit(
                ctx,
                NewTurn::new(
                    thread_id,
                    Author::Profile(profile),
                    TurnContent::Delegated {
                        delegations: specs.clone(),
                    },
                ),
            )
            .await?;
        self.open_delegations(ctx, thread_id, profile, delegated.seq, child_depth, specs)
            .await
    }

    /// Refuse delegations back up the chain and record the rest.
    async fn open_delegations(
        &self,
        ctx: &RunCtx,
        thread_id: &str,
        profile: ProfileId,
        parent_turn_seq: i64,
        depth: u32,
        specs: Vec<DelegationSpec>,
    ) -> Result<(), Halt> {
        let chain = ctx.session.lock().await.ancestry(thread_id);
        let (refused, accepted): (Vec<_>, Vec<_>) =
            specs.into_iter().partition(|s| chain.contains(&s.target));

        for spec in refused {
            self.deny(
                ctx,
                thread_id,
                &spec.delegation_id,
                DenialKind::PermissionDenied,
                format!(
                    "{profile} may not delegate to {}: it is already on the delegation chain",
                    spec.target
                ),
            )
            .await?;
        }
        if accepted.is_empty() {
            return Ok(());
        }

        let records = self
            .store
            .record_delegations(&ctx.session_id, thread_id, parent_turn_seq, depth, &accepted)
            .await
            .map_err(Halt::Store)?;
        info!(
            session_id = %ctx.session_id,
            thread_id,
            profile = %profile,
            depth,
            targets = ?records.iter().map(|r| r.target.as_str()).collect::<Vec<_>>(),
            "Delegations opened"
        );
        ctx.session.lock().await.delegations.extend(records);
        Ok(())
    }

    async fn run_delegations(
        &self,
        ctx: &RunCtx,
        thread_id: &str,
        profile: ProfileId,
        records: Vec<DelegationRecord>,
    ) -> Result<(), Halt> {
        let mut finished = Vec::with_capacity(records.len());

        if fanout::can_run_concurrently(&records) {
            debug!(session_id = %ctx.session_id, thread_id, count = records.len(), "Running delegations concurrently");
            let pool = DelegationPool::new(self.config.max_parallel_delegations);
            let runs = records.iter().enumerate().map(|(position, record)| {
                let pool = &pool;
                async move {
                    let _permit = pool.acquire().await;
                    (position, self.run_child(ctx, record, profile).await)
                }
            });

            let mut halt = None;
            for (position, result) in join_all(runs).await {
                match result {
                    Ok(answer) => finished.push(FinishedChild {
                        record: records[position].clone(),
                        position,
                        text: answer.text,
                        completed_at: answer.completed_at,
                    }),
                    Err(h) => halt = Some(Halt::worst(halt, h)),
                }
            }
            if let Some(halt) = halt {
                return Err(halt);
            }
        } else {
            for record in fanout::serial_order(&records) {
                let position = records
                    .iter()
                    .position(|r| r.id == record.id)
                    .unwrap_or(records.len());
                let answer = self.run_child(ctx, &record, profile).await?;
                finished.push(FinishedChild {
                    record,
                    position,
                    text: answer.text,
                    completed_at: answer.completed_at,
                });
            }
        }

        for child in fanout::merge_order(finished) {
            let merged = self
                .commit(
                    ctx,
                    NewTurn::new(
                        thread_id,
                        Author::Profile(child.record.target),
                        TurnContent::DelegationResult {
                            delegation_id: child.record.id.clone(),
                            text: child.text,
                        },
                    ),
                )
                .await?;
            self.store
                .close_delegation(&ctx.session_id, &child.record.id, merged.seq)
                .await
                .map_err(Halt::Store)?;

            let mut session = ctx.session.lock().await;
            if let Some(record) = session
                .delegations
                .iter_mut()
                .find(|d| d.id == child.record.id)
            {
                record.status = DelegationStatus::Closed;
                record.closed_turn_seq = Some(merged.seq);
            }
            drop(session);
            debug!(session_id = %ctx.session_id, delegation_id = %child.record.id, target = %child.record.target, "Delegation merged");
        }
        Ok(())
    }

    async fn run_child(
        &self,
        ctx: &RunCtx,
        record: &DelegationRecord,
        parent: ProfileId,
    ) -> Result<Answer, Halt> {
        let fresh = ctx.session.lock().await.thread(&record.id).next().is_none();
        if fresh {
            self.commit(
                ctx,
                NewTurn::new(
                    record.id.clone(),
                    Author::Profile(parent),
                    TurnContent::Message {
                        text: record.sub_task.clone(),
                    },
                ),
            )
            .await?;
        }
        debug!(
            session_id = %ctx.session_id,
            thread_id = %record.id,
            profile = %record.target,
            depth = record.depth,
            "Entering sub-session"
        );
        self.drive_thread(ctx, record.id.clone(), record.target, record.depth)
            .await
    }
}

fn denial(request_id: &str, kind: DenialKind, reason: String) -> TurnContent {
    TurnContent::Denied {
        denial: Denial {
            request_id: request_id.to_string(),
            kind,
            reason,
        },
    }
}
