//! Session control surface.
//!
//! [`SessionController`] starts sessions, resumes them as lazy turn
//! streams, and cancels them. At most one run per session is live at a
//! time; a second `resume` while one is running is refused.

use std::collections::HashMap;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use futures::Stream;
use tokio::sync::{Mutex, mpsc, watch};
use tracing::{debug, info, warn};

use codeagent_core::model::{
    Author, FailureKind, NewTurn, PendingApproval, Session, SessionStatus, Turn, TurnContent,
};
use codeagent_core::{Workspace, WorkspaceError};

use crate::orchestration::{Confirmation, Orchestrator, OrchestratorError};
use crate::session::{SessionStore, SessionSummary, StoreError};

/// Committed turns of one run, in commit order.
///
/// Dropping the stream pauses the run at its next commit; `resume`
/// continues from the last committed turn.
pub type TurnStream = Pin<Box<dyn Stream<Item = Result<Turn, ControllerError>> + Send>>;

#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("Session {0} is already running")]
    SessionBusy(String),

    #[error("Session {0} is waiting for a confirmation")]
    AwaitingApproval(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),

    #[error(transparent)]
    Workspace(#[from] WorkspaceError),

    #[error("Session task failed: {0}")]
    Task(String),
}

/// Options for a new session.
#[derive(Debug, Clone)]
pub struct StartOptions {
    pub workspace_root: PathBuf,
    /// Destructive tools run without confirmation.
    pub trusted: bool,
}

#[derive(Clone)]
pub struct SessionController {
    orchestrator: Arc<Orchestrator>,
    /// Cancellation senders of live runs, keyed by session id.
    running: Arc<Mutex<HashMap<String, watch::Sender<bool>>>>,
}

impl SessionController {
    pub fn new(orchestrator: Orchestrator) -> Self {
        Self {
            orchestrator: Arc::new(orchestrator),
            running: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn store(&self) -> &SessionStore {
        self.orchestrator.store()
    }

    /// Create a session holding the user's first message. Nothing runs
    /// until [`resume`](Self::resume).
    pub async fn start(
        &self,
        message: &str,
        options: StartOptions,
    ) -> Result<String, ControllerError> {
        let workspace = Workspace::open(&options.workspace_root)?;
        let session = self.store().create(workspace.root(), options.trusted).await?;
        self.store()
            .append(
                &session.id,
                NewTurn::new(
                    session.id.clone(),
                    Author::User,
                    TurnContent::Message {
                        text: message.to_string(),
                    },
                ),
            )
            .await?;
        info!(session_id = %session.id, "Session started");
        Ok(session.id)
    }

    /// Run a session, streaming its turns as they are committed.
    pub async fn resume(
        &self,
        session_id: &str,
        confirmation: Option<Confirmation>,
    ) -> Result<TurnStream, ControllerError> {
        let mut running = self.running.lock().await;
        if running.contains_key(session_id) {
            return Err(ControllerError::SessionBusy(session_id.to_string()));
        }

        let session = self.store().resume(session_id).await?;
        if let Some(c) = &confirmation
            && !session
                .pending_approvals()
                .iter()
                .any(|p| p.request_id == c.request_id)
        {
            return Err(OrchestratorError::UnknownApproval {
                session_id: session_id.to_string(),
                request_id: c.request_id.clone(),
            }
            .into());
        }

        let (cancel_tx, cancel_rx) = watch::channel(false);
        running.insert(session_id.to_string(), cancel_tx);
        drop(running);

        let capacity = self.orchestrator.config().stream_capacity.max(1);
        let (tx, mut rx) = mpsc::channel(capacity);
        let orchestrator = Arc::clone(&self.orchestrator);
        let live = Arc::clone(&self.running);
        let id = session_id.to_string();
        let handle = tokio::spawn(async move {
            let result = orchestrator.run(&id, confirmation, cancel_rx, tx).await;
            let mut live = live.lock().await;
            // A cancel can land after the run's last check.
            if live.remove(&id).is_some_and(|cancel| *cancel.borrow())
                && let Err(e) = fail_cancelled(orchestrator.store(), &id, "cancelled as the run ended").await
            {
                warn!(session_id = %id, error = %e, "Late cancellation not recorded");
            }
            drop(live);
            result
        });

        let session_id = session_id.to_string();
        let stream = async_stream::stream! {
            while let Some(turn) = rx.recv().await {
                yield Ok(turn);
            }
            match handle.await {
                Ok(Ok(outcome)) => {
                    debug!(session_id = %session_id, outcome = ?outcome, "Turn stream finished");
                }
                Ok(Err(e)) => yield Err(ControllerError::Orchestrator(e)),
                Err(e) => {
                    warn!(session_id = %session_id, error = %e, "Session task aborted");
                    yield Err(ControllerError::Task(e.to_string()));
                }
            }
        };
        Ok(Box::pin(stream))
    }

    /// Run to the end and collect every committed turn.
    pub async fn run_to_end(
        &self,
        session_id: &str,
        confirmation: Option<Confirmation>,
    ) -> Result<Vec<Turn>, ControllerError> {
        use futures::StreamExt;

        let mut stream = self.resume(session_id, confirmation).await?;
        let mut turns = Vec::new();
        while let Some(turn) = stream.next().await {
            turns.push(turn?);
        }
        Ok(turns)
    }

    /// Cancel a session.
    ///
    /// A live run is signalled and fails at its next suspension point. An
    /// idle session is failed directly. Terminal sessions are left alone.
    pub async fn cancel(&self, session_id: &str) -> Result<(), ControllerError> {
        let running = self.running.lock().await;
        if let Some(tx) = running.get(session_id) {
            tx.send_replace(true);
            if tx.receiver_count() > 0 {
                info!(session_id, "Cancellation signalled");
                return Ok(());
            }
            debug!(session_id, "Run already returned, cancelling directly");
        }

        if fail_cancelled(self.store(), session_id, "cancelled while idle").await? {
            info!(session_id, "Idle session cancelled");
        } else {
            debug!(session_id, "Cancel on terminal session ignored");
        }
        drop(running);
        Ok(())
    }

    /// Add a user message to the root thread, continuing the conversation.
    pub async fn post_message(&self, session_id: &str, text: &str) -> Result<(), ControllerError> {
        let running = self.running.lock().await;
        if running.contains_key(session_id) {
            return Err(ControllerError::SessionBusy(session_id.to_string()));
        }

        let session = self.store().load(session_id).await?;
        if session.archived_at.is_some() {
            return Err(StoreError::Archived(session_id.to_string()).into());
        }
        match session.status {
            SessionStatus::Failed => {
                return Err(StoreError::Terminal {
                    session_id: session_id.to_string(),
                    status: session.status,
                }
                .into());
            }
            SessionStatus::AwaitingApproval => {
                return Err(ControllerError::AwaitingApproval(session_id.to_string()));
            }
            SessionStatus::Active | SessionStatus::Completed => {}
        }

        self.store()
            .append(
                session_id,
                NewTurn::new(
                    session_id,
                    Author::User,
                    TurnContent::Message {
                        text: text.to_string(),
                    },
                ),
            )
            .await?;
        self.store()
            .set_status(session_id, SessionStatus::Active)
            .await?;
        drop(running);
        debug!(session_id, "User message posted");
        Ok(())
    }

    pub async fn pending_approvals(
        &self,
        session_id: &str,
    ) -> Result<Vec<PendingApproval>, ControllerError> {
        Ok(self.store().load(session_id).await?.pending_approvals())
    }

    pub async fn load(&self, session_id: &str) -> Result<Session, ControllerError> {
        Ok(self.store().load(session_id).await?)
    }

    pub async fn list(
        &self,
        include_archived: bool,
        limit: u32,
    ) -> Result<Vec<SessionSummary>, ControllerError> {
        Ok(self.store().list(include_archived, limit).await?)
    }

    pub async fn is_running(&self, session_id: &str) -> bool {
        self.running.lock().await.contains_key(session_id)
    }

    /// Archive a session. Refused while it runs.
    pub async fn close(&self, session_id: &str) -> Result<(), ControllerError> {
        let running = self.running.lock().await;
        if running.contains_key(session_id) {
            return Err(ControllerError::SessionBusy(session_id.to_string()));
        }
        self.store().close(session_id).await?;
        drop(running);
        Ok(())
    }
}

/// Fail a stored session as cancelled. Returns false when it had already
/// ended.
async fn fail_cancelled(
    store: &SessionStore,
    session_id: &str,
    message: &str,
) -> Result<bool, StoreError> {
    let session = store.load(session_id).await?;
    if session.status.is_terminal() {
        return Ok(false);
    }
    store
        .append(
            session_id,
            NewTurn::system(
                session_id,
                TurnContent::Failed {
                    kind: FailureKind::Cancelled,
                    message: message.to_string(),
                },
            ),
        )
        .await?;
    store.set_status(session_id, SessionStatus::Failed).await?;
    Ok(true)
}
