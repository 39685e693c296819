//! Session hub: owns every live session, starts turns, queues messages that
//! arrive mid-turn and fans events out to subscribers.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use serde::Serialize;
use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use helm_core::agent::{AgentGateway, AgentPrompt, RunOptions};
use helm_core::ids::{MessageId, QueuedMessageId, SessionId, TurnId};
use helm_core::messages::{ChatMessage, MessagePart};
use helm_core::persistence::{
    CompletionReason, NewChatMessage, NewSession, Persistence, SessionRecord, StoredMessage,
};
use helm_core::MessageAccumulator;
use helm_telemetry::MetricsRecorder;

use crate::broadcast::Subscription;
use crate::completion::{finish_turn, TurnHandle, TurnOutcome};
use crate::config::HubConfig;
use crate::error::{
    HubError, AGENT_START_FAILED, MESSAGE_PERSIST_FAILED, SESSION_LOAD_FAILED, TURN_CREATE_FAILED,
};
use crate::events::{
    DequeueReason, QueuedMessage, SessionEvent, SessionSnapshot, SessionStatus, TurnContext,
};
use crate::processor::run_turn;
use crate::state::{RunTokens, SessionCell, TurnClaim};

#[derive(Clone, Debug, Default, PartialEq)]
pub struct SendRequest {
    pub content: String,
    pub client_message_id: Option<String>,
    pub parts: Vec<MessagePart>,
}

impl SendRequest {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Self::default()
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum SendOutcome {
    /// A turn was started for this message.
    Started {
        message_id: MessageId,
        turn_id: TurnId,
    },
    /// A turn was already running; the message waits in the queue.
    Queued { queued_message: QueuedMessage },
}

/// Result of [`SessionHub::shutdown`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ShutdownReport {
    /// Turns that reached their completion path in time.
    pub interrupted: usize,
    /// Sessions whose turn did not finish within the timeout.
    pub timed_out: usize,
    /// Agent cancel requests that returned an error.
    pub failed: usize,
}

pub(crate) struct HubInner {
    pub(crate) agent: Arc<dyn AgentGateway>,
    pub(crate) persistence: Arc<dyn Persistence>,
    pub(crate) config: HubConfig,
    sessions: DashMap<SessionId, Arc<SessionCell>>,
    shutting_down: AtomicBool,
    metrics: Option<Arc<MetricsRecorder>>,
}

impl HubInner {
    pub(crate) fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    fn record_turn_started(&self) {
        if let Some(m) = &self.metrics {
            m.counter_inc("hub.turns.started", &[], 1);
            m.gauge_inc("hub.sessions.streaming", &[], 1.0);
        }
    }

    pub(crate) fn record_turn_finished(&self, reason: CompletionReason, turn: &TurnHandle) {
        if let Some(m) = &self.metrics {
            m.counter_inc("hub.turns.completed", &[("reason", reason.as_str())], 1);
            m.histogram_observe(
                "hub.turn.duration_ms",
                &[],
                turn.started_at.elapsed().as_secs_f64() * 1000.0,
            );
            m.gauge_inc("hub.sessions.streaming", &[], -1.0);
        }
    }

    fn record_queued(&self) {
        if let Some(m) = &self.metrics {
            m.counter_inc("hub.messages.queued", &[], 1);
        }
    }
}

/// The user message a turn is started from.
struct StartMessage {
    message_id: MessageId,
    content: String,
    parts: Vec<MessagePart>,
    client_message_id: Option<String>,
}

impl StartMessage {
    fn from_request(request: SendRequest) -> Self {
        Self {
            message_id: MessageId::new(),
            content: request.content,
            parts: request.parts,
            client_message_id: request.client_message_id,
        }
    }

    fn from_queued(queued: &QueuedMessage) -> Self {
        Self {
            message_id: MessageId::new(),
            content: queued.content.clone(),
            parts: queued.parts.clone(),
            client_message_id: queued.client_message_id.clone(),
        }
    }
}

enum Admission {
    Start(TurnClaim, StartMessage),
    Queued {
        queued: QueuedMessage,
        backlog: Option<(QueuedMessage, TurnClaim)>,
    },
}

struct StopRequest {
    finished: CancellationToken,
    cancel_failed: bool,
}

/// Entry point for every session operation. Cheap to clone.
#[derive(Clone)]
pub struct SessionHub {
    inner: Arc<HubInner>,
}

impl SessionHub {
    pub fn new(
        agent: Arc<dyn AgentGateway>,
        persistence: Arc<dyn Persistence>,
        config: HubConfig,
    ) -> Self {
        Self::with_metrics(agent, persistence, config, None)
    }

    pub fn with_metrics(
        agent: Arc<dyn AgentGateway>,
        persistence: Arc<dyn Persistence>,
        config: HubConfig,
        metrics: Option<Arc<MetricsRecorder>>,
    ) -> Self {
        Self {
            inner: Arc::new(HubInner {
                agent,
                persistence,
                config,
                sessions: DashMap::new(),
                shutting_down: AtomicBool::new(false),
                metrics,
            }),
        }
    }

    /// Number of sessions currently held in memory.
    pub fn loaded_sessions(&self) -> usize {
        self.inner.sessions.len()
    }

    /// Number of sessions with a turn in flight.
    pub fn streaming_sessions(&self) -> usize {
        self.inner
            .sessions
            .iter()
            .filter(|entry| entry.value().state.lock().status == SessionStatus::Streaming)
            .count()
    }

    pub async fn create_session(&self, new: NewSession) -> Result<SessionRecord, HubError> {
        let record = self.inner.persistence.create_session(new).await?;
        info!(session_id = %record.id, cwd = %record.cwd, "session created");
        Ok(record)
    }

    pub async fn list_sessions(&self, limit: u32, offset: u32) -> Result<Vec<SessionRecord>, HubError> {
        Ok(self.inner.persistence.list_sessions(limit, offset).await?)
    }

    /// Persisted messages of a session, oldest first.
    pub async fn history(&self, session_id: &SessionId) -> Result<Vec<StoredMessage>, HubError> {
        let _ = self.cell(session_id).await?;
        Ok(self.inner.persistence.list_chat_messages(session_id).await?)
    }

    /// Start a turn, or queue the message if one is already running or
    /// older messages are still waiting.
    #[instrument(skip(self, request), fields(session_id = %session_id))]
    pub async fn send(
        &self,
        session_id: &SessionId,
        request: SendRequest,
    ) -> Result<SendOutcome, HubError> {
        let cell = self.cell(session_id).await?;
        let admission = {
            let mut state = cell.state.lock();
            if state.tearing_down {
                return Err(HubError::SessionNotFound(session_id.clone()));
            }
            if state.status == SessionStatus::Streaming || !state.queue.is_empty() {
                let queued = QueuedMessage {
                    id: QueuedMessageId::new(),
                    content: request.content,
                    parts: request.parts,
                    client_message_id: request.client_message_id,
                    queued_at: Utc::now().to_rfc3339(),
                };
                state.queue.push_back(queued.clone());
                state.publish(SessionEvent::MessageQueued {
                    queued_message: queued.clone(),
                });
                // An idle session with a backlog left behind by a failed start.
                let backlog = if self.inner.is_shutting_down() {
                    None
                } else {
                    state.claim_queue_head()
                };
                Admission::Queued { queued, backlog }
            } else {
                Admission::Start(state.begin_run(), StartMessage::from_request(request))
            }
        };

        let (claim, message) = match admission {
            Admission::Start(claim, message) => (claim, message),
            Admission::Queued { queued, backlog } => {
                self.inner.record_queued();
                debug!(queued_id = %queued.id, "message queued");
                if let Some((head, claim)) = backlog {
                    debug!(queued_id = %head.id, "starting queue backlog");
                    start_queued(Arc::clone(&self.inner), Arc::clone(&cell), head, claim).await;
                }
                return Ok(SendOutcome::Queued {
                    queued_message: queued,
                });
            }
        };

        let message_id = message.message_id.clone();
        match start_turn(Arc::clone(&self.inner), Arc::clone(&cell), claim, message).await {
            Ok(turn_id) => Ok(SendOutcome::Started {
                message_id,
                turn_id,
            }),
            Err(e) => {
                // Messages queued while this start was pending must not wait
                // for the next send.
                drain_queue(&self.inner, &cell).await;
                Err(e)
            }
        }
    }

    /// Subscribe to a session. The first item is always `InitialState`.
    pub async fn subscribe(&self, session_id: &SessionId) -> Result<Subscription, HubError> {
        let cell = self.cell(session_id).await?;
        let mut state = cell.state.lock();
        if state.tearing_down {
            return Err(HubError::SessionNotFound(session_id.clone()));
        }
        Ok(state.subscribe())
    }

    /// Stop the running turn and wait for its completion path. `false` when
    /// the session was idle.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub async fn interrupt(&self, session_id: &SessionId) -> Result<bool, HubError> {
        let cell = self.cell(session_id).await?;
        let Some(stop) = request_stop(&cell).await else {
            return Ok(false);
        };
        stop.finished.cancelled().await;
        info!("turn interrupted");
        Ok(true)
    }

    /// Remove a queued message. `false` when no such message is queued.
    pub async fn dequeue_message(
        &self,
        session_id: &SessionId,
        queued_id: &QueuedMessageId,
    ) -> Result<bool, HubError> {
        let cell = self.cell(session_id).await?;
        let mut state = cell.state.lock();
        let Some(pos) = state.queue.iter().position(|q| &q.id == queued_id) else {
            return Ok(false);
        };
        let _ = state.queue.remove(pos);
        state.publish(SessionEvent::MessageDequeued {
            message_id: queued_id.clone(),
            reason: DequeueReason::Removed,
        });
        Ok(true)
    }

    pub async fn get_state(&self, session_id: &SessionId) -> Result<SessionSnapshot, HubError> {
        let cell = self.cell(session_id).await?;
        let snapshot = cell.state.lock().snapshot();
        Ok(snapshot)
    }

    /// Answer a pending interactive tool call of the running turn.
    #[instrument(skip(self, response), fields(session_id = %session_id))]
    pub async fn respond(
        &self,
        session_id: &SessionId,
        tool_call_id: &str,
        response: Value,
    ) -> Result<(), HubError> {
        let cell = self.cell(session_id).await?;
        let (turn_id, control) = {
            let state = cell.state.lock();
            let pending = state.status == SessionStatus::Streaming
                && state
                    .pending_actions
                    .iter()
                    .any(|a| a.tool_call_id == tool_call_id);
            let control = state.run.as_ref().and_then(|run| run.control.clone());
            match (pending, state.active_turn_id.clone(), control) {
                (true, Some(turn_id), Some(control)) => (turn_id, control),
                _ => {
                    return Err(HubError::NoPendingAction {
                        session_id: session_id.clone(),
                        tool_call_id: tool_call_id.to_owned(),
                    })
                }
            }
        };

        control.respond(tool_call_id, response).await?;

        let mut state = cell.state.lock();
        if state.active_turn_id.as_ref() == Some(&turn_id) {
            let before = state.pending_actions.len();
            state
                .pending_actions
                .retain(|a| a.tool_call_id != tool_call_id);
            if state.pending_actions.len() < before {
                state.publish(SessionEvent::ActionResolved {
                    turn_id,
                    tool_call_id: tool_call_id.to_owned(),
                });
            }
        }
        Ok(())
    }

    /// Tear the session down and delete its persisted rows. A running turn
    /// is cancelled without recording a completion. Returns whether anything
    /// existed.
    ///
    /// The entry stays in the table, marked as tearing down, until the rows
    /// are gone, so concurrent calls see `SessionNotFound` instead of
    /// reloading the session.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub async fn delete_session(&self, session_id: &SessionId) -> Result<bool, HubError> {
        let loaded = self
            .inner
            .sessions
            .get(session_id)
            .map(|entry| Arc::clone(entry.value()));
        let was_loaded = loaded.is_some();

        if let Some(cell) = &loaded {
            let run = {
                let mut state = cell.state.lock();
                state.tearing_down = true;
                state.queue.clear();
                state.publish(SessionEvent::SessionDeleted);
                state.broadcaster.close();
                state
                    .run
                    .as_ref()
                    .map(|run| (run.tokens.clone(), run.control.clone()))
            };
            if let Some((tokens, control)) = run {
                tokens.cancel.cancel();
                if let Some(control) = control {
                    if let Err(e) = control.cancel().await {
                        warn!(error = %e, "agent cancel failed during delete");
                    }
                }
                let wait = tokens.finished.cancelled();
                if tokio::time::timeout(self.inner.config.shutdown_timeout, wait)
                    .await
                    .is_err()
                {
                    warn!("turn did not stop before delete timeout");
                }
            }
        }

        let persisted = match self.inner.persistence.delete_session(session_id).await {
            Ok(()) => true,
            Err(e) if e.is_not_found() => false,
            Err(e) => {
                warn!(error = %e, "failed to delete persisted session");
                false
            }
        };
        if let Some(cell) = &loaded {
            self.inner
                .sessions
                .remove_if(session_id, |_, current| Arc::ptr_eq(current, cell));
        }
        if was_loaded || persisted {
            info!("session deleted");
        }
        Ok(was_loaded || persisted)
    }

    /// Interrupt every streaming session concurrently, each bounded by the
    /// configured timeout. Queued messages are not started afterwards.
    pub async fn shutdown(&self) -> ShutdownReport {
        self.inner.shutting_down.store(true, Ordering::Release);
        let cells: Vec<Arc<SessionCell>> = self
            .inner
            .sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        let timeout = self.inner.config.shutdown_timeout;

        let results = join_all(cells.iter().map(|cell| async move {
            let stopped = tokio::time::timeout(timeout, async {
                let Some(stop) = request_stop(cell).await else {
                    return None;
                };
                stop.finished.cancelled().await;
                Some(stop.cancel_failed)
            })
            .await;
            (cell.id.clone(), stopped)
        }))
        .await;

        let mut report = ShutdownReport::default();
        for (session_id, stopped) in results {
            match stopped {
                Ok(None) => {}
                Ok(Some(cancel_failed)) => {
                    report.interrupted += 1;
                    if cancel_failed {
                        report.failed += 1;
                    }
                }
                Err(_) => {
                    warn!(%session_id, "turn did not stop before shutdown timeout");
                    report.timed_out += 1;
                }
            }
        }
        info!(
            interrupted = report.interrupted,
            timed_out = report.timed_out,
            failed = report.failed,
            "session hub shut down"
        );
        report
    }

    /// Get or load the in-memory entry for a session.
    async fn cell(&self, session_id: &SessionId) -> Result<Arc<SessionCell>, HubError> {
        let existing = self
            .inner
            .sessions
            .get(session_id)
            .map(|entry| Arc::clone(entry.value()));
        if let Some(cell) = existing {
            if cell.state.lock().tearing_down {
                return Err(HubError::SessionNotFound(session_id.clone()));
            }
            return Ok(cell);
        }

        let record = self
            .inner
            .persistence
            .get_session(session_id)
            .await
            .map_err(|e| load_error(session_id, &e))?;
        let cursor = match self.inner.persistence.get_cursor(session_id).await {
            Ok(cursor) => cursor,
            Err(e) => {
                warn!(%session_id, error = %e, "failed to load history cursor");
                None
            }
        };
        let cell = Arc::clone(
            self.inner
                .sessions
                .entry(session_id.clone())
                .or_insert_with(|| {
                    Arc::new(SessionCell::new(
                        session_id.clone(),
                        cursor,
                        record.resume_token,
                    ))
                })
                .value(),
        );
        Ok(cell)
    }
}

fn load_error(session_id: &SessionId, e: &helm_core::errors::PersistenceError) -> HubError {
    if e.is_not_found() {
        HubError::SessionNotFound(session_id.clone())
    } else {
        HubError::chat(SESSION_LOAD_FAILED, format!("failed to load session: {e}"))
    }
}

/// Fire the turn's cancel token, then cancel the agent (best-effort). `None`
/// when the session is idle.
async fn request_stop(cell: &SessionCell) -> Option<StopRequest> {
    let (tokens, control) = {
        let state = cell.state.lock();
        if state.status != SessionStatus::Streaming {
            return None;
        }
        let run = state.run.as_ref()?;
        (run.tokens.clone(), run.control.clone())
    };
    tokens.cancel.cancel();
    let mut cancel_failed = false;
    if let Some(control) = control {
        if let Err(e) = control.cancel().await {
            warn!(session_id = %cell.id, error = %e, "agent cancel failed");
            cancel_failed = true;
        }
    }
    Some(StopRequest {
        finished: tokens.finished,
        cancel_failed,
    })
}

/// Undo a claim made by `begin_run` for a turn that never reached the agent.
fn abort_start(cell: &SessionCell, tokens: &RunTokens) {
    cell.state.lock().reset_idle();
    tokens.finished.cancel();
}

/// Start the head of the queue if the session sits idle with a backlog.
async fn drain_queue(inner: &Arc<HubInner>, cell: &Arc<SessionCell>) {
    if inner.is_shutting_down() {
        return;
    }
    let head = cell.state.lock().claim_queue_head();
    if let Some((queued, claim)) = head {
        start_queued(Arc::clone(inner), Arc::clone(cell), queued, claim).await;
    }
}

/// Start a message taken off the queue with `claim_queue_head`. If the start
/// fails the message goes back to the head so queue order is kept.
pub(crate) async fn start_queued(
    inner: Arc<HubInner>,
    cell: Arc<SessionCell>,
    queued: QueuedMessage,
    claim: TurnClaim,
) {
    let message = StartMessage::from_queued(&queued);
    if let Err(e) = start_turn(inner, Arc::clone(&cell), claim, message).await {
        warn!(session_id = %cell.id, queued_id = %queued.id, error = %e, "queued message failed to start, returning it to the queue");
        let mut state = cell.state.lock();
        if !state.tearing_down {
            state.queue.push_front(queued.clone());
            state.publish(SessionEvent::MessageQueued {
                queued_message: queued,
            });
        }
    }
}

/// Start a turn on a session already claimed with `begin_run`. Shared by
/// `send` and auto-dequeue.
///
/// Boxed because the completion path it spawns can call back into it.
fn start_turn(
    inner: Arc<HubInner>,
    cell: Arc<SessionCell>,
    claim: TurnClaim,
    message: StartMessage,
) -> BoxFuture<'static, Result<TurnId, HubError>> {
    async move {
        let session_id = cell.id.clone();
        let TurnClaim { turn_id, tokens } = claim;

        let record = match inner.persistence.get_session(&session_id).await {
            Ok(record) => record,
            Err(e) => {
                abort_start(&cell, &tokens);
                return Err(load_error(&session_id, &e));
            }
        };

        if let Err(e) = inner.persistence.create_turn(&session_id, &turn_id).await {
            error!(%session_id, %turn_id, error = %e, "failed to create turn");
            abort_start(&cell, &tokens);
            return Err(HubError::chat(
                TURN_CREATE_FAILED,
                format!("failed to create turn: {e}"),
            ));
        }

        let user = ChatMessage::user(
            message.message_id.clone(),
            &message.content,
            message.parts.clone(),
        );
        let stored = inner
            .persistence
            .create_chat_message(NewChatMessage {
                session_id: session_id.clone(),
                turn_id: turn_id.clone(),
                seq: 0,
                message: user.clone(),
            })
            .await;
        let stored = match stored {
            Ok(stored) => stored,
            Err(e) => {
                error!(%session_id, %turn_id, error = %e, "failed to persist user message");
                close_turn(&inner, &turn_id).await;
                abort_start(&cell, &tokens);
                return Err(HubError::chat(
                    MESSAGE_PERSIST_FAILED,
                    format!("failed to persist message: {e}"),
                ));
            }
        };

        let resume_token = {
            let mut state = cell.state.lock();
            if state.tearing_down {
                None
            } else {
                state.turn_context = Some(TurnContext {
                    turn_id: turn_id.clone(),
                    message_id: message.message_id.clone(),
                    content: message.content.clone(),
                    parts: message.parts.clone(),
                    client_message_id: message.client_message_id.clone(),
                });
                state.buffer.clear();
                state.pending_actions.clear();
                state.accumulator = Some(MessageAccumulator::new());
                state.publish(SessionEvent::UserMessage {
                    message: user,
                    client_message_id: message.client_message_id.clone(),
                });
                state.publish(SessionEvent::SessionStarted {
                    turn_id: turn_id.clone(),
                    message_id: message.message_id.clone(),
                });
                Some(state.resume_token.clone().or(record.resume_token))
            }
        };
        let Some(resume_token) = resume_token else {
            close_turn(&inner, &turn_id).await;
            abort_start(&cell, &tokens);
            return Err(HubError::SessionNotFound(session_id));
        };

        inner.record_turn_started();
        let handle = TurnHandle {
            turn_id: turn_id.clone(),
            tokens: tokens.clone(),
            user_cursor: stored.cursor(),
            started_at: Instant::now(),
        };
        info!(%session_id, %turn_id, resumed = resume_token.is_some(), "turn started");

        if tokens.cancel.is_cancelled() {
            finish_turn(inner, cell, handle, TurnOutcome::interrupted(), true).await;
            return Ok(turn_id);
        }

        let prompt = AgentPrompt {
            content: message.content,
            parts: message.parts,
        };
        let options = RunOptions {
            cwd: Some(PathBuf::from(&record.cwd)).filter(|p| !p.as_os_str().is_empty()),
            resume_token,
        };
        let run = match inner.agent.run(prompt, options).await {
            Ok(run) => run,
            Err(e) => {
                error!(%session_id, %turn_id, kind = e.error_kind(), error = %e, "agent failed to start");
                finish_turn(inner, cell, handle, TurnOutcome::error(e.to_string()), false).await;
                return Err(HubError::chat(
                    AGENT_START_FAILED,
                    format!("failed to start agent: {e}"),
                ));
            }
        };

        let cancelled = {
            let mut state = cell.state.lock();
            if let Some(active) = state.run.as_mut() {
                active.control = Some(Arc::clone(&run.control));
            }
            tokens.cancel.is_cancelled()
        };
        if cancelled {
            if let Err(e) = run.control.cancel().await {
                warn!(%session_id, %turn_id, error = %e, "agent cancel failed");
            }
        }

        let _ = tokio::spawn(run_turn(inner, cell, handle, run.events));
        Ok(turn_id)
    }
    .boxed()
}

async fn close_turn(inner: &HubInner, turn_id: &TurnId) {
    if let Err(e) = inner
        .persistence
        .complete_turn(turn_id, CompletionReason::Error)
        .await
    {
        warn!(%turn_id, error = %e, "failed to close turn record");
    }
}
