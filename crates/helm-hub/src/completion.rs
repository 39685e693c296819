//! The single exit path of every turn that reached the agent or was torn
//! down after its start was announced.

use std::sync::Arc;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use helm_core::ids::TurnId;
use helm_core::persistence::{CompletionReason, HistoryCursor, NewChatMessage, SessionUpdate};
use helm_core::usage::{resume_token_from_metadata, TurnUsage};

use crate::events::SessionEvent;
use crate::hub::{start_queued, HubInner};
use crate::state::{RunTokens, SessionCell};

/// Sequence number of the assistant message within a turn; the user
/// message is 0.
const ASSISTANT_SEQ: u32 = 1;

/// What the processor hands to the completion path.
#[derive(Debug)]
pub(crate) struct TurnHandle {
    pub(crate) turn_id: TurnId,
    pub(crate) tokens: RunTokens,
    /// Cursor of the persisted user message.
    pub(crate) user_cursor: HistoryCursor,
    pub(crate) started_at: Instant,
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct TurnOutcome {
    pub(crate) reason: CompletionReason,
    pub(crate) error: Option<String>,
}

impl TurnOutcome {
    pub(crate) fn completed() -> Self {
        Self {
            reason: CompletionReason::Completed,
            error: None,
        }
    }

    pub(crate) fn interrupted() -> Self {
        Self {
            reason: CompletionReason::Interrupted,
            error: None,
        }
    }

    pub(crate) fn error(message: impl Into<String>) -> Self {
        Self {
            reason: CompletionReason::Error,
            error: Some(message.into()),
        }
    }
}

/// Persist what the turn produced, announce the stop, return the session to
/// idle and, when `dequeue_next` holds, start the head of the queue.
///
/// Runs exactly once per turn. Persistence failures are logged and never
/// prevent the session from going idle.
pub(crate) async fn finish_turn(
    inner: Arc<HubInner>,
    cell: Arc<SessionCell>,
    turn: TurnHandle,
    outcome: TurnOutcome,
    dequeue_next: bool,
) {
    let session_id = cell.id.clone();
    let taken = {
        let mut state = cell.state.lock();
        if state.tearing_down {
            state.reset_idle();
            None
        } else {
            let accumulator = state.accumulator.take();
            let metadata = accumulator.as_ref().and_then(|a| a.metadata().cloned());
            let message = accumulator.filter(|a| a.has_content()).map(|a| a.message());
            Some((message, metadata, state.resume_token.clone()))
        }
    };
    let Some((message, metadata, known_token)) = taken else {
        debug!(%session_id, turn_id = %turn.turn_id, "session deleted, skipping turn completion");
        turn.tokens.finished.cancel();
        inner.record_turn_finished(outcome.reason, &turn);
        return;
    };

    let mut cursor = turn.user_cursor.clone();
    if let Some(message) = message {
        let rows = vec![NewChatMessage {
            session_id: session_id.clone(),
            turn_id: turn.turn_id.clone(),
            seq: ASSISTANT_SEQ,
            message,
        }];
        match inner.persistence.create_chat_messages(rows).await {
            Ok(stored) => {
                if let Some(last) = stored.last() {
                    cursor = last.cursor();
                }
            }
            Err(e) => {
                warn!(%session_id, turn_id = %turn.turn_id, error = %e, "failed to persist assistant message");
            }
        }
    }
    if let Err(e) = inner.persistence.upsert_cursor(&session_id, &cursor).await {
        warn!(%session_id, error = %e, "failed to update history cursor");
    }

    let usage = metadata.as_ref().and_then(TurnUsage::from_metadata);
    let discovered = metadata
        .as_ref()
        .and_then(resume_token_from_metadata)
        .filter(|token| known_token.as_deref() != Some(token.as_str()));
    let update = SessionUpdate {
        resume_token: discovered.clone(),
        usage,
        title: None,
    };
    if !update.is_empty() {
        if let Err(e) = inner.persistence.update_session(&session_id, update).await {
            warn!(%session_id, error = %e, "failed to record turn usage");
        }
    }

    if let Err(e) = inner
        .persistence
        .complete_turn(&turn.turn_id, outcome.reason)
        .await
    {
        warn!(%session_id, turn_id = %turn.turn_id, error = %e, "failed to close turn record");
    }

    let next = {
        let mut state = cell.state.lock();
        if let Some(token) = discovered {
            state.resume_token = Some(token);
        }
        state.history_cursor = Some(cursor);
        if state.tearing_down {
            state.reset_idle();
            None
        } else {
            state.publish(SessionEvent::SessionStopped {
                turn_id: turn.turn_id.clone(),
                reason: outcome.reason,
                error: outcome.error.clone(),
            });
            state.reset_idle();
            if dequeue_next && !inner.is_shutting_down() {
                state.claim_queue_head()
            } else {
                None
            }
        }
    };

    info!(
        %session_id,
        turn_id = %turn.turn_id,
        reason = %outcome.reason,
        elapsed_ms = u64::try_from(turn.started_at.elapsed().as_millis()).unwrap_or(u64::MAX),
        "turn finished"
    );
    turn.tokens.finished.cancel();
    inner.record_turn_finished(outcome.reason, &turn);

    let Some((queued, claim)) = next else {
        return;
    };
    debug!(%session_id, queued_id = %queued.id, "starting queued message");
    start_queued(inner, cell, queued, claim).await;
}
