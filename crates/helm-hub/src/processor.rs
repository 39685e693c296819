//! Drives one agent run: consumes its event stream until it ends, fails or
//! is cancelled, then hands off to the completion path.

use std::sync::Arc;

use futures::StreamExt;
use tracing::{debug, error, warn};

use helm_core::agent::AgentEventStream;
use helm_core::events::AgentEvent;
use helm_core::persistence::SessionUpdate;

use crate::completion::{finish_turn, TurnHandle, TurnOutcome};
use crate::events::{PendingAction, SessionEvent};
use crate::hub::HubInner;
use crate::state::SessionCell;

pub(crate) async fn run_turn(
    inner: Arc<HubInner>,
    cell: Arc<SessionCell>,
    turn: TurnHandle,
    mut events: AgentEventStream,
) {
    let cancel = turn.tokens.cancel.clone();
    let outcome = loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                debug!(session_id = %cell.id, turn_id = %turn.turn_id, "turn cancelled");
                break TurnOutcome::interrupted();
            }
            next = events.next() => match next {
                None => break TurnOutcome::completed(),
                Some(Ok(event)) => {
                    if let AgentEvent::SessionStarted { resume_token } = &event {
                        persist_resume_token(&inner, &cell, resume_token).await;
                    }
                    let reported = match &event {
                        AgentEvent::Error { error_text } => Some(error_text.clone()),
                        _ => None,
                    };
                    apply_event(&inner, &cell, &turn, event);
                    if let Some(error_text) = reported {
                        error!(session_id = %cell.id, turn_id = %turn.turn_id, error = %error_text, "agent reported an error");
                        break TurnOutcome::error(error_text);
                    }
                }
                Some(Err(e)) => {
                    error!(
                        session_id = %cell.id,
                        turn_id = %turn.turn_id,
                        kind = e.error_kind(),
                        error = %e,
                        "agent stream failed"
                    );
                    break TurnOutcome::error(e.to_string());
                }
            }
        }
    };
    drop(events);
    finish_turn(inner, cell, turn, outcome, true).await;
}

/// Feed the accumulator, track interactive tool calls, buffer and publish.
/// All under one lock so subscribers never see a gap.
fn apply_event(inner: &HubInner, cell: &SessionCell, turn: &TurnHandle, event: AgentEvent) {
    let mut state = cell.state.lock();
    if state.active_turn_id.as_ref() != Some(&turn.turn_id) {
        return;
    }
    if let Some(accumulator) = state.accumulator.as_mut() {
        accumulator.process_event(&event);
    }
    match &event {
        AgentEvent::ToolInputAvailable {
            tool_call_id,
            tool_name,
            input,
        } if inner.config.interactive_tools.contains(tool_name) => {
            if !state
                .pending_actions
                .iter()
                .any(|a| &a.tool_call_id == tool_call_id)
            {
                state.pending_actions.push(PendingAction {
                    tool_call_id: tool_call_id.clone(),
                    tool_name: tool_name.clone(),
                    input: input.clone(),
                });
            }
        }
        AgentEvent::ToolInputError { tool_call_id, .. }
        | AgentEvent::ToolOutputAvailable { tool_call_id, .. }
        | AgentEvent::ToolOutputError { tool_call_id, .. }
        | AgentEvent::ToolOutputDenied { tool_call_id } => {
            state.pending_actions.retain(|a| &a.tool_call_id != tool_call_id);
        }
        _ => {}
    }
    state.buffer.push(event.clone());
    state.publish(SessionEvent::StreamEvent {
        turn_id: turn.turn_id.clone(),
        event,
    });
}

async fn persist_resume_token(inner: &HubInner, cell: &SessionCell, token: &str) {
    {
        let mut state = cell.state.lock();
        if state.resume_token.as_deref() == Some(token) {
            return;
        }
        state.resume_token = Some(token.to_owned());
    }
    let update = SessionUpdate {
        resume_token: Some(token.to_owned()),
        ..SessionUpdate::default()
    };
    if let Err(e) = inner.persistence.update_session(&cell.id, update).await {
        warn!(session_id = %cell.id, error = %e, "failed to persist resume token");
    }
}
