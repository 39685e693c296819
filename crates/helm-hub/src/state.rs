//! In-memory state of one session.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use helm_core::agent::AgentControl;
use helm_core::events::AgentEvent;
use helm_core::ids::{SessionId, TurnId};
use helm_core::persistence::HistoryCursor;
use helm_core::MessageAccumulator;

use crate::broadcast::{Broadcaster, Subscription};
use crate::events::{
    DequeueReason, PendingAction, QueuedMessage, SessionEvent, SessionSnapshot, SessionStatus, TurnContext,
};

/// Table entry for one session. All fields of [`SessionState`] are read and
/// written under `state`; the lock is never held across an `.await`.
pub(crate) struct SessionCell {
    pub(crate) id: SessionId,
    pub(crate) state: Mutex<SessionState>,
}

impl SessionCell {
    pub(crate) fn new(
        id: SessionId,
        history_cursor: Option<HistoryCursor>,
        resume_token: Option<String>,
    ) -> Self {
        Self {
            id,
            state: Mutex::new(SessionState {
                history_cursor,
                resume_token,
                ..SessionState::default()
            }),
        }
    }
}

/// Signals shared between a running turn and anyone waiting on it.
#[derive(Clone, Debug, Default)]
pub(crate) struct RunTokens {
    /// Fired to ask the processor to stop.
    pub(crate) cancel: CancellationToken,
    /// Fired once the turn's completion path has run.
    pub(crate) finished: CancellationToken,
}

/// A session claimed for a turn that has not reached the agent yet.
#[derive(Debug)]
pub(crate) struct TurnClaim {
    pub(crate) turn_id: TurnId,
    pub(crate) tokens: RunTokens,
}

pub(crate) struct ActiveRun {
    pub(crate) tokens: RunTokens,
    /// Set once the agent accepted the run.
    pub(crate) control: Option<Arc<dyn AgentControl>>,
}

#[derive(Default)]
pub(crate) struct SessionState {
    pub(crate) status: SessionStatus,
    pub(crate) active_turn_id: Option<TurnId>,
    pub(crate) queue: VecDeque<QueuedMessage>,
    pub(crate) history_cursor: Option<HistoryCursor>,
    /// Stream events of the active turn, in publish order.
    pub(crate) buffer: Vec<AgentEvent>,
    pub(crate) turn_context: Option<TurnContext>,
    pub(crate) accumulator: Option<MessageAccumulator>,
    pub(crate) resume_token: Option<String>,
    pub(crate) run: Option<ActiveRun>,
    pub(crate) pending_actions: Vec<PendingAction>,
    pub(crate) broadcaster: Broadcaster,
    /// Set by deletion; a turn finishing afterwards skips persistence.
    pub(crate) tearing_down: bool,
}

impl SessionState {
    /// Claim the session for a new turn. Callers check `status` first. The
    /// turn id is known from here on, so a streaming session always reports
    /// one.
    pub(crate) fn begin_run(&mut self) -> TurnClaim {
        let claim = TurnClaim {
            turn_id: TurnId::new(),
            tokens: RunTokens::default(),
        };
        self.status = SessionStatus::Streaming;
        self.active_turn_id = Some(claim.turn_id.clone());
        self.run = Some(ActiveRun {
            tokens: claim.tokens.clone(),
            control: None,
        });
        claim
    }

    /// Pop the head of the queue and claim the session for it. `None` when
    /// the session is busy, going away or has nothing queued.
    pub(crate) fn claim_queue_head(&mut self) -> Option<(QueuedMessage, TurnClaim)> {
        if self.status != SessionStatus::Idle || self.tearing_down {
            return None;
        }
        let queued = self.queue.pop_front()?;
        let claim = self.begin_run();
        self.publish(SessionEvent::MessageDequeued {
            message_id: queued.id.clone(),
            reason: DequeueReason::Started,
        });
        Some((queued, claim))
    }

    /// Drop everything tied to the finished turn. The queue, cursor and
    /// resume token survive.
    pub(crate) fn reset_idle(&mut self) {
        self.status = SessionStatus::Idle;
        self.active_turn_id = None;
        self.buffer.clear();
        self.turn_context = None;
        self.accumulator = None;
        self.run = None;
        self.pending_actions.clear();
    }

    pub(crate) fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            status: self.status,
            active_turn_id: self.active_turn_id.clone(),
            queue: self.queue.iter().cloned().collect(),
            history_cursor: self.history_cursor.clone(),
            resume_token: self.resume_token.clone(),
            pending_actions: self.pending_actions.clone(),
        }
    }

    pub(crate) fn publish(&mut self, event: SessionEvent) {
        self.broadcaster.publish(&event);
    }

    /// Register a subscriber; its first item reflects the state right now.
    pub(crate) fn subscribe(&mut self) -> Subscription {
        let initial = SessionEvent::InitialState {
            snapshot: self.snapshot(),
            buffer: self.buffer.clone(),
            turn_context: self.turn_context.clone(),
        };
        self.broadcaster.subscribe(initial)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use helm_core::ids::QueuedMessageId;

    fn queued(id: &str) -> QueuedMessage {
        QueuedMessage {
            id: QueuedMessageId::from_raw(id),
            content: id.into(),
            parts: vec![],
            client_message_id: None,
            queued_at: "2026-01-01T00:00:00Z".into(),
        }
    }

    #[test]
    fn begin_run_then_reset() {
        let mut state = SessionState::default();
        let claim = state.begin_run();
        assert_eq!(state.status, SessionStatus::Streaming);
        assert_eq!(state.active_turn_id.as_ref(), Some(&claim.turn_id));
        assert!(!claim.tokens.cancel.is_cancelled());

        state.buffer.push(AgentEvent::Unknown);
        state.queue.push_back(queued("q1"));
        state.resume_token = Some("r".into());
        state.reset_idle();

        assert_eq!(state.status, SessionStatus::Idle);
        assert!(state.active_turn_id.is_none());
        assert!(state.buffer.is_empty());
        assert!(state.run.is_none());
        assert_eq!(state.queue.len(), 1);
        assert_eq!(state.resume_token.as_deref(), Some("r"));
    }

    #[tokio::test]
    async fn subscribe_captures_buffer_and_context() {
        let mut state = SessionState::default();
        let _ = state.begin_run();
        state.buffer.push(AgentEvent::TextStart { id: "t".into() });
        let mut sub = state.subscribe();

        match sub.recv().await {
            Some(SessionEvent::InitialState {
                snapshot, buffer, ..
            }) => {
                assert_eq!(snapshot.status, SessionStatus::Streaming);
                assert_eq!(buffer, vec![AgentEvent::TextStart { id: "t".into() }]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn claim_queue_head_takes_the_oldest() {
        let mut state = SessionState::default();
        assert!(state.claim_queue_head().is_none());

        state.queue.push_back(queued("a"));
        state.queue.push_back(queued("b"));
        let mut sub = state.subscribe();
        let _ = sub.try_recv();

        let (head, claim) = state.claim_queue_head().unwrap();
        assert_eq!(head.id.as_str(), "a");
        assert_eq!(state.status, SessionStatus::Streaming);
        assert_eq!(state.active_turn_id.as_ref(), Some(&claim.turn_id));
        assert_eq!(state.queue.len(), 1);
        assert!(matches!(
            sub.try_recv(),
            Some(SessionEvent::MessageDequeued {
                reason: DequeueReason::Started,
                ..
            })
        ));

        // Busy sessions keep their queue.
        assert!(state.claim_queue_head().is_none());
        assert_eq!(state.queue.len(), 1);
    }

    #[test]
    fn snapshot_preserves_queue_order() {
        let mut state = SessionState::default();
        state.queue.push_back(queued("a"));
        state.queue.push_back(queued("b"));
        let ids: Vec<_> = state
            .snapshot()
            .queue
            .into_iter()
            .map(|q| q.id.as_str().to_owned())
            .collect();
        assert_eq!(ids, ["a", "b"]);
    }
}
