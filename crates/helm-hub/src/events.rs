//! Events fanned out to session subscribers and the snapshot types they carry.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use helm_core::events::AgentEvent;
use helm_core::ids::{MessageId, QueuedMessageId, TurnId};
use helm_core::messages::{ChatMessage, MessagePart};
use helm_core::persistence::{CompletionReason, HistoryCursor};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    #[default]
    Idle,
    Streaming,
}

/// A message submitted while a turn was running. Immutable once queued.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedMessage {
    pub id: QueuedMessageId,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parts: Vec<MessagePart>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_message_id: Option<String>,
    pub queued_at: String,
}

/// The user message that opened the active turn.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnContext {
    pub turn_id: TurnId,
    pub message_id: MessageId,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parts: Vec<MessagePart>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_message_id: Option<String>,
}

/// An interactive tool call waiting for the user.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingAction {
    pub tool_call_id: String,
    pub tool_name: String,
    pub input: Value,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DequeueReason {
    /// Pulled off the queue to start the next turn.
    Started,
    /// Removed by an explicit dequeue request.
    Removed,
}

/// Read-only projection of a session's in-memory state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub status: SessionStatus,
    pub active_turn_id: Option<TurnId>,
    pub queue: Vec<QueuedMessage>,
    pub history_cursor: Option<HistoryCursor>,
    pub resume_token: Option<String>,
    pub pending_actions: Vec<PendingAction>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum SessionEvent {
    /// First item of every subscription.
    InitialState {
        snapshot: SessionSnapshot,
        /// Stream events of the active turn published so far.
        buffer: Vec<AgentEvent>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        turn_context: Option<TurnContext>,
    },
    UserMessage {
        message: ChatMessage,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_message_id: Option<String>,
    },
    SessionStarted {
        turn_id: TurnId,
        message_id: MessageId,
    },
    StreamEvent {
        turn_id: TurnId,
        event: AgentEvent,
    },
    SessionStopped {
        turn_id: TurnId,
        reason: CompletionReason,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    MessageQueued {
        queued_message: QueuedMessage,
    },
    MessageDequeued {
        message_id: QueuedMessageId,
        reason: DequeueReason,
    },
    ActionResolved {
        turn_id: TurnId,
        tool_call_id: String,
    },
    SessionDeleted,
}

impl SessionEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InitialState { .. } => "initial-state",
            Self::UserMessage { .. } => "user-message",
            Self::SessionStarted { .. } => "session-started",
            Self::StreamEvent { .. } => "stream-event",
            Self::SessionStopped { .. } => "session-stopped",
            Self::MessageQueued { .. } => "message-queued",
            Self::MessageDequeued { .. } => "message-dequeued",
            Self::ActionResolved { .. } => "action-resolved",
            Self::SessionDeleted => "session-deleted",
        }
    }
}
