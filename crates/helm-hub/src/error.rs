use helm_core::errors::{AgentError, PersistenceError};
use helm_core::ids::SessionId;

pub const SESSION_LOAD_FAILED: &str = "SESSION_LOAD_FAILED";
pub const TURN_CREATE_FAILED: &str = "TURN_CREATE_FAILED";
pub const MESSAGE_PERSIST_FAILED: &str = "MESSAGE_PERSIST_FAILED";
pub const AGENT_START_FAILED: &str = "AGENT_START_FAILED";

#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("session not found: {0}")]
    SessionNotFound(SessionId),

    #[error("no pending action {tool_call_id} in session {session_id}")]
    NoPendingAction {
        session_id: SessionId,
        tool_call_id: String,
    },

    /// A turn could not be started. `code` is one of the `*_FAILED` constants.
    #[error("{message}")]
    ChatOperation { message: String, code: &'static str },

    #[error(transparent)]
    AgentStream(#[from] AgentError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

impl HubError {
    pub(crate) fn chat(code: &'static str, message: impl Into<String>) -> Self {
        Self::ChatOperation {
            message: message.into(),
            code,
        }
    }

    /// Stable error code for the transport layer.
    pub fn code(&self) -> &'static str {
        match self {
            Self::SessionNotFound(_) => "SESSION_NOT_FOUND",
            Self::NoPendingAction { .. } => "NO_PENDING_ACTION",
            Self::ChatOperation { code, .. } => code,
            Self::AgentStream(_) => "AGENT_ERROR",
            Self::Persistence(_) => "PERSISTENCE_ERROR",
        }
    }
}
