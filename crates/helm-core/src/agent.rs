use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde_json::Value;

use crate::errors::AgentError;
use crate::events::AgentEvent;
use crate::messages::MessagePart;

pub type AgentEventStream = BoxStream<'static, Result<AgentEvent, AgentError>>;

/// What the agent is asked to do in one turn.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AgentPrompt {
    pub content: String,
    pub parts: Vec<MessagePart>,
}

impl AgentPrompt {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            parts: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct RunOptions {
    pub cwd: Option<PathBuf>,
    /// Resumable session id from a previous turn.
    pub resume_token: Option<String>,
}

/// Handle for steering a run that is in progress.
#[async_trait]
pub trait AgentControl: Send + Sync {
    /// Ask the agent to stop. Best-effort; the event stream may still yield
    /// a few events before ending.
    async fn cancel(&self) -> Result<(), AgentError>;

    /// Answer an interactive tool call (a question or an approval).
    async fn respond(&self, tool_call_id: &str, response: Value) -> Result<(), AgentError> {
        let _ = (tool_call_id, response);
        Err(AgentError::Unsupported("respond"))
    }
}

/// A started agent run: its event stream plus the control handle.
pub struct AgentRun {
    pub events: AgentEventStream,
    pub control: Arc<dyn AgentControl>,
}

impl std::fmt::Debug for AgentRun {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRun").finish_non_exhaustive()
    }
}

/// Starts agent runs. Implementations must be cheap to share across sessions.
#[async_trait]
pub trait AgentGateway: Send + Sync {
    async fn run(&self, prompt: AgentPrompt, options: RunOptions) -> Result<AgentRun, AgentError>;
}
