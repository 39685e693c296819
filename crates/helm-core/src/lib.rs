//! Shared types and collaborator traits for the helm session runtime.

pub mod accumulator;
pub mod agent;
pub mod errors;
pub mod events;
pub mod ids;
pub mod messages;
pub mod partial_json;
pub mod persistence;
pub mod usage;

pub use accumulator::MessageAccumulator;
pub use agent::{AgentControl, AgentEventStream, AgentGateway, AgentPrompt, AgentRun, RunOptions};
pub use errors::{AgentError, PersistenceError};
pub use events::AgentEvent;
pub use ids::{MessageId, QueuedMessageId, SessionId, TurnId};
pub use messages::{ChatMessage, MessagePart, Role};
pub use persistence::{
    CompletionReason, HistoryCursor, NewChatMessage, NewSession, Persistence, SessionRecord,
    SessionUpdate, StoredMessage, TurnRecord, TurnStatus,
};
pub use usage::{TurnUsage, UsageTotals};
