//! Per-session turn runtime.
//!
//! [`SessionHub`] serializes turns per session: a message sent while a turn
//! is streaming is queued and started automatically when the turn ends.
//! Every turn ends in exactly one `SessionStopped` event, whether it
//! completed, was interrupted or failed.

mod broadcast;
mod completion;
pub mod config;
pub mod error;
pub mod events;
mod hub;
mod processor;
mod state;

pub use broadcast::Subscription;
pub use config::HubConfig;
pub use error::{
    HubError, AGENT_START_FAILED, MESSAGE_PERSIST_FAILED, SESSION_LOAD_FAILED, TURN_CREATE_FAILED,
};
pub use events::{
    DequeueReason, PendingAction, QueuedMessage, SessionEvent, SessionSnapshot, SessionStatus,
    TurnContext,
};
pub use hub::{SendOutcome, SendRequest, SessionHub, ShutdownReport};
