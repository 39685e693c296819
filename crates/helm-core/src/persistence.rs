use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::PersistenceError;
use crate::ids::{MessageId, SessionId, TurnId};
use crate::messages::ChatMessage;
use crate::usage::{TurnUsage, UsageTotals};

/// Why a turn ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionReason {
    Completed,
    Interrupted,
    Error,
}

impl CompletionReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Interrupted => "interrupted",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for CompletionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnStatus {
    Open,
    Completed,
    Interrupted,
    Error,
}

impl From<CompletionReason> for TurnStatus {
    fn from(r: CompletionReason) -> Self {
        match r {
            CompletionReason::Completed => Self::Completed,
            CompletionReason::Interrupted => Self::Interrupted,
            CompletionReason::Error => Self::Error,
        }
    }
}

impl std::fmt::Display for TurnStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open => write!(f, "open"),
            Self::Completed => write!(f, "completed"),
            Self::Interrupted => write!(f, "interrupted"),
            Self::Error => write!(f, "error"),
        }
    }
}

impl std::str::FromStr for TurnStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(Self::Open),
            "completed" => Ok(Self::Completed),
            "interrupted" => Ok(Self::Interrupted),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown turn status: {other}")),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub id: SessionId,
    pub title: Option<String>,
    pub cwd: String,
    pub resume_token: Option<String>,
    pub usage: UsageTotals,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct NewSession {
    pub title: Option<String>,
    pub cwd: String,
}

/// Partial update of a session summary. `usage` is a per-turn delta added to
/// the stored totals.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SessionUpdate {
    pub resume_token: Option<String>,
    pub usage: Option<TurnUsage>,
    pub title: Option<String>,
}

impl SessionUpdate {
    pub fn is_empty(&self) -> bool {
        self.resume_token.is_none() && self.usage.is_none() && self.title.is_none()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnRecord {
    pub id: TurnId,
    pub session_id: SessionId,
    pub status: TurnStatus,
    pub created_at: String,
    pub completed_at: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct NewChatMessage {
    pub session_id: SessionId,
    pub turn_id: TurnId,
    pub seq: u32,
    pub message: ChatMessage,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredMessage {
    pub turn_id: TurnId,
    pub seq: u32,
    pub message: ChatMessage,
    pub created_at: String,
}

/// Position of the last persisted message of a session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryCursor {
    pub message_id: MessageId,
    pub timestamp: String,
}

impl StoredMessage {
    pub fn cursor(&self) -> HistoryCursor {
        HistoryCursor {
            message_id: self.message.id.clone(),
            timestamp: self.created_at.clone(),
        }
    }
}

/// Durable storage contract used by the session hub.
///
/// Every method may fail independently; callers decide which failures are
/// fatal to the operation at hand.
#[async_trait]
pub trait Persistence: Send + Sync {
    async fn create_session(&self, new: NewSession) -> Result<SessionRecord, PersistenceError>;
    async fn get_session(&self, id: &SessionId) -> Result<SessionRecord, PersistenceError>;
    async fn list_sessions(&self, limit: u32, offset: u32)
        -> Result<Vec<SessionRecord>, PersistenceError>;
    async fn update_session(
        &self,
        id: &SessionId,
        update: SessionUpdate,
    ) -> Result<(), PersistenceError>;
    async fn delete_session(&self, id: &SessionId) -> Result<(), PersistenceError>;

    /// Open a turn under `turn_id`, which the hub mints when it claims the
    /// session.
    async fn create_turn(
        &self,
        session_id: &SessionId,
        turn_id: &TurnId,
    ) -> Result<TurnRecord, PersistenceError>;
    async fn complete_turn(
        &self,
        turn_id: &TurnId,
        reason: CompletionReason,
    ) -> Result<(), PersistenceError>;

    async fn create_chat_message(
        &self,
        message: NewChatMessage,
    ) -> Result<StoredMessage, PersistenceError>;
    /// Insert a batch in one transaction: all rows or none.
    async fn create_chat_messages(
        &self,
        messages: Vec<NewChatMessage>,
    ) -> Result<Vec<StoredMessage>, PersistenceError>;
    async fn list_chat_messages(
        &self,
        session_id: &SessionId,
    ) -> Result<Vec<StoredMessage>, PersistenceError>;

    async fn get_cursor(
        &self,
        session_id: &SessionId,
    ) -> Result<Option<HistoryCursor>, PersistenceError>;
    async fn upsert_cursor(
        &self,
        session_id: &SessionId,
        cursor: &HistoryCursor,
    ) -> Result<(), PersistenceError>;
}
