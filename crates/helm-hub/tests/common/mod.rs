#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use helm_agent::{ScriptStep, ScriptedAgent, ScriptedResponse};
use helm_core::errors::PersistenceError;
use helm_core::events::AgentEvent;
use helm_core::ids::{SessionId, TurnId};
use helm_core::persistence::{
    CompletionReason, HistoryCursor, NewChatMessage, NewSession, Persistence, SessionRecord,
    SessionUpdate, StoredMessage, TurnRecord,
};
use helm_hub::{HubConfig, SessionEvent, SessionHub, Subscription};
use helm_store::{Database, SqlitePersistence};

pub struct Harness {
    pub hub: SessionHub,
    pub agent: Arc<ScriptedAgent>,
    pub store: Arc<FlakyPersistence>,
    pub session_id: SessionId,
}

pub async fn harness(responses: Vec<ScriptedResponse>) -> Harness {
    harness_with(ScriptedAgent::new(responses), HubConfig::default()).await
}

pub async fn harness_with(agent: ScriptedAgent, config: HubConfig) -> Harness {
    let agent = Arc::new(agent);
    let store = Arc::new(FlakyPersistence::new());
    let hub = SessionHub::new(agent.clone(), store.clone(), config);
    let session_id = new_session(&hub).await;
    Harness {
        hub,
        agent,
        store,
        session_id,
    }
}

pub async fn new_session(hub: &SessionHub) -> SessionId {
    hub.create_session(NewSession {
        title: Some("test".into()),
        cwd: "/tmp/project".into(),
    })
    .await
    .unwrap()
    .id
}

/// Text reply whose stream pauses for `pause` in the middle.
pub fn slow_text(text: &str, pause: Duration) -> ScriptedResponse {
    ScriptedResponse::Steps(vec![
        ScriptStep::Event(AgentEvent::Start {
            message_id: None,
            message_metadata: None,
        }),
        ScriptStep::Event(AgentEvent::TextStart { id: "t0".into() }),
        ScriptStep::Event(AgentEvent::TextDelta {
            id: "t0".into(),
            delta: text.into(),
        }),
        ScriptStep::Sleep(pause),
        ScriptStep::Event(AgentEvent::TextEnd { id: "t0".into() }),
        ScriptStep::Event(AgentEvent::Finish {
            message_metadata: None,
        }),
    ])
}

/// Receive until `pred` matches, returning everything received including
/// the match. Panics after five seconds.
pub async fn recv_until(
    sub: &mut Subscription,
    pred: impl Fn(&SessionEvent) -> bool,
) -> Vec<SessionEvent> {
    let mut seen = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), sub.recv())
            .await
            .unwrap_or_else(|_| panic!("timed out; received so far: {seen:#?}"))
            .unwrap_or_else(|| panic!("subscription closed; received so far: {seen:#?}"));
        let done = pred(&event);
        seen.push(event);
        if done {
            return seen;
        }
    }
}

pub fn is_stopped(event: &SessionEvent) -> bool {
    matches!(event, SessionEvent::SessionStopped { .. })
}

pub fn stopped_count(events: &[SessionEvent]) -> usize {
    events.iter().filter(|e| is_stopped(e)).count()
}

/// Wait until `n` turns have stopped.
pub async fn wait_stopped(sub: &mut Subscription, n: usize) -> Vec<SessionEvent> {
    let mut all = Vec::new();
    for _ in 0..n {
        all.extend(recv_until(sub, is_stopped).await);
    }
    all
}

/// Skip the initial state of a fresh subscription.
pub async fn subscribe(hub: &SessionHub, id: &SessionId) -> Subscription {
    let mut sub = hub.subscribe(id).await.unwrap();
    let first = sub.recv().await.unwrap();
    assert!(matches!(first, SessionEvent::InitialState { .. }));
    sub
}

/// In-memory SQLite persistence that can fail or stall selected operations.
pub struct FlakyPersistence {
    inner: SqlitePersistence,
    failing: Mutex<HashSet<&'static str>>,
    delays: Mutex<HashMap<&'static str, Duration>>,
}

impl FlakyPersistence {
    pub fn new() -> Self {
        Self {
            inner: SqlitePersistence::new(Database::in_memory().unwrap()),
            failing: Mutex::new(HashSet::new()),
            delays: Mutex::new(HashMap::new()),
        }
    }

    pub fn fail(&self, op: &'static str) {
        self.failing.lock().insert(op);
    }

    pub fn heal(&self, op: &'static str) {
        self.failing.lock().remove(op);
    }

    pub fn delay(&self, op: &'static str, by: Duration) {
        self.delays.lock().insert(op, by);
    }

    pub fn database(&self) -> &Database {
        self.inner.database()
    }

    async fn gate(&self, op: &'static str) -> Result<(), PersistenceError> {
        let delay = self.delays.lock().get(op).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.lock().contains(op) {
            return Err(PersistenceError::Storage(format!("{op} unavailable")));
        }
        Ok(())
    }
}

#[async_trait]
impl Persistence for FlakyPersistence {
    async fn create_session(&self, new: NewSession) -> Result<SessionRecord, PersistenceError> {
        self.gate("create_session").await?;
        self.inner.create_session(new).await
    }

    async fn get_session(&self, id: &SessionId) -> Result<SessionRecord, PersistenceError> {
        self.gate("get_session").await?;
        self.inner.get_session(id).await
    }

    async fn list_sessions(
        &self,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<SessionRecord>, PersistenceError> {
        self.gate("list_sessions").await?;
        self.inner.list_sessions(limit, offset).await
    }

    async fn update_session(
        &self,
        id: &SessionId,
        update: SessionUpdate,
    ) -> Result<(), PersistenceError> {
        self.gate("update_session").await?;
        self.inner.update_session(id, update).await
    }

    async fn delete_session(&self, id: &SessionId) -> Result<(), PersistenceError> {
        self.gate("delete_session").await?;
        self.inner.delete_session(id).await
    }

    async fn create_turn(
        &self,
        session_id: &SessionId,
        turn_id: &TurnId,
    ) -> Result<TurnRecord, PersistenceError> {
        self.gate("create_turn").await?;
        self.inner.create_turn(session_id, turn_id).await
    }

    async fn complete_turn(
        &self,
        turn_id: &TurnId,
        reason: CompletionReason,
    ) -> Result<(), PersistenceError> {
        self.gate("complete_turn").await?;
        self.inner.complete_turn(turn_id, reason).await
    }

    async fn create_chat_message(
        &self,
        message: NewChatMessage,
    ) -> Result<StoredMessage, PersistenceError> {
        self.gate("create_chat_message").await?;
        self.inner.create_chat_message(message).await
    }

    async fn create_chat_messages(
        &self,
        messages: Vec<NewChatMessage>,
    ) -> Result<Vec<StoredMessage>, PersistenceError> {
        self.gate("create_chat_messages").await?;
        self.inner.create_chat_messages(messages).await
    }

    async fn list_chat_messages(
        &self,
        session_id: &SessionId,
    ) -> Result<Vec<StoredMessage>, PersistenceError> {
        self.gate("list_chat_messages").await?;
        self.inner.list_chat_messages(session_id).await
    }

    async fn get_cursor(
        &self,
        session_id: &SessionId,
    ) -> Result<Option<HistoryCursor>, PersistenceError> {
        self.gate("get_cursor").await?;
        self.inner.get_cursor(session_id).await
    }

    async fn upsert_cursor(
        &self,
        session_id: &SessionId,
        cursor: &HistoryCursor,
    ) -> Result<(), PersistenceError> {
        self.gate("upsert_cursor").await?;
        self.inner.upsert_cursor(session_id, cursor).await
    }
}
