use async_trait::async_trait;

use helm_core::errors::PersistenceError;
use helm_core::ids::{SessionId, TurnId};
use helm_core::persistence::{
    CompletionReason, HistoryCursor, NewChatMessage, NewSession, Persistence, SessionRecord,
    SessionUpdate, StoredMessage, TurnRecord,
};

use crate::chat_messages::ChatMessageRepo;
use crate::cursors::CursorRepo;
use crate::database::Database;
use crate::error::StoreError;
use crate::sessions::SessionRepo;
use crate::turns::TurnRepo;

/// [`Persistence`] over the SQLite repos. Each call runs on the blocking
/// pool so the async callers never hold the connection lock on a runtime
/// worker.
#[derive(Clone)]
pub struct SqlitePersistence {
    db: Database,
}

impl SqlitePersistence {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, PersistenceError>
    where
        F: FnOnce(Database) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || f(db))
            .await
            .map_err(|e| PersistenceError::Storage(format!("blocking task failed: {e}")))?
            .map_err(PersistenceError::from)
    }
}

#[async_trait]
impl Persistence for SqlitePersistence {
    async fn create_session(&self, new: NewSession) -> Result<SessionRecord, PersistenceError> {
        self.blocking(move |db| SessionRepo::new(db).create(&new)).await
    }

    async fn get_session(&self, id: &SessionId) -> Result<SessionRecord, PersistenceError> {
        let id = id.clone();
        self.blocking(move |db| SessionRepo::new(db).get(&id)).await
    }

    async fn list_sessions(
        &self,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<SessionRecord>, PersistenceError> {
        self.blocking(move |db| SessionRepo::new(db).list(limit, offset))
            .await
    }

    async fn update_session(
        &self,
        id: &SessionId,
        update: SessionUpdate,
    ) -> Result<(), PersistenceError> {
        if update.is_empty() {
            return Ok(());
        }
        let id = id.clone();
        self.blocking(move |db| SessionRepo::new(db).update(&id, &update))
            .await
    }

    async fn delete_session(&self, id: &SessionId) -> Result<(), PersistenceError> {
        let id = id.clone();
        self.blocking(move |db| match SessionRepo::new(db).delete(&id)? {
            true => Ok(()),
            false => Err(StoreError::NotFound(format!("session {id}"))),
        })
        .await
    }

    async fn create_turn(
        &self,
        session_id: &SessionId,
        turn_id: &TurnId,
    ) -> Result<TurnRecord, PersistenceError> {
        let session_id = session_id.clone();
        let turn_id = turn_id.clone();
        self.blocking(move |db| TurnRepo::new(db).create_with_id(&session_id, turn_id))
            .await
    }

    async fn complete_turn(
        &self,
        turn_id: &TurnId,
        reason: CompletionReason,
    ) -> Result<(), PersistenceError> {
        let turn_id = turn_id.clone();
        self.blocking(move |db| TurnRepo::new(db).complete(&turn_id, reason))
            .await
    }

    async fn create_chat_message(
        &self,
        message: NewChatMessage,
    ) -> Result<StoredMessage, PersistenceError> {
        self.blocking(move |db| ChatMessageRepo::new(db).create(&message))
            .await
    }

    async fn create_chat_messages(
        &self,
        messages: Vec<NewChatMessage>,
    ) -> Result<Vec<StoredMessage>, PersistenceError> {
        self.blocking(move |db| ChatMessageRepo::new(db).create_many(&messages))
            .await
    }

    async fn list_chat_messages(
        &self,
        session_id: &SessionId,
    ) -> Result<Vec<StoredMessage>, PersistenceError> {
        let session_id = session_id.clone();
        self.blocking(move |db| ChatMessageRepo::new(db).list_for_session(&session_id))
            .await
    }

    async fn get_cursor(
        &self,
        session_id: &SessionId,
    ) -> Result<Option<HistoryCursor>, PersistenceError> {
        let session_id = session_id.clone();
        self.blocking(move |db| CursorRepo::new(db).get(&session_id))
            .await
    }

    async fn upsert_cursor(
        &self,
        session_id: &SessionId,
        cursor: &HistoryCursor,
    ) -> Result<(), PersistenceError> {
        let session_id = session_id.clone();
        let cursor = cursor.clone();
        self.blocking(move |db| CursorRepo::new(db).upsert(&session_id, &cursor))
            .await
    }
}
