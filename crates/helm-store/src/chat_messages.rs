use chrono::Utc;
use rusqlite::Connection;
use tracing::instrument;

use helm_core::ids::{MessageId, SessionId, TurnId};
use helm_core::messages::{ChatMessage, Role};
use helm_core::persistence::{NewChatMessage, StoredMessage};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

pub struct ChatMessageRepo {
    db: Database,
}

impl ChatMessageRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self, msg), fields(turn_id = %msg.turn_id, seq = msg.seq))]
    pub fn create(&self, msg: &NewChatMessage) -> Result<StoredMessage, StoreError> {
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| insert(conn, msg, &now))
    }

    /// Insert a batch atomically, sharing one timestamp.
    #[instrument(skip(self, msgs), fields(count = msgs.len()))]
    pub fn create_many(&self, msgs: &[NewChatMessage]) -> Result<Vec<StoredMessage>, StoreError> {
        if msgs.is_empty() {
            return Ok(Vec::new());
        }
        let now = Utc::now().to_rfc3339();
        self.db
            .with_tx(|tx| msgs.iter().map(|m| insert(tx, m, &now)).collect())
    }

    /// All messages of a session in conversation order.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub fn list_for_session(&self, session_id: &SessionId) -> Result<Vec<StoredMessage>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, turn_id, seq, role, parts, metadata, created_at
                 FROM chat_messages WHERE session_id = ?1 ORDER BY turn_id, seq",
            )?;
            let mut rows = stmt.query([session_id.as_str()])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push(row_to_message(row)?);
            }
            Ok(out)
        })
    }
}

fn insert(conn: &Connection, msg: &NewChatMessage, now: &str) -> Result<StoredMessage, StoreError> {
    let parts = serde_json::to_string(&msg.message.parts)?;
    let metadata = msg
        .message
        .metadata
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;
    conn.execute(
        "INSERT INTO chat_messages (id, session_id, turn_id, seq, role, parts, metadata, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        rusqlite::params![
            msg.message.id.as_str(),
            msg.session_id.as_str(),
            msg.turn_id.as_str(),
            msg.seq,
            msg.message.role.to_string(),
            parts,
            metadata,
            now,
        ],
    )?;
    Ok(StoredMessage {
        turn_id: msg.turn_id.clone(),
        seq: msg.seq,
        message: msg.message.clone(),
        created_at: now.to_owned(),
    })
}

fn row_to_message(row: &rusqlite::Row<'_>) -> Result<StoredMessage, StoreError> {
    let role: String = row_helpers::get(row, 3, "chat_messages", "role")?;
    let parts: String = row_helpers::get(row, 4, "chat_messages", "parts")?;
    let metadata: Option<String> = row_helpers::get_opt(row, 5, "chat_messages", "metadata")?;
    Ok(StoredMessage {
        turn_id: TurnId::from_raw(row_helpers::get::<String>(row, 1, "chat_messages", "turn_id")?),
        seq: row_helpers::get(row, 2, "chat_messages", "seq")?,
        message: ChatMessage {
            id: MessageId::from_raw(row_helpers::get::<String>(row, 0, "chat_messages", "id")?),
            role: row_helpers::parse_enum::<Role>(&role, "chat_messages", "role")?,
            parts: row_helpers::parse_json(&parts, "chat_messages", "parts")?,
            metadata: metadata
                .map(|m| row_helpers::parse_json(&m, "chat_messages", "metadata"))
                .transpose()?,
        },
        created_at: row_helpers::get(row, 6, "chat_messages", "created_at")?,
    })
}
