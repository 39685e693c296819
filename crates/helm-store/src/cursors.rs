use tracing::instrument;

use helm_core::ids::{MessageId, SessionId};
use helm_core::persistence::HistoryCursor;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

pub struct CursorRepo {
    db: Database,
}

impl CursorRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self), fields(session_id = %session_id))]
    pub fn get(&self, session_id: &SessionId) -> Result<Option<HistoryCursor>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT message_id, timestamp FROM cursors WHERE session_id = ?1")?;
            let mut rows = stmt.query([session_id.as_str()])?;
            match rows.next()? {
                Some(row) => Ok(Some(HistoryCursor {
                    message_id: MessageId::from_raw(row_helpers::get::<String>(
                        row,
                        0,
                        "cursors",
                        "message_id",
                    )?),
                    timestamp: row_helpers::get(row, 1, "cursors", "timestamp")?,
                })),
                None => Ok(None),
            }
        })
    }

    #[instrument(skip(self, cursor), fields(session_id = %session_id, message_id = %cursor.message_id))]
    pub fn upsert(&self, session_id: &SessionId, cursor: &HistoryCursor) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO cursors (session_id, message_id, timestamp) VALUES (?1, ?2, ?3)
                 ON CONFLICT(session_id) DO UPDATE SET
                    message_id = excluded.message_id,
                    timestamp = excluded.timestamp",
                rusqlite::params![
                    session_id.as_str(),
                    cursor.message_id.as_str(),
                    cursor.timestamp
                ],
            )?;
            Ok(())
        })
    }
}
