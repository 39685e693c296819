use chrono::Utc;
use tracing::instrument;

use helm_core::ids::{SessionId, TurnId};
use helm_core::persistence::{CompletionReason, TurnRecord, TurnStatus};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

pub struct TurnRepo {
    db: Database,
}

impl TurnRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Open a new turn. Fails with `NotFound` if the session does not exist.
    pub fn create(&self, session_id: &SessionId) -> Result<TurnRecord, StoreError> {
        self.create_with_id(session_id, TurnId::new())
    }

    /// Open a turn under an id minted by the caller.
    #[instrument(skip(self), fields(session_id = %session_id, turn_id = %id))]
    pub fn create_with_id(
        &self,
        session_id: &SessionId,
        id: TurnId,
    ) -> Result<TurnRecord, StoreError> {
        let now = Utc::now().to_rfc3339();

        self.db.with_tx(|tx| {
            let exists: bool = tx.query_row(
                "SELECT EXISTS(SELECT 1 FROM sessions WHERE id = ?1)",
                [session_id.as_str()],
                |row| row.get(0),
            )?;
            if !exists {
                return Err(StoreError::NotFound(format!("session {session_id}")));
            }
            tx.execute(
                "INSERT INTO turns (id, session_id, status, created_at) VALUES (?1, ?2, 'open', ?3)",
                rusqlite::params![id.as_str(), session_id.as_str(), now],
            )?;
            Ok(TurnRecord {
                id,
                session_id: session_id.clone(),
                status: TurnStatus::Open,
                created_at: now,
                completed_at: None,
            })
        })
    }

    /// Close a turn with its completion reason.
    #[instrument(skip(self), fields(turn_id = %turn_id, reason = %reason))]
    pub fn complete(&self, turn_id: &TurnId, reason: CompletionReason) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE turns SET status = ?1, completed_at = ?2 WHERE id = ?3",
                rusqlite::params![TurnStatus::from(reason).to_string(), now, turn_id.as_str()],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("turn {turn_id}")));
            }
            Ok(())
        })
    }

    #[instrument(skip(self), fields(turn_id = %turn_id))]
    pub fn get(&self, turn_id: &TurnId) -> Result<TurnRecord, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, session_id, status, created_at, completed_at FROM turns WHERE id = ?1",
            )?;
            let mut rows = stmt.query([turn_id.as_str()])?;
            match rows.next()? {
                Some(row) => row_to_turn(row),
                None => Err(StoreError::NotFound(format!("turn {turn_id}"))),
            }
        })
    }

    /// Turns of a session, oldest first.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub fn list_for_session(&self, session_id: &SessionId) -> Result<Vec<TurnRecord>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, session_id, status, created_at, completed_at
                 FROM turns WHERE session_id = ?1 ORDER BY id",
            )?;
            let mut rows = stmt.query([session_id.as_str()])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push(row_to_turn(row)?);
            }
            Ok(out)
        })
    }

    /// Mark turns left open by a crash as interrupted. Returns how many were closed.
    #[instrument(skip(self))]
    pub fn close_stale(&self) -> Result<usize, StoreError> {
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            Ok(conn.execute(
                "UPDATE turns SET status = 'interrupted', completed_at = ?1 WHERE status = 'open'",
                [now],
            )?)
        })
    }
}

fn row_to_turn(row: &rusqlite::Row<'_>) -> Result<TurnRecord, StoreError> {
    let status: String = row_helpers::get(row, 2, "turns", "status")?;
    Ok(TurnRecord {
        id: TurnId::from_raw(row_helpers::get::<String>(row, 0, "turns", "id")?),
        session_id: SessionId::from_raw(row_helpers::get::<String>(row, 1, "turns", "session_id")?),
        status: row_helpers::parse_enum(&status, "turns", "status")?,
        created_at: row_helpers::get(row, 3, "turns", "created_at")?,
        completed_at: row_helpers::get_opt(row, 4, "turns", "completed_at")?,
    })
}
