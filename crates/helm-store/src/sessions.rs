use chrono::Utc;
use tracing::instrument;

use helm_core::ids::SessionId;
use helm_core::persistence::{NewSession, SessionRecord, SessionUpdate};
use helm_core::usage::UsageTotals;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

const SELECT_COLUMNS: &str = "SELECT id, title, cwd, resume_token,
        total_input_tokens, total_output_tokens, total_cache_read_tokens,
        total_cache_creation_tokens, total_cost_usd, turn_count, created_at, updated_at
 FROM sessions";

pub struct SessionRepo {
    db: Database,
}

impl SessionRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self, new), fields(cwd = %new.cwd))]
    pub fn create(&self, new: &NewSession) -> Result<SessionRecord, StoreError> {
        let id = SessionId::new();
        let now = Utc::now().to_rfc3339();

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO sessions (id, title, cwd, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![id.as_str(), new.title, new.cwd, now, now],
            )?;

            Ok(SessionRecord {
                id,
                title: new.title.clone(),
                cwd: new.cwd.clone(),
                resume_token: None,
                usage: UsageTotals::default(),
                created_at: now.clone(),
                updated_at: now,
            })
        })
    }

    #[instrument(skip(self), fields(session_id = %id))]
    pub fn get(&self, id: &SessionId) -> Result<SessionRecord, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!("{SELECT_COLUMNS} WHERE id = ?1"))?;
            let mut rows = stmt.query([id.as_str()])?;
            match rows.next()? {
                Some(row) => row_to_session(row),
                None => Err(StoreError::NotFound(format!("session {id}"))),
            }
        })
    }

    /// Most recently updated first.
    #[instrument(skip(self))]
    pub fn list(&self, limit: u32, offset: u32) -> Result<Vec<SessionRecord>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "{SELECT_COLUMNS} ORDER BY updated_at DESC, id DESC LIMIT ?1 OFFSET ?2"
            ))?;
            let mut rows = stmt.query(rusqlite::params![limit, offset])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_session(row)?);
            }
            Ok(results)
        })
    }

    /// Apply a partial update. A usage delta is added to the totals and
    /// counts as one turn.
    #[instrument(skip(self, update), fields(session_id = %id))]
    pub fn update(&self, id: &SessionId, update: &SessionUpdate) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        self.db.with_tx(|tx| {
            let changed = tx.execute(
                "UPDATE sessions SET updated_at = ?1 WHERE id = ?2",
                rusqlite::params![now, id.as_str()],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("session {id}")));
            }
            if let Some(token) = &update.resume_token {
                tx.execute(
                    "UPDATE sessions SET resume_token = ?1 WHERE id = ?2",
                    rusqlite::params![token, id.as_str()],
                )?;
            }
            if let Some(title) = &update.title {
                tx.execute(
                    "UPDATE sessions SET title = ?1 WHERE id = ?2",
                    rusqlite::params![title, id.as_str()],
                )?;
            }
            if let Some(usage) = &update.usage {
                tx.execute(
                    "UPDATE sessions SET
                        total_input_tokens = total_input_tokens + ?1,
                        total_output_tokens = total_output_tokens + ?2,
                        total_cache_read_tokens = total_cache_read_tokens + ?3,
                        total_cache_creation_tokens = total_cache_creation_tokens + ?4,
                        total_cost_usd = total_cost_usd + ?5,
                        turn_count = turn_count + 1
                     WHERE id = ?6",
                    rusqlite::params![
                        usage.input_tokens as i64,
                        usage.output_tokens as i64,
                        usage.cache_read_tokens as i64,
                        usage.cache_creation_tokens as i64,
                        usage.total_cost_usd,
                        id.as_str(),
                    ],
                )?;
            }
            Ok(())
        })
    }

    /// Hard delete. Turns, chat messages and the cursor cascade.
    #[instrument(skip(self), fields(session_id = %id))]
    pub fn delete(&self, id: &SessionId) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            let n = conn.execute("DELETE FROM sessions WHERE id = ?1", [id.as_str()])?;
            Ok(n > 0)
        })
    }
}

fn row_to_session(row: &rusqlite::Row<'_>) -> Result<SessionRecord, StoreError> {
    Ok(SessionRecord {
        id: SessionId::from_raw(row_helpers::get::<String>(row, 0, "sessions", "id")?),
        title: row_helpers::get_opt(row, 1, "sessions", "title")?,
        cwd: row_helpers::get(row, 2, "sessions", "cwd")?,
        resume_token: row_helpers::get_opt(row, 3, "sessions", "resume_token")?,
        usage: UsageTotals {
            input_tokens: row_helpers::get_u64(row, 4, "sessions", "total_input_tokens")?,
            output_tokens: row_helpers::get_u64(row, 5, "sessions", "total_output_tokens")?,
            cache_read_tokens: row_helpers::get_u64(row, 6, "sessions", "total_cache_read_tokens")?,
            cache_creation_tokens: row_helpers::get_u64(
                row,
                7,
                "sessions",
                "total_cache_creation_tokens",
            )?,
            total_cost_usd: row_helpers::get(row, 8, "sessions", "total_cost_usd")?,
            turn_count: row_helpers::get(row, 9, "sessions", "turn_count")?,
        },
        created_at: row_helpers::get(row, 10, "sessions", "created_at")?,
        updated_at: row_helpers::get(row, 11, "sessions", "updated_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use helm_core::usage::TurnUsage;

    fn repo() -> SessionRepo {
        SessionRepo::new(Database::in_memory().unwrap())
    }

    fn new_session(cwd: &str) -> NewSession {
        NewSession {
            title: Some("demo".into()),
            cwd: cwd.into(),
        }
    }

    #[test]
    fn create_and_get() {
        let repo = repo();
        let created = repo.create(&new_session("/work")).unwrap();
        assert!(created.id.as_str().starts_with("sess_"));

        let fetched = repo.get(&created.id).unwrap();
        assert_eq!(fetched, created);
        assert_eq!(fetched.usage.turn_count, 0);
        assert!(fetched.resume_token.is_none());
    }

    #[test]
    fn get_nonexistent_is_not_found() {
        let repo = repo();
        let result = repo.get(&SessionId::from_raw("sess_missing"));
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }

    #[test]
    fn list_with_pagination() {
        let repo = repo();
        for i in 0..5 {
            repo.create(&new_session(&format!("/w{i}"))).unwrap();
        }
        assert_eq!(repo.list(2, 0).unwrap().len(), 2);
        assert_eq!(repo.list(2, 4).unwrap().len(), 1);
        assert_eq!(repo.list(100, 0).unwrap().len(), 5);
    }

    #[test]
    fn update_adds_usage_and_counts_turns() {
        let repo = repo();
        let s = repo.create(&new_session("/w")).unwrap();
        let delta = TurnUsage {
            input_tokens: 100,
            output_tokens: 20,
            cache_read_tokens: 5,
            cache_creation_tokens: 1,
            total_cost_usd: 0.25,
        };
        for _ in 0..2 {
            repo.update(
                &s.id,
                &SessionUpdate {
                    usage: Some(delta.clone()),
                    ..Default::default()
                },
            )
            .unwrap();
        }
        let fetched = repo.get(&s.id).unwrap();
        assert_eq!(fetched.usage.input_tokens, 200);
        assert_eq!(fetched.usage.output_tokens, 40);
        assert_eq!(fetched.usage.cache_read_tokens, 10);
        assert_eq!(fetched.usage.turn_count, 2);
        assert!((fetched.usage.total_cost_usd - 0.5).abs() < 1e-9);
    }

    #[test]
    fn update_resume_token_and_title() {
        let repo = repo();
        let s = repo.create(&new_session("/w")).unwrap();
        repo.update(
            &s.id,
            &SessionUpdate {
                resume_token: Some("resume-1".into()),
                title: Some("renamed".into()),
                usage: None,
            },
        )
        .unwrap();
        let fetched = repo.get(&s.id).unwrap();
        assert_eq!(fetched.resume_token.as_deref(), Some("resume-1"));
        assert_eq!(fetched.title.as_deref(), Some("renamed"));
        assert_eq!(fetched.usage.turn_count, 0);
    }

    #[test]
    fn update_missing_session_is_not_found() {
        let repo = repo();
        let result = repo.update(&SessionId::new(), &SessionUpdate::default());
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }

    #[test]
    fn delete_reports_whether_removed() {
        let repo = repo();
        let s = repo.create(&new_session("/w")).unwrap();
        assert!(repo.delete(&s.id).unwrap());
        assert!(!repo.delete(&s.id).unwrap());
        assert!(repo.get(&s.id).is_err());
    }
}
