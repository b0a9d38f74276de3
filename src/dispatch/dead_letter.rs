//! Facts whose aggregate update could not be delivered.
//!
//! A dead letter means the reactant's aggregates may have drifted; the
//! reaction itself is safely stored. Repair is a recount of the reactant.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, params};
use std::sync::Mutex;

use crate::db;
use crate::error::Result;
use crate::model::Fact;

#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetter {
    /// Store-assigned; zero until recorded.
    pub id: i64,
    pub fact: Fact,
    pub listener: String,
    pub error: String,
    pub attempts: u32,
    pub failed_at: DateTime<Utc>,
}

#[async_trait]
pub trait DeadLetterStore: Send + Sync {
    async fn record(&self, letter: &DeadLetter) -> Result<i64>;
    /// Unresolved letters, oldest first.
    async fn list(&self) -> Result<Vec<DeadLetter>>;
    /// Deletes the given letters. Returns how many existed.
    async fn resolve(&self, ids: &[i64]) -> Result<usize>;
}

pub struct SqliteDeadLetters {
    conn: Mutex<Connection>,
}

impl SqliteDeadLetters {
    pub fn open(path: &str) -> Result<Self> {
        let conn = db::open(path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS dead_letters (
                id            INTEGER PRIMARY KEY AUTOINCREMENT,
                fact_id       TEXT NOT NULL,
                reactant_type TEXT NOT NULL,
                reactant_id   TEXT NOT NULL,
                listener      TEXT NOT NULL,
                fact          TEXT NOT NULL,
                error         TEXT NOT NULL,
                attempts      INTEGER NOT NULL,
                failed_at     TEXT NOT NULL
            )",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn in_memory() -> Result<Self> {
        Self::open(":memory:")
    }
}

#[async_trait]
impl DeadLetterStore for SqliteDeadLetters {
    async fn record(&self, letter: &DeadLetter) -> Result<i64> {
        let json = serde_json::to_string(&letter.fact)?;
        let reactant = letter.fact.reactant();
        let conn = db::lock(&self.conn)?;
        conn.execute(
            "INSERT INTO dead_letters
                (fact_id, reactant_type, reactant_id, listener, fact, error, attempts, failed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                letter.fact.id.to_string(),
                reactant.type_tag,
                reactant.id,
                letter.listener,
                json,
                letter.error,
                letter.attempts,
                letter.failed_at.to_rfc3339()
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    async fn list(&self) -> Result<Vec<DeadLetter>> {
        let conn = db::lock(&self.conn)?;
        let mut stmt = conn.prepare(
            "SELECT id, fact, listener, error, attempts, failed_at
             FROM dead_letters ORDER BY id ASC",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, u32>(4)?,
                    row.get::<_, String>(5)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(|(id, fact, listener, error, attempts, failed_at)| {
                Ok(DeadLetter {
                    id,
                    fact: serde_json::from_str(&fact)?,
                    listener,
                    error,
                    attempts,
                    failed_at: db::parse_time(&failed_at)?,
                })
            })
            .collect()
    }

    async fn resolve(&self, ids: &[i64]) -> Result<usize> {
        let conn = db::lock(&self.conn)?;
        let mut removed = 0;
        for id in ids {
            removed += conn.execute("DELETE FROM dead_letters WHERE id = ?1", [id])?;
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EntityRef, FactKind, Reaction};
    use uuid::Uuid;

    fn letter() -> DeadLetter {
        let reaction = Reaction {
            id: Uuid::new_v4(),
            reacter: EntityRef::new("User", "1"),
            reactant: EntityRef::new("Post", "p"),
            type_name: "like".to_string(),
            created_at: Utc::now(),
        };
        DeadLetter {
            id: 0,
            fact: Fact::new(FactKind::Added, reaction, 1),
            listener: "aggregates".to_string(),
            error: "storage unavailable: busy".to_string(),
            attempts: 5,
            failed_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn record_then_list() {
        let store = SqliteDeadLetters::in_memory().unwrap();
        let original = letter();
        let id = store.record(&original).await.unwrap();

        let listed = store.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, id);
        assert_eq!(listed[0].fact, original.fact);
        assert_eq!(listed[0].attempts, 5);
    }

    #[tokio::test]
    async fn resolve_removes_only_given_ids() {
        let store = SqliteDeadLetters::in_memory().unwrap();
        let first = store.record(&letter()).await.unwrap();
        let second = store.record(&letter()).await.unwrap();

        assert_eq!(store.resolve(&[first, 999]).await.unwrap(), 1);
        let remaining: Vec<_> = store.list().await.unwrap().into_iter().map(|l| l.id).collect();
        assert_eq!(remaining, vec![second]);
    }
}
