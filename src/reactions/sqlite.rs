use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use std::sync::Mutex;
use uuid::Uuid;

use super::ReactionStore;
use crate::consts::SCAN_PAGE_SIZE;
use crate::db;
use crate::error::{Error, Result, is_constraint_violation};
use crate::model::{EntityRef, Fact, FactId, FactKind, Reaction, ReactionKey, Scope};

/// SQLite-backed reaction store with a transactional outbox.
pub struct SqliteReactions {
    conn: Mutex<Connection>,
    allow_multiple_types: bool,
    page_size: i64,
}

struct Row {
    seq: i64,
    id: String,
    reacter_type: String,
    reacter_id: String,
    type_name: String,
    created_at: String,
}

impl SqliteReactions {
    pub fn open(path: &str) -> Result<Self> {
        let conn = db::open(path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS reactions (
                seq           INTEGER PRIMARY KEY AUTOINCREMENT,
                id            TEXT NOT NULL UNIQUE,
                reacter_type  TEXT NOT NULL,
                reacter_id    TEXT NOT NULL,
                reactant_type TEXT NOT NULL,
                reactant_id   TEXT NOT NULL,
                type_name     TEXT NOT NULL,
                created_at    TEXT NOT NULL,
                UNIQUE (reacter_type, reacter_id, reactant_type, reactant_id, type_name)
            );
            CREATE INDEX IF NOT EXISTS reactions_by_reactant
                ON reactions (reactant_type, reactant_id, seq);
            CREATE TABLE IF NOT EXISTS reaction_outbox (
                seq     INTEGER PRIMARY KEY AUTOINCREMENT,
                fact_id TEXT NOT NULL UNIQUE,
                fact    TEXT NOT NULL
            );",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
            allow_multiple_types: true,
            page_size: SCAN_PAGE_SIZE,
        })
    }

    pub fn in_memory() -> Result<Self> {
        Self::open(":memory:")
    }

    /// When false, a reacter holds at most one active reaction per reactant.
    pub fn with_multiple_types(mut self, allow: bool) -> Self {
        self.allow_multiple_types = allow;
        self
    }

    pub fn with_page_size(mut self, page_size: i64) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    fn enqueue(conn: &Connection, fact: &Fact) -> Result<()> {
        let json = serde_json::to_string(fact)?;
        conn.execute(
            "INSERT INTO reaction_outbox (fact_id, fact) VALUES (?1, ?2)",
            params![fact.id.to_string(), json],
        )?;
        Ok(())
    }

    fn page(&self, reactant: &EntityRef, scope: &Scope, after: i64) -> Result<Vec<(i64, Reaction)>> {
        let conn = db::lock(&self.conn)?;
        let mut stmt = conn.prepare(
            "SELECT seq, id, reacter_type, reacter_id, type_name, created_at
             FROM reactions
             WHERE reactant_type = ?1 AND reactant_id = ?2
               AND (?3 = '' OR type_name = ?3)
               AND seq > ?4
             ORDER BY seq ASC
             LIMIT ?5",
        )?;
        let rows = stmt
            .query_map(
                params![
                    reactant.type_tag,
                    reactant.id,
                    scope.as_column(),
                    after,
                    self.page_size
                ],
                |row| {
                    Ok(Row {
                        seq: row.get(0)?,
                        id: row.get(1)?,
                        reacter_type: row.get(2)?,
                        reacter_id: row.get(3)?,
                        type_name: row.get(4)?,
                        created_at: row.get(5)?,
                    })
                },
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(|row| {
                let reaction = Reaction {
                    id: db::parse_uuid(&row.id)?,
                    reacter: EntityRef::new(row.reacter_type, row.reacter_id),
                    reactant: reactant.clone(),
                    type_name: row.type_name,
                    created_at: db::parse_time(&row.created_at)?,
                };
                Ok((row.seq, reaction))
            })
            .collect()
    }
}

#[async_trait]
impl ReactionStore for SqliteReactions {
    async fn insert(&self, key: &ReactionKey, weight: i64, at: DateTime<Utc>) -> Result<Fact> {
        let mut conn = db::lock(&self.conn)?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        if !self.allow_multiple_types {
            let taken: bool = tx.query_row(
                "SELECT EXISTS (
                    SELECT 1 FROM reactions
                    WHERE reacter_type = ?1 AND reacter_id = ?2
                      AND reactant_type = ?3 AND reactant_id = ?4
                )",
                params![
                    key.reacter.type_tag,
                    key.reacter.id,
                    key.reactant.type_tag,
                    key.reactant.id
                ],
                |row| row.get(0),
            )?;
            if taken {
                return Err(Error::DuplicateReaction(key.clone()));
            }
        }

        let reaction = Reaction {
            id: Uuid::new_v4(),
            reacter: key.reacter.clone(),
            reactant: key.reactant.clone(),
            type_name: key.type_name.clone(),
            created_at: at,
        };
        let inserted = tx.execute(
            "INSERT INTO reactions
                (id, reacter_type, reacter_id, reactant_type, reactant_id, type_name, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                reaction.id.to_string(),
                key.reacter.type_tag,
                key.reacter.id,
                key.reactant.type_tag,
                key.reactant.id,
                key.type_name,
                at.to_rfc3339()
            ],
        );
        match inserted {
            Ok(_) => {}
            Err(e) if is_constraint_violation(&e) => {
                return Err(Error::DuplicateReaction(key.clone()));
            }
            Err(e) => return Err(e.into()),
        }

        let fact = Fact::new(FactKind::Added, reaction, weight);
        Self::enqueue(&tx, &fact)?;
        tx.commit()?;
        Ok(fact)
    }

    async fn remove(&self, key: &ReactionKey, weight: i64) -> Result<Fact> {
        let mut conn = db::lock(&self.conn)?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let found = tx
            .query_row(
                "SELECT id, created_at FROM reactions
                 WHERE reacter_type = ?1 AND reacter_id = ?2
                   AND reactant_type = ?3 AND reactant_id = ?4
                   AND type_name = ?5",
                params![
                    key.reacter.type_tag,
                    key.reacter.id,
                    key.reactant.type_tag,
                    key.reactant.id,
                    key.type_name
                ],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()?;
        let Some((id, created_at)) = found else {
            return Err(Error::NotFound(key.clone()));
        };

        tx.execute("DELETE FROM reactions WHERE id = ?1", [&id])?;

        let reaction = Reaction {
            id: db::parse_uuid(&id)?,
            reacter: key.reacter.clone(),
            reactant: key.reactant.clone(),
            type_name: key.type_name.clone(),
            created_at: db::parse_time(&created_at)?,
        };
        let fact = Fact::new(FactKind::Removed, reaction, weight);
        Self::enqueue(&tx, &fact)?;
        tx.commit()?;
        Ok(fact)
    }

    async fn find(&self, key: &ReactionKey) -> Result<Option<Reaction>> {
        let conn = db::lock(&self.conn)?;
        let found = conn
            .query_row(
                "SELECT id, created_at FROM reactions
                 WHERE reacter_type = ?1 AND reacter_id = ?2
                   AND reactant_type = ?3 AND reactant_id = ?4
                   AND type_name = ?5",
                params![
                    key.reacter.type_tag,
                    key.reacter.id,
                    key.reactant.type_tag,
                    key.reactant.id,
                    key.type_name
                ],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()?;

        found
            .map(|(id, created_at)| {
                Ok(Reaction {
                    id: db::parse_uuid(&id)?,
                    reacter: key.reacter.clone(),
                    reactant: key.reactant.clone(),
                    type_name: key.type_name.clone(),
                    created_at: db::parse_time(&created_at)?,
                })
            })
            .transpose()
    }

    fn find_all_for<'a>(
        &'a self,
        reactant: &'a EntityRef,
        scope: &'a Scope,
    ) -> BoxStream<'a, Result<Reaction>> {
        // Keyset pagination on `seq`: the lock is held per page, never across pages.
        stream::try_unfold(Some(0_i64), move |cursor: Option<i64>| async move {
            let Some(after) = cursor else {
                return Ok::<_, Error>(None);
            };
            let page = self.page(reactant, scope, after)?;
            if page.is_empty() {
                return Ok(None);
            }
            let next = if (page.len() as i64) < self.page_size {
                None
            } else {
                page.last().map(|(seq, _)| *seq)
            };
            let items = page.into_iter().map(|(_, reaction)| Ok::<_, Error>(reaction));
            Ok(Some((stream::iter(items), next)))
        })
        .try_flatten()
        .boxed()
    }

    async fn reactants(&self, type_tag: Option<&str>) -> Result<Vec<EntityRef>> {
        let conn = db::lock(&self.conn)?;
        let mut stmt = conn.prepare(
            "SELECT DISTINCT reactant_type, reactant_id FROM reactions
             WHERE (?1 IS NULL OR reactant_type = ?1)
             ORDER BY reactant_type, reactant_id",
        )?;
        let reactants = stmt
            .query_map(params![type_tag], |row| {
                Ok(EntityRef::new(
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(reactants)
    }

    async fn reactants_with_type(&self, type_name: &str) -> Result<Vec<EntityRef>> {
        let conn = db::lock(&self.conn)?;
        let mut stmt = conn.prepare(
            "SELECT DISTINCT reactant_type, reactant_id FROM reactions
             WHERE type_name = ?1
             ORDER BY reactant_type, reactant_id",
        )?;
        let reactants = stmt
            .query_map([type_name], |row| {
                Ok(EntityRef::new(
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(reactants)
    }

    async fn pending_facts(&self) -> Result<Vec<Fact>> {
        let conn = db::lock(&self.conn)?;
        let mut stmt = conn.prepare("SELECT fact FROM reaction_outbox ORDER BY seq ASC")?;
        let jsons = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        let facts = jsons
            .iter()
            .map(|json| serde_json::from_str(json))
            .collect::<std::result::Result<Vec<Fact>, _>>()?;
        Ok(facts)
    }

    async fn acknowledge(&self, fact_id: &FactId) -> Result<()> {
        let conn = db::lock(&self.conn)?;
        conn.execute(
            "DELETE FROM reaction_outbox WHERE fact_id = ?1",
            [fact_id.to_string()],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(reacter: &str, reactant: &str, type_name: &str) -> ReactionKey {
        ReactionKey::new(
            EntityRef::new("User", reacter),
            EntityRef::new("Post", reactant),
            type_name,
        )
    }

    #[tokio::test]
    async fn insert_returns_added_fact_and_outbox_entry() {
        let store = SqliteReactions::in_memory().unwrap();
        let fact = store.insert(&key("1", "p", "like"), 1, Utc::now()).await.unwrap();

        assert_eq!(fact.kind, FactKind::Added);
        assert_eq!(fact.weight, 1);
        let pending = store.pending_facts().await.unwrap();
        assert_eq!(pending, vec![fact]);
    }

    #[tokio::test]
    async fn duplicate_key_is_rejected() {
        let store = SqliteReactions::in_memory().unwrap();
        store.insert(&key("1", "p", "like"), 1, Utc::now()).await.unwrap();

        let err = store
            .insert(&key("1", "p", "like"), 1, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateReaction(_)));
        assert_eq!(store.pending_facts().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn different_types_from_same_reacter_are_allowed() {
        let store = SqliteReactions::in_memory().unwrap();
        store.insert(&key("1", "p", "like"), 1, Utc::now()).await.unwrap();
        store.insert(&key("1", "p", "fire"), 5, Utc::now()).await.unwrap();
    }

    #[tokio::test]
    async fn single_type_mode_rejects_second_type() {
        let store = SqliteReactions::in_memory()
            .unwrap()
            .with_multiple_types(false);
        store.insert(&key("1", "p", "like"), 1, Utc::now()).await.unwrap();

        let err = store
            .insert(&key("1", "p", "fire"), 5, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateReaction(_)));
        // Other reactants are unaffected.
        store.insert(&key("1", "q", "fire"), 5, Utc::now()).await.unwrap();
    }

    #[tokio::test]
    async fn remove_missing_is_not_found() {
        let store = SqliteReactions::in_memory().unwrap();
        let err = store.remove(&key("1", "p", "like"), 1).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn remove_keeps_reaction_identity() {
        let store = SqliteReactions::in_memory().unwrap();
        let added = store.insert(&key("1", "p", "like"), 1, Utc::now()).await.unwrap();
        let removed = store.remove(&key("1", "p", "like"), 1).await.unwrap();

        assert_eq!(removed.kind, FactKind::Removed);
        assert_eq!(removed.reaction.id, added.reaction.id);
        assert!(store.find(&key("1", "p", "like")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn react_after_remove_gets_fresh_identity() {
        let store = SqliteReactions::in_memory().unwrap();
        let first = store.insert(&key("1", "p", "like"), 1, Utc::now()).await.unwrap();
        store.remove(&key("1", "p", "like"), 1).await.unwrap();
        let second = store.insert(&key("1", "p", "like"), 1, Utc::now()).await.unwrap();

        assert_ne!(first.reaction.id, second.reaction.id);
    }

    #[tokio::test]
    async fn scan_spans_pages_and_filters_scope() {
        let store = SqliteReactions::in_memory().unwrap().with_page_size(2);
        for i in 0..5 {
            store
                .insert(&key(&i.to_string(), "p", "like"), 1, Utc::now())
                .await
                .unwrap();
        }
        store.insert(&key("0", "p", "fire"), 5, Utc::now()).await.unwrap();
        store.insert(&key("0", "q", "like"), 1, Utc::now()).await.unwrap();

        let reactant = EntityRef::new("Post", "p");
        let all: Vec<Reaction> = store
            .find_all_for(&reactant, &Scope::All)
            .try_collect()
            .await
            .unwrap();
        assert_eq!(all.len(), 6);

        let likes: Vec<Reaction> = store
            .find_all_for(&reactant, &Scope::Type("like".to_string()))
            .try_collect()
            .await
            .unwrap();
        assert_eq!(likes.len(), 5);
        assert!(likes.iter().all(|r| r.type_name == "like"));
    }

    #[tokio::test]
    async fn scan_is_restartable() {
        let store = SqliteReactions::in_memory().unwrap();
        store.insert(&key("1", "p", "like"), 1, Utc::now()).await.unwrap();
        let reactant = EntityRef::new("Post", "p");

        let first: Vec<Reaction> = store
            .find_all_for(&reactant, &Scope::All)
            .try_collect()
            .await
            .unwrap();
        let second: Vec<Reaction> = store
            .find_all_for(&reactant, &Scope::All)
            .try_collect()
            .await
            .unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn acknowledge_clears_outbox_entry() {
        let store = SqliteReactions::in_memory().unwrap();
        let fact = store.insert(&key("1", "p", "like"), 1, Utc::now()).await.unwrap();
        store.acknowledge(&fact.id).await.unwrap();
        assert!(store.pending_facts().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn reactants_filters_by_type_tag() {
        let store = SqliteReactions::in_memory().unwrap();
        store.insert(&key("1", "p", "like"), 1, Utc::now()).await.unwrap();
        store.insert(&key("2", "p", "like"), 1, Utc::now()).await.unwrap();
        let comment = ReactionKey::new(
            EntityRef::new("User", "1"),
            EntityRef::new("Comment", "c"),
            "like",
        );
        store.insert(&comment, 1, Utc::now()).await.unwrap();

        assert_eq!(store.reactants(None).await.unwrap().len(), 2);
        assert_eq!(
            store.reactants(Some("Post")).await.unwrap(),
            vec![EntityRef::new("Post", "p")]
        );
    }

    #[tokio::test]
    async fn reactants_with_type_ignores_removed_reactions() {
        let store = SqliteReactions::in_memory().unwrap();
        store.insert(&key("1", "p", "fire"), 5, Utc::now()).await.unwrap();
        store.insert(&key("2", "p", "fire"), 5, Utc::now()).await.unwrap();
        store.insert(&key("1", "q", "fire"), 5, Utc::now()).await.unwrap();
        store.insert(&key("1", "r", "like"), 1, Utc::now()).await.unwrap();
        store.remove(&key("1", "q", "fire"), 5).await.unwrap();

        assert_eq!(
            store.reactants_with_type("fire").await.unwrap(),
            vec![EntityRef::new("Post", "p")]
        );
        assert!(store.reactants_with_type("wow").await.unwrap().is_empty());
    }
}
