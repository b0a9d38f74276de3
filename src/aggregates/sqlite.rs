use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use std::collections::HashSet;
use std::sync::Mutex;

use super::AggregateStore;
use crate::db;
use crate::error::Result;
use crate::model::{Aggregate, EntityRef, FactId, Scope};

/// SQLite-backed aggregate cache with a processed-fact ledger.
pub struct SqliteAggregates {
    conn: Mutex<Connection>,
}

impl SqliteAggregates {
    pub fn open(path: &str) -> Result<Self> {
        let conn = db::open(path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS aggregates (
                reactant_type TEXT NOT NULL,
                reactant_id   TEXT NOT NULL,
                scope         TEXT NOT NULL,
                count         INTEGER NOT NULL DEFAULT 0,
                weight        INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (reactant_type, reactant_id, scope)
            );
            CREATE TABLE IF NOT EXISTS stale_reactants (
                reactant_type TEXT NOT NULL,
                reactant_id   TEXT NOT NULL,
                marked_at     TEXT NOT NULL DEFAULT (datetime('now')),
                PRIMARY KEY (reactant_type, reactant_id)
            );
            CREATE TABLE IF NOT EXISTS applied_facts (
                fact_id    TEXT PRIMARY KEY,
                applied_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS applied_facts_by_time
                ON applied_facts (applied_at);",
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
impl AggregateStore for SqliteAggregates {
    async fn get(&self, reactant: &EntityRef, scope: &Scope) -> Result<Aggregate> {
        let conn = db::lock(&self.conn)?;
        let stale: bool = conn.query_row(
            "SELECT EXISTS (
                SELECT 1 FROM stale_reactants
                WHERE reactant_type = ?1 AND reactant_id = ?2
            )",
            params![reactant.type_tag, reactant.id],
            |row| row.get(0),
        )?;
        let found = conn
            .query_row(
                "SELECT count, weight FROM aggregates
                 WHERE reactant_type = ?1 AND reactant_id = ?2 AND scope = ?3",
                params![reactant.type_tag, reactant.id, scope.as_column()],
                |row| {
                    Ok(Aggregate {
                        scope: scope.clone(),
                        count: row.get(0)?,
                        weight: row.get(1)?,
                        stale,
                    })
                },
            )
            .optional()?;
        Ok(found.unwrap_or_else(|| Aggregate {
            stale,
            ..Aggregate::zero(scope.clone())
        }))
    }

    async fn apply_delta(
        &self,
        fact_id: &FactId,
        reactant: &EntityRef,
        type_name: &str,
        count_delta: i64,
        weight_delta: i64,
    ) -> Result<bool> {
        let mut conn = db::lock(&self.conn)?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let fresh = tx.execute(
            "INSERT OR IGNORE INTO applied_facts (fact_id, applied_at) VALUES (?1, ?2)",
            params![fact_id.to_string(), Utc::now().timestamp_millis()],
        )?;
        if fresh == 0 {
            return Ok(false);
        }

        for scope in ["", type_name] {
            tx.execute(
                "INSERT INTO aggregates (reactant_type, reactant_id, scope, count, weight)
                 VALUES (?1, ?2, ?3, max(?4, 0), ?5)
                 ON CONFLICT (reactant_type, reactant_id, scope) DO UPDATE SET
                    count  = max(count + ?4, 0),
                    weight = weight + ?5",
                params![reactant.type_tag, reactant.id, scope, count_delta, weight_delta],
            )?;
        }
        tx.commit()?;
        Ok(true)
    }

    async fn overwrite(&self, reactant: &EntityRef, aggregates: &[Aggregate]) -> Result<()> {
        let mut conn = db::lock(&self.conn)?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            "DELETE FROM aggregates WHERE reactant_type = ?1 AND reactant_id = ?2",
            params![reactant.type_tag, reactant.id],
        )?;
        tx.execute(
            "DELETE FROM stale_reactants WHERE reactant_type = ?1 AND reactant_id = ?2",
            params![reactant.type_tag, reactant.id],
        )?;
        for aggregate in aggregates {
            tx.execute(
                "INSERT INTO aggregates (reactant_type, reactant_id, scope, count, weight)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    reactant.type_tag,
                    reactant.id,
                    aggregate.scope.as_column(),
                    aggregate.count.max(0),
                    aggregate.weight
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    async fn mark_stale(&self, reactants: &[EntityRef]) -> Result<usize> {
        let mut conn = db::lock(&self.conn)?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut flagged = 0;
        for reactant in reactants {
            flagged += tx.execute(
                "INSERT OR IGNORE INTO stale_reactants (reactant_type, reactant_id)
                 VALUES (?1, ?2)",
                params![reactant.type_tag, reactant.id],
            )?;
        }
        tx.commit()?;
        Ok(flagged)
    }

    async fn stale_reactants(&self) -> Result<Vec<EntityRef>> {
        let conn = db::lock(&self.conn)?;
        let mut stmt = conn.prepare(
            "SELECT reactant_type, reactant_id FROM stale_reactants
             ORDER BY reactant_type, reactant_id",
        )?;
        let reactants = stmt
            .query_map([], |row| {
                Ok(EntityRef::new(
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(reactants)
    }

    async fn reactants(&self, type_tag: Option<&str>) -> Result<Vec<EntityRef>> {
        let conn = db::lock(&self.conn)?;
        let mut stmt = conn.prepare(
            "SELECT DISTINCT reactant_type, reactant_id FROM aggregates
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

    async fn applied_facts(&self) -> Result<Vec<FactId>> {
        let conn = db::lock(&self.conn)?;
        let mut stmt = conn.prepare("SELECT fact_id FROM applied_facts")?;
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        ids.iter().map(|id| db::parse_uuid(id)).collect()
    }

    async fn prune_ledger(
        &self,
        applied_before: DateTime<Utc>,
        keep: &[FactId],
    ) -> Result<usize> {
        let keep: HashSet<String> = keep.iter().map(|id| id.to_string()).collect();
        let mut conn = db::lock(&self.conn)?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let expired = {
            let mut stmt = tx.prepare("SELECT fact_id FROM applied_facts WHERE applied_at <= ?1")?;
            stmt.query_map([applied_before.timestamp_millis()], |row| {
                row.get::<_, String>(0)
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?
        };

        let mut removed = 0;
        for fact_id in expired.iter().filter(|id| !keep.contains(*id)) {
            removed += tx.execute("DELETE FROM applied_facts WHERE fact_id = ?1", [fact_id])?;
        }
        tx.commit()?;
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;
    use uuid::Uuid;

    fn post(id: &str) -> EntityRef {
        EntityRef::new("Post", id)
    }

    fn like() -> Scope {
        Scope::Type("like".to_string())
    }

    #[tokio::test]
    async fn missing_aggregate_reads_as_zero() {
        let store = SqliteAggregates::in_memory().unwrap();
        let agg = store.get(&post("p"), &Scope::All).await.unwrap();
        assert_eq!(agg, Aggregate::zero(Scope::All));
    }

    #[tokio::test]
    async fn delta_updates_all_and_type_scopes() {
        let store = SqliteAggregates::in_memory().unwrap();
        let applied = store
            .apply_delta(&Uuid::new_v4(), &post("p"), "like", 1, 1)
            .await
            .unwrap();
        assert!(applied);

        let all = store.get(&post("p"), &Scope::All).await.unwrap();
        let likes = store.get(&post("p"), &like()).await.unwrap();
        assert_eq!((all.count, all.weight), (1, 1));
        assert_eq!((likes.count, likes.weight), (1, 1));
    }

    #[tokio::test]
    async fn same_fact_applies_once() {
        let store = SqliteAggregates::in_memory().unwrap();
        let fact_id = Uuid::new_v4();
        for _ in 0..3 {
            store
                .apply_delta(&fact_id, &post("p"), "fire", 1, 5)
                .await
                .unwrap();
        }

        let all = store.get(&post("p"), &Scope::All).await.unwrap();
        assert_eq!((all.count, all.weight), (1, 5));
        assert!(
            !store
                .apply_delta(&fact_id, &post("p"), "fire", 1, 5)
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn count_never_goes_negative() {
        let store = SqliteAggregates::in_memory().unwrap();
        store
            .apply_delta(&Uuid::new_v4(), &post("p"), "like", -1, -1)
            .await
            .unwrap();

        let all = store.get(&post("p"), &Scope::All).await.unwrap();
        assert_eq!(all.count, 0);
    }

    #[tokio::test]
    async fn overwrite_replaces_every_scope() {
        let store = SqliteAggregates::in_memory().unwrap();
        store
            .apply_delta(&Uuid::new_v4(), &post("p"), "like", 1, 1)
            .await
            .unwrap();

        store
            .overwrite(
                &post("p"),
                &[Aggregate {
                    scope: Scope::All,
                    count: 0,
                    weight: 0,
                    stale: false,
                }],
            )
            .await
            .unwrap();

        let likes = store.get(&post("p"), &like()).await.unwrap();
        assert_eq!(likes, Aggregate::zero(like()));
    }

    #[tokio::test]
    async fn mark_stale_flags_whole_reactant() {
        let store = SqliteAggregates::in_memory().unwrap();
        store
            .apply_delta(&Uuid::new_v4(), &post("p"), "like", 1, 1)
            .await
            .unwrap();
        store
            .apply_delta(&Uuid::new_v4(), &post("q"), "fire", 1, 5)
            .await
            .unwrap();

        assert_eq!(store.mark_stale(&[post("p")]).await.unwrap(), 1);
        assert_eq!(store.mark_stale(&[post("p")]).await.unwrap(), 0);
        assert!(store.get(&post("p"), &Scope::All).await.unwrap().stale);
        assert!(store.get(&post("p"), &like()).await.unwrap().stale);
        assert!(!store.get(&post("q"), &Scope::All).await.unwrap().stale);
        assert_eq!(store.stale_reactants().await.unwrap(), vec![post("p")]);
    }

    #[tokio::test]
    async fn stale_flag_covers_rows_created_later() {
        let store = SqliteAggregates::in_memory().unwrap();
        store
            .apply_delta(&Uuid::new_v4(), &post("p"), "like", 1, 1)
            .await
            .unwrap();
        store.mark_stale(&[post("p")]).await.unwrap();

        store
            .apply_delta(&Uuid::new_v4(), &post("p"), "fire", 1, 5)
            .await
            .unwrap();

        let fire = Scope::Type("fire".to_string());
        assert!(store.get(&post("p"), &fire).await.unwrap().stale);
        assert!(store.get(&post("p"), &Scope::All).await.unwrap().stale);
    }

    #[tokio::test]
    async fn stale_flag_survives_before_first_delta() {
        let store = SqliteAggregates::in_memory().unwrap();
        store.mark_stale(&[post("p")]).await.unwrap();
        store
            .apply_delta(&Uuid::new_v4(), &post("p"), "like", 1, 1)
            .await
            .unwrap();

        let all = store.get(&post("p"), &Scope::All).await.unwrap();
        assert!(all.stale);
        assert_eq!((all.count, all.weight), (1, 1));
    }

    #[tokio::test]
    async fn overwrite_clears_stale_flag() {
        let store = SqliteAggregates::in_memory().unwrap();
        store
            .apply_delta(&Uuid::new_v4(), &post("p"), "like", 1, 1)
            .await
            .unwrap();
        store.mark_stale(&[post("p")]).await.unwrap();

        store
            .overwrite(
                &post("p"),
                &[
                    Aggregate {
                        scope: Scope::All,
                        count: 1,
                        weight: 3,
                        stale: true,
                    },
                    Aggregate {
                        scope: like(),
                        count: 1,
                        weight: 3,
                        stale: true,
                    },
                ],
            )
            .await
            .unwrap();

        assert!(store.stale_reactants().await.unwrap().is_empty());
        let likes = store.get(&post("p"), &like()).await.unwrap();
        assert_eq!(likes.weight, 3);
        assert!(!likes.stale);
    }

    #[tokio::test]
    async fn prune_drops_expired_facts_except_kept() {
        let store = SqliteAggregates::in_memory().unwrap();
        let (kept, dropped) = (Uuid::new_v4(), Uuid::new_v4());
        for fact_id in [kept, dropped] {
            store
                .apply_delta(&fact_id, &post("p"), "like", 1, 1)
                .await
                .unwrap();
        }

        let removed = store
            .prune_ledger(Utc::now() + TimeDelta::seconds(1), &[kept])
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.applied_facts().await.unwrap(), vec![kept]);
        assert_eq!(store.get(&post("p"), &Scope::All).await.unwrap().count, 2);
    }

    #[tokio::test]
    async fn prune_keeps_recent_facts() {
        let store = SqliteAggregates::in_memory().unwrap();
        store
            .apply_delta(&Uuid::new_v4(), &post("p"), "like", 1, 1)
            .await
            .unwrap();

        let removed = store
            .prune_ledger(Utc::now() - TimeDelta::minutes(5), &[])
            .await
            .unwrap();
        assert_eq!(removed, 0);
        assert_eq!(store.applied_facts().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn persists_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("aggregates.db");
        let path_str = path.to_str().unwrap();
        let fact_id = Uuid::new_v4();

        {
            let store = SqliteAggregates::open(path_str).unwrap();
            store
                .apply_delta(&fact_id, &post("p"), "like", 1, 1)
                .await
                .unwrap();
        }

        {
            let store = SqliteAggregates::open(path_str).unwrap();
            assert!(
                !store
                    .apply_delta(&fact_id, &post("p"), "like", 1, 1)
                    .await
                    .unwrap()
            );
            assert_eq!(store.get(&post("p"), &Scope::All).await.unwrap().count, 1);
        }
    }
}
