use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension, params};
use std::sync::Mutex;
use tracing::info;

use super::{TypeRegistry, validate_name};
use crate::db;
use crate::error::{Error, Result, is_constraint_violation};
use crate::model::ReactionType;

/// SQLite-backed reaction type catalog.
pub struct SqliteRegistry {
    conn: Mutex<Connection>,
}

impl SqliteRegistry {
    pub fn open(path: &str) -> Result<Self> {
        let conn = db::open(path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS reaction_types (
                name       TEXT PRIMARY KEY,
                weight     INTEGER NOT NULL,
                active     INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            )",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn in_memory() -> Result<Self> {
        Self::open(":memory:")
    }

    fn fetch(conn: &Connection, name: &str) -> Result<Option<ReactionType>> {
        let found = conn
            .query_row(
                "SELECT name, weight, active FROM reaction_types WHERE name = ?1",
                [name],
                |row| {
                    Ok(ReactionType {
                        name: row.get(0)?,
                        weight: row.get(1)?,
                        active: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(found)
    }
}

#[async_trait]
impl TypeRegistry for SqliteRegistry {
    async fn register(&self, name: &str, weight: i64, active: bool) -> Result<ReactionType> {
        validate_name(name)?;
        let conn = db::lock(&self.conn)?;
        match conn.execute(
            "INSERT INTO reaction_types (name, weight, active) VALUES (?1, ?2, ?3)",
            params![name, weight, active],
        ) {
            Ok(_) => {}
            Err(e) if is_constraint_violation(&e) => {
                return Err(Error::DuplicateType {
                    name: name.to_string(),
                });
            }
            Err(e) => return Err(e.into()),
        }
        info!(name, weight, active, "reaction type registered");
        Ok(ReactionType {
            name: name.to_string(),
            weight,
            active,
        })
    }

    async fn get(&self, name: &str) -> Result<ReactionType> {
        let conn = db::lock(&self.conn)?;
        Self::fetch(&conn, name)?.ok_or_else(|| Error::UnknownType {
            name: name.to_string(),
        })
    }

    async fn set_weight(&self, name: &str, weight: i64) -> Result<ReactionType> {
        let conn = db::lock(&self.conn)?;
        let updated = conn.execute(
            "UPDATE reaction_types SET weight = ?2 WHERE name = ?1",
            params![name, weight],
        )?;
        if updated == 0 {
            return Err(Error::UnknownType {
                name: name.to_string(),
            });
        }
        Self::fetch(&conn, name)?.ok_or_else(|| Error::UnknownType {
            name: name.to_string(),
        })
    }

    async fn list(&self) -> Result<Vec<ReactionType>> {
        let conn = db::lock(&self.conn)?;
        let mut stmt =
            conn.prepare("SELECT name, weight, active FROM reaction_types ORDER BY name ASC")?;
        let types = stmt
            .query_map([], |row| {
                Ok(ReactionType {
                    name: row.get(0)?,
                    weight: row.get(1)?,
                    active: row.get(2)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(types)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn register_then_get() {
        let registry = SqliteRegistry::in_memory().unwrap();
        registry.register("like", 1, true).await.unwrap();

        let like = registry.get("like").await.unwrap();
        assert_eq!(like.weight, 1);
        assert!(like.active);
    }

    #[tokio::test]
    async fn duplicate_name_is_rejected() {
        let registry = SqliteRegistry::in_memory().unwrap();
        registry.register("like", 1, true).await.unwrap();

        let err = registry.register("like", 2, true).await.unwrap_err();
        assert!(matches!(err, Error::DuplicateType { name } if name == "like"));
        assert_eq!(registry.get("like").await.unwrap().weight, 1);
    }

    #[tokio::test]
    async fn get_unknown_fails() {
        let registry = SqliteRegistry::in_memory().unwrap();
        let err = registry.get("nope").await.unwrap_err();
        assert!(matches!(err, Error::UnknownType { .. }));
    }

    #[tokio::test]
    async fn set_weight_updates_value() {
        let registry = SqliteRegistry::in_memory().unwrap();
        registry.register("like", 1, true).await.unwrap();

        let updated = registry.set_weight("like", 3).await.unwrap();
        assert_eq!(updated.weight, 3);
        assert_eq!(registry.get("like").await.unwrap().weight, 3);
    }

    #[tokio::test]
    async fn set_weight_unknown_fails() {
        let registry = SqliteRegistry::in_memory().unwrap();
        let err = registry.set_weight("nope", 3).await.unwrap_err();
        assert!(matches!(err, Error::UnknownType { .. }));
    }

    #[tokio::test]
    async fn inactive_flag_persists() {
        let registry = SqliteRegistry::in_memory().unwrap();
        registry.register("retired", -2, false).await.unwrap();
        assert!(!registry.get("retired").await.unwrap().active);
    }

    #[tokio::test]
    async fn list_is_sorted_by_name() {
        let registry = SqliteRegistry::in_memory().unwrap();
        registry.register("fire", 5, true).await.unwrap();
        registry.register("angry", -1, true).await.unwrap();

        let names: Vec<_> = registry
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.name)
            .collect();
        assert_eq!(names, ["angry", "fire"]);
    }
}
