pub mod aggregator;
pub mod reaction;

use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::aggregates::AggregateStore;
use crate::aggregates::sqlite::SqliteAggregates;
use crate::config::EngineConfig;
use crate::dispatch::dead_letter::{DeadLetterStore, SqliteDeadLetters};
use crate::error::Result;
use crate::model::{Aggregate, EntityRef, ReactionId, ReactionType, Scope};
use crate::reactions::ReactionStore;
use crate::reactions::sqlite::SqliteReactions;
use crate::registry::TypeRegistry;
use crate::registry::sqlite::SqliteRegistry;

/// The outermost boundary. main.rs and integrators only need this trait.
#[async_trait]
pub trait Engine: Send + Sync {
    /// Records a reaction and schedules the aggregate increment.
    async fn react(
        &self,
        reacter: &EntityRef,
        reactant: &EntityRef,
        type_name: &str,
    ) -> Result<ReactionId>;

    /// Removes a reaction and schedules the aggregate decrement.
    async fn unreact(&self, reacter: &EntityRef, reactant: &EntityRef, type_name: &str)
    -> Result<()>;

    async fn get_aggregate(&self, reactant: &EntityRef, scope: &Scope) -> Result<Aggregate>;

    /// Rebuilds every aggregate of `reactant` from the reaction store.
    async fn recount(&self, reactant: &EntityRef) -> Result<()>;

    async fn register_type(&self, name: &str, weight: i64, active: bool) -> Result<ReactionType>;

    /// Changes a weight and flags affected aggregates as stale. Returns the
    /// number of reactants that need a recount.
    async fn set_type_weight(&self, name: &str, weight: i64) -> Result<usize>;
}

/// The storage collaborators an engine runs on.
#[derive(Clone)]
pub struct Stores {
    pub registry: Arc<dyn TypeRegistry>,
    pub reactions: Arc<dyn ReactionStore>,
    pub aggregates: Arc<dyn AggregateStore>,
    pub dead_letters: Arc<dyn DeadLetterStore>,
}

impl Stores {
    /// All four stores in one SQLite database. Use `":memory:"` for an
    /// ephemeral set.
    pub fn sqlite(path: &str, config: &EngineConfig) -> Result<Self> {
        Ok(Self {
            registry: Arc::new(SqliteRegistry::open(path)?),
            reactions: Arc::new(
                SqliteReactions::open(path)?.with_multiple_types(config.allow_multiple_types),
            ),
            aggregates: Arc::new(SqliteAggregates::open(path)?),
            dead_letters: Arc::new(SqliteDeadLetters::open(path)?),
        })
    }

    pub fn in_memory() -> Result<Self> {
        Self::sqlite(":memory:", &EngineConfig::default())
    }
}

/// Fails with `StorageUnavailable` when `fut` outlives `limit`.
pub(crate) async fn bounded<T>(limit: Duration, fut: impl Future<Output = Result<T>>) -> Result<T> {
    tokio::time::timeout(limit, fut).await?
}
