pub mod flaky;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::model::{Aggregate, EntityRef, FactId, Scope};

/// Cached per-reactant counts and weights, keyed by scope.
///
/// Only the engine writes here. Delta application is idempotent per fact
/// id; `overwrite` is reserved for recount.
#[async_trait]
pub trait AggregateStore: Send + Sync {
    /// Current aggregate, or a zero value if never written.
    async fn get(&self, reactant: &EntityRef, scope: &Scope) -> Result<Aggregate>;

    /// Adds the deltas to the `All` and `Type(type_name)` scopes of
    /// `reactant` unless `fact_id` was applied before. Returns whether
    /// anything changed.
    async fn apply_delta(
        &self,
        fact_id: &FactId,
        reactant: &EntityRef,
        type_name: &str,
        count_delta: i64,
        weight_delta: i64,
    ) -> Result<bool>;

    /// Replaces every scope of `reactant` with `aggregates` and clears the
    /// stale flag.
    async fn overwrite(&self, reactant: &EntityRef, aggregates: &[Aggregate]) -> Result<()>;

    /// Flags `reactants` as needing a recount. The flag belongs to the
    /// reactant, not to a scope row, so scopes created later report it too.
    /// Returns how many of them were not flagged before.
    async fn mark_stale(&self, reactants: &[EntityRef]) -> Result<usize>;

    async fn stale_reactants(&self) -> Result<Vec<EntityRef>>;

    /// Fact ids currently held in the ledger.
    async fn applied_facts(&self) -> Result<Vec<FactId>>;

    /// Drops ledger entries applied at or before `applied_before`, except
    /// those in `keep`. Returns how many were removed.
    async fn prune_ledger(&self, applied_before: DateTime<Utc>, keep: &[FactId])
    -> Result<usize>;

    /// Distinct reactants with any stored aggregate.
    async fn reactants(&self, type_tag: Option<&str>) -> Result<Vec<EntityRef>>;
}
