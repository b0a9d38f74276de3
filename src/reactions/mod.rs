pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;

use crate::error::Result;
use crate::model::{EntityRef, Fact, FactId, Reaction, ReactionKey, Scope};

/// Source of truth for reactions. Append and hard-remove only.
///
/// Each successful write returns the [`Fact`] it emitted. The fact is
/// recorded in an outbox within the same transaction and stays there until
/// [`ReactionStore::acknowledge`] is called, so a crash between the write
/// and the aggregate update can be replayed.
#[async_trait]
pub trait ReactionStore: Send + Sync {
    /// Fails with `DuplicateReaction` if the key is already active.
    async fn insert(&self, key: &ReactionKey, weight: i64, at: DateTime<Utc>) -> Result<Fact>;

    /// Fails with `NotFound` if the key is not active.
    async fn remove(&self, key: &ReactionKey, weight: i64) -> Result<Fact>;

    async fn find(&self, key: &ReactionKey) -> Result<Option<Reaction>>;

    /// Lazily scans every active reaction on `reactant` within `scope`.
    /// Calling it again restarts from the beginning.
    fn find_all_for<'a>(
        &'a self,
        reactant: &'a EntityRef,
        scope: &'a Scope,
    ) -> BoxStream<'a, Result<Reaction>>;

    /// Distinct reactants with at least one active reaction.
    async fn reactants(&self, type_tag: Option<&str>) -> Result<Vec<EntityRef>>;

    /// Distinct reactants holding an active reaction of `type_name`.
    async fn reactants_with_type(&self, type_name: &str) -> Result<Vec<EntityRef>>;

    /// Facts not yet acknowledged, oldest first.
    async fn pending_facts(&self) -> Result<Vec<Fact>>;

    async fn acknowledge(&self, fact_id: &FactId) -> Result<()>;
}
