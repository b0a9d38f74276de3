use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::AggregateStore;
use crate::error::{Error, Result};
use crate::model::{Aggregate, EntityRef, FactId, Scope};

/// A test double that fails the next `n` delta applications with
/// `StorageUnavailable`, then delegates to the wrapped store.
pub struct FlakyAggregates {
    inner: Arc<dyn AggregateStore>,
    failures_left: AtomicUsize,
    attempts: AtomicUsize,
}

impl FlakyAggregates {
    pub fn new(inner: Arc<dyn AggregateStore>, failures: usize) -> Self {
        Self {
            inner,
            failures_left: AtomicUsize::new(failures),
            attempts: AtomicUsize::new(0),
        }
    }

    /// Total `apply_delta` calls seen, failed ones included.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Stop failing from now on.
    pub fn heal(&self) {
        self.failures_left.store(0, Ordering::SeqCst);
    }
}

#[async_trait]
impl AggregateStore for FlakyAggregates {
    async fn get(&self, reactant: &EntityRef, scope: &Scope) -> Result<Aggregate> {
        self.inner.get(reactant, scope).await
    }

    async fn apply_delta(
        &self,
        fact_id: &FactId,
        reactant: &EntityRef,
        type_name: &str,
        count_delta: i64,
        weight_delta: i64,
    ) -> Result<bool> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(Error::StorageUnavailable("injected failure".to_string()));
        }
        self.inner
            .apply_delta(fact_id, reactant, type_name, count_delta, weight_delta)
            .await
    }

    async fn overwrite(&self, reactant: &EntityRef, aggregates: &[Aggregate]) -> Result<()> {
        self.inner.overwrite(reactant, aggregates).await
    }

    async fn mark_stale(&self, reactants: &[EntityRef]) -> Result<usize> {
        self.inner.mark_stale(reactants).await
    }

    async fn stale_reactants(&self) -> Result<Vec<EntityRef>> {
        self.inner.stale_reactants().await
    }

    async fn reactants(&self, type_tag: Option<&str>) -> Result<Vec<EntityRef>> {
        self.inner.reactants(type_tag).await
    }

    async fn applied_facts(&self) -> Result<Vec<FactId>> {
        self.inner.applied_facts().await
    }

    async fn prune_ledger(
        &self,
        applied_before: DateTime<Utc>,
        keep: &[FactId],
    ) -> Result<usize> {
        self.inner.prune_ledger(applied_before, keep).await
    }
}
