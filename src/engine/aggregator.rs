use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::bounded;
use crate::aggregates::AggregateStore;
use crate::dispatch::Listener;
use crate::error::Result;
use crate::events::{Event, EventBus};
use crate::model::Fact;
use crate::registry::TypeRegistry;

/// Applies reaction facts to the aggregate store.
///
/// Added facts increment, removed facts decrement, both on the `All` scope
/// and on the reaction's type scope. Redelivered facts are absorbed by the
/// store's ledger. A fact recorded under a weight that no longer matches
/// the registry leaves its reactant stale.
pub struct AggregateListener {
    aggregates: Arc<dyn AggregateStore>,
    registry: Arc<dyn TypeRegistry>,
    bus: Arc<EventBus>,
    timeout: Duration,
}

impl AggregateListener {
    pub const NAME: &'static str = "aggregates";

    pub fn new(
        aggregates: Arc<dyn AggregateStore>,
        registry: Arc<dyn TypeRegistry>,
        bus: Arc<EventBus>,
        timeout: Duration,
    ) -> Self {
        Self {
            aggregates,
            registry,
            bus,
            timeout,
        }
    }
}

#[async_trait]
impl Listener for AggregateListener {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn handle(&self, fact: &Fact) -> Result<()> {
        let (count, weight) = fact.deltas();
        let applied = bounded(
            self.timeout,
            self.aggregates.apply_delta(
                &fact.id,
                fact.reactant(),
                &fact.reaction.type_name,
                count,
                weight,
            ),
        )
        .await?;
        if !applied {
            debug!(fact = %fact.id, "fact already applied, ignoring redelivery");
        }

        // Flag after the delta: a recount racing it must not clear the flag.
        let current = bounded(self.timeout, self.registry.get(&fact.reaction.type_name)).await?;
        if current.weight != fact.weight {
            debug!(
                fact = %fact.id,
                recorded = fact.weight,
                current = current.weight,
                "fact carries an outdated weight"
            );
            bounded(
                self.timeout,
                self.aggregates.mark_stale(std::slice::from_ref(fact.reactant())),
            )
            .await?;
        }

        self.bus.emit(Event::AggregateUpdated {
            fact_id: fact.id,
            reactant: fact.reactant().clone(),
            applied,
        });
        Ok(())
    }
}
