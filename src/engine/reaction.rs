use async_trait::async_trait;
use chrono::{TimeDelta, Utc};
use futures::TryStreamExt;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::aggregator::AggregateListener;
use super::{Engine, Stores, bounded};
use crate::config::EngineConfig;
use crate::consts::DEFAULT_TYPES;
use crate::dispatch::dead_letter::DeadLetter;
use crate::dispatch::{Dispatcher, Listener};
use crate::error::{Error, Result};
use crate::events::{Event, EventBus};
use crate::model::{Aggregate, EntityRef, FactId, ReactionId, ReactionKey, ReactionType, Scope};

/// Reaction engine over a set of [`Stores`].
///
/// Writes go to the reaction store synchronously; aggregate updates flow
/// through the [`Dispatcher`] and become visible once it settles.
pub struct ReactionEngine {
    stores: Stores,
    dispatcher: Dispatcher,
    bus: Arc<EventBus>,
    config: EngineConfig,
}

impl ReactionEngine {
    /// Starts the dispatcher with the aggregate listener as its only
    /// subscriber. Must be called inside a tokio runtime.
    pub fn start(stores: Stores, config: EngineConfig) -> Self {
        Self::with_listeners(stores, config, Vec::new())
    }

    /// Like [`ReactionEngine::start`], with extra listeners subscribed after
    /// the aggregate listener.
    pub fn with_listeners(
        stores: Stores,
        config: EngineConfig,
        extra: Vec<Arc<dyn Listener>>,
    ) -> Self {
        let bus = Arc::new(EventBus::default());
        let mut listeners: Vec<Arc<dyn Listener>> = vec![Arc::new(AggregateListener::new(
            Arc::clone(&stores.aggregates),
            Arc::clone(&stores.registry),
            Arc::clone(&bus),
            config.store_timeout,
        ))];
        listeners.extend(extra);

        let dispatcher = Dispatcher::start(
            listeners,
            Arc::clone(&stores.reactions),
            Arc::clone(&stores.dead_letters),
            Arc::clone(&bus),
            config.retry.clone(),
            config.shards,
        );

        Self {
            stores,
            dispatcher,
            bus,
            config,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.bus.subscribe()
    }

    /// Waits until every published fact reached its listeners.
    pub async fn settle(&self) {
        self.dispatcher.settle().await;
    }

    pub async fn shutdown(self) {
        self.dispatcher.settle().await;
        if let Err(e) = self.prune_ledger().await {
            warn!(error = %e, "failed to prune the applied-fact ledger");
        }
        self.dispatcher.shutdown().await;
    }

    /// Republishes facts the outbox still holds, e.g. after a crash between
    /// a reaction write and its aggregate update.
    pub async fn recover(&self) -> Result<usize> {
        self.prune_ledger().await?;
        let pending = bounded(
            self.config.store_timeout,
            self.stores.reactions.pending_facts(),
        )
        .await?;
        let replayed = pending.len();
        for fact in pending {
            self.dispatcher.publish(fact);
        }
        if replayed > 0 {
            info!(facts = replayed, "replaying unacknowledged facts");
        }
        Ok(replayed)
    }

    /// Drops ledger entries older than the configured retention whose facts
    /// have left the outbox. Returns how many were dropped.
    pub async fn prune_ledger(&self) -> Result<usize> {
        let timeout = self.config.store_timeout;
        let Some(cutoff) = TimeDelta::from_std(self.config.ledger_retention)
            .ok()
            .and_then(|retention| Utc::now().checked_sub_signed(retention))
        else {
            return Ok(0);
        };
        // Cutoff before the outbox read: anything applied by then and no
        // longer pending was acknowledged.
        let pending: Vec<FactId> = bounded(timeout, self.stores.reactions.pending_facts())
            .await?
            .into_iter()
            .map(|fact| fact.id)
            .collect();
        let pruned = bounded(
            timeout,
            self.stores.aggregates.prune_ledger(cutoff, &pending),
        )
        .await?;
        if pruned > 0 {
            debug!(pruned, "pruned applied-fact ledger");
        }
        Ok(pruned)
    }

    pub async fn is_reacted_by(
        &self,
        reacter: &EntityRef,
        reactant: &EntityRef,
        type_name: &str,
    ) -> Result<bool> {
        let key = ReactionKey::new(reacter.clone(), reactant.clone(), type_name);
        let found = self
            .config
            .retry
            .run("find reaction", || {
                bounded(self.config.store_timeout, self.stores.reactions.find(&key))
            })
            .await?;
        Ok(found.is_some())
    }

    pub async fn list_types(&self) -> Result<Vec<ReactionType>> {
        let types = self
            .config
            .retry
            .run("list reaction types", || {
                bounded(self.config.store_timeout, self.stores.registry.list())
            })
            .await?;
        Ok(types)
    }

    /// Registers `Like` (+1) and `Dislike` (-1), skipping names already
    /// taken. Returns the types actually added.
    pub async fn register_defaults(&self) -> Result<Vec<ReactionType>> {
        let mut added = Vec::new();
        for (name, weight) in DEFAULT_TYPES {
            match self.register_type(name, *weight, true).await {
                Ok(reaction_type) => added.push(reaction_type),
                Err(Error::DuplicateType { .. }) => debug!(name, "default type exists, skipping"),
                Err(e) => return Err(e),
            }
        }
        Ok(added)
    }

    /// Recounts every reactant either store knows about, optionally only
    /// those with the given type tag. Returns how many were recounted.
    pub async fn recount_all(&self, type_tag: Option<&str>) -> Result<usize> {
        let timeout = self.config.store_timeout;
        let mut reactants: BTreeSet<EntityRef> =
            bounded(timeout, self.stores.reactions.reactants(type_tag))
                .await?
                .into_iter()
                .collect();
        // Aggregates whose reactions are all gone still need zeroing.
        reactants.extend(bounded(timeout, self.stores.aggregates.reactants(type_tag)).await?);

        for reactant in &reactants {
            self.recount(reactant).await?;
        }
        Ok(reactants.len())
    }

    /// Recounts reactants flagged by weight edits.
    pub async fn recount_stale(&self) -> Result<usize> {
        let stale = bounded(
            self.config.store_timeout,
            self.stores.aggregates.stale_reactants(),
        )
        .await?;
        for reactant in &stale {
            self.recount(reactant).await?;
        }
        Ok(stale.len())
    }

    pub async fn dead_letters(&self) -> Result<Vec<DeadLetter>> {
        bounded(self.config.store_timeout, self.stores.dead_letters.list()).await
    }

    /// Repairs every reactant with a dead-lettered fact and resolves the
    /// letters. Returns how many reactants were recounted.
    pub async fn recount_dead_letters(&self) -> Result<usize> {
        let timeout = self.config.store_timeout;
        let letters = self.dead_letters().await?;

        // Retire the fact ids first: a late redelivery of a dead-lettered
        // fact must not add on top of the recount.
        for letter in &letters {
            let fact = &letter.fact;
            bounded(
                timeout,
                self.stores.aggregates.apply_delta(
                    &fact.id,
                    fact.reactant(),
                    &fact.reaction.type_name,
                    0,
                    0,
                ),
            )
            .await?;
        }

        let reactants: BTreeSet<EntityRef> = letters
            .iter()
            .map(|letter| letter.fact.reactant().clone())
            .collect();
        for reactant in &reactants {
            self.recount(reactant).await?;
        }

        let ids: Vec<i64> = letters.iter().map(|letter| letter.id).collect();
        bounded(timeout, self.stores.dead_letters.resolve(&ids)).await?;
        Ok(reactants.len())
    }

    async fn rebuild(&self, reactant: &EntityRef) -> Result<Aggregate> {
        let timeout = self.config.store_timeout;
        let weights: HashMap<String, i64> = bounded(timeout, self.stores.registry.list())
            .await?
            .into_iter()
            .map(|t| (t.name, t.weight))
            .collect();

        let mut totals = BTreeMap::from([(Scope::All, Aggregate::zero(Scope::All))]);
        let mut reactions = self.stores.reactions.find_all_for(reactant, &Scope::All);
        while let Some(reaction) = bounded(timeout, reactions.try_next()).await? {
            let weight = *weights
                .get(&reaction.type_name)
                .ok_or_else(|| Error::UnknownType {
                    name: reaction.type_name.clone(),
                })?;
            for scope in [Scope::All, Scope::Type(reaction.type_name)] {
                let total = totals
                    .entry(scope.clone())
                    .or_insert_with(|| Aggregate::zero(scope));
                total.count += 1;
                total.weight += weight;
            }
        }

        let aggregates: Vec<Aggregate> = totals.into_values().collect();
        bounded(
            timeout,
            self.stores.aggregates.overwrite(reactant, &aggregates),
        )
        .await?;

        let all = aggregates
            .into_iter()
            .find(|aggregate| aggregate.scope == Scope::All)
            .unwrap_or_else(|| Aggregate::zero(Scope::All));
        Ok(all)
    }
}

#[async_trait]
impl Engine for ReactionEngine {
    async fn react(
        &self,
        reacter: &EntityRef,
        reactant: &EntityRef,
        type_name: &str,
    ) -> Result<ReactionId> {
        let timeout = self.config.store_timeout;
        let reaction_type = self
            .config
            .retry
            .run("load reaction type", || {
                bounded(timeout, self.stores.registry.get(type_name))
            })
            .await?;
        if !reaction_type.active {
            return Err(Error::InactiveType {
                name: type_name.to_string(),
            });
        }

        let key = ReactionKey::new(reacter.clone(), reactant.clone(), type_name);
        let fact = bounded(
            timeout,
            self.stores
                .reactions
                .insert(&key, reaction_type.weight, Utc::now()),
        )
        .await?;
        let id = fact.reaction.id;
        debug!(reaction = %id, %key, "reaction added");
        self.dispatcher.publish(fact);
        Ok(id)
    }

    async fn unreact(
        &self,
        reacter: &EntityRef,
        reactant: &EntityRef,
        type_name: &str,
    ) -> Result<()> {
        let timeout = self.config.store_timeout;
        let reaction_type = self
            .config
            .retry
            .run("load reaction type", || {
                bounded(timeout, self.stores.registry.get(type_name))
            })
            .await?;

        let key = ReactionKey::new(reacter.clone(), reactant.clone(), type_name);
        let fact = bounded(
            timeout,
            self.stores.reactions.remove(&key, reaction_type.weight),
        )
        .await?;
        debug!(reaction = %fact.reaction.id, %key, "reaction removed");
        self.dispatcher.publish(fact);
        Ok(())
    }

    async fn get_aggregate(&self, reactant: &EntityRef, scope: &Scope) -> Result<Aggregate> {
        let aggregate = self
            .config
            .retry
            .run("read aggregate", || {
                bounded(
                    self.config.store_timeout,
                    self.stores.aggregates.get(reactant, scope),
                )
            })
            .await?;
        Ok(aggregate)
    }

    async fn recount(&self, reactant: &EntityRef) -> Result<()> {
        let all = self
            .config
            .retry
            .run("recount", || self.rebuild(reactant))
            .await?;
        info!(%reactant, count = all.count, weight = all.weight, "recounted");
        self.bus.emit(Event::Recounted {
            reactant: reactant.clone(),
            count: all.count,
            weight: all.weight,
        });
        Ok(())
    }

    async fn register_type(&self, name: &str, weight: i64, active: bool) -> Result<ReactionType> {
        bounded(
            self.config.store_timeout,
            self.stores.registry.register(name, weight, active),
        )
        .await
    }

    async fn set_type_weight(&self, name: &str, weight: i64) -> Result<usize> {
        let timeout = self.config.store_timeout;
        bounded(timeout, self.stores.registry.set_weight(name, weight)).await?;

        // Facts still in flight are flagged by the aggregate listener when
        // their recorded weight no longer matches.
        let affected = bounded(timeout, self.stores.reactions.reactants_with_type(name)).await?;
        bounded(timeout, self.stores.aggregates.mark_stale(&affected)).await?;
        let stale = affected.len();

        info!(
            type_name = name,
            weight, stale, "reaction type weight changed, stale reactants need recount"
        );
        self.bus.emit(Event::WeightChanged {
            type_name: name.to_string(),
            weight,
            stale,
        });
        Ok(stale)
    }
}
