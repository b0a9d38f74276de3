//! Event dispatch boundary between reaction writes and aggregate updates.
//!
//! Facts are routed to one of N shard workers by a hash of their reactant,
//! so every reactant sees its facts in publish order while different
//! reactants proceed in parallel. Each worker hands a fact to every
//! [`Listener`] in subscription order, retrying transient failures with
//! backoff. A fact a listener cannot take is dead-lettered; once every
//! listener has taken or dead-lettered it, the fact is acknowledged in the
//! outbox. Publishing never waits on a listener.

pub mod dead_letter;
pub mod retry;

use async_trait::async_trait;
use chrono::Utc;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::error::Result;
use crate::events::{Event, EventBus};
use crate::model::{EntityRef, Fact};
use crate::reactions::ReactionStore;
use dead_letter::{DeadLetter, DeadLetterStore};
use retry::{Exhausted, RetryPolicy};

/// A subscriber to reaction facts. Must tolerate redelivery.
#[async_trait]
pub trait Listener: Send + Sync {
    /// Stable name, recorded with dead letters.
    fn name(&self) -> &str;
    async fn handle(&self, fact: &Fact) -> Result<()>;
}

struct Shared {
    listeners: Vec<Arc<dyn Listener>>,
    outbox: Arc<dyn ReactionStore>,
    dead_letters: Arc<dyn DeadLetterStore>,
    bus: Arc<EventBus>,
    retry: RetryPolicy,
    in_flight: AtomicUsize,
    idle: Notify,
}

impl Shared {
    async fn deliver(&self, fact: &Fact) {
        let mut settled = true;
        for listener in &self.listeners {
            debug!(fact = %fact.id, listener = listener.name(), "delivering");
            let outcome = self
                .retry
                .run(listener.name(), || listener.handle(fact))
                .await;
            if let Err(exhausted) = outcome {
                settled &= self.dead_letter(fact, listener.name(), exhausted).await;
            }
        }

        // Left in the outbox when a dead letter could not be written, so
        // recovery redelivers it.
        if settled && let Err(e) = self.outbox.acknowledge(&fact.id).await {
            warn!(fact = %fact.id, error = %e, "failed to acknowledge fact");
        }
    }

    async fn dead_letter(&self, fact: &Fact, listener: &str, exhausted: Exhausted) -> bool {
        let letter = DeadLetter {
            id: 0,
            fact: fact.clone(),
            listener: listener.to_string(),
            error: exhausted.error.to_string(),
            attempts: exhausted.attempts,
            failed_at: Utc::now(),
        };
        error!(
            fact = %fact.id,
            reaction = %fact.reaction.key(),
            listener,
            attempts = exhausted.attempts,
            error = %exhausted.error,
            "fact dead-lettered, reactant needs recount"
        );
        self.bus.emit(Event::DeadLettered {
            fact_id: fact.id,
            reactant: fact.reactant().clone(),
            listener: listener.to_string(),
            error: letter.error.clone(),
        });

        match self.dead_letters.record(&letter).await {
            Ok(_) => true,
            Err(e) => {
                error!(fact = %fact.id, error = %e, "failed to record dead letter");
                false
            }
        }
    }

    fn finish(&self) {
        if self.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }
}

/// Sharded, ordered-per-reactant fact delivery.
pub struct Dispatcher {
    shards: Vec<mpsc::UnboundedSender<Fact>>,
    workers: Vec<JoinHandle<()>>,
    shared: Arc<Shared>,
}

impl Dispatcher {
    /// Spawns `shards` workers on the current tokio runtime. The listener
    /// list is fixed from here on.
    pub fn start(
        listeners: Vec<Arc<dyn Listener>>,
        outbox: Arc<dyn ReactionStore>,
        dead_letters: Arc<dyn DeadLetterStore>,
        bus: Arc<EventBus>,
        retry: RetryPolicy,
        shards: usize,
    ) -> Self {
        let shared = Arc::new(Shared {
            listeners,
            outbox,
            dead_letters,
            bus,
            retry,
            in_flight: AtomicUsize::new(0),
            idle: Notify::new(),
        });

        let (shards, workers): (Vec<_>, Vec<_>) = (0..shards.max(1))
            .map(|_| {
                let (tx, mut rx) = mpsc::unbounded_channel::<Fact>();
                let shared = Arc::clone(&shared);
                let worker = tokio::spawn(async move {
                    while let Some(fact) = rx.recv().await {
                        shared.deliver(&fact).await;
                        shared.finish();
                    }
                });
                (tx, worker)
            })
            .unzip();

        Self {
            shards,
            workers,
            shared,
        }
    }

    /// Queues a fact for delivery. Never blocks.
    pub fn publish(&self, fact: Fact) {
        let shard = self.shard_for(fact.reactant());
        self.shared.in_flight.fetch_add(1, Ordering::SeqCst);
        if let Err(mpsc::error::SendError(fact)) = self.shards[shard].send(fact) {
            // Still in the outbox; recovery picks it up.
            error!(fact = %fact.id, shard, "dispatch worker gone, fact left pending");
            self.shared.finish();
        }
    }

    /// Facts published but not yet fully delivered.
    pub fn in_flight(&self) -> usize {
        self.shared.in_flight.load(Ordering::SeqCst)
    }

    /// Waits until every published fact has been delivered or dead-lettered.
    pub async fn settle(&self) {
        loop {
            let idle = self.shared.idle.notified();
            if self.in_flight() == 0 {
                return;
            }
            idle.await;
        }
    }

    /// Drains the queues and stops the workers.
    pub async fn shutdown(mut self) {
        self.settle().await;
        self.shards.clear();
        for worker in self.workers.drain(..) {
            if let Err(e) = worker.await {
                warn!(error = %e, "dispatch worker ended abnormally");
            }
        }
    }

    fn shard_for(&self, reactant: &EntityRef) -> usize {
        let mut hasher = DefaultHasher::new();
        reactant.hash(&mut hasher);
        (hasher.finish() % self.shards.len() as u64) as usize
    }
}
