//! Observability bus for engine notifications.
//!
//! The engine and the dispatcher emit via [`EventBus::emit`]; operators and
//! tests subscribe via [`EventBus::subscribe`]. Built on
//! [`tokio::sync::broadcast`], so a slow or absent subscriber never blocks
//! the reaction path.

use tokio::sync::broadcast;

use crate::model::{EntityRef, FactId};

/// Notifications that flow out of the engine.
#[derive(Debug, Clone)]
pub enum Event {
    /// A fact reached the aggregate store. `applied` is false for a
    /// suppressed redelivery.
    AggregateUpdated {
        fact_id: FactId,
        reactant: EntityRef,
        applied: bool,
    },
    /// A listener gave up on a fact; the reactant needs a recount.
    DeadLettered {
        fact_id: FactId,
        reactant: EntityRef,
        listener: String,
        error: String,
    },
    /// A type's weight changed and left `stale` reactants behind.
    WeightChanged {
        type_name: String,
        weight: i64,
        stale: usize,
    },
    /// A reactant's aggregates were rebuilt from the reaction store.
    Recounted {
        reactant: EntityRef,
        count: i64,
        weight: i64,
    },
}

/// A broadcast channel that any component can emit to or subscribe from.
#[derive(Debug)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    /// Create a new event bus with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Emit an event to all current subscribers.
    /// Returns the number of receivers that will see it.
    pub fn emit(&self, event: Event) -> usize {
        self.tx.send(event).unwrap_or(0)
    }

    /// Subscribe to events emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(crate::consts::EVENT_BUS_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn weight_changed() -> Event {
        Event::WeightChanged {
            type_name: "like".to_string(),
            weight: 3,
            stale: 2,
        }
    }

    #[tokio::test]
    async fn emit_reaches_subscriber() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        bus.emit(weight_changed());

        match rx.recv().await.unwrap() {
            Event::WeightChanged {
                type_name, stale, ..
            } => {
                assert_eq!(type_name, "like");
                assert_eq!(stale, 2);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn multiple_subscribers_receive_event() {
        let bus = EventBus::default();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        bus.emit(Event::Recounted {
            reactant: EntityRef::new("Post", "1"),
            count: 2,
            weight: 6,
        });

        assert!(matches!(rx1.recv().await.unwrap(), Event::Recounted { count: 2, .. }));
        assert!(matches!(rx2.recv().await.unwrap(), Event::Recounted { weight: 6, .. }));
    }

    #[test]
    fn emit_without_subscribers_returns_zero() {
        let bus = EventBus::default();
        assert_eq!(bus.emit(weight_changed()), 0);
    }

    #[test]
    fn emit_with_subscriber_returns_count() {
        let bus = EventBus::default();
        let _rx1 = bus.subscribe();
        let _rx2 = bus.subscribe();
        assert_eq!(bus.emit(weight_changed()), 2);
    }
}
