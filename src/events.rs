//! Typed publish/subscribe for the notifications the engine raises.
//!
//! Every subscriber gets its own unbounded channel, so a slow reader never makes the engine wait
//! and never misses an event published after it subscribed.

use crate::model::{EntityKind, EntityRef, TempId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::trace;

/// Something that screens may want to refresh on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "event")]
pub enum SyncEvent {
    /// A queued operation reached the server. For creates, `temp_id` is the id the entity had
    /// before and every reference to it has already been rewritten to `id`.
    EntitySynced {
        entity: EntityKind,
        temp_id: Option<TempId>,
        id: i64,
    },
    /// A queued operation will not be delivered without intervention.
    SyncFailed {
        operation_id: i64,
        entity: EntityKind,
        target: EntityRef,
        error: String,
    },
    BecameOnline,
    BecameOffline,
    /// A write was saved locally and will be sent later.
    Queued {
        operation_id: i64,
        entity: EntityKind,
        target: EntityRef,
    },
    /// A delete cancelled undelivered operations, so nothing will be sent for this entity.
    Collapsed {
        entity: EntityKind,
        target: EntityRef,
        removed: usize,
    },
}

impl Display for SyncEvent {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncEvent::EntitySynced { entity, id, .. } => write!(f, "Synced {entity} {id}"),
            SyncEvent::SyncFailed {
                entity,
                target,
                error,
                ..
            } => write!(f, "Could not sync {entity} {target}: {error}"),
            SyncEvent::BecameOnline => write!(f, "Back online"),
            SyncEvent::BecameOffline => write!(f, "Offline"),
            SyncEvent::Queued { entity, target, .. } => {
                write!(f, "Saved {entity} {target}, will sync")
            }
            SyncEvent::Collapsed { entity, target, .. } => {
                write!(f, "Discarded unsynced {entity} {target}")
            }
        }
    }
}

pub type SubscriptionId = u64;

/// A handle on the event stream. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    id: SubscriptionId,
    receiver: UnboundedReceiver<SyncEvent>,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Waits for the next event. Returns `None` once the bus is gone or the subscription has been
    /// removed.
    pub async fn recv(&mut self) -> Option<SyncEvent> {
        self.receiver.recv().await
    }

    /// Returns the events that have already arrived without waiting.
    pub fn drain(&mut self) -> Vec<SyncEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.receiver.try_recv() {
            events.push(event);
        }
        events
    }
}

#[derive(Debug, Default)]
struct Subscribers {
    next_id: SubscriptionId,
    senders: BTreeMap<SubscriptionId, UnboundedSender<SyncEvent>>,
}

/// Cloning the bus gives another handle on the same set of subscribers.
#[derive(Debug, Clone, Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<Subscribers>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn subscribers(&self) -> MutexGuard<'_, Subscribers> {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn subscribe(&self) -> Subscription {
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut subscribers = self.subscribers();
        subscribers.next_id += 1;
        let id = subscribers.next_id;
        subscribers.senders.insert(id, sender);
        Subscription { id, receiver }
    }

    /// Removes a subscriber. Returns `false` if it was not subscribed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.subscribers().senders.remove(&id).is_some()
    }

    /// Delivers `event` to every subscriber in subscription order.
    pub fn publish(&self, event: SyncEvent) {
        trace!("Publishing {event:?}");
        self.subscribers()
            .senders
            .retain(|_, sender| sender.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers().senders.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_every_subscriber_gets_every_event() {
        let bus = EventBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        bus.publish(SyncEvent::BecameOffline);
        bus.publish(SyncEvent::BecameOnline);
        assert_eq!(a.recv().await, Some(SyncEvent::BecameOffline));
        assert_eq!(
            b.drain(),
            vec![SyncEvent::BecameOffline, SyncEvent::BecameOnline]
        );
        assert_eq!(a.drain(), vec![SyncEvent::BecameOnline]);
    }

    #[tokio::test]
    async fn test_unsubscribe_and_drop() {
        let bus = EventBus::new();
        let mut a = bus.subscribe();
        let b = bus.subscribe();
        assert_ne!(a.id(), b.id());
        assert!(bus.unsubscribe(a.id()));
        assert!(!bus.unsubscribe(a.id()));
        assert_eq!(a.recv().await, None);

        drop(b);
        bus.publish(SyncEvent::BecameOnline);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_failure_message_names_the_record() {
        let event = SyncEvent::SyncFailed {
            operation_id: 3,
            entity: EntityKind::Transaction,
            target: EntityRef::Confirmed(917),
            error: "rejected".to_string(),
        };
        assert_eq!(event.to_string(), "Could not sync transaction 917: rejected");
    }
}
