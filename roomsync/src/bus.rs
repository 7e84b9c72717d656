//! Synchronous topic-keyed publish/subscribe.
//!
//! Each session owns two instances: a public bus carrying
//! [`SessionEvent`](crate::events::SessionEvent)s for the host application,
//! and an internal bus carrying per-room deliveries to bindings.
//!
//! Listeners run on the publishing thread, in registration order. The
//! listener table is snapshotted before dispatch, so a listener may register
//! or remove listeners (including itself) without deadlocking.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Topic that receives every event published on the bus.
pub const ANY_TOPIC: &str = "*";

/// Handle returned by [`EventBus::on`], used to remove the listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

type Listener<E> = Arc<dyn Fn(&E) + Send + Sync>;

pub struct EventBus<E> {
    topics: Mutex<HashMap<String, Vec<(ListenerId, Listener<E>)>>>,
    next_id: AtomicU64,
}

impl<E> EventBus<E> {
    pub fn new() -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn topics(&self) -> MutexGuard<'_, HashMap<String, Vec<(ListenerId, Listener<E>)>>> {
        self.topics.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a listener for `topic`. Use [`ANY_TOPIC`] to see everything.
    pub fn on<F>(&self, topic: impl Into<String>, listener: F) -> ListenerId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.topics()
            .entry(topic.into())
            .or_default()
            .push((id, Arc::new(listener)));
        id
    }

    /// Remove a listener. Returns `false` if it was not registered.
    pub fn off(&self, id: ListenerId) -> bool {
        let mut topics = self.topics();
        let mut removed = false;
        topics.retain(|_, listeners| {
            let before = listeners.len();
            listeners.retain(|(lid, _)| *lid != id);
            removed |= listeners.len() != before;
            !listeners.is_empty()
        });
        removed
    }

    /// Deliver `event` to listeners of `topic` and of [`ANY_TOPIC`].
    ///
    /// Returns the number of listeners invoked.
    pub fn publish(&self, topic: &str, event: &E) -> usize {
        let mut targets: Vec<(ListenerId, Listener<E>)> = {
            let topics = self.topics();
            let exact = topics.get(topic).into_iter().flatten();
            let any = if topic == ANY_TOPIC {
                None
            } else {
                topics.get(ANY_TOPIC)
            };
            exact
                .chain(any.into_iter().flatten())
                .map(|(id, listener)| (*id, Arc::clone(listener)))
                .collect()
        };
        // Listener IDs are handed out in increasing order
        targets.sort_by_key(|(id, _)| *id);

        for (_, listener) in &targets {
            listener(event);
        }
        targets.len()
    }
}

impl<E> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_publish_reaches_topic_listeners() {
        let bus = EventBus::<u32>::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = seen.clone();
        bus.on("a", move |v: &u32| sink.lock().unwrap().push(*v));

        assert_eq!(bus.publish("a", &1), 1);
        assert_eq!(bus.publish("b", &2), 0);
        assert_eq!(*seen.lock().unwrap(), vec![1]);
    }

    #[test]
    fn test_registration_order_across_wildcard() {
        let bus = EventBus::<&'static str>::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let o = order.clone();
        bus.on("topic", move |_: &&str| o.lock().unwrap().push("first"));
        let o = order.clone();
        bus.on(ANY_TOPIC, move |_: &&str| o.lock().unwrap().push("any"));
        let o = order.clone();
        bus.on("topic", move |_: &&str| o.lock().unwrap().push("third"));

        assert_eq!(bus.publish("topic", &"x"), 3);
        assert_eq!(*order.lock().unwrap(), vec!["first", "any", "third"]);
    }

    #[test]
    fn test_off_removes_listener() {
        let bus = EventBus::<()>::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let h = hits.clone();
        let id = bus.on("t", move |_: &()| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        bus.publish("t", &());
        assert!(bus.off(id));
        assert!(!bus.off(id));
        bus.publish("t", &());

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(bus.publish("t", &()), 0);
    }

    #[test]
    fn test_listener_can_reenter_bus() {
        let bus = Arc::new(EventBus::<u32>::new());
        let inner = Arc::clone(&bus);
        bus.on("t", move |_: &u32| {
            // Registering from inside a listener must not deadlock
            inner.on("t", |_: &u32| {});
        });

        assert_eq!(bus.publish("t", &0), 1);
        // The listener added during the first publish is live for the next one
        assert_eq!(bus.publish("t", &0), 2);
    }
}
