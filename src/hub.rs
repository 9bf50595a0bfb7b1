//! ==============================================================================
//! hub.rs - live-update broadcast hub
//! ==============================================================================
//!
//! purpose:
//!     fans every accepted sample (and device status line) out to every attached
//!     live client.
//!
//! model:
//!
//! ```text
//!         publish(event) ──► for each subscriber: try_send(event.clone())
//!                                  │ full / closed
//!                                  ▼
//!                             removed after the pass
//!
//!     each subscriber owns a bounded queue. the publisher never waits: a slow
//!     or vanished consumer loses its place in the set instead of stalling
//!     everybody else. delivery is at-most-once and best-effort.
//! ```
//!
//! relationships:
//!     - fed by: gateway.rs
//!     - drained by: server.rs (/stream, one `Subscription` per connection)
//!
//! ==============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::domain::{LiveEvent, Measurement};

type SubscriberSet = HashMap<u64, mpsc::Sender<LiveEvent>>;

#[derive(Debug)]
struct HubInner {
    subscribers: Mutex<SubscriberSet>,
    next_id: AtomicU64,
    capacity: usize,
}

impl HubInner {
    fn subscribers(&self) -> MutexGuard<'_, SubscriberSet> {
        self.subscribers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// cheap to clone; all clones share one subscriber set
#[derive(Debug, Clone)]
pub struct BroadcastHub {
    inner: Arc<HubInner>,
}

impl BroadcastHub {
    /// `capacity` is the per-subscriber queue depth
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(HubInner {
                subscribers: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                capacity: capacity.max(1),
            }),
        }
    }

    /// registers a new subscriber; `snapshot` becomes its first event
    pub fn subscribe(&self, snapshot: Option<Measurement>) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.inner.capacity);

        if let Some(m) = snapshot {
            // fresh queue with capacity >= 1, cannot be full
            let _ = tx.try_send(LiveEvent::Initial(m));
        }

        let mut subscribers = self.inner.subscribers();
        subscribers.insert(id, tx);
        tracing::debug!(subscriber = id, total = subscribers.len(), "live subscriber attached");
        drop(subscribers);

        Subscription { id, rx, hub: self.clone() }
    }

    pub fn unsubscribe(&self, id: u64) {
        let mut subscribers = self.inner.subscribers();
        if subscribers.remove(&id).is_some() {
            tracing::debug!(subscriber = id, total = subscribers.len(), "live subscriber detached");
        }
    }

    /// hands `event` to every subscriber without blocking; returns how many took it
    pub fn publish(&self, event: LiveEvent) -> usize {
        let mut subscribers = self.inner.subscribers();
        let mut dead = Vec::new();
        let mut delivered = 0;

        for (id, tx) in subscribers.iter() {
            match tx.try_send(event.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    tracing::debug!(subscriber = id, "live subscriber queue full, dropping it");
                    dead.push(*id);
                }
                Err(TrySendError::Closed(_)) => dead.push(*id),
            }
        }

        for id in dead {
            subscribers.remove(&id);
        }
        delivered
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers().len()
    }

    /// detaches everybody; their streams end once queued events are read
    pub fn close_all(&self) {
        let mut subscribers = self.inner.subscribers();
        if !subscribers.is_empty() {
            tracing::debug!(total = subscribers.len(), "closing all live subscribers");
        }
        subscribers.clear();
    }
}

/// one live client's queue; leaves the hub when dropped
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    rx: mpsc::Receiver<LiveEvent>,
    hub: BroadcastHub,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// waits for the next event; `None` once the hub has dropped this subscriber
    pub async fn recv(&mut self) -> Option<LiveEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<LiveEvent> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.hub.unsubscribe(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Source;
    use chrono::Utc;

    fn reading(t: f64) -> Measurement {
        Measurement {
            temperature: t,
            humidity: 50.0,
            timestamp: Utc::now(),
            source: Source::Remote,
            raw: None,
        }
    }

    #[test]
    fn every_attached_subscriber_gets_the_event_once() {
        let hub = BroadcastHub::new(8);
        let mut subs: Vec<_> = (0..3).map(|_| hub.subscribe(None)).collect();

        let event = LiveEvent::Reading(reading(20.0));
        assert_eq!(hub.publish(event.clone()), 3);

        for sub in subs.iter_mut() {
            assert_eq!(sub.try_recv(), Some(event.clone()));
            assert_eq!(sub.try_recv(), None);
        }
    }

    #[test]
    fn unsubscribed_before_publish_gets_nothing() {
        let hub = BroadcastHub::new(8);
        let mut stays = hub.subscribe(None);
        let leaves = hub.subscribe(None);
        hub.unsubscribe(leaves.id());

        assert_eq!(hub.publish(LiveEvent::Reading(reading(20.0))), 1);
        assert!(stays.try_recv().is_some());
    }

    #[test]
    fn late_subscriber_sees_only_its_snapshot() {
        let hub = BroadcastHub::new(8);
        hub.publish(LiveEvent::Reading(reading(20.0)));

        let mut late = hub.subscribe(Some(reading(20.0)));
        assert!(matches!(late.try_recv(), Some(LiveEvent::Initial(_))));
        assert_eq!(late.try_recv(), None);
    }

    #[test]
    fn full_queue_drops_only_the_slow_subscriber() {
        let hub = BroadcastHub::new(2);
        let mut fast = hub.subscribe(None);
        let _slow = hub.subscribe(None);

        for i in 0..3 {
            hub.publish(LiveEvent::Reading(reading(i as f64)));
            fast.try_recv().unwrap();
        }

        assert_eq!(hub.subscriber_count(), 1);
        hub.publish(LiveEvent::Reading(reading(9.0)));
        assert!(fast.try_recv().is_some());
    }

    #[test]
    fn dropping_a_subscription_leaves_the_set() {
        let hub = BroadcastHub::new(4);
        let sub = hub.subscribe(None);
        assert_eq!(hub.subscriber_count(), 1);
        drop(sub);
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[test]
    fn order_is_preserved_per_subscriber() {
        let hub = BroadcastHub::new(16);
        let mut sub = hub.subscribe(None);
        for i in 0..5 {
            hub.publish(LiveEvent::Reading(reading(i as f64)));
        }
        let temps: Vec<f64> = std::iter::from_fn(|| sub.try_recv())
            .map(|e| match e {
                LiveEvent::Reading(m) => m.temperature,
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(temps, vec![0.0, 1.0, 2.0, 3.0, 4.0]);
    }

    #[tokio::test]
    async fn close_all_ends_every_stream() {
        let hub = BroadcastHub::new(4);
        let mut a = hub.subscribe(Some(reading(1.0)));
        let mut b = hub.subscribe(None);
        hub.close_all();

        assert!(matches!(a.recv().await, Some(LiveEvent::Initial(_))));
        assert_eq!(a.recv().await, None);
        assert_eq!(b.recv().await, None);
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn dropped_subscriber_stream_ends_after_queued_events() {
        let hub = BroadcastHub::new(1);
        let mut slow = hub.subscribe(None);
        hub.publish(LiveEvent::Reading(reading(1.0)));
        hub.publish(LiveEvent::Reading(reading(2.0)));

        assert!(matches!(slow.recv().await, Some(LiveEvent::Reading(_))));
        assert_eq!(slow.recv().await, None);
    }
}
