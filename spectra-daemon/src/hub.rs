//! Event distributor: fan-out of [`SweepEvent`]s to subscribers.
//!
//! Every subscriber owns a bounded queue. Publishing never waits: a full
//! queue drops that subscriber, which must reconnect and resynchronise from
//! the state snapshot it receives on subscribe.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use tokio::sync::mpsc;

use spectra_core::{EventEnvelope, SweepEvent};

#[derive(Clone)]
pub struct EventHub {
    inner: Arc<HubInner>,
}

struct HubInner {
    subscribers: Mutex<Subscribers>,
    next_id: AtomicU64,
    queue: usize,
}

#[derive(Default)]
struct Subscribers {
    seq: u64,
    senders: HashMap<u64, mpsc::Sender<EventEnvelope>>,
}

impl Subscribers {
    fn envelope(&mut self, event: SweepEvent) -> EventEnvelope {
        self.seq += 1;
        EventEnvelope {
            seq: self.seq,
            sent_at: Utc::now(),
            event,
        }
    }
}

/// One subscriber's receiving end.
pub struct Subscription {
    pub id: u64,
    pub events: mpsc::Receiver<EventEnvelope>,
}

impl EventHub {
    pub fn new(queue: usize) -> Self {
        Self {
            inner: Arc::new(HubInner {
                subscribers: Mutex::new(Subscribers::default()),
                next_id: AtomicU64::new(1),
                queue: queue.max(1),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Subscribers> {
        self.inner
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Deliver to every subscriber without blocking. Returns how many
    /// subscribers received the event.
    pub fn publish(&self, event: SweepEvent) -> usize {
        let mut subs = self.lock();
        let name = event.name();
        let envelope = subs.envelope(event);
        let mut dropped = Vec::new();
        let mut delivered = 0;
        for (id, tx) in &subs.senders {
            match tx.try_send(envelope.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!(
                        subscriber = id,
                        event = name,
                        kind = %spectra_core::ErrorKind::DistributionOverflow,
                        "subscriber queue full; dropping subscriber"
                    );
                    dropped.push(*id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => dropped.push(*id),
            }
        }
        for id in dropped {
            subs.senders.remove(&id);
        }
        delivered
    }

    /// Register a subscriber whose queue starts with `initial`. The initial
    /// events are built under the distribution lock, so nothing published
    /// afterwards can overtake them.
    pub fn subscribe_with<F>(&self, initial: F) -> Subscription
    where
        F: FnOnce() -> Vec<SweepEvent>,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let mut subs = self.lock();
        let events = initial();
        let (tx, rx) = mpsc::channel(self.inner.queue.max(events.len() + 1));
        for event in events {
            let envelope = subs.envelope(event);
            let _ = tx.try_send(envelope);
        }
        subs.senders.insert(id, tx);
        tracing::debug!(subscriber = id, "subscriber connected");
        Subscription { id, events: rx }
    }

    pub fn subscribe(&self) -> Subscription {
        self.subscribe_with(Vec::new)
    }

    pub fn unsubscribe(&self, id: u64) {
        if self.lock().senders.remove(&id).is_some() {
            tracing::debug!(subscriber = id, "subscriber disconnected");
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().senders.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spectra_core::events::Heartbeat;
    use spectra_core::ServerState;

    fn heartbeat(version: u64) -> SweepEvent {
        SweepEvent::Heartbeat(Heartbeat {
            version,
            subscribers: 0,
            uptime_secs: 0,
        })
    }

    #[tokio::test]
    async fn initial_events_precede_later_publishes() {
        let hub = EventHub::new(8);
        let mut sub = hub.subscribe_with(|| vec![SweepEvent::StateSync(ServerState::idle(4))]);
        hub.publish(heartbeat(5));

        let first = sub.events.recv().await.unwrap();
        assert_eq!(first.event.name(), "state_sync");
        let second = sub.events.recv().await.unwrap();
        assert_eq!(second.event.name(), "heartbeat");
        assert!(second.seq > first.seq);
    }

    #[test]
    fn publish_wakes_a_waiting_subscriber() {
        let hub = EventHub::new(4);
        let mut sub = hub.subscribe();
        let mut recv = tokio_test::task::spawn(sub.events.recv());

        tokio_test::assert_pending!(recv.poll());
        hub.publish(heartbeat(1));
        assert!(recv.is_woken());
        let envelope = tokio_test::assert_ready!(recv.poll()).unwrap();
        assert_eq!(envelope.event.name(), "heartbeat");
    }

    #[tokio::test]
    async fn slow_subscriber_is_dropped_without_blocking_others() {
        let hub = EventHub::new(2);
        let _slow = hub.subscribe();
        let mut fast = hub.subscribe();

        for v in 0..2 {
            assert_eq!(hub.publish(heartbeat(v)), 2);
            fast.events.recv().await.unwrap();
        }
        // The slow queue is now full; the next publish drops it.
        assert_eq!(hub.publish(heartbeat(2)), 1);
        assert_eq!(hub.subscriber_count(), 1);
        assert!(fast.events.recv().await.is_some());
    }

    #[tokio::test]
    async fn closed_receivers_are_pruned() {
        let hub = EventHub::new(4);
        let sub = hub.subscribe();
        drop(sub);
        assert_eq!(hub.publish(heartbeat(1)), 0);
        assert_eq!(hub.subscriber_count(), 0);
    }
}
