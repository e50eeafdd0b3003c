//! # Per-tenant event fan-out.
//!
//! [`EventBus`] keeps one live output channel per tenant. Subscribing
//! replaces (and implicitly closes) any prior channel for the same tenant,
//! so at most one subscriber per tenant is ever active.
//!
//! ```text
//! Publishers (supervisors, manager):        Subscribers (one per tenant):
//!   publish("alice", ev) ───► [alice tx] ───► alice's mpsc receiver
//!   publish("bob", ev)   ───► [bob tx]   ───► bob's mpsc receiver
//!   publish("carol", ev) ───► (no subscriber → dropped)
//! ```
//!
//! ## Rules
//! - **Best-effort**: delivery happens only if a subscriber exists; there is
//!   no buffering or replay, and a full queue drops the event.
//! - **Replace-on-subscribe**: a second `subscribe` for the same tenant
//!   closes the first channel; only the new one receives further events.
//! - **Keep-alive**: a `connected` event is sent immediately on subscribe
//!   and a keep-alive every interval thereafter; once the consumer side is
//!   gone the subscription is removed.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, RwLock};
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::event::Event;

struct Subscription {
    tx: mpsc::Sender<Event>,
    /// Cancelled when the subscription is replaced or removed, stopping
    /// its keep-alive task.
    guard: CancellationToken,
}

struct BusInner {
    subs: RwLock<HashMap<String, Subscription>>,
    capacity: usize,
    keepalive: Duration,
}

/// Per-tenant live status channels with at most one subscriber per tenant.
///
/// Cheap to clone (internally holds an `Arc`); every clone addresses the
/// same subscriber map.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    /// Creates a bus with the given per-channel capacity and keep-alive
    /// interval.
    pub fn new(capacity: usize, keepalive: Duration) -> Self {
        Self {
            inner: Arc::new(BusInner {
                subs: RwLock::new(HashMap::new()),
                capacity: capacity.max(1),
                keepalive,
            }),
        }
    }

    /// Opens a live channel for `tenant`, replacing any prior one.
    ///
    /// The returned receiver immediately carries a `connected` handshake
    /// event; the prior tenant channel (if any) stops receiving events and
    /// closes.
    pub async fn subscribe(&self, tenant: &str) -> mpsc::Receiver<Event> {
        let (tx, rx) = mpsc::channel(self.inner.capacity);
        let _ = tx.try_send(Event::stream_connected());

        let guard = CancellationToken::new();
        let prior = self.inner.subs.write().await.insert(
            tenant.to_string(),
            Subscription {
                tx: tx.clone(),
                guard: guard.clone(),
            },
        );
        if let Some(prior) = prior {
            prior.guard.cancel();
            debug!(tenant, "prior event subscription replaced");
        }

        self.spawn_keepalive(tenant.to_string(), tx, guard);
        rx
    }

    /// Delivers `event` to the tenant's subscriber, if one exists.
    ///
    /// Best-effort: no subscriber or a full queue drops the event; a closed
    /// consumer removes the subscription.
    pub async fn publish(&self, tenant: &str, event: Event) {
        let tx = {
            let subs = self.inner.subs.read().await;
            subs.get(tenant).map(|sub| sub.tx.clone())
        };
        let Some(tx) = tx else { return };

        match tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!(tenant, "event dropped: subscriber queue full");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.inner.remove_if_current(tenant, &tx).await;
            }
        }
    }

    /// Number of tenants with a live subscription.
    pub async fn subscriber_count(&self) -> usize {
        self.inner.subs.read().await.len()
    }

    fn spawn_keepalive(&self, tenant: String, tx: mpsc::Sender<Event>, guard: CancellationToken) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    // Subscription replaced or removed; dropping `tx` lets
                    // the old receiver observe end-of-stream.
                    _ = guard.cancelled() => return,
                    _ = time::sleep(inner.keepalive) => {
                        match tx.try_send(Event::keep_alive()) {
                            Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => {}
                            Err(mpsc::error::TrySendError::Closed(_)) => {
                                inner.remove_if_current(&tenant, &tx).await;
                                debug!(tenant, "subscriber disconnected, subscription removed");
                                return;
                            }
                        }
                    }
                }
            }
        });
    }
}

impl BusInner {
    /// Removes the tenant's subscription if it still maps to `tx`
    /// (a replacement may have raced in).
    async fn remove_if_current(&self, tenant: &str, tx: &mpsc::Sender<Event>) {
        let mut subs = self.subs.write().await;
        if subs.get(tenant).is_some_and(|sub| sub.tx.same_channel(tx)) {
            if let Some(sub) = subs.remove(tenant) {
                sub.guard.cancel();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::event::EventKind;

    fn bus() -> EventBus {
        EventBus::new(8, Duration::from_secs(30))
    }

    #[tokio::test]
    async fn publish_without_subscriber_is_dropped() {
        let bus = bus();
        bus.publish("alice", Event::new(EventKind::Status)).await;
        assert_eq!(bus.subscriber_count().await, 0);
    }

    #[tokio::test]
    async fn subscriber_gets_handshake_then_events() {
        let bus = bus();
        let mut rx = bus.subscribe("alice").await;

        let first = rx.recv().await.unwrap();
        assert_eq!(first.kind, EventKind::Connected);

        bus.publish("alice", Event::new(EventKind::Success).with_device("6281111"))
            .await;
        let ev = rx.recv().await.unwrap();
        assert_eq!(ev.kind, EventKind::Success);
        assert_eq!(ev.number.as_deref(), Some("6281111"));
    }

    #[tokio::test]
    async fn events_are_isolated_per_tenant() {
        let bus = bus();
        let mut alice = bus.subscribe("alice").await;
        let mut bob = bus.subscribe("bob").await;
        alice.recv().await.unwrap();
        bob.recv().await.unwrap();

        bus.publish("bob", Event::new(EventKind::Qr)).await;
        let ev = bob.recv().await.unwrap();
        assert_eq!(ev.kind, EventKind::Qr);
        assert!(alice.try_recv().is_err());
    }

    #[tokio::test]
    async fn resubscribe_replaces_prior_channel() {
        let bus = bus();
        let mut first = bus.subscribe("bob").await;
        first.recv().await.unwrap();

        let mut second = bus.subscribe("bob").await;
        second.recv().await.unwrap();

        bus.publish("bob", Event::new(EventKind::Status)).await;
        assert_eq!(second.recv().await.unwrap().kind, EventKind::Status);

        // The first channel stops receiving and closes once its keep-alive
        // task observes the cancelled guard.
        let closed = time::timeout(Duration::from_secs(1), first.recv()).await;
        assert_eq!(bus.subscriber_count().await, 1);
        assert!(matches!(closed, Ok(None)));
    }

    #[tokio::test(start_paused = true)]
    async fn keepalive_is_sent_periodically() {
        let bus = EventBus::new(8, Duration::from_secs(30));
        let mut rx = bus.subscribe("alice").await;
        rx.recv().await.unwrap();

        time::sleep(Duration::from_secs(31)).await;
        let ev = rx.recv().await.unwrap();
        assert_eq!(ev.kind, EventKind::Connected);
        assert_eq!(ev.message.as_deref(), Some("keep-alive"));
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_consumer_is_removed() {
        let bus = EventBus::new(8, Duration::from_secs(30));
        let rx = bus.subscribe("alice").await;
        assert_eq!(bus.subscriber_count().await, 1);
        drop(rx);

        time::sleep(Duration::from_secs(31)).await;
        tokio::task::yield_now().await;
        assert_eq!(bus.subscriber_count().await, 0);
    }
}
