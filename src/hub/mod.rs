use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{info, warn};
use uuid::Uuid;

use crate::engine::retry::RetryPolicy;
use crate::error::AppError;
use crate::models::{LoadEvent, Snapshot};
use crate::observability::metrics::Metrics;
use crate::store::{FeedError, FeedSubscription, LoadStore};

pub type ClientId = Uuid;

/// What a registered client receives after its snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HubMessage {
    Event(LoadEvent),
    /// The hub dropped this client; it must register again.
    Resync { reason: String },
}

pub struct Registration {
    pub client_id: ClientId,
    pub snapshot: Snapshot,
    events: mpsc::Receiver<HubMessage>,
}

impl Registration {
    /// `None` once the hub stopped forwarding to this client.
    pub async fn recv(&mut self) -> Option<HubMessage> {
        self.events.recv().await
    }

    pub fn into_parts(self) -> (ClientId, Snapshot, ReceiverStream<HubMessage>) {
        (self.client_id, self.snapshot, ReceiverStream::new(self.events))
    }
}

struct ClientEntry {
    registered_at: DateTime<Utc>,
    // Dropping the sender stops the forwarding task.
    _stop: oneshot::Sender<()>,
}

/// Fans change-feed events out to connected clients.
///
/// Each client gets its own forwarding task and a bounded outbound channel.
/// A client that stops draining its channel only stalls its own task; once
/// it falls further behind than the feed buffer, it is dropped with a
/// `Resync` notice instead of having events skipped.
pub struct SubscriptionHub {
    store: Arc<LoadStore>,
    clients: Arc<DashMap<ClientId, ClientEntry>>,
    client_buffer: usize,
    retry: RetryPolicy,
    metrics: Metrics,
}

impl SubscriptionHub {
    pub fn new(
        store: Arc<LoadStore>,
        client_buffer: usize,
        retry: RetryPolicy,
        metrics: Metrics,
    ) -> Self {
        Self {
            store,
            clients: Arc::new(DashMap::new()),
            client_buffer: client_buffer.max(1),
            retry,
            metrics,
        }
    }

    pub async fn register(&self) -> Result<Registration, AppError> {
        let (snapshot, subscription) = self
            .retry
            .run(&self.metrics, "snapshot", || self.store.snapshot_and_subscribe())
            .await?;

        let client_id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(self.client_buffer);
        let (stop_tx, stop_rx) = oneshot::channel();

        self.clients.insert(
            client_id,
            ClientEntry {
                registered_at: Utc::now(),
                _stop: stop_tx,
            },
        );
        self.metrics.subscribers_connected.inc();

        tokio::spawn(forward(
            client_id,
            subscription,
            tx,
            stop_rx,
            self.clients.clone(),
            self.metrics.clone(),
        ));

        info!(
            client_id = %client_id,
            as_of = snapshot.as_of,
            loads = snapshot.loads.len(),
            "client registered"
        );

        Ok(Registration {
            client_id,
            snapshot,
            events: rx,
        })
    }

    /// Stops delivery to `client_id`. Unknown or already-removed ids are ignored.
    pub fn unregister(&self, client_id: ClientId) {
        if let Some((_, entry)) = self.clients.remove(&client_id) {
            let connected_for = Utc::now() - entry.registered_at;
            info!(
                client_id = %client_id,
                connected_ms = connected_for.num_milliseconds(),
                "client unregistered"
            );
        }
    }

    pub fn is_registered(&self, client_id: ClientId) -> bool {
        self.clients.contains_key(&client_id)
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }
}

async fn forward(
    client_id: ClientId,
    mut subscription: FeedSubscription,
    tx: mpsc::Sender<HubMessage>,
    mut stop_rx: oneshot::Receiver<()>,
    clients: Arc<DashMap<ClientId, ClientEntry>>,
    metrics: Metrics,
) {
    let reason = loop {
        tokio::select! {
            _ = &mut stop_rx => break "unregistered",
            _ = tx.closed() => break "disconnected",
            received = subscription.recv() => match received {
                Ok(event) => {
                    tokio::select! {
                        _ = &mut stop_rx => break "unregistered",
                        sent = tx.send(HubMessage::Event(event)) => {
                            if sent.is_err() {
                                break "disconnected";
                            }
                        }
                    }
                }
                Err(err @ (FeedError::Lagged(_) | FeedError::Gap { .. })) => {
                    warn!(client_id = %client_id, error = %err, "dropping subscriber; resync required");
                    // Best effort: a full channel still ends the stream, which
                    // means the same thing to the client.
                    let _ = tx.try_send(HubMessage::Resync {
                        reason: err.to_string(),
                    });
                    break "lagged";
                }
                Err(FeedError::Closed) => break "feed_closed",
            },
        }
    };

    clients.remove(&client_id);
    metrics.subscribers_connected.dec();
    metrics
        .subscriber_drops_total
        .with_label_values(&[reason])
        .inc();
    info!(client_id = %client_id, reason, "subscription ended");
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Utc;
    use tokio::time::{Duration, timeout};
    use uuid::Uuid;

    use super::{HubMessage, SubscriptionHub};
    use crate::engine::retry::RetryPolicy;
    use crate::models::{Load, NewLoad};
    use crate::observability::metrics::Metrics;
    use crate::store::LoadStore;

    fn setup(feed_capacity: usize, client_buffer: usize) -> (Arc<LoadStore>, SubscriptionHub) {
        let metrics = Metrics::new();
        let store = Arc::new(LoadStore::in_memory(feed_capacity, metrics.clone()));
        let hub = SubscriptionHub::new(
            store.clone(),
            client_buffer,
            RetryPolicy::default(),
            metrics,
        );
        (store, hub)
    }

    fn load() -> Load {
        Load::new(
            Uuid::new_v4(),
            NewLoad {
                pickup: "Fresno, CA".to_string(),
                dropoff: "Portland, OR".to_string(),
                distance: "750 mi".to_string(),
                price: "$1,900".to_string(),
                load_type: "Reefer".to_string(),
                intake_key: None,
            },
            Utc::now(),
        )
    }

    async fn next(registration: &mut super::Registration) -> Option<HubMessage> {
        timeout(Duration::from_secs(2), registration.recv())
            .await
            .expect("hub message within timeout")
    }

    #[tokio::test]
    async fn snapshot_then_events_in_sequence() {
        let (store, hub) = setup(64, 16);
        store.insert(load()).unwrap();

        let mut registration = hub.register().await.unwrap();
        assert_eq!(registration.snapshot.loads.len(), 1);
        assert_eq!(registration.snapshot.as_of, 1);

        let a = store.insert(load()).unwrap();
        let b = store.insert(load()).unwrap();

        assert_eq!(next(&mut registration).await, Some(HubMessage::Event(a)));
        assert_eq!(next(&mut registration).await, Some(HubMessage::Event(b)));
    }

    #[test]
    fn hub_messages_are_tagged_by_type() {
        let event = crate::models::LoadEvent {
            sequence: 7,
            load_id: Uuid::from_u128(3),
            load: Load::new(
                Uuid::from_u128(3),
                NewLoad {
                    pickup: "Reno, NV".to_string(),
                    dropoff: "Elko, NV".to_string(),
                    distance: String::new(),
                    price: String::new(),
                    load_type: String::new(),
                    intake_key: None,
                },
                Utc::now(),
            ),
        };

        let frame = serde_json::to_value(HubMessage::Event(event)).unwrap();
        assert_eq!(frame["type"], "event");
        assert_eq!(frame["sequence"], 7);
        assert_eq!(frame["load_id"], Uuid::from_u128(3).to_string());
        assert_eq!(frame["load"]["status"], "Pending");

        let frame = serde_json::to_value(HubMessage::Resync {
            reason: "lagged".to_string(),
        })
        .unwrap();
        assert_eq!(frame, serde_json::json!({ "type": "resync", "reason": "lagged" }));
    }

    #[tokio::test]
    async fn unregister_is_idempotent_and_ends_stream() {
        let (_store, hub) = setup(64, 16);
        let mut registration = hub.register().await.unwrap();
        let id = registration.client_id;
        assert!(hub.is_registered(id));

        hub.unregister(id);
        hub.unregister(id);

        assert!(!hub.is_registered(id));
        assert_eq!(next(&mut registration).await, None);
    }

    #[tokio::test]
    async fn slow_client_is_dropped_with_resync() {
        let (store, hub) = setup(4, 1);
        let mut slow = hub.register().await.unwrap();
        let mut fast = hub.register().await.unwrap();

        let mut expected = Vec::new();
        for _ in 0..12 {
            let event = store.insert(load()).unwrap();
            // The fast client keeps up with every event.
            assert_eq!(
                next(&mut fast).await,
                Some(HubMessage::Event(event.clone()))
            );
            expected.push(event);
        }

        let mut messages = Vec::new();
        while let Some(message) = next(&mut slow).await {
            messages.push(message);
        }

        // A resync notice, when it fits in the channel, is the last thing sent.
        let resync_at = messages
            .iter()
            .position(|m| matches!(m, HubMessage::Resync { .. }));
        if let Some(index) = resync_at {
            assert_eq!(index, messages.len() - 1);
        }

        // Whatever was delivered is a gap-free prefix, and the stream ended
        // short of the full run.
        let received: Vec<_> = messages
            .into_iter()
            .filter_map(|m| match m {
                HubMessage::Event(event) => Some(event),
                HubMessage::Resync { .. } => None,
            })
            .collect();
        assert!(received.len() < expected.len());
        assert_eq!(received[..], expected[..received.len()]);
        assert!(!hub.is_registered(slow.client_id));
        assert!(hub.is_registered(fast.client_id));
    }

    #[tokio::test]
    async fn dropped_registration_releases_the_client() {
        let (_store, hub) = setup(64, 16);
        let registration = hub.register().await.unwrap();
        let id = registration.client_id;
        drop(registration);

        timeout(Duration::from_secs(2), async {
            while hub.is_registered(id) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("client released after disconnect");
        assert_eq!(hub.client_count(), 0);
    }
}
