use std::sync::Mutex;

use thiserror::Error;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

use crate::models::{Load, LoadEvent};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FeedError {
    #[error("subscriber lagged behind the feed by {0} events")]
    Lagged(u64),

    #[error("sequence gap: expected {expected}, received {received}")]
    Gap { expected: u64, received: u64 },

    #[error("change feed closed")]
    Closed,
}

/// Ordered fan-out of accepted mutations.
///
/// Sequence numbers start at 1 and increase by one per append. Sending
/// happens while the head lock is held, so broadcast order always matches
/// sequence order.
pub struct ChangeFeed {
    head: Mutex<u64>,
    tx: broadcast::Sender<LoadEvent>,
}

impl ChangeFeed {
    pub fn new(capacity: usize) -> Self {
        let (tx, _unused_rx) = broadcast::channel(capacity.max(1));
        Self {
            head: Mutex::new(0),
            tx,
        }
    }

    pub fn append(&self, load: Load) -> LoadEvent {
        let mut head = self.head.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *head += 1;

        let event = LoadEvent {
            sequence: *head,
            load_id: load.id,
            load,
        };

        // No receivers is fine: nobody is subscribed yet.
        let _ = self.tx.send(event.clone());
        event
    }

    /// Sequence of the most recent append, 0 if nothing was appended.
    pub fn head(&self) -> u64 {
        *self.head.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Events appended after this call, never older ones.
    pub fn subscribe(&self) -> FeedSubscription {
        let head = self.head.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        FeedSubscription {
            rx: self.tx.subscribe(),
            last_sequence: *head,
        }
    }
}

pub struct FeedSubscription {
    rx: broadcast::Receiver<LoadEvent>,
    last_sequence: u64,
}

impl FeedSubscription {
    pub fn last_sequence(&self) -> u64 {
        self.last_sequence
    }

    /// Next event in sequence order. Any lag or gap is reported instead of
    /// being skipped; the subscription is unusable afterwards.
    pub async fn recv(&mut self) -> Result<LoadEvent, FeedError> {
        match self.rx.recv().await {
            Ok(event) => {
                let expected = self.last_sequence + 1;
                if event.sequence != expected {
                    return Err(FeedError::Gap {
                        expected,
                        received: event.sequence,
                    });
                }
                self.last_sequence = event.sequence;
                Ok(event)
            }
            Err(RecvError::Lagged(skipped)) => Err(FeedError::Lagged(skipped)),
            Err(RecvError::Closed) => Err(FeedError::Closed),
        }
    }
}
