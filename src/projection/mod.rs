use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::AppError;
use crate::hub::{HubMessage, Registration, SubscriptionHub};
use crate::models::{Load, LoadEvent, LoadId, Snapshot, newest_first};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// Sequence did not follow on; the view must be rebuilt from a fresh snapshot.
    ResyncRequired { expected: u64, received: u64 },
}

/// A client's materialized view: loads by id plus a newest-first ordering.
#[derive(Debug, Clone, Default)]
pub struct ClientProjection {
    loads: HashMap<LoadId, Load>,
    ordered: Vec<LoadId>,
    last_sequence: u64,
}

impl ClientProjection {
    pub fn from_snapshot(snapshot: Snapshot) -> Self {
        let mut projection = Self {
            loads: HashMap::with_capacity(snapshot.loads.len()),
            ordered: Vec::with_capacity(snapshot.loads.len()),
            last_sequence: snapshot.as_of,
        };
        for load in snapshot.loads {
            projection.ordered.push(load.id);
            projection.loads.insert(load.id, load);
        }
        projection.resort();
        projection
    }

    pub fn apply_event(&mut self, event: &LoadEvent) -> ApplyOutcome {
        let expected = self.last_sequence + 1;
        if event.sequence != expected {
            return ApplyOutcome::ResyncRequired {
                expected,
                received: event.sequence,
            };
        }

        let previous = self.loads.insert(event.load_id, event.load.clone());
        if previous.is_none() {
            self.ordered.push(event.load_id);
        }
        self.resort();
        self.last_sequence = event.sequence;
        ApplyOutcome::Applied
    }

    pub fn get(&self, id: &LoadId) -> Option<&Load> {
        self.loads.get(id)
    }

    /// Loads newest first.
    pub fn loads(&self) -> impl Iterator<Item = &Load> {
        self.ordered.iter().filter_map(|id| self.loads.get(id))
    }

    pub fn last_sequence(&self) -> u64 {
        self.last_sequence
    }

    pub fn len(&self) -> usize {
        self.loads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loads.is_empty()
    }

    fn resort(&mut self) {
        let loads = &self.loads;
        self.ordered.sort_by(|a, b| match (loads.get(a), loads.get(b)) {
            (Some(a), Some(b)) => newest_first(a, b),
            _ => b.cmp(a),
        });
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStep {
    Applied(LoadId),
    Resynced,
}

/// Keeps a [`ClientProjection`] live from a hub registration, re-registering
/// whenever the stream reports or reveals a break in sequence.
pub struct ProjectionSession {
    hub: Arc<SubscriptionHub>,
    registration: Registration,
    projection: ClientProjection,
    resyncs: u64,
}

impl ProjectionSession {
    pub async fn connect(hub: Arc<SubscriptionHub>) -> Result<Self, AppError> {
        let mut registration = hub.register().await?;
        let snapshot = std::mem::take(&mut registration.snapshot);
        Ok(Self {
            hub,
            registration,
            projection: ClientProjection::from_snapshot(snapshot),
            resyncs: 0,
        })
    }

    pub fn projection(&self) -> &ClientProjection {
        &self.projection
    }

    pub fn resyncs(&self) -> u64 {
        self.resyncs
    }

    /// Waits for the next hub message and folds it into the view.
    pub async fn next_update(&mut self) -> Result<SyncStep, AppError> {
        match self.registration.recv().await {
            Some(HubMessage::Event(event)) => match self.projection.apply_event(&event) {
                ApplyOutcome::Applied => {
                    debug!(load_id = %event.load_id, sequence = event.sequence, "projection updated");
                    Ok(SyncStep::Applied(event.load_id))
                }
                ApplyOutcome::ResyncRequired { expected, received } => {
                    warn!(expected, received, "projection saw a sequence gap");
                    self.resync().await
                }
            },
            Some(HubMessage::Resync { reason }) => {
                warn!(reason = %reason, "hub requested resync");
                self.resync().await
            }
            None => self.resync().await,
        }
    }

    pub fn close(self) {
        self.hub.unregister(self.registration.client_id);
    }

    async fn resync(&mut self) -> Result<SyncStep, AppError> {
        self.hub.unregister(self.registration.client_id);
        let mut registration = self.hub.register().await?;
        let snapshot = std::mem::take(&mut registration.snapshot);
        self.projection = ClientProjection::from_snapshot(snapshot);
        self.registration = registration;
        self.resyncs += 1;
        Ok(SyncStep::Resynced)
    }
}
