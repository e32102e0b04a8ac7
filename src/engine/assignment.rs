use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde::Serialize;
use tracing::{error, info};

use crate::engine::allocator::DriverAllocator;
use crate::engine::read_load;
use crate::engine::retry::RetryPolicy;
use crate::error::AppError;
use crate::models::{DispatcherId, DriverId, Load, LoadId, LoadStatus};
use crate::observability::metrics::Metrics;
use crate::store::{CasOutcome, LoadStore, StoreError};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AssignOutcome {
    Assigned { driver_id: DriverId, load: Load },
    AlreadyAssigned { load: Load },
    NotFound,
    InvalidState { load: Load },
}

impl AssignOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            AssignOutcome::Assigned { .. } => "assigned",
            AssignOutcome::AlreadyAssigned { .. } => "already_assigned",
            AssignOutcome::NotFound => "not_found",
            AssignOutcome::InvalidState { .. } => "invalid_state",
        }
    }

    /// Classifies a load that can no longer be assigned.
    fn unavailable(load: Load) -> Self {
        match load.status {
            LoadStatus::Cancelled => AssignOutcome::InvalidState { load },
            _ => AssignOutcome::AlreadyAssigned { load },
        }
    }
}

/// The only path from Pending to InTransit.
///
/// Each call reads the load, decides, and issues a single compare-and-swap
/// against the version it read. Losing the swap ends the attempt: the
/// caller gets `AlreadyAssigned` and the same load is never re-tried.
/// Transient store failures are retried by the [`RetryPolicy`], which is
/// safe because a retried swap still carries the original version. The
/// retries share one write token, so only this call can claim a write of
/// its own that landed without an acknowledgement.
pub struct AssignmentCoordinator {
    store: Arc<LoadStore>,
    allocator: Arc<dyn DriverAllocator>,
    retry: RetryPolicy,
    metrics: Metrics,
}

impl AssignmentCoordinator {
    pub fn new(
        store: Arc<LoadStore>,
        allocator: Arc<dyn DriverAllocator>,
        retry: RetryPolicy,
        metrics: Metrics,
    ) -> Self {
        Self {
            store,
            allocator,
            retry,
            metrics,
        }
    }

    pub async fn assign(
        &self,
        load_id: LoadId,
        dispatcher_id: DispatcherId,
    ) -> Result<AssignOutcome, AppError> {
        let start = Instant::now();
        let result = self.try_assign(load_id, &dispatcher_id).await;

        let label = match &result {
            Ok(outcome) => outcome.label(),
            Err(err) => {
                error!(load_id = %load_id, dispatcher_id = %dispatcher_id, error = %err, "assignment failed");
                "error"
            }
        };
        self.metrics
            .assignment_latency_seconds
            .with_label_values(&[label])
            .observe(start.elapsed().as_secs_f64());
        self.metrics
            .assignments_total
            .with_label_values(&[label])
            .inc();

        result
    }

    async fn try_assign(
        &self,
        load_id: LoadId,
        dispatcher_id: &DispatcherId,
    ) -> Result<AssignOutcome, AppError> {
        let Some(current) = read_load(&self.store, &self.retry, &self.metrics, load_id).await?
        else {
            return Ok(AssignOutcome::NotFound);
        };

        if current.status != LoadStatus::Pending {
            return Ok(AssignOutcome::unavailable(current));
        }

        let driver_id = self.allocator.allocate();
        let assigned_at = Utc::now();
        let observed_version = current.version;
        let token = self.store.write_token();

        let swapped = self
            .retry
            .run(&self.metrics, "conditional_update", || {
                self.store
                    .conditional_update_as(token, load_id, observed_version, |load| {
                        load.assign(driver_id.clone(), dispatcher_id.clone(), assigned_at)
                    })
            })
            .await;

        match swapped {
            Ok(CasOutcome::Applied { load, sequence }) => {
                info!(
                    load_id = %load_id,
                    driver_id = %driver_id,
                    dispatcher_id = %dispatcher_id,
                    version = load.version,
                    sequence,
                    "load assigned"
                );
                Ok(AssignOutcome::Assigned { driver_id, load })
            }
            Ok(CasOutcome::Stale(latest)) => {
                info!(
                    load_id = %load_id,
                    dispatcher_id = %dispatcher_id,
                    status = %latest.status,
                    version = latest.version,
                    "assignment race lost"
                );
                Ok(AssignOutcome::unavailable(latest))
            }
            Err(StoreError::NotFound(_)) => Ok(AssignOutcome::NotFound),
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Utc;
    use uuid::Uuid;

    use super::{AssignOutcome, AssignmentCoordinator};
    use crate::engine::allocator::DriverAllocator;
    use crate::engine::retry::RetryPolicy;
    use crate::models::{DispatcherId, DriverId, Load, LoadStatus, NewLoad};
    use crate::observability::metrics::Metrics;
    use crate::store::LoadStore;

    struct FixedAllocator(&'static str);

    impl DriverAllocator for FixedAllocator {
        fn allocate(&self) -> DriverId {
            DriverId(self.0.to_string())
        }
    }

    fn setup() -> (Arc<LoadStore>, AssignmentCoordinator) {
        let metrics = Metrics::new();
        let store = Arc::new(LoadStore::in_memory(64, metrics.clone()));
        let coordinator = AssignmentCoordinator::new(
            store.clone(),
            Arc::new(FixedAllocator("drv-fixed")),
            RetryPolicy::default(),
            metrics,
        );
        (store, coordinator)
    }

    fn seed(store: &LoadStore, id: u128) -> Load {
        let load = Load::new(
            Uuid::from_u128(id),
            NewLoad {
                pickup: "Denver, CO".to_string(),
                dropoff: "Omaha, NE".to_string(),
                distance: "540 mi".to_string(),
                price: "$1,350".to_string(),
                load_type: "Flatbed".to_string(),
                intake_key: None,
            },
            Utc::now(),
        );
        store.insert(load.clone()).unwrap();
        load
    }

    #[tokio::test]
    async fn assigns_pending_load() {
        let (store, coordinator) = setup();
        let load = seed(&store, 1);

        let outcome = coordinator
            .assign(load.id, DispatcherId("alice".to_string()))
            .await
            .unwrap();

        match outcome {
            AssignOutcome::Assigned { driver_id, load } => {
                assert_eq!(driver_id, DriverId("drv-fixed".to_string()));
                assert_eq!(load.status, LoadStatus::InTransit);
                assert_eq!(load.version, 1);
                assert_eq!(load.assigned_by, Some(DispatcherId("alice".to_string())));
            }
            other => panic!("expected assigned, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn second_assign_reports_already_assigned() {
        let (store, coordinator) = setup();
        let load = seed(&store, 1);

        coordinator
            .assign(load.id, DispatcherId("alice".to_string()))
            .await
            .unwrap();
        let outcome = coordinator
            .assign(load.id, DispatcherId("bob".to_string()))
            .await
            .unwrap();

        assert_eq!(outcome.label(), "already_assigned");
        assert_eq!(store.get(load.id).unwrap().version, 1);
    }

    #[tokio::test]
    async fn cancelled_load_is_invalid_state_and_untouched() {
        let (store, coordinator) = setup();
        let load = seed(&store, 1);
        store
            .conditional_update(load.id, 0, |l| l.cancel())
            .unwrap();
        let head = store.feed().head();

        let outcome = coordinator
            .assign(load.id, DispatcherId("alice".to_string()))
            .await
            .unwrap();

        assert_eq!(outcome.label(), "invalid_state");
        assert_eq!(store.get(load.id).unwrap().version, 1);
        assert_eq!(store.feed().head(), head);
    }

    #[tokio::test]
    async fn unknown_load_is_not_found() {
        let (_store, coordinator) = setup();
        let outcome = coordinator
            .assign(Uuid::from_u128(99), DispatcherId("alice".to_string()))
            .await
            .unwrap();
        assert_eq!(outcome, AssignOutcome::NotFound);
    }
}
