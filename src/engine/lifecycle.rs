use std::sync::Arc;

use serde::Serialize;
use tracing::info;

use crate::engine::read_load;
use crate::engine::retry::RetryPolicy;
use crate::error::AppError;
use crate::models::{Load, LoadId, LoadStatus, TransitionError};
use crate::observability::metrics::Metrics;
use crate::store::{CasOutcome, LoadStore, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalTransition {
    Complete,
    Cancel,
}

impl TerminalTransition {
    pub fn target(self) -> LoadStatus {
        match self {
            TerminalTransition::Complete => LoadStatus::Completed,
            TerminalTransition::Cancel => LoadStatus::Cancelled,
        }
    }

    fn label(self) -> &'static str {
        match self {
            TerminalTransition::Complete => "complete",
            TerminalTransition::Cancel => "cancel",
        }
    }

    fn apply(self, load: &mut Load) -> Result<(), TransitionError> {
        match self {
            TerminalTransition::Complete => load.complete(),
            TerminalTransition::Cancel => load.cancel(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TransitionOutcome {
    Applied { load: Load },
    Conflict { load: Load },
    NotFound,
    InvalidState { load: Load },
}

impl TransitionOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            TransitionOutcome::Applied { .. } => "applied",
            TransitionOutcome::Conflict { .. } => "conflict",
            TransitionOutcome::NotFound => "not_found",
            TransitionOutcome::InvalidState { .. } => "invalid_state",
        }
    }
}

/// Completion and cancellation, under the same compare-and-swap
/// discipline as assignment.
pub struct LifecycleService {
    store: Arc<LoadStore>,
    retry: RetryPolicy,
    metrics: Metrics,
}

impl LifecycleService {
    pub fn new(store: Arc<LoadStore>, retry: RetryPolicy, metrics: Metrics) -> Self {
        Self {
            store,
            retry,
            metrics,
        }
    }

    pub async fn complete(
        &self,
        load_id: LoadId,
        expected_version: Option<u64>,
    ) -> Result<TransitionOutcome, AppError> {
        self.transition(load_id, expected_version, TerminalTransition::Complete)
            .await
    }

    pub async fn cancel(
        &self,
        load_id: LoadId,
        expected_version: Option<u64>,
    ) -> Result<TransitionOutcome, AppError> {
        self.transition(load_id, expected_version, TerminalTransition::Cancel)
            .await
    }

    /// Without `expected_version` the swap is made against the version just read.
    pub async fn transition(
        &self,
        load_id: LoadId,
        expected_version: Option<u64>,
        kind: TerminalTransition,
    ) -> Result<TransitionOutcome, AppError> {
        let result = self.try_transition(load_id, expected_version, kind).await;

        let label = result.as_ref().map_or("error", |outcome| outcome.label());
        self.metrics
            .transitions_total
            .with_label_values(&[kind.label(), label])
            .inc();

        result
    }

    async fn try_transition(
        &self,
        load_id: LoadId,
        expected_version: Option<u64>,
        kind: TerminalTransition,
    ) -> Result<TransitionOutcome, AppError> {
        let Some(current) = read_load(&self.store, &self.retry, &self.metrics, load_id).await?
        else {
            return Ok(TransitionOutcome::NotFound);
        };

        let version = expected_version.unwrap_or(current.version);
        if version != current.version {
            return Ok(TransitionOutcome::Conflict { load: current });
        }
        if !current.status.can_transition_to(kind.target()) {
            return Ok(TransitionOutcome::InvalidState { load: current });
        }

        let token = self.store.write_token();
        let swapped = self
            .retry
            .run(&self.metrics, "conditional_update", || {
                self.store
                    .conditional_update_as(token, load_id, version, |load| kind.apply(load))
            })
            .await;

        match swapped {
            Ok(CasOutcome::Applied { load, sequence }) => {
                info!(
                    load_id = %load_id,
                    status = %load.status,
                    version = load.version,
                    sequence,
                    "load transitioned"
                );
                Ok(TransitionOutcome::Applied { load })
            }
            Ok(CasOutcome::Stale(latest)) => Ok(TransitionOutcome::Conflict { load: latest }),
            Err(StoreError::NotFound(_)) => Ok(TransitionOutcome::NotFound),
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Utc;
    use uuid::Uuid;

    use super::{LifecycleService, TransitionOutcome};
    use crate::engine::retry::RetryPolicy;
    use crate::models::{DispatcherId, DriverId, Load, LoadStatus, NewLoad};
    use crate::observability::metrics::Metrics;
    use crate::store::LoadStore;

    fn setup() -> (Arc<LoadStore>, LifecycleService) {
        let metrics = Metrics::new();
        let store = Arc::new(LoadStore::in_memory(64, metrics.clone()));
        let service = LifecycleService::new(store.clone(), RetryPolicy::default(), metrics);
        (store, service)
    }

    fn seed(store: &LoadStore) -> Uuid {
        let id = Uuid::new_v4();
        store
            .insert(Load::new(
                id,
                NewLoad {
                    pickup: "Tulsa, OK".to_string(),
                    dropoff: "Memphis, TN".to_string(),
                    distance: "400 mi".to_string(),
                    price: "$980".to_string(),
                    load_type: "Dry Van".to_string(),
                    intake_key: None,
                },
                Utc::now(),
            ))
            .unwrap();
        id
    }

    fn put_in_transit(store: &LoadStore, id: Uuid) {
        store
            .conditional_update(id, 0, |l| {
                l.assign(
                    DriverId("drv-1".to_string()),
                    DispatcherId("ops".to_string()),
                    Utc::now(),
                )
            })
            .unwrap();
    }

    #[tokio::test]
    async fn completes_in_transit_load() {
        let (store, service) = setup();
        let id = seed(&store);
        put_in_transit(&store, id);

        let outcome = service.complete(id, None).await.unwrap();
        match outcome {
            TransitionOutcome::Applied { load } => {
                assert_eq!(load.status, LoadStatus::Completed);
                assert_eq!(load.version, 2);
                assert!(load.driver_id.is_some());
            }
            other => panic!("expected applied, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn completing_pending_load_is_invalid() {
        let (store, service) = setup();
        let id = seed(&store);

        let outcome = service.complete(id, None).await.unwrap();
        assert_eq!(outcome.label(), "invalid_state");
        assert_eq!(store.get(id).unwrap().version, 0);
    }

    #[tokio::test]
    async fn cancel_with_stale_expected_version_conflicts() {
        let (store, service) = setup();
        let id = seed(&store);
        put_in_transit(&store, id);

        let outcome = service.cancel(id, Some(0)).await.unwrap();
        match outcome {
            TransitionOutcome::Conflict { load } => assert_eq!(load.version, 1),
            other => panic!("expected conflict, got {other:?}"),
        }
        assert_eq!(store.get(id).unwrap().status, LoadStatus::InTransit);
    }

    #[tokio::test]
    async fn cancelling_in_transit_load_drops_driver() {
        let (store, service) = setup();
        let id = seed(&store);
        put_in_transit(&store, id);

        let outcome = service.cancel(id, Some(1)).await.unwrap();
        match outcome {
            TransitionOutcome::Applied { load } => {
                assert_eq!(load.status, LoadStatus::Cancelled);
                assert!(load.driver_id.is_none());
                assert!(load.driver_invariant_holds());
            }
            other => panic!("expected applied, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_load_is_not_found() {
        let (_store, service) = setup();
        let outcome = service.cancel(Uuid::new_v4(), None).await.unwrap();
        assert_eq!(outcome, TransitionOutcome::NotFound);
    }
}
