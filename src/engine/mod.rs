pub mod allocator;
pub mod assignment;
pub mod intake;
pub mod lifecycle;
pub mod retry;

use crate::models::{Load, LoadId};
use crate::observability::metrics::Metrics;
use crate::store::{LoadStore, StoreError};

use self::retry::RetryPolicy;

/// Point read with transient-failure retry; a missing load is `Ok(None)`.
pub(crate) async fn read_load(
    store: &LoadStore,
    retry: &RetryPolicy,
    metrics: &Metrics,
    load_id: LoadId,
) -> Result<Option<Load>, StoreError> {
    retry
        .run(metrics, "get", || match store.get(load_id) {
            Ok(load) => Ok(Some(load)),
            Err(StoreError::NotFound(_)) => Ok(None),
            Err(err) => Err(err),
        })
        .await
}
