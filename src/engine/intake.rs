use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::info;
use uuid::Uuid;

use crate::engine::retry::RetryPolicy;
use crate::error::AppError;
use crate::models::{Load, LoadId, NewLoad};
use crate::observability::metrics::Metrics;
use crate::store::{LoadStore, StoreError};

/// Creates Pending loads. Requests carrying an `intake_key` are
/// deduplicated: a repeated key returns the load it first created.
pub struct IntakeService {
    store: Arc<LoadStore>,
    keys: DashMap<String, LoadId>,
    retry: RetryPolicy,
    metrics: Metrics,
}

impl IntakeService {
    pub fn new(store: Arc<LoadStore>, retry: RetryPolicy, metrics: Metrics) -> Self {
        Self {
            store,
            keys: DashMap::new(),
            retry,
            metrics,
        }
    }

    pub async fn create(&self, input: NewLoad) -> Result<Load, AppError> {
        validate(&input)?;

        let id = Uuid::new_v4();
        let key = input.intake_key.clone();

        if let Some(key) = &key {
            // Reserve the key before touching the store; the guard is dropped
            // before any await.
            let existing = match self.keys.entry(key.clone()) {
                Entry::Occupied(entry) => Some(*entry.get()),
                Entry::Vacant(entry) => {
                    entry.insert(id);
                    None
                }
            };

            if let Some(existing) = existing {
                return match self.store.get(existing) {
                    Ok(load) => {
                        info!(load_id = %load.id, intake_key = %key, "duplicate intake request");
                        Ok(load)
                    }
                    Err(StoreError::NotFound(_)) => Err(AppError::Conflict(format!(
                        "intake key {key} is still being processed"
                    ))),
                    Err(err) => Err(err.into()),
                };
            }
        }

        let load = Load::new(id, input, Utc::now());
        let token = self.store.write_token();
        let inserted = self
            .retry
            .run(&self.metrics, "insert", || {
                self.store.insert_as(token, load.clone())
            })
            .await;

        match inserted {
            Ok(event) => {
                self.metrics.loads_created_total.inc();
                info!(load_id = %id, sequence = event.sequence, "load created");
                Ok(event.load)
            }
            Err(err) => {
                if let Some(key) = &key {
                    self.keys.remove_if(key, |_, reserved| *reserved == id);
                }
                Err(err.into())
            }
        }
    }

    /// Validates every item up front, then creates them one by one.
    pub async fn create_many(&self, inputs: Vec<NewLoad>) -> Result<Vec<Load>, AppError> {
        for (index, input) in inputs.iter().enumerate() {
            validate(input).map_err(|err| AppError::BadRequest(format!("item {index}: {err}")))?;
        }

        let mut created = Vec::with_capacity(inputs.len());
        for input in inputs {
            created.push(self.create(input).await?);
        }
        Ok(created)
    }
}

fn validate(input: &NewLoad) -> Result<(), AppError> {
    if input.pickup.trim().is_empty() {
        return Err(AppError::BadRequest("pickup cannot be empty".to_string()));
    }
    if input.dropoff.trim().is_empty() {
        return Err(AppError::BadRequest("dropoff cannot be empty".to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::IntakeService;
    use crate::engine::retry::RetryPolicy;
    use crate::error::AppError;
    use crate::models::{LoadStatus, NewLoad};
    use crate::observability::metrics::Metrics;
    use crate::store::LoadStore;

    fn service() -> (Arc<LoadStore>, IntakeService) {
        let metrics = Metrics::new();
        let store = Arc::new(LoadStore::in_memory(64, metrics.clone()));
        (
            store.clone(),
            IntakeService::new(store, RetryPolicy::default(), metrics),
        )
    }

    fn request(key: Option<&str>) -> NewLoad {
        NewLoad {
            pickup: "Phoenix, AZ".to_string(),
            dropoff: "El Paso, TX".to_string(),
            distance: "430 mi".to_string(),
            price: "$1,020".to_string(),
            load_type: "Dry Van".to_string(),
            intake_key: key.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn creates_pending_load_at_version_zero() {
        let (store, intake) = service();
        let load = intake.create(request(None)).await.unwrap();

        assert_eq!(load.status, LoadStatus::Pending);
        assert_eq!(load.version, 0);
        assert!(load.driver_id.is_none());
        assert_eq!(store.get(load.id).unwrap(), load);
        assert_eq!(store.feed().head(), 1);
    }

    #[tokio::test]
    async fn repeated_intake_key_returns_original() {
        let (store, intake) = service();
        let first = intake.create(request(Some("po-1001"))).await.unwrap();
        let second = intake.create(request(Some("po-1001"))).await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(store.len(), 1);
        assert_eq!(store.feed().head(), 1);
    }

    #[tokio::test]
    async fn blank_pickup_is_rejected() {
        let (_store, intake) = service();
        let mut input = request(None);
        input.pickup = "   ".to_string();

        assert!(matches!(
            intake.create(input).await,
            Err(AppError::BadRequest(_))
        ));
    }

    #[tokio::test]
    async fn bulk_create_is_all_or_nothing_on_validation() {
        let (store, intake) = service();
        let mut bad = request(None);
        bad.dropoff = String::new();

        let result = intake.create_many(vec![request(None), bad]).await;
        assert!(matches!(result, Err(AppError::BadRequest(_))));
        assert!(store.is_empty());

        let created = intake
            .create_many(vec![request(None), request(None)])
            .await
            .unwrap();
        assert_eq!(created.len(), 2);
        assert_eq!(store.len(), 2);
    }
}
