use std::sync::Arc;

use crate::config::Config;
use crate::engine::allocator::{DriverAllocator, RandomDriverAllocator};
use crate::engine::assignment::AssignmentCoordinator;
use crate::engine::intake::IntakeService;
use crate::engine::lifecycle::LifecycleService;
use crate::engine::retry::RetryPolicy;
use crate::hub::SubscriptionHub;
use crate::observability::metrics::Metrics;
use crate::store::{LoadStore, LoadTable, MemoryTable};

pub struct AppState {
    pub store: Arc<LoadStore>,
    pub hub: Arc<SubscriptionHub>,
    pub coordinator: AssignmentCoordinator,
    pub lifecycle: LifecycleService,
    pub intake: IntakeService,
    pub metrics: Metrics,
}

impl AppState {
    pub fn new(config: &Config) -> Self {
        Self::with_parts(
            config,
            Arc::new(MemoryTable::new()),
            Arc::new(RandomDriverAllocator),
        )
    }

    pub fn with_parts(
        config: &Config,
        table: Arc<dyn LoadTable>,
        allocator: Arc<dyn DriverAllocator>,
    ) -> Self {
        let metrics = Metrics::new();
        let retry = RetryPolicy::from_config(config);
        let store = Arc::new(LoadStore::new(
            table,
            config.feed_buffer_size,
            metrics.clone(),
        ));

        Self {
            hub: Arc::new(SubscriptionHub::new(
                store.clone(),
                config.client_buffer_size,
                retry.clone(),
                metrics.clone(),
            )),
            coordinator: AssignmentCoordinator::new(
                store.clone(),
                allocator,
                retry.clone(),
                metrics.clone(),
            ),
            lifecycle: LifecycleService::new(store.clone(), retry.clone(), metrics.clone()),
            intake: IntakeService::new(store.clone(), retry, metrics.clone()),
            store,
            metrics,
        }
    }
}
