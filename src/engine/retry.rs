use tokio::time::{Duration, sleep};
use tracing::warn;

use crate::config::Config;
use crate::observability::metrics::Metrics;
use crate::store::StoreError;

/// Bounded exponential backoff over transient store failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(25),
            max_delay: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_attempts: config.store_retry_attempts.max(1),
            base_delay: Duration::from_millis(config.store_retry_base_ms),
            max_delay: Duration::from_millis(config.store_retry_max_ms),
        }
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32 << (attempt.saturating_sub(1)).min(16);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Runs `op` until it succeeds, fails permanently, or the attempt
    /// budget is spent. Only [`StoreError::is_transient`] errors are retried.
    pub async fn run<T, F>(
        &self,
        metrics: &Metrics,
        operation: &'static str,
        mut op: F,
    ) -> Result<T, StoreError>
    where
        F: FnMut() -> Result<T, StoreError>,
    {
        let mut attempt = 1;
        loop {
            match op() {
                Err(err) if err.is_transient() && attempt < self.max_attempts => {
                    let delay = self.delay_for(attempt);
                    warn!(
                        operation,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient store failure; retrying"
                    );
                    metrics
                        .store_retries_total
                        .with_label_values(&[operation])
                        .inc();
                    sleep(delay).await;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use tokio::time::Duration;
    use uuid::Uuid;

    use super::RetryPolicy;
    use crate::observability::metrics::Metrics;
    use crate::store::StoreError;

    fn fast() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        }
    }

    #[tokio::test]
    async fn recovers_after_transient_failures() {
        let metrics = Metrics::new();
        let calls = Cell::new(0);

        let result = fast()
            .run(&metrics, "get", || {
                calls.set(calls.get() + 1);
                if calls.get() < 3 {
                    Err(StoreError::Unavailable("timeout".to_string()))
                } else {
                    Ok(7)
                }
            })
            .await;

        assert_eq!(result, Ok(7));
        assert_eq!(calls.get(), 3);
        assert_eq!(
            metrics.store_retries_total.with_label_values(&["get"]).get(),
            2
        );
    }

    #[tokio::test]
    async fn gives_up_when_budget_is_spent() {
        let metrics = Metrics::new();
        let calls = Cell::new(0);

        let result: Result<(), _> = fast()
            .run(&metrics, "put", || {
                calls.set(calls.get() + 1);
                Err(StoreError::Unavailable("down".to_string()))
            })
            .await;

        assert!(matches!(result, Err(StoreError::Unavailable(_))));
        assert_eq!(calls.get(), 3);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let metrics = Metrics::new();
        let calls = Cell::new(0);
        let id = Uuid::from_u128(1);

        let result: Result<(), _> = fast()
            .run(&metrics, "get", || {
                calls.set(calls.get() + 1);
                Err(StoreError::NotFound(id))
            })
            .await;

        assert_eq!(result, Err(StoreError::NotFound(id)));
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn delay_doubles_up_to_the_cap() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(10));
        assert_eq!(policy.delay_for(2), Duration::from_millis(20));
        assert_eq!(policy.delay_for(3), Duration::from_millis(40));
        assert_eq!(policy.delay_for(4), Duration::from_millis(50));
    }
}
