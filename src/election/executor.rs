//! Retrying wrapper around store calls
//!
//! Transient failures (`Error::Transient`) are retried with a linearly
//! growing delay; anything else is returned immediately. Each call's final
//! outcome, latency and error code go to the metrics registry.

use crate::common::{MetricsRegistry, Result, StoreConfig};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Retry bounds for store calls
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    /// Delay before attempt `n + 1` is `base_delay * n`
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 20,
            base_delay: Duration::from_millis(100),
        }
    }
}

impl From<&StoreConfig> for RetryPolicy {
    fn from(conf: &StoreConfig) -> Self {
        Self {
            max_attempts: conf.max_retries.max(1),
            base_delay: Duration::from_millis(conf.retry_base_delay_ms),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResilientExecutor {
    policy: RetryPolicy,
    metrics: Arc<MetricsRegistry>,
}

impl ResilientExecutor {
    pub fn new(policy: RetryPolicy, metrics: Arc<MetricsRegistry>) -> Self {
        Self { policy, metrics }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    /// Run `call` until it succeeds, fails permanently, or attempts run out.
    ///
    /// Sleeps between attempts suspend only the calling task.
    pub async fn run<T, F, Fut>(&self, op: &'static str, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let start = Instant::now();
        let mut attempt = 1;
        loop {
            match call().await {
                Ok(value) => {
                    self.metrics.record_call(op, start.elapsed(), None);
                    return Ok(value);
                }
                Err(e) if e.is_retryable() && attempt < self.policy.max_attempts => {
                    tracing::warn!(op, attempt, error = %e, "transient store error, retrying");
                    self.metrics.record_retry(op);
                    tokio::time::sleep(self.policy.base_delay * attempt).await;
                    attempt += 1;
                }
                Err(e) => {
                    if e.is_retryable() {
                        tracing::error!(op, attempts = attempt, error = %e, "store retries exhausted");
                    }
                    self.metrics.record_call(op, start.elapsed(), Some(e.code()));
                    return Err(e);
                }
            }
        }
    }
}
