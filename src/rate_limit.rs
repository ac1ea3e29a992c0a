//! Per-destination fixed-window rate limiting.
//!
//! Each call increments a counter keyed by destination. The first increment
//! in a window sets the key's expiry to the window length, and calls are
//! limited once the counter exceeds the ceiling. Because the window is fixed
//! rather than sliding, a burst straddling a window boundary can briefly
//! reach twice the nominal rate.
//!
//! The counter lives behind [`CounterStore`] so several worker processes
//! share one budget. If the store errors or times out the limiter fails
//! open and the delivery proceeds.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::error::StoreError;

#[cfg(feature = "metrics")]
fn metric_inc(name: &'static str) {
    metrics::increment_counter!(name);
}

#[cfg(not(feature = "metrics"))]
fn metric_inc(_name: &'static str) {}

/// Atomic increment-with-expiry primitive.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Increment `key` and return the new value. When the increment creates
    /// the key, the key expires after `window`.
    async fn increment(&self, key: &str, window: Duration) -> Result<u64, StoreError>;
}

/// Process-local counter store for tests and single-instance deployments.
#[derive(Default)]
pub struct InMemoryCounterStore {
    counters: Mutex<HashMap<String, (u64, Instant)>>,
}

impl InMemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CounterStore for InMemoryCounterStore {
    async fn increment(&self, key: &str, window: Duration) -> Result<u64, StoreError> {
        let now = Instant::now();
        let mut counters = self.counters.lock().await;
        let entry = counters
            .entry(key.to_string())
            .or_insert((0, now + window));
        if entry.1 <= now {
            *entry = (0, now + window);
        }
        entry.0 += 1;
        Ok(entry.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Requests allowed per destination per window.
    pub max_requests: u64,
    pub window_secs: u64,

    /// Upper bound on one counter-store round trip.
    pub store_timeout_ms: u64,

    pub key_prefix: String,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 60,
            window_secs: 60,
            store_timeout_ms: 500,
            key_prefix: "webhook:ratelimit".to_string(),
        }
    }
}

#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn CounterStore>, config: RateLimitConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    fn key_for(&self, destination: &str) -> String {
        format!("{}:{}", self.config.key_prefix, destination)
    }

    /// Count one request against `destination` and report whether it is
    /// over budget.
    pub async fn is_rate_limited(&self, destination: &str) -> bool {
        let key = self.key_for(destination);
        let window = Duration::from_secs(self.config.window_secs.max(1));
        let timeout = Duration::from_millis(self.config.store_timeout_ms.max(1));

        let count = match tokio::time::timeout(timeout, self.store.increment(&key, window)).await {
            Ok(Ok(count)) => count,
            Ok(Err(e)) => {
                metric_inc("webhook.rate_limiter.fail_open");
                tracing::warn!(
                    target: "webhook_delivery",
                    destination,
                    error = %e,
                    "Rate limiter store unavailable, allowing request"
                );
                return false;
            }
            Err(_) => {
                metric_inc("webhook.rate_limiter.fail_open");
                tracing::warn!(
                    target: "webhook_delivery",
                    destination,
                    timeout_ms = self.config.store_timeout_ms,
                    "Rate limiter store timed out, allowing request"
                );
                return false;
            }
        };

        let limited = count > self.config.max_requests;
        if limited {
            metric_inc("webhook.rate_limiter.limited");
        }
        limited
    }
}
