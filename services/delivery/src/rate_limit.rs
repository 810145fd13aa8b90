//! Per-integration token buckets.
//!
//! One direct (unkeyed) governor limiter per integration id, shared by
//! every worker in the process. Capacity and refill both derive from the
//! integration's `rate_limit_per_minute`; buckets start full, so identity
//! survives restart trivially.

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::Arc;

use governor::clock::DefaultClock;
use governor::middleware::NoOpMiddleware;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use tokio::sync::RwLock;

type Bucket = RateLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>;

#[derive(Default)]
pub struct RateLimiterRegistry {
    buckets: RwLock<HashMap<String, Arc<Bucket>>>,
}

impl RateLimiterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    async fn bucket(&self, integration_id: &str, rate_limit_per_minute: u32) -> Arc<Bucket> {
        {
            let buckets = self.buckets.read().await;
            if let Some(bucket) = buckets.get(integration_id) {
                return bucket.clone();
            }
        }

        let quota = Quota::per_minute(
            NonZeroU32::new(rate_limit_per_minute.max(1)).expect("max(1) is non-zero"),
        );
        let bucket = Arc::new(RateLimiter::direct(quota));

        let mut buckets = self.buckets.write().await;
        buckets
            .entry(integration_id.to_string())
            .or_insert(bucket)
            .clone()
    }

    /// Wait until one token is available for the integration.
    pub async fn acquire(&self, integration_id: &str, rate_limit_per_minute: u32) {
        let bucket = self.bucket(integration_id, rate_limit_per_minute).await;
        bucket.until_ready().await;
    }

    /// Non-blocking probe, for tests and for callers that would rather
    /// requeue than wait.
    pub async fn try_acquire(&self, integration_id: &str, rate_limit_per_minute: u32) -> bool {
        let bucket = self.bucket(integration_id, rate_limit_per_minute).await;
        bucket.check().is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_burst_admits_exactly_capacity() {
        let registry = RateLimiterRegistry::new();

        let mut admitted = 0;
        for _ in 0..6 {
            if registry.try_acquire("int-1", 5).await {
                admitted += 1;
            }
        }
        // Capacity 5: the sixth request must wait.
        assert_eq!(admitted, 5);
    }

    #[tokio::test]
    async fn test_buckets_are_per_integration() {
        let registry = RateLimiterRegistry::new();

        assert!(registry.try_acquire("int-a", 1).await);
        assert!(!registry.try_acquire("int-a", 1).await);
        // A different integration has its own full bucket.
        assert!(registry.try_acquire("int-b", 1).await);
    }

    #[tokio::test]
    async fn test_acquire_waits_about_refill_interval() {
        let registry = RateLimiterRegistry::new();
        // Drain the single-token bucket.
        registry.acquire("int-x", 60).await;

        let started = std::time::Instant::now();
        registry.acquire("int-x", 60).await;
        let waited = started.elapsed();

        // 60/min refills one token per second.
        assert!(waited >= std::time::Duration::from_millis(700), "waited {waited:?}");
        assert!(waited <= std::time::Duration::from_secs(3), "waited {waited:?}");
    }
}
