//! §4.5 step 6: per-`(app, service)` send-rate throttling in front of the gateway produce call.
//! Built on `governor`'s token-bucket rate limiter rather than a hand-rolled one.

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::Arc;

use governor::{Quota, RateLimiter};
use nonzero_ext::nonzero;
use tokio::sync::Mutex;

use crate::model::Service;

type Limiter = RateLimiter<
    governor::state::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// One bucket per `(app_id, service)`, sized from a per-app quota that a caller supplies the
/// first time it sees that key. Later calls with a different `permits_per_second` for an
/// already-registered key are ignored: the bucket keeps its original shape for its lifetime.
#[derive(Clone)]
pub struct GatewayRateLimiter {
    buckets: Arc<Mutex<HashMap<(uuid::Uuid, Service), Arc<Limiter>>>>,
}

impl Default for GatewayRateLimiter {
    fn default() -> Self {
        Self {
            buckets: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl GatewayRateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks until a permit for `(app_id, service)` is available, creating the bucket (sized to
    /// `permits_per_second`) on first use.
    pub async fn acquire(&self, app_id: uuid::Uuid, service: Service, permits_per_second: NonZeroU32) {
        let limiter = {
            let mut buckets = self.buckets.lock().await;
            buckets
                .entry((app_id, service))
                .or_insert_with(|| Arc::new(RateLimiter::direct(Quota::per_second(permits_per_second))))
                .clone()
        };
        limiter.until_ready().await;
    }
}

/// Fallback quota used when an app/service combination carries no explicit rate configured: a
/// conservative default so a misconfigured app can't accidentally flood a gateway.
pub fn default_quota() -> NonZeroU32 {
    nonzero!(50u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquire_does_not_block_under_quota() {
        let limiter = GatewayRateLimiter::new();
        let app = uuid::Uuid::now_v7();
        for _ in 0..5 {
            limiter.acquire(app, Service::Apns, nonzero!(100u32)).await;
        }
    }

    #[tokio::test]
    async fn separate_apps_get_independent_buckets() {
        let limiter = GatewayRateLimiter::new();
        let app_a = uuid::Uuid::now_v7();
        let app_b = uuid::Uuid::now_v7();
        limiter.acquire(app_a, Service::Apns, nonzero!(1u32)).await;
        limiter.acquire(app_b, Service::Apns, nonzero!(1u32)).await;
        let buckets = limiter.buckets.lock().await;
        assert_eq!(buckets.len(), 2);
    }
}
