//! Outbound rate limiting.
//!
//! Injected into the worker pool instead of living in a global, so tests can
//! run without it and deployments can plug their own.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::debug;

/// Gate called before every outbound send.
#[async_trait]
pub trait Throttle: Send + Sync {
    /// Wait until a request to `host` may be sent.
    async fn acquire(&self, host: &str);
}

/// No limiting.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoThrottle;

#[async_trait]
impl Throttle for NoThrottle {
    async fn acquire(&self, _host: &str) {}
}

struct Bucket {
    tokens: f64,
    refilled_at: Instant,
}

/// One token bucket per destination host.
pub struct HostTokenBucket {
    rate_per_sec: f64,
    burst: f64,
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl HostTokenBucket {
    /// `rate_per_sec` tokens refill each second, up to `burst` stored tokens.
    pub fn new(rate_per_sec: f64, burst: u32) -> Self {
        Self {
            rate_per_sec: rate_per_sec.max(f64::MIN_POSITIVE),
            burst: f64::from(burst.max(1)),
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Take a token if one is available, otherwise return how long to wait.
    fn try_take(&self, host: &str, now: Instant) -> Option<Duration> {
        let mut buckets = self.buckets.lock().unwrap_or_else(PoisonError::into_inner);
        let bucket = buckets.entry(host.to_string()).or_insert(Bucket {
            tokens: self.burst,
            refilled_at: now,
        });

        let elapsed = now.saturating_duration_since(bucket.refilled_at).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.rate_per_sec).min(self.burst);
        bucket.refilled_at = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            None
        } else {
            let missing = 1.0 - bucket.tokens;
            Some(Duration::from_secs_f64(missing / self.rate_per_sec))
        }
    }
}

#[async_trait]
impl Throttle for HostTokenBucket {
    async fn acquire(&self, host: &str) {
        while let Some(wait) = self.try_take(host, Instant::now()) {
            debug!(host = %host, wait_ms = wait.as_millis() as u64, "throttle_waiting");
            tokio::time::sleep(wait).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_burst_then_rate() {
        let throttle = HostTokenBucket::new(2.0, 2);
        let start = Instant::now();

        throttle.acquire("ex.com").await;
        throttle.acquire("ex.com").await;
        assert!(start.elapsed() < Duration::from_millis(10));

        throttle.acquire("ex.com").await;
        assert!(start.elapsed() >= Duration::from_millis(490));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hosts_are_independent() {
        let throttle = HostTokenBucket::new(1.0, 1);
        let start = Instant::now();

        throttle.acquire("a.example").await;
        throttle.acquire("b.example").await;
        assert!(start.elapsed() < Duration::from_millis(10));
    }

    #[tokio::test]
    async fn test_no_throttle_never_waits() {
        NoThrottle.acquire("ex.com").await;
    }
}
