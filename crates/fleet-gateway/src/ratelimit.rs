//! Layered token-bucket rate limiting
//!
//! Three independent limiters guard the dispatch boundary: a single global
//! bucket, one bucket per principal, and one per model. Each has its own
//! denial code so clients can tell which layer rejected them. Buckets are
//! created lazily per key and evicted by a janitor once idle, which bounds
//! memory under IP-keyed churn.

use fleet_core::{Error, Result};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Denial code for the global limiter.
pub const GLOBAL_LIMIT_CODE: &str = "RATE_LIMIT_EXCEEDED";
/// Denial code for the per-principal limiter.
pub const USER_LIMIT_CODE: &str = "USER_RATE_LIMIT_EXCEEDED";
/// Denial code for the per-model limiter.
pub const MODEL_LIMIT_CODE: &str = "MODEL_RATE_LIMIT_EXCEEDED";

/// How often the janitor scans bucket maps.
pub const JANITOR_INTERVAL: Duration = Duration::from_secs(300);
/// Buckets idle longer than this are evicted.
pub const BUCKET_MAX_IDLE: Duration = Duration::from_secs(600);

struct BucketInner {
    tokens: i64,
    last_refill: Instant,
}

/// A single token bucket with lazy refill.
pub struct TokenBucket {
    capacity: i64,
    refill_rate: i64,
    inner: Mutex<BucketInner>,
}

impl TokenBucket {
    pub fn new(capacity: i64, refill_rate: i64) -> Self {
        Self {
            capacity,
            refill_rate,
            inner: Mutex::new(BucketInner {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Try to take one token, refilling lazily from the wall clock first.
    pub fn take(&self) -> bool {
        self.take_at(Instant::now())
    }

    fn take_at(&self, now: Instant) -> bool {
        let mut inner = self.inner.lock();

        let elapsed = now.saturating_duration_since(inner.last_refill).as_secs_f64();
        let refill = (elapsed * self.refill_rate as f64) as i64;
        inner.tokens = (inner.tokens + refill).min(self.capacity);
        inner.last_refill = now;

        if inner.tokens > 0 {
            inner.tokens -= 1;
            true
        } else {
            false
        }
    }

    /// Current occupancy without taking a token.
    pub fn snapshot(&self) -> (i64, i64) {
        let inner = self.inner.lock();
        (inner.tokens, self.capacity)
    }

    fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.inner.lock().last_refill)
    }
}

/// Occupancy report for one bucket.
#[derive(Debug, Clone, Serialize)]
pub struct BucketStatus {
    pub available_tokens: i64,
    pub capacity: i64,
    pub usage_percent: f64,
}

/// Keyed collection of token buckets sharing one capacity/rate.
pub struct RateLimiter {
    capacity: i64,
    refill_rate: i64,
    buckets: Mutex<HashMap<String, Arc<TokenBucket>>>,
}

impl RateLimiter {
    pub fn new(capacity: i64, refill_rate: i64) -> Self {
        Self {
            capacity,
            refill_rate,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Get or lazily create the bucket for a key.
    pub fn bucket(&self, key: &str) -> Arc<TokenBucket> {
        let mut buckets = self.buckets.lock();
        Arc::clone(
            buckets
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(TokenBucket::new(self.capacity, self.refill_rate))),
        )
    }

    /// Take one token for a key.
    pub fn take(&self, key: &str) -> bool {
        self.bucket(key).take()
    }

    /// Occupancy for a key.
    pub fn status(&self, key: &str) -> BucketStatus {
        let (tokens, capacity) = self.bucket(key).snapshot();
        BucketStatus {
            available_tokens: tokens,
            capacity,
            usage_percent: if capacity > 0 {
                (capacity - tokens) as f64 / capacity as f64 * 100.0
            } else {
                0.0
            },
        }
    }

    /// Evict buckets idle longer than `max_idle`. Returns how many went.
    pub fn cleanup(&self, max_idle: Duration) -> usize {
        let now = Instant::now();
        let mut buckets = self.buckets.lock();
        let before = buckets.len();
        buckets.retain(|_, bucket| bucket.idle_for(now) <= max_idle);
        before - buckets.len()
    }

    /// Number of live buckets.
    pub fn len(&self) -> usize {
        self.buckets.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The three dispatch-boundary limiters.
pub struct RateLimiters {
    pub global: RateLimiter,
    pub user: RateLimiter,
    pub model: RateLimiter,
}

impl RateLimiters {
    pub fn new() -> Self {
        Self {
            // 100 requests/s with bursts up to 200 across the whole node
            global: RateLimiter::new(200, 100),
            // 10 requests/s with bursts up to 20 per principal
            user: RateLimiter::new(20, 10),
            // 5 requests/s with bursts up to 10 per model
            model: RateLimiter::new(10, 5),
        }
    }

    /// Check the global bucket.
    pub fn check_global(&self) -> Result<()> {
        if self.global.take("global") {
            Ok(())
        } else {
            Err(Error::RateLimited {
                code: GLOBAL_LIMIT_CODE,
            })
        }
    }

    /// Check the calling principal's bucket.
    pub fn check_user(&self, rate_key: &str) -> Result<()> {
        if self.user.take(rate_key) {
            Ok(())
        } else {
            Err(Error::RateLimited {
                code: USER_LIMIT_CODE,
            })
        }
    }

    /// Check a model's bucket.
    pub fn check_model(&self, model: &str) -> Result<()> {
        if self.model.take(model) {
            Ok(())
        } else {
            Err(Error::RateLimited {
                code: MODEL_LIMIT_CODE,
            })
        }
    }

    /// Start the janitor that evicts idle buckets.
    pub fn spawn_janitor(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let limiters = self;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(JANITOR_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let evicted = limiters.global.cleanup(BUCKET_MAX_IDLE)
                    + limiters.user.cleanup(BUCKET_MAX_IDLE)
                    + limiters.model.cleanup(BUCKET_MAX_IDLE);
                if evicted > 0 {
                    debug!(evicted, "Evicted idle rate-limit buckets");
                }
            }
        })
    }
}

impl Default for RateLimiters {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_exhaustion_without_refill() {
        let bucket = TokenBucket::new(2, 0);
        let now = Instant::now();

        assert!(bucket.take_at(now));
        assert!(bucket.take_at(now));
        // capacity 2, refill 0: the third take within the same instant fails
        assert!(!bucket.take_at(now));
    }

    #[test]
    fn test_bucket_lazy_refill() {
        let bucket = TokenBucket::new(5, 2);
        let start = Instant::now();

        for _ in 0..5 {
            assert!(bucket.take_at(start));
        }
        assert!(!bucket.take_at(start));

        // two seconds later: floor(2s * 2/s) = 4 tokens back
        let later = start + Duration::from_secs(2);
        for _ in 0..4 {
            assert!(bucket.take_at(later));
        }
        assert!(!bucket.take_at(later));
    }

    #[test]
    fn test_bucket_refill_clamps_to_capacity() {
        let bucket = TokenBucket::new(3, 100);
        let start = Instant::now();

        assert!(bucket.take_at(start));
        let much_later = start + Duration::from_secs(60);
        assert!(bucket.take_at(much_later));
        let (tokens, capacity) = bucket.snapshot();
        assert_eq!(capacity, 3);
        assert_eq!(tokens, 2); // clamped to 3, then one taken
    }

    #[test]
    fn test_fractional_refill_floors() {
        let bucket = TokenBucket::new(10, 1);
        let start = Instant::now();
        for _ in 0..10 {
            assert!(bucket.take_at(start));
        }

        // 0.5s at 1/s floors to zero tokens
        assert!(!bucket.take_at(start + Duration::from_millis(500)));
    }

    #[test]
    fn test_limiter_keys_are_independent() {
        let limiter = RateLimiter::new(1, 0);
        assert!(limiter.take("alice"));
        assert!(!limiter.take("alice"));
        assert!(limiter.take("bob"));
        assert_eq!(limiter.len(), 2);
    }

    #[test]
    fn test_limiter_status() {
        let limiter = RateLimiter::new(4, 0);
        limiter.take("k");
        let status = limiter.status("k");
        assert_eq!(status.available_tokens, 3);
        assert_eq!(status.capacity, 4);
        assert!((status.usage_percent - 25.0).abs() < 1e-9);
    }

    #[test]
    fn test_cleanup_evicts_only_idle() {
        let limiter = RateLimiter::new(1, 0);
        limiter.take("fresh");
        assert_eq!(limiter.cleanup(Duration::from_secs(600)), 0);
        assert_eq!(limiter.cleanup(Duration::ZERO), 1);
        assert!(limiter.is_empty());
    }

    #[test]
    fn test_layered_denial_codes() {
        let limiters = RateLimiters::new();

        // capacity 20 per principal: the 21st burst request is denied
        for _ in 0..20 {
            assert!(limiters.check_user("user:u1").is_ok());
        }
        let err = limiters.check_user("user:u1").unwrap_err();
        assert!(matches!(
            err,
            Error::RateLimited {
                code: USER_LIMIT_CODE
            }
        ));

        // capacity 10 per model
        for _ in 0..10 {
            assert!(limiters.check_model("m1").is_ok());
        }
        let err = limiters.check_model("m1").unwrap_err();
        assert!(matches!(
            err,
            Error::RateLimited {
                code: MODEL_LIMIT_CODE
            }
        ));

        // other principals and models are unaffected
        assert!(limiters.check_user("user:u2").is_ok());
        assert!(limiters.check_model("m2").is_ok());
    }
}
