//! Rate Limiter - token buckets per connecting IP and per authenticated identity

use dashmap::DashMap;
use mailgate_common::config::{BucketConfig, RateLimitConfig};
use std::fmt;
use std::net::IpAddr;
use tokio::time::Instant;
use tracing::debug;

/// Slack for floating point refill arithmetic
const EPSILON: f64 = 1e-9;

/// What a bucket is keyed by
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RateKey {
    Ip(IpAddr),
    Identity(String),
}

impl fmt::Display for RateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateKey::Ip(ip) => write!(f, "ip:{}", ip),
            RateKey::Identity(id) => write!(f, "identity:{}", id),
        }
    }
}

/// Outcome of a consume attempt
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateDecision {
    pub allowed: bool,
    /// Tokens left after the attempt
    pub remaining: f64,
}

#[derive(Debug, Clone)]
struct RateBucket {
    tokens: f64,
    last_refill: Instant,
}

impl RateBucket {
    fn refill(&mut self, limits: &BucketConfig, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * limits.refill_per_sec).min(limits.capacity);
        self.last_refill = now.max(self.last_refill);
    }
}

/// Rate limiter for connecting IPs and authenticated senders
pub struct RateLimiter {
    buckets: DashMap<RateKey, RateBucket>,
    ip: BucketConfig,
    identity: BucketConfig,
}

impl RateLimiter {
    /// Create a new rate limiter
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            buckets: DashMap::new(),
            ip: config.ip,
            identity: config.identity,
        }
    }

    fn limits(&self, key: &RateKey) -> &BucketConfig {
        match key {
            RateKey::Ip(_) => &self.ip,
            RateKey::Identity(_) => &self.identity,
        }
    }

    /// Take `cost` tokens from the bucket for `key`
    ///
    /// Negative or NaN costs are denied without touching the bucket.
    pub fn consume(&self, key: RateKey, cost: f64) -> RateDecision {
        self.consume_at(key, cost, Instant::now())
    }

    pub fn consume_at(&self, key: RateKey, cost: f64, now: Instant) -> RateDecision {
        let limits = *self.limits(&key);
        if cost.is_nan() || cost < 0.0 {
            debug!("Invalid rate cost {} for {}", cost, key);
            let remaining = self
                .buckets
                .get(&key)
                .map(|bucket| bucket.tokens)
                .unwrap_or(limits.capacity);
            return RateDecision {
                allowed: false,
                remaining,
            };
        }

        let mut bucket = self.buckets.entry(key.clone()).or_insert_with(|| RateBucket {
            tokens: limits.capacity,
            last_refill: now,
        });

        bucket.refill(&limits, now);

        if bucket.tokens + EPSILON >= cost {
            bucket.tokens = (bucket.tokens - cost).clamp(0.0, limits.capacity);
            RateDecision {
                allowed: true,
                remaining: bucket.tokens,
            }
        } else {
            debug!(
                "Rate limit hit for {}: {:.2} tokens < {}",
                key, bucket.tokens, cost
            );
            RateDecision {
                allowed: false,
                remaining: bucket.tokens,
            }
        }
    }

    /// Drop buckets that have refilled to capacity; they behave like absent ones
    pub fn prune_at(&self, now: Instant) -> usize {
        let before = self.buckets.len();
        self.buckets.retain(|key, bucket| {
            let limits = match key {
                RateKey::Ip(_) => &self.ip,
                RateKey::Identity(_) => &self.identity,
            };
            bucket.refill(limits, now);
            bucket.tokens + EPSILON < limits.capacity
        });
        before.saturating_sub(self.buckets.len())
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn limiter(capacity: f64, refill_per_sec: f64) -> RateLimiter {
        let bucket = BucketConfig {
            capacity,
            refill_per_sec,
        };
        RateLimiter::new(&RateLimitConfig {
            ip: bucket,
            identity: bucket,
        })
    }

    fn ip_key() -> RateKey {
        RateKey::Ip("192.0.2.1".parse().unwrap())
    }

    #[test]
    fn test_burst_up_to_capacity() {
        let limiter = limiter(5.0, 1.0);
        let now = Instant::now();

        for _ in 0..5 {
            assert!(limiter.consume_at(ip_key(), 1.0, now).allowed);
        }
        let denied = limiter.consume_at(ip_key(), 1.0, now);
        assert!(!denied.allowed);
        assert!(denied.remaining >= 0.0);
    }

    #[test]
    fn test_refill_after_one_over_rate() {
        let limiter = limiter(2.0, 4.0);
        let now = Instant::now();
        limiter.consume_at(ip_key(), 1.0, now);
        limiter.consume_at(ip_key(), 1.0, now);
        assert!(!limiter.consume_at(ip_key(), 1.0, now).allowed);

        // 1/R seconds buys exactly one token
        let later = now + Duration::from_millis(250);
        assert!(limiter.consume_at(ip_key(), 1.0, later).allowed);
        assert!(!limiter.consume_at(ip_key(), 1.0, later).allowed);
    }

    #[test]
    fn test_full_after_capacity_over_rate() {
        let limiter = limiter(10.0, 2.0);
        let now = Instant::now();
        for _ in 0..10 {
            limiter.consume_at(ip_key(), 1.0, now);
        }

        // C/R seconds refill the whole bucket
        let later = now + Duration::from_secs(5);
        let decision = limiter.consume_at(ip_key(), 1.0, later);
        assert!(decision.allowed);
        assert!((decision.remaining - 9.0).abs() < 1e-6);

        // and idling longer never goes beyond it
        let much_later = later + Duration::from_secs(60);
        let decision = limiter.consume_at(ip_key(), 1.0, much_later);
        assert!((decision.remaining - 9.0).abs() < 1e-6);
    }

    #[test]
    fn test_invalid_cost_is_denied() {
        let limiter = limiter(5.0, 1.0);
        let now = Instant::now();

        let negative = limiter.consume_at(ip_key(), -10.0, now);
        assert!(!negative.allowed);
        assert!(negative.remaining <= 5.0);

        assert!(!limiter.consume_at(ip_key(), f64::NAN, now).allowed);

        // The bucket was left alone
        for _ in 0..5 {
            assert!(limiter.consume_at(ip_key(), 1.0, now).allowed);
        }
        let exhausted = limiter.consume_at(ip_key(), 1.0, now);
        assert!(!exhausted.allowed);
        assert!(exhausted.remaining >= 0.0 && exhausted.remaining <= 5.0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_consume_on_one_key() {
        let limiter = Arc::new(limiter(50.0, 0.001));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let limiter = limiter.clone();
                tokio::spawn(async move {
                    let mut allowed = 0;
                    for _ in 0..25 {
                        let decision = limiter.consume(ip_key(), 1.0);
                        assert!(decision.remaining >= 0.0);
                        assert!(decision.remaining <= 50.0);
                        if decision.allowed {
                            allowed += 1;
                        }
                        tokio::task::yield_now().await;
                    }
                    allowed
                })
            })
            .collect();

        let mut total = 0;
        for handle in handles {
            total += handle.await.unwrap();
        }

        // 200 attempts against 50 tokens; the refill during the test is far
        // below one token
        assert_eq!(total, 50);
        assert_eq!(limiter.len(), 1);
    }

    #[test]
    fn test_keys_are_independent() {
        let limiter = limiter(1.0, 0.1);
        let now = Instant::now();

        assert!(limiter.consume_at(ip_key(), 1.0, now).allowed);
        assert!(!limiter.consume_at(ip_key(), 1.0, now).allowed);
        assert!(limiter
            .consume_at(RateKey::Identity("alice@example.com".into()), 1.0, now)
            .allowed);
        assert!(limiter
            .consume_at(RateKey::Ip("192.0.2.2".parse().unwrap()), 1.0, now)
            .allowed);
    }

    #[test]
    fn test_separate_limits_per_key_kind() {
        let limiter = RateLimiter::new(&RateLimitConfig {
            ip: BucketConfig {
                capacity: 1.0,
                refill_per_sec: 1.0,
            },
            identity: BucketConfig {
                capacity: 3.0,
                refill_per_sec: 1.0,
            },
        });
        let now = Instant::now();
        let identity = || RateKey::Identity("alice".into());

        assert!(limiter.consume_at(identity(), 3.0, now).allowed);
        assert!(!limiter.consume_at(ip_key(), 2.0, now).allowed);
    }

    #[test]
    fn test_prune_drops_full_buckets() {
        let limiter = limiter(2.0, 1.0);
        let now = Instant::now();
        limiter.consume_at(ip_key(), 1.0, now);
        limiter.consume_at(RateKey::Identity("bob".into()), 2.0, now);
        assert_eq!(limiter.len(), 2);

        assert_eq!(limiter.prune_at(now + Duration::from_secs(1)), 1);
        assert_eq!(limiter.prune_at(now + Duration::from_secs(2)), 1);
        assert!(limiter.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_consume_uses_runtime_clock() {
        let limiter = limiter(1.0, 1.0);
        assert!(limiter.consume(ip_key(), 1.0).allowed);
        assert!(!limiter.consume(ip_key(), 1.0).allowed);

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(limiter.consume(ip_key(), 1.0).allowed);
    }
}
