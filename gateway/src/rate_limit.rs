//! Per-identity token budgets.
//!
//! Each tier is a keyed GCRA limiter from `governor`, which behaves as a
//! token bucket of `capacity` tokens refilled at `refill_per_sec`, computed
//! lazily on each check. Denied checks consume nothing.

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use governor::clock::{Clock, DefaultClock};
use governor::{DefaultKeyedRateLimiter, Quota};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{RateLimitConfig, TierConfig};
use crate::error::GatewayError;
use crate::identity::ClientIdentity;

/// Result of an admission check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Admission {
    pub allowed: bool,
    /// Seconds until the request would fit. Zero when allowed.
    pub retry_after_secs: f64,
}

impl Admission {
    fn allowed() -> Self {
        Self {
            allowed: true,
            retry_after_secs: 0.0,
        }
    }

    fn denied(wait: Duration) -> Self {
        Self {
            allowed: false,
            retry_after_secs: wait.as_secs_f64(),
        }
    }
}

struct TierLimiter {
    limiter: DefaultKeyedRateLimiter<String>,
    capacity: NonZeroU32,
}

impl TierLimiter {
    fn new(tier: &TierConfig) -> Self {
        let capacity = NonZeroU32::new(tier.capacity).unwrap_or(NonZeroU32::MIN);
        let period = Duration::try_from_secs_f64((1.0 / tier.refill_per_sec).clamp(1e-9, 86_400.0))
            .unwrap_or(Duration::from_secs(1));
        let quota = Quota::with_period(period)
            .unwrap_or_else(|| Quota::per_second(capacity))
            .allow_burst(capacity);
        Self {
            limiter: governor::RateLimiter::keyed(quota),
            capacity,
        }
    }
}

/// Token-bucket rate limiter keyed by client identity.
pub struct RateLimiter {
    tiers: HashMap<String, TierLimiter>,
    default_tier: String,
    clock: DefaultClock,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        let tiers = config
            .tiers
            .iter()
            .map(|(name, tier)| (name.clone(), TierLimiter::new(tier)))
            .collect();
        Self {
            tiers,
            default_tier: config.default_tier.clone(),
            clock: DefaultClock::default(),
        }
    }

    /// Try to take `estimated_tokens` from the identity's bucket.
    ///
    /// Requests larger than the tier's capacity are charged the full
    /// capacity, so they are admitted once the bucket is full.
    pub fn try_admit(&self, identity: &ClientIdentity, estimated_tokens: u32) -> Admission {
        let Some(tier) = self
            .tiers
            .get(&identity.tier)
            .or_else(|| self.tiers.get(&self.default_tier))
        else {
            return Admission::allowed();
        };

        let cost = estimated_tokens.clamp(1, tier.capacity.get());
        let cost = NonZeroU32::new(cost).unwrap_or(NonZeroU32::MIN);

        match tier.limiter.check_key_n(&identity.id, cost) {
            Ok(Ok(())) => Admission::allowed(),
            Ok(Err(not_until)) => {
                let wait = not_until.wait_time_from(self.clock.now());
                tracing::debug!(
                    "Rate limited {} ({} tokens, retry in {:?})",
                    identity.id,
                    cost,
                    wait
                );
                Admission::denied(wait)
            }
            Err(_) => Admission::denied(Duration::from_secs(1)),
        }
    }

    /// [`try_admit`](Self::try_admit) as a `Result`.
    pub fn check(&self, identity: &ClientIdentity, estimated_tokens: u32) -> Result<(), GatewayError> {
        let admission = self.try_admit(identity, estimated_tokens);
        if admission.allowed {
            Ok(())
        } else {
            Err(GatewayError::RateLimited {
                retry_after_secs: admission.retry_after_secs,
            })
        }
    }

    /// Number of tracked identities across tiers.
    pub fn tracked_identities(&self) -> usize {
        self.tiers.values().map(|t| t.limiter.len()).sum()
    }

    /// Drop state for identities whose buckets are full again.
    pub fn sweep(&self) {
        for tier in self.tiers.values() {
            tier.limiter.retain_recent();
            tier.limiter.shrink_to_fit();
        }
    }

    /// Sweep every `period` until `shutdown` is cancelled.
    pub fn spawn_sweeper(self: Arc<Self>, period: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => self.sweep(),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(capacity: u32, refill_per_sec: f64) -> RateLimiter {
        let mut config = RateLimitConfig::default();
        config.tiers.insert(
            "test".to_string(),
            TierConfig {
                capacity,
                refill_per_sec,
            },
        );
        config.default_tier = "test".to_string();
        RateLimiter::new(&config)
    }

    fn identity(id: &str) -> ClientIdentity {
        ClientIdentity::new(id, "test")
    }

    #[test]
    fn test_admits_within_capacity() {
        let limiter = limiter(100, 1.0);
        assert!(limiter.try_admit(&identity("a"), 60).allowed);
        assert!(limiter.try_admit(&identity("a"), 40).allowed);
        assert!(!limiter.try_admit(&identity("a"), 10).allowed);
    }

    #[test]
    fn test_denial_reports_refill_wait() {
        let limiter = limiter(100, 10.0);
        assert!(limiter.try_admit(&identity("a"), 100).allowed);

        let denied = limiter.try_admit(&identity("a"), 20);
        assert!(!denied.allowed);
        // 20 tokens at 10/s
        assert!(denied.retry_after_secs > 1.0 && denied.retry_after_secs < 3.0);
    }

    #[test]
    fn test_retry_after_never_grows_without_spending() {
        let limiter = limiter(100, 10.0);
        assert!(limiter.try_admit(&identity("a"), 100).allowed);

        let first = limiter.try_admit(&identity("a"), 50).retry_after_secs;
        std::thread::sleep(Duration::from_millis(20));
        let second = limiter.try_admit(&identity("a"), 50).retry_after_secs;
        assert!(second <= first);
    }

    #[test]
    fn test_identities_are_isolated() {
        let limiter = limiter(10, 1.0);
        assert!(limiter.try_admit(&identity("a"), 10).allowed);
        assert!(!limiter.try_admit(&identity("a"), 5).allowed);
        assert!(limiter.try_admit(&identity("b"), 10).allowed);
        assert_eq!(limiter.tracked_identities(), 2);
    }

    #[test]
    fn test_refills_over_time() {
        let limiter = limiter(10, 200.0);
        assert!(limiter.try_admit(&identity("a"), 10).allowed);
        assert!(!limiter.try_admit(&identity("a"), 5).allowed);
        std::thread::sleep(Duration::from_millis(60));
        assert!(limiter.try_admit(&identity("a"), 5).allowed);
    }

    #[test]
    fn test_oversized_request_charged_full_capacity() {
        let limiter = limiter(10, 1.0);
        assert!(limiter.try_admit(&identity("a"), 1_000).allowed);
        assert!(!limiter.try_admit(&identity("a"), 5).allowed);
    }

    #[test]
    fn test_unknown_tier_uses_default() {
        let limiter = limiter(10, 1.0);
        let stranger = ClientIdentity::new("x", "no-such-tier");
        assert!(limiter.try_admit(&stranger, 10).allowed);
        assert!(!limiter.try_admit(&stranger, 5).allowed);
    }

    #[test]
    fn test_check_maps_to_rate_limited() {
        let limiter = limiter(10, 1.0);
        assert!(limiter.check(&identity("a"), 10).is_ok());
        assert!(matches!(
            limiter.check(&identity("a"), 5),
            Err(GatewayError::RateLimited { retry_after_secs }) if retry_after_secs > 0.0
        ));
    }

    #[test]
    fn test_nan_refill_rate_does_not_panic() {
        let limiter = limiter(10, f64::NAN);
        assert!(limiter.try_admit(&identity("a"), 10).allowed);
    }

    #[test]
    fn test_waiting_retry_after_readmits_same_request() {
        let limiter = limiter(100, 50.0);
        assert!(limiter.try_admit(&identity("a"), 100).allowed);

        let denied = limiter.try_admit(&identity("a"), 30);
        assert!(!denied.allowed);
        assert!(denied.retry_after_secs > 0.0);

        std::thread::sleep(Duration::from_secs_f64(denied.retry_after_secs));
        assert!(limiter.try_admit(&identity("a"), 30).allowed);
    }
}
