//! Rate Limiter
//!
//! Token-bucket admission control for outbound broker requests, one bucket
//! per operation class. Buckets never share state; each has its own lock.

mod bucket;

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

pub use bucket::{Quota, TokenBucket};

/// Operation class with its own quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationClass {
    /// Market data subscriptions.
    MarketData,
    /// Order placement and cancellation.
    Orders,
    /// Account, position and order queries.
    Account,
}

impl OperationClass {
    /// All classes.
    pub const ALL: [Self; 3] = [Self::MarketData, Self::Orders, Self::Account];

    /// Lowercase name used as a metric label.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::MarketData => "market_data",
            Self::Orders => "orders",
            Self::Account => "account",
        }
    }
}

impl fmt::Display for OperationClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-class quotas.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitSettings {
    /// Market data quota.
    pub market_data: Quota,
    /// Order quota.
    pub orders: Quota,
    /// Account quota.
    pub account: Quota,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            market_data: Quota::new(50, Duration::from_secs(600)),
            orders: Quota::new(40, Duration::from_secs(1)),
            account: Quota::new(8, Duration::from_secs(60)),
        }
    }
}

impl RateLimitSettings {
    /// Quota for one class.
    #[must_use]
    pub const fn quota(&self, class: OperationClass) -> Quota {
        match class {
            OperationClass::MarketData => self.market_data,
            OperationClass::Orders => self.orders,
            OperationClass::Account => self.account,
        }
    }
}

/// Rate limiter errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RateLimitError {
    /// No token before the deadline.
    #[error("no {class} token available before deadline")]
    DeadlineExceeded {
        /// Class that was throttled.
        class: OperationClass,
    },
}

/// Bucket state report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BucketUsage {
    /// Class.
    pub class: OperationClass,
    /// Capacity.
    pub capacity: u32,
    /// Whole tokens available.
    pub available: u32,
    /// Refill rate.
    pub refill_rate_per_second: f64,
}

/// Per-class token buckets.
#[derive(Debug)]
pub struct RateLimiter {
    buckets: HashMap<OperationClass, TokenBucket>,
}

impl RateLimiter {
    /// Create a limiter with full buckets.
    #[must_use]
    pub fn new(settings: RateLimitSettings) -> Self {
        let now = Instant::now();
        let buckets = OperationClass::ALL
            .into_iter()
            .map(|class| (class, TokenBucket::new(settings.quota(class), now)))
            .collect();
        Self { buckets }
    }

    fn bucket(&self, class: OperationClass) -> &TokenBucket {
        // every class is inserted in `new`
        &self.buckets[&class]
    }

    /// Take a token if one is available. Never waits.
    pub fn try_acquire(&self, class: OperationClass) -> bool {
        let granted = self.bucket(class).try_acquire(Instant::now());
        if !granted {
            metrics::counter!("gateway_rate_limited_total", "class" => class.as_str())
                .increment(1);
        }
        granted
    }

    /// Wait for a token until `deadline`. Suspends only the calling task.
    ///
    /// # Errors
    ///
    /// Returns [`RateLimitError::DeadlineExceeded`] if no token became
    /// available in time.
    pub async fn acquire_blocking(
        &self,
        class: OperationClass,
        deadline: Instant,
    ) -> Result<(), RateLimitError> {
        let bucket = self.bucket(class);
        let mut throttled = false;

        loop {
            let now = Instant::now();
            if bucket.try_acquire(now) {
                if throttled {
                    tracing::debug!(class = %class, "Rate limit token acquired after wait");
                }
                return Ok(());
            }

            if !throttled {
                throttled = true;
                metrics::counter!("gateway_rate_limited_total", "class" => class.as_str())
                    .increment(1);
            }

            if now >= deadline {
                tracing::warn!(class = %class, "Rate limit deadline exceeded");
                return Err(RateLimitError::DeadlineExceeded { class });
            }

            let wake = (now + bucket.time_until_available(now)).min(deadline);
            tracing::debug!(
                class = %class,
                wait_ms = wake.saturating_duration_since(now).as_millis(),
                "Rate limited, waiting for token"
            );
            tokio::time::sleep_until(wake).await;
        }
    }

    /// Whole tokens currently available.
    #[must_use]
    pub fn available(&self, class: OperationClass) -> u32 {
        self.bucket(class).available(Instant::now())
    }

    /// State of every bucket.
    #[must_use]
    pub fn usage(&self) -> Vec<BucketUsage> {
        let now = Instant::now();
        OperationClass::ALL
            .into_iter()
            .map(|class| {
                let bucket = self.bucket(class);
                let quota = bucket.quota();
                BucketUsage {
                    class,
                    capacity: quota.capacity,
                    available: bucket.available(now),
                    refill_rate_per_second: quota.refill_rate_per_second(),
                }
            })
            .collect()
    }

    /// Refill every bucket.
    pub fn reset(&self) {
        let now = Instant::now();
        for bucket in self.buckets.values() {
            bucket.reset(now);
        }
    }
}
