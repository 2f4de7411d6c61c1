//! Fixed-point token bucket.
//!
//! Tokens are counted in nano-tokens so refill needs no floating point:
//! after exactly `window / capacity` of elapsed time one whole token has been
//! added. The division remainder is carried between refills, so repeated
//! small refills never lose time.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

/// Nano-tokens per token.
const SCALE: u128 = 1_000_000_000;

/// Bucket quota: `capacity` tokens, refilled evenly over `window`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quota {
    /// Maximum tokens (burst size).
    pub capacity: u32,
    /// Time to refill from empty to full.
    pub window: Duration,
}

impl Quota {
    /// Create a quota. Zero capacity or zero window is clamped to one.
    #[must_use]
    pub fn new(capacity: u32, window: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            window: window.max(Duration::from_nanos(1)),
        }
    }

    /// Tokens added per second.
    #[must_use]
    pub fn refill_rate_per_second(&self) -> f64 {
        f64::from(self.capacity) / self.window.as_secs_f64()
    }

    /// Time to earn one token.
    #[must_use]
    pub fn replenish_interval(&self) -> Duration {
        self.window / self.capacity
    }

    fn capacity_nanos(&self) -> u128 {
        u128::from(self.capacity) * SCALE
    }
}

#[derive(Debug)]
struct BucketState {
    available: u128,
    carry: u128,
    last_refill: Instant,
}

/// A single operation class's bucket.
#[derive(Debug)]
pub struct TokenBucket {
    quota: Quota,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// Create a full bucket.
    #[must_use]
    pub fn new(quota: Quota, now: Instant) -> Self {
        Self {
            quota,
            state: Mutex::new(BucketState {
                available: quota.capacity_nanos(),
                carry: 0,
                last_refill: now,
            }),
        }
    }

    /// The bucket's quota.
    #[must_use]
    pub const fn quota(&self) -> Quota {
        self.quota
    }

    /// Refill, then take one token if available.
    pub fn try_acquire(&self, now: Instant) -> bool {
        let mut state = self.state.lock();
        self.refill(&mut state, now);
        if state.available >= SCALE {
            state.available -= SCALE;
            true
        } else {
            false
        }
    }

    /// Refill and report how long until one token is available.
    ///
    /// Returns `Duration::ZERO` if a token is available now.
    #[must_use]
    pub fn time_until_available(&self, now: Instant) -> Duration {
        let mut state = self.state.lock();
        self.refill(&mut state, now);
        if state.available >= SCALE {
            return Duration::ZERO;
        }

        let missing = SCALE - state.available;
        let window = self.quota.window.as_nanos();
        let rate = u128::from(self.quota.capacity) * SCALE;
        // smallest elapsed e with e * rate + carry >= missing * window
        let needed = (missing * window).saturating_sub(state.carry);
        let nanos = needed.div_ceil(rate);
        Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
    }

    /// Whole tokens available after refilling.
    #[must_use]
    pub fn available(&self, now: Instant) -> u32 {
        let mut state = self.state.lock();
        self.refill(&mut state, now);
        u32::try_from(state.available / SCALE).unwrap_or(u32::MAX)
    }

    /// Refill to capacity.
    pub fn reset(&self, now: Instant) {
        let mut state = self.state.lock();
        state.available = self.quota.capacity_nanos();
        state.carry = 0;
        state.last_refill = now;
    }

    fn refill(&self, state: &mut BucketState, now: Instant) {
        let elapsed = now.saturating_duration_since(state.last_refill).as_nanos();
        if elapsed == 0 {
            return;
        }
        state.last_refill = now;

        let cap = self.quota.capacity_nanos();
        if state.available >= cap {
            state.carry = 0;
            return;
        }

        let window = self.quota.window.as_nanos();
        let numerator = elapsed * u128::from(self.quota.capacity) * SCALE + state.carry;
        let added = numerator / window;
        let available = state.available + added;
        if available >= cap {
            state.available = cap;
            state.carry = 0;
        } else {
            state.available = available;
            state.carry = numerator % window;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn bucket(capacity: u32, window: Duration) -> (TokenBucket, Instant) {
        let now = Instant::now();
        (TokenBucket::new(Quota::new(capacity, window), now), now)
    }

    #[test]
    fn drains_to_empty_then_refuses() {
        let (b, now) = bucket(40, Duration::from_secs(1));
        for _ in 0..40 {
            assert!(b.try_acquire(now));
        }
        assert!(!b.try_acquire(now));
        assert_eq!(b.available(now), 0);
    }

    #[test]
    fn one_interval_yields_exactly_one_token() {
        let (b, now) = bucket(8, Duration::from_secs(60));
        for _ in 0..8 {
            assert!(b.try_acquire(now));
        }
        let interval = b.quota().replenish_interval();
        assert_eq!(interval, Duration::from_millis(7_500));

        let just_before = now + interval - Duration::from_nanos(1);
        assert!(!b.try_acquire(just_before));

        let later = now + interval;
        assert!(b.try_acquire(later));
        assert!(!b.try_acquire(later));
    }

    #[test]
    fn piecewise_refill_does_not_lose_time() {
        let (b, now) = bucket(3, Duration::from_secs(1));
        for _ in 0..3 {
            assert!(b.try_acquire(now));
        }
        // 1/3 s is not a whole number of nanoseconds per token
        let mut t = now;
        for _ in 0..1000 {
            t += Duration::from_millis(1);
            let _ = b.available(t);
        }
        assert_eq!(b.available(t), 3);
    }

    #[test]
    fn wait_estimate_matches_refill() {
        let (b, now) = bucket(40, Duration::from_secs(1));
        for _ in 0..40 {
            assert!(b.try_acquire(now));
        }
        let wait = b.time_until_available(now);
        assert_eq!(wait, Duration::from_millis(25));
        assert!(b.try_acquire(now + wait));
    }

    #[test]
    fn reset_refills() {
        let (b, now) = bucket(2, Duration::from_secs(10));
        assert!(b.try_acquire(now));
        assert!(b.try_acquire(now));
        b.reset(now);
        assert_eq!(b.available(now), 2);
    }

    proptest! {
        #[test]
        fn never_exceeds_capacity(
            capacity in 1u32..100,
            window_ms in 1u64..10_000,
            steps in prop::collection::vec((0u64..5_000, any::<bool>()), 0..60),
        ) {
            let (b, start) = bucket(capacity, Duration::from_millis(window_ms));
            let mut t = start;
            for (advance_ms, acquire) in steps {
                t += Duration::from_millis(advance_ms);
                if acquire {
                    let _ = b.try_acquire(t);
                }
                prop_assert!(b.available(t) <= capacity);
            }
        }

        #[test]
        fn successes_bounded_by_capacity_without_time(capacity in 1u32..200) {
            let (b, now) = bucket(capacity, Duration::from_secs(1));
            let granted = (0..capacity * 2).filter(|_| b.try_acquire(now)).count();
            prop_assert_eq!(granted, capacity as usize);
        }
    }
}
