//! Failure backoff policy.
//!
//! The first failure waits `base`; every consecutive failure doubles the
//! previous delay, capped at `max`. Success deletes the record, so there is
//! no state to reset.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::record::AdhocTaskRecord;

/// Exponential backoff with a ceiling, in whole seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Delay after the first failure
    pub base: Duration,
    /// Maximum delay cap
    pub max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(60),
            max: Duration::from_secs(24 * 60 * 60),
        }
    }
}

impl BackoffPolicy {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    /// Next fail delay (seconds) given the current one.
    pub fn next_faildelay(&self, current: u64) -> u64 {
        let base = self.base.as_secs().max(1);
        let max = self.max.as_secs().max(base);

        if current == 0 {
            return base.min(max);
        }
        current.saturating_mul(2).clamp(base, max)
    }

    /// New `(faildelay, nextruntime)` after a failed execution.
    ///
    /// A delay past chrono's representable range saturates to the latest
    /// representable instant.
    pub fn on_failure(&self, record: &AdhocTaskRecord, now: DateTime<Utc>) -> (u64, DateTime<Utc>) {
        let faildelay = self.next_faildelay(record.faildelay);
        let nextruntime = i64::try_from(faildelay)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .and_then(|delay| now.checked_add_signed(delay))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        (faildelay, nextruntime)
    }

    /// Exceeding the runtime budget is an ordinary failure.
    pub fn on_timeout(&self, record: &AdhocTaskRecord, now: DateTime<Utc>) -> (u64, DateTime<Utc>) {
        self.on_failure(record, now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::TaskId;
    use crate::record::NewAdhocTask;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn now() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap()
    }

    fn record_with_faildelay(faildelay: u64) -> AdhocTaskRecord {
        let mut r = NewAdhocTask::new("x", serde_json::json!({}))
            .into_record(TaskId::new(1), now())
            .unwrap();
        r.faildelay = faildelay;
        r
    }

    #[test]
    fn first_failure_uses_base_interval() {
        let policy = BackoffPolicy::default();
        let (delay, next) = policy.on_failure(&record_with_faildelay(0), now());
        assert_eq!(delay, 60);
        assert_eq!(next, now() + chrono::Duration::seconds(60));
    }

    #[test]
    fn consecutive_failures_double() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.next_faildelay(60), 120);
        assert_eq!(policy.next_faildelay(120), 240);
        assert_eq!(policy.next_faildelay(240), 480);
    }

    #[test]
    fn delay_is_capped_at_max() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.next_faildelay(60_000), 86_400);
        assert_eq!(policy.next_faildelay(86_400), 86_400);
        assert_eq!(policy.next_faildelay(u64::MAX), 86_400);
    }

    #[test]
    fn timeout_is_treated_like_failure() {
        let policy = BackoffPolicy::default();
        let r = record_with_faildelay(120);
        assert_eq!(policy.on_timeout(&r, now()), policy.on_failure(&r, now()));
    }

    #[test]
    fn delay_below_base_is_raised_to_base() {
        let policy = BackoffPolicy::new(Duration::from_secs(60), Duration::from_secs(600));
        assert_eq!(policy.next_faildelay(10), 60);
    }

    #[test]
    fn huge_delays_saturate_instead_of_panicking() {
        let huge = Duration::from_secs(10_000_000_000_000);
        let policy = BackoffPolicy::new(huge, huge);
        let (delay, next) = policy.on_failure(&record_with_faildelay(0), now());
        assert_eq!(delay, 10_000_000_000_000);
        assert_eq!(next, DateTime::<Utc>::MAX_UTC);

        let unbounded = BackoffPolicy::new(Duration::from_secs(60), Duration::from_secs(u64::MAX));
        let (delay, next) = unbounded.on_failure(&record_with_faildelay(1 << 62), now());
        assert_eq!(delay, u64::MAX);
        assert_eq!(next, DateTime::<Utc>::MAX_UTC);
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: consecutive failures never shrink the delay and never
        /// exceed the ceiling.
        #[test]
        fn faildelay_is_monotonic_and_bounded(
            base in 1u64..3_600,
            extra in 0u64..200_000,
            failures in 1usize..64,
        ) {
            let policy = BackoffPolicy::new(
                Duration::from_secs(base),
                Duration::from_secs(base + extra),
            );

            let mut delay = 0u64;
            for _ in 0..failures {
                let next = policy.next_faildelay(delay);
                prop_assert!(next >= delay);
                prop_assert!(next <= base + extra);
                prop_assert!(next >= base);
                delay = next;
            }
        }
    }
}
