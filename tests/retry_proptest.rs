//! Property tests for the retry engine's backoff arithmetic

use std::time::Duration;

use proptest::prelude::*;

use propharvest::resilience::RetryPolicy;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    /// Effective delay for attempt n lies in
    /// [base * 2^n, base * 2^n * (1 + jitter_factor)], capped at max_delay
    #[test]
    fn delay_within_bounds(
        base_ms in 1u64..2000,
        max_ms in 1000u64..120_000,
        jitter in 0.0f64..1.0,
        attempt in 0u32..10,
    ) {
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(base_ms),
            max_delay: Duration::from_millis(max_ms),
            jitter_factor: jitter,
        };

        let delay = policy.delay_for_attempt(attempt);
        let floor = Duration::from_millis(base_ms.saturating_mul(1 << attempt.min(16)));
        let ceiling = floor.mul_f64(1.0 + jitter);
        let cap = Duration::from_millis(max_ms);

        prop_assert!(delay <= cap, "delay {delay:?} exceeds cap {cap:?}");
        prop_assert!(
            delay >= floor.min(cap),
            "delay {delay:?} below floor {:?}",
            floor.min(cap)
        );
        prop_assert!(
            delay <= ceiling.min(cap),
            "delay {delay:?} above ceiling {:?}",
            ceiling.min(cap)
        );
    }

    /// Delays are monotonically non-decreasing in the attempt number once
    /// jitter is removed
    #[test]
    fn zero_jitter_is_monotonic(base_ms in 1u64..500, attempts in 1u32..8) {
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(base_ms),
            max_delay: Duration::from_secs(3600),
            jitter_factor: 0.0,
        };

        let mut previous = Duration::ZERO;
        for attempt in 0..attempts {
            let delay = policy.delay_for_attempt(attempt);
            prop_assert!(delay >= previous);
            previous = delay;
        }
    }
}
