//! Retry engine: classified exponential backoff with jitter
//!
//! Wraps an async unit of work with up to `max_retries(kind)` attempts.
//! Before each retry the classifier decides whether to continue;
//! non-recoverable kinds give up immediately. A `RetryWithProxyRotation`
//! plan marks the next attempt as eligible for a fresh forward selection.

use std::future::Future;
use std::time::Duration;

use log::{debug, warn};
use rand::Rng;

use crate::shutdown::ShutdownSignal;

use super::classify::{self, FetchFailure, RecoveryAction, RecoveryPlan};

/// Backoff parameters for the retry engine
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: crate::utils::DEFAULT_RETRY_BASE_DELAY,
            max_delay: crate::utils::DEFAULT_RETRY_MAX_DELAY,
            jitter_factor: crate::utils::DEFAULT_RETRY_JITTER_FACTOR,
        }
    }
}

/// Per-attempt context handed to the unit of work
#[derive(Debug, Clone, Copy, Default)]
pub struct AttemptContext {
    /// 0-indexed attempt number
    pub attempt: u32,
    /// The previous attempt failed with `ProxyError`; select a new forward
    pub rotate_proxy: bool,
    /// Forward index to exclude when rotating
    pub excluded_index: Option<usize>,
}

/// Terminal result of a retry cycle
#[derive(Debug)]
pub enum RetryOutcome<T> {
    /// An attempt succeeded
    Success(T),
    /// Every admitted attempt failed; the last failure and its plan
    GaveUp {
        failure: FetchFailure,
        plan: RecoveryPlan,
        attempts: u32,
    },
    /// Shutdown observed during a backoff sleep
    Cancelled,
}

impl RetryPolicy {
    /// Delay before retry attempt `n` (0-indexed):
    /// `base · 2^n + Uniform(0, jitter_factor · base · 2^n)`, capped at
    /// `max_delay`
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay
            .checked_mul(1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX))
            .unwrap_or(self.max_delay);
        let jitter_max = exp.mul_f64(self.jitter_factor.max(0.0));
        let jitter = if jitter_max.is_zero() {
            Duration::ZERO
        } else {
            rand::rng().random_range(Duration::ZERO..jitter_max)
        };
        exp.saturating_add(jitter).min(self.max_delay)
    }

    /// Execute `op` under classified retries
    ///
    /// `op` receives the attempt context and returns either the success value
    /// or a [`FetchFailure`] for classification. Backoff sleeps select
    /// against the shutdown signal.
    pub async fn execute<T, F, Fut>(
        &self,
        shutdown: &ShutdownSignal,
        mut op: F,
    ) -> RetryOutcome<T>
    where
        F: FnMut(AttemptContext) -> Fut,
        Fut: Future<Output = Result<T, FetchFailure>>,
    {
        let mut ctx = AttemptContext::default();

        loop {
            if shutdown.is_triggered() {
                return RetryOutcome::Cancelled;
            }

            match op(ctx).await {
                Ok(value) => return RetryOutcome::Success(value),
                Err(failure) => {
                    let plan = classify::classify(&failure);
                    let attempts_done = ctx.attempt + 1;

                    if !plan.recoverable || ctx.attempt >= plan.max_retries {
                        if !plan.recoverable {
                            debug!(
                                "Not retrying {:?} after attempt {attempts_done}: {}",
                                plan.kind, failure.error
                            );
                        } else {
                            warn!(
                                "Giving up after {attempts_done} attempts ({:?}): {}",
                                plan.kind, failure.error
                            );
                        }
                        return RetryOutcome::GaveUp {
                            failure,
                            plan,
                            attempts: attempts_done,
                        };
                    }

                    // Server-provided Retry-After wins over computed backoff
                    let delay = plan
                        .retry_after
                        .unwrap_or_else(|| self.delay_for_attempt(ctx.attempt));

                    debug!(
                        "Attempt {attempts_done} failed ({:?}), retrying in {delay:?}: {}",
                        plan.kind, failure.error
                    );

                    tokio::select! {
                        () = tokio::time::sleep(delay) => {}
                        () = shutdown.wait() => return RetryOutcome::Cancelled,
                    }

                    ctx = AttemptContext {
                        attempt: ctx.attempt + 1,
                        rotate_proxy: plan.action == RecoveryAction::RetryWithProxyRotation,
                        excluded_index: if plan.action == RecoveryAction::RetryWithProxyRotation {
                            failure.proxy_index
                        } else {
                            None
                        },
                    };
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::classify::ErrorKind;
    use anyhow::anyhow;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            jitter_factor: 0.2,
        }
    }

    #[test]
    fn test_delay_bounds() {
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            jitter_factor: 0.5,
        };
        for attempt in 0..6 {
            let floor = Duration::from_millis(100 * (1 << attempt));
            let ceil = floor.mul_f64(1.5);
            for _ in 0..50 {
                let d = policy.delay_for_attempt(attempt);
                assert!(d >= floor.min(policy.max_delay), "delay {d:?} below floor {floor:?}");
                assert!(d <= ceil.min(policy.max_delay), "delay {d:?} above ceiling {ceil:?}");
            }
        }
    }

    #[test]
    fn test_delay_never_exceeds_cap() {
        let policy = RetryPolicy {
            base_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(15),
            jitter_factor: 1.0,
        };
        for attempt in 0..20 {
            assert!(policy.delay_for_attempt(attempt) <= Duration::from_secs(15));
        }
    }

    #[tokio::test]
    async fn test_success_passes_through() {
        let shutdown = ShutdownSignal::new();
        let outcome = fast_policy()
            .execute(&shutdown, |_ctx| async { Ok::<_, FetchFailure>(42) })
            .await;
        assert!(matches!(outcome, RetryOutcome::Success(42)));
    }

    #[tokio::test]
    async fn test_non_recoverable_gives_up_immediately() {
        let shutdown = ShutdownSignal::new();
        let calls = Arc::new(AtomicU32::new(0));
        let calls_in = Arc::clone(&calls);

        let outcome = fast_policy()
            .execute(&shutdown, move |_ctx| {
                let calls = Arc::clone(&calls_in);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(FetchFailure::from_error(anyhow!("gone")).with_status(404))
                }
            })
            .await;

        match outcome {
            RetryOutcome::GaveUp { plan, attempts, .. } => {
                assert_eq!(plan.kind, ErrorKind::NotFound);
                assert_eq!(attempts, 1);
            }
            other => panic!("expected GaveUp, got {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retries_until_budget_exhausted() {
        let shutdown = ShutdownSignal::new();
        let calls = Arc::new(AtomicU32::new(0));
        let calls_in = Arc::clone(&calls);

        let outcome = fast_policy()
            .execute(&shutdown, move |_ctx| {
                let calls = Arc::clone(&calls_in);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(FetchFailure::from_error(anyhow!("operation timed out")))
                }
            })
            .await;

        // NetworkTimeout budget is 3 retries: 4 attempts total
        match outcome {
            RetryOutcome::GaveUp { plan, attempts, .. } => {
                assert_eq!(plan.kind, ErrorKind::NetworkTimeout);
                assert_eq!(attempts, 4);
            }
            other => panic!("expected GaveUp, got {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_proxy_rotation_signalled_on_next_attempt() {
        let shutdown = ShutdownSignal::new();
        let seen_rotation = Arc::new(AtomicU32::new(0));
        let seen_in = Arc::clone(&seen_rotation);

        let _ = fast_policy()
            .execute(&shutdown, move |ctx| {
                let seen = Arc::clone(&seen_in);
                async move {
                    if ctx.rotate_proxy && ctx.excluded_index == Some(3) {
                        seen.fetch_add(1, Ordering::SeqCst);
                        return Ok(());
                    }
                    Err(FetchFailure::from_error(anyhow!("proxy handshake failed"))
                        .with_proxy_index(3))
                }
            })
            .await;

        assert_eq!(seen_rotation.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancellation_during_backoff() {
        let shutdown = ShutdownSignal::new();
        let policy = RetryPolicy {
            base_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(120),
            jitter_factor: 0.0,
        };
        shutdown.trigger();
        let outcome = policy
            .execute(&shutdown, |_ctx| async {
                Err::<(), _>(FetchFailure::from_error(anyhow!("timed out")))
            })
            .await;
        assert!(matches!(outcome, RetryOutcome::Cancelled));
    }
}
