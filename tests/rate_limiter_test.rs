//! Tests for the per-domain token-bucket rate limiter
//!
//! These tests use isolated limiter instances so they can run in parallel
//! without interfering with each other.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use propharvest::resilience::{BucketConfig, LimiterSettings, RateLimiter};
use propharvest::shutdown::ShutdownSignal;

fn settings(capacity: f64, refill: f64) -> LimiterSettings {
    LimiterSettings {
        default: BucketConfig {
            capacity,
            refill_per_sec: refill,
        },
        per_domain: HashMap::new(),
    }
}

#[tokio::test]
async fn test_burst_then_pacing() {
    // Bucket of 2 at 1 token/sec: first two admissions are immediate, the
    // next ones arrive roughly one per second
    let limiter = RateLimiter::local(settings(2.0, 1.0));
    let shutdown = ShutdownSignal::new();
    let started = Instant::now();

    limiter.acquire("d1.example", &shutdown).await.expect("token 1");
    limiter.acquire("d1.example", &shutdown).await.expect("token 2");
    assert!(started.elapsed() < Duration::from_millis(200));

    limiter.acquire("d1.example", &shutdown).await.expect("token 3");
    assert!(
        started.elapsed() >= Duration::from_millis(800),
        "third token arrived too early: {:?}",
        started.elapsed()
    );
}

#[tokio::test]
async fn test_eight_urls_take_at_least_six_seconds() {
    // capacity=2, refill=1/sec, eight acquisitions at t=0: two immediate,
    // then one per second; total >= 6s
    let limiter = Arc::new(RateLimiter::local(settings(2.0, 1.0)));
    let shutdown = ShutdownSignal::new();
    let started = Instant::now();

    for _ in 0..8 {
        limiter.acquire("d1.example", &shutdown).await.expect("token");
    }

    let elapsed = started.elapsed();
    assert!(
        elapsed >= Duration::from_secs(6),
        "eight tokens in {elapsed:?}, expected >= 6s"
    );
    assert!(elapsed < Duration::from_secs(9), "pacing too slow: {elapsed:?}");
}

#[tokio::test]
async fn test_admission_bound_under_concurrency() {
    // Over any window, admissions never exceed capacity + refill * elapsed
    let limiter = Arc::new(RateLimiter::local(settings(3.0, 5.0)));
    let shutdown = ShutdownSignal::new();
    let started = Instant::now();

    let mut handles = Vec::new();
    for _ in 0..4 {
        let limiter = Arc::clone(&limiter);
        let shutdown = shutdown.clone();
        handles.push(tokio::spawn(async move {
            let mut admitted = 0u32;
            while started.elapsed() < Duration::from_millis(1200) {
                if limiter.acquire("d1.example", &shutdown).await.is_ok() {
                    admitted += 1;
                }
            }
            admitted
        }));
    }

    let mut total = 0u32;
    for handle in handles {
        total += handle.await.expect("worker");
    }

    let elapsed = started.elapsed().as_secs_f64();
    let bound = (3.0 + 5.0 * elapsed).ceil() as u32 + 1;
    assert!(
        total <= bound,
        "{total} admissions exceed the bucket bound {bound} over {elapsed:.2}s"
    );
}

#[tokio::test]
async fn test_domains_do_not_share_buckets() {
    let limiter = RateLimiter::local(settings(1.0, 0.5));
    let shutdown = ShutdownSignal::new();
    let started = Instant::now();

    limiter.acquire("a.example", &shutdown).await.expect("a");
    limiter.acquire("b.example", &shutdown).await.expect("b");
    limiter.acquire("c.example", &shutdown).await.expect("c");

    // Three different domains, all from full buckets: no waiting
    assert!(started.elapsed() < Duration::from_millis(200));
}

#[tokio::test]
async fn test_zero_capacity_only_exits_via_shutdown() {
    let limiter = Arc::new(RateLimiter::local(settings(0.0, 0.0)));
    let shutdown = ShutdownSignal::new();

    let acquire = {
        let limiter = Arc::clone(&limiter);
        let shutdown = shutdown.clone();
        tokio::spawn(async move { limiter.acquire("dead.example", &shutdown).await })
    };

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!acquire.is_finished(), "zero-capacity bucket admitted a token");

    shutdown.trigger();
    let result = acquire.await.expect("task");
    assert!(result.is_err());
}
