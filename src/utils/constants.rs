//! Shared configuration constants for propharvest
//!
//! This module contains default values and configuration constants used
//! throughout the codebase to ensure consistency and avoid magic numbers.

use std::time::Duration;

/// Default inter-request delay per site: 2 seconds
///
/// Conservative pacing that respects target servers while maintaining
/// reasonable harvest speed. Translated into a token-bucket refill rate
/// of `1 / delay` tokens per second.
pub const DEFAULT_SITE_DELAY_SECS: f64 = 2.0;

/// Default per-fetch timeout: 30 seconds
pub const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 30;

/// Default token bucket capacity per domain
pub const DEFAULT_BUCKET_CAPACITY: f64 = 2.0;

/// Checkpoint save cadence: persist after this many completed URLs
pub const DEFAULT_CHECKPOINT_EVERY: usize = 10;

/// Progress publish cadence: report after this many completed URLs
pub const DEFAULT_PROGRESS_EVERY: usize = 25;

/// Maximum full retry cycles a URL gets before it is moved to the failed set
pub const DEFAULT_MAX_URL_PASSES: u32 = 2;

/// Circuit breaker: consecutive failures before the circuit opens
pub const DEFAULT_BREAKER_FAILURE_THRESHOLD: u32 = 2;

/// Circuit breaker: how long an open circuit waits before admitting a probe
pub const DEFAULT_BREAKER_COOLDOWN: Duration = Duration::from_secs(120);

/// Retry engine base delay
pub const DEFAULT_RETRY_BASE_DELAY: Duration = Duration::from_millis(1000);

/// Retry engine delay cap
pub const DEFAULT_RETRY_MAX_DELAY: Duration = Duration::from_secs(30);

/// Retry engine jitter factor (fraction of the exponential delay)
pub const DEFAULT_RETRY_JITTER_FACTOR: f64 = 0.2;

/// Proxy validation chunk size
pub const DEFAULT_VALIDATION_CHUNK_SIZE: usize = 100;

/// Minimum live forwards required before the dispatchers start
pub const DEFAULT_MIN_LIVE_POOL: usize = 3;

/// Scorer: consecutive failures before an endpoint is pruned
pub const SCORER_PRUNE_FAILURES: u32 = 3;

/// Scorer: score floor below which an endpoint is pruned
pub const SCORER_PRUNE_SCORE: f64 = 0.01;

/// Scorer: multiplier applied on a successful fetch through a forward
pub const SCORER_SUCCESS_FACTOR: f64 = 1.1;

/// Scorer: multiplier applied on a failed fetch through a forward
pub const SCORER_FAILURE_FACTOR: f64 = 0.5;

/// Scorer: latency floor used when seeding scores as `1 / latency`
pub const SCORER_LATENCY_EPSILON: f64 = 0.001;

/// Quiescence delay after endpoint-file writes so the rotator's watch mode
/// finishes reloading before new traffic arrives
pub const DEFAULT_QUIESCENCE_DELAY: Duration = Duration::from_millis(750);

/// Grace period between SIGTERM and SIGKILL for supervised children
pub const DEFAULT_CHILD_GRACE: Duration = Duration::from_secs(10);

/// Window within which a second unclean rotator exit escalates instead of
/// triggering another restart
pub const DEFAULT_RESTART_WINDOW: Duration = Duration::from_secs(60);

/// Health verdict latency threshold L1 (healthy at or below)
pub const HEALTH_LATENCY_L1: Duration = Duration::from_secs(2);

/// Health verdict latency threshold L2 (degraded at or below)
pub const HEALTH_LATENCY_L2: Duration = Duration::from_secs(8);

/// Bound on retained price-history points per listing
pub const PRICE_HISTORY_LIMIT: usize = 10;

/// Chrome user agent string for stealth mode
///
/// Updated: 2025-01-29 to Chrome 132 (current stable)
/// Next update: 2025-04-29 (quarterly schedule)
pub const CHROME_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/132.0.6834.160 Safari/537.36";

/// Routing header the rotator uses to select a specific forward by
/// zero-based index into the endpoint file
pub const FORWARD_INDEX_HEADER: &str = "Proxy-Forward-Index";
