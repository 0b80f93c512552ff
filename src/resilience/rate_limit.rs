//! Per-domain token-bucket admission control
//!
//! `acquire(domain)` suspends until at least one token is available, then
//! consumes it. Refill is continuous:
//! `tokens = min(capacity, tokens + elapsed · refill_rate)`.
//!
//! Two implementations share identical semantics behind [`RateLimiter`]:
//! a local mutex-protected map, and a shared-store variant that runs an
//! atomic check-and-decrement script against redis keyed `rate:{domain}`
//! so multiple harvester processes share one bucket. The acquiring caller
//! never knows which variant is configured.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use anyhow::Context;
use log::{debug, trace};
use parking_lot::Mutex;

use crate::error::{HarvestError, HarvestResult};
use crate::shutdown::ShutdownSignal;

/// Bucket parameters for one domain
#[derive(Debug, Clone, Copy)]
pub struct BucketConfig {
    pub capacity: f64,
    pub refill_per_sec: f64,
}

impl Default for BucketConfig {
    fn default() -> Self {
        Self {
            capacity: crate::utils::DEFAULT_BUCKET_CAPACITY,
            refill_per_sec: 1.0 / crate::utils::DEFAULT_SITE_DELAY_SECS,
        }
    }
}

/// Limiter-wide settings: a default bucket plus per-domain overrides
#[derive(Debug, Clone, Default)]
pub struct LimiterSettings {
    pub default: BucketConfig,
    pub per_domain: HashMap<String, BucketConfig>,
}

impl LimiterSettings {
    fn bucket_for(&self, domain: &str) -> BucketConfig {
        self.per_domain.get(domain).copied().unwrap_or(self.default)
    }
}

/// One in-process token bucket
#[derive(Debug)]
struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(config: BucketConfig, now: Instant) -> Self {
        Self {
            capacity: config.capacity,
            refill_per_sec: config.refill_per_sec,
            tokens: config.capacity,
            last_refill: now,
        }
    }

    /// Consume one token, or return how long to wait for one
    fn try_acquire(&mut self, now: Instant) -> Result<(), Duration> {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            return Ok(());
        }

        if self.refill_per_sec <= 0.0 || self.capacity < 1.0 {
            // A zero-capacity bucket never admits; callers wait on shutdown
            return Err(Duration::from_secs(3600));
        }

        let deficit = 1.0 - self.tokens;
        Err(Duration::from_secs_f64(deficit / self.refill_per_sec))
    }
}

/// In-process limiter: a mutex-protected map of buckets
#[derive(Debug)]
pub struct LocalRateLimiter {
    buckets: Mutex<HashMap<String, TokenBucket>>,
    settings: LimiterSettings,
}

impl LocalRateLimiter {
    #[must_use]
    pub fn new(settings: LimiterSettings) -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            settings,
        }
    }

    fn try_acquire(&self, domain: &str) -> Result<(), Duration> {
        let now = Instant::now();
        let mut buckets = self.buckets.lock();
        let bucket = buckets
            .entry(domain.to_string())
            .or_insert_with(|| TokenBucket::new(self.settings.bucket_for(domain), now));
        bucket.try_acquire(now)
    }
}

/// Atomic check-and-decrement against redis
///
/// KEYS[1] = `rate:{domain}`; ARGV = capacity, refill_per_sec, now_ms.
/// The bucket state is a hash `{tokens, last_refill_ms}`. Returns
/// `{1, 0}` when a token was consumed, `{0, wait_ms}` otherwise.
const ACQUIRE_SCRIPT: &str = r#"
local capacity = tonumber(ARGV[1])
local refill = tonumber(ARGV[2])
local now_ms = tonumber(ARGV[3])

local state = redis.call('HMGET', KEYS[1], 'tokens', 'last_refill_ms')
local tokens = tonumber(state[1])
local last_ms = tonumber(state[2])
if tokens == nil then
    tokens = capacity
    last_ms = now_ms
end

local elapsed = math.max(now_ms - last_ms, 0) / 1000.0
tokens = math.min(capacity, tokens + elapsed * refill)

if tokens >= 1.0 then
    tokens = tokens - 1.0
    redis.call('HMSET', KEYS[1], 'tokens', tokens, 'last_refill_ms', now_ms)
    redis.call('PEXPIRE', KEYS[1], 3600000)
    return {1, 0}
end

redis.call('HMSET', KEYS[1], 'tokens', tokens, 'last_refill_ms', now_ms)
redis.call('PEXPIRE', KEYS[1], 3600000)

if refill <= 0 or capacity < 1.0 then
    return {0, 3600000}
end

local wait_ms = math.ceil((1.0 - tokens) / refill * 1000.0)
return {0, wait_ms}
"#;

/// Shared-store limiter: one bucket per domain across processes
pub struct SharedRateLimiter {
    conn: redis::aio::ConnectionManager,
    script: redis::Script,
    settings: LimiterSettings,
}

impl SharedRateLimiter {
    pub async fn connect(store_url: &str, settings: LimiterSettings) -> anyhow::Result<Self> {
        let client = redis::Client::open(store_url)
            .with_context(|| format!("Invalid shared-store URL: {store_url}"))?;
        let conn = client
            .get_connection_manager()
            .await
            .context("Failed to connect to shared store")?;
        Ok(Self {
            conn,
            script: redis::Script::new(ACQUIRE_SCRIPT),
            settings,
        })
    }

    async fn try_acquire(&self, domain: &str) -> anyhow::Result<Result<(), Duration>> {
        let config = self.settings.bucket_for(domain);
        let now_ms = chrono::Utc::now().timestamp_millis();
        let mut conn = self.conn.clone();
        let (admitted, wait_ms): (i64, i64) = self
            .script
            .key(format!("rate:{domain}"))
            .arg(config.capacity)
            .arg(config.refill_per_sec)
            .arg(now_ms)
            .invoke_async(&mut conn)
            .await
            .context("Rate-limit script failed against shared store")?;

        if admitted == 1 {
            Ok(Ok(()))
        } else {
            Ok(Err(Duration::from_millis(wait_ms.max(1) as u64)))
        }
    }
}

/// The limiter the engine holds; variant chosen by configuration
pub enum RateLimiter {
    Local(LocalRateLimiter),
    Shared(SharedRateLimiter),
}

impl RateLimiter {
    #[must_use]
    pub fn local(settings: LimiterSettings) -> Self {
        Self::Local(LocalRateLimiter::new(settings))
    }

    pub async fn shared(store_url: &str, settings: LimiterSettings) -> anyhow::Result<Self> {
        Ok(Self::Shared(SharedRateLimiter::connect(store_url, settings).await?))
    }

    /// Suspend until a token is available for `domain`, then consume it
    ///
    /// Returns the total time spent waiting, so callers can count
    /// rate-limit events. Honours the shutdown signal during waits.
    pub async fn acquire(
        &self,
        domain: &str,
        shutdown: &ShutdownSignal,
    ) -> HarvestResult<Duration> {
        let start = Instant::now();
        loop {
            if shutdown.is_triggered() {
                return Err(HarvestError::Cancelled);
            }

            let decision = match self {
                Self::Local(limiter) => limiter.try_acquire(domain),
                Self::Shared(limiter) => limiter.try_acquire(domain).await?,
            };

            match decision {
                Ok(()) => {
                    trace!("Token acquired for {domain}");
                    return Ok(start.elapsed());
                }
                Err(wait) => {
                    debug!("Rate limited on {domain}, waiting {wait:?}");
                    tokio::select! {
                        () = tokio::time::sleep(wait) => {}
                        () = shutdown.wait() => return Err(HarvestError::Cancelled),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(capacity: f64, refill: f64) -> LimiterSettings {
        LimiterSettings {
            default: BucketConfig {
                capacity,
                refill_per_sec: refill,
            },
            per_domain: HashMap::new(),
        }
    }

    #[test]
    fn test_bucket_admits_up_to_capacity() {
        let limiter = LocalRateLimiter::new(settings(2.0, 1.0));
        assert!(limiter.try_acquire("example.com").is_ok());
        assert!(limiter.try_acquire("example.com").is_ok());
        assert!(limiter.try_acquire("example.com").is_err());
    }

    #[test]
    fn test_domains_are_independent() {
        let limiter = LocalRateLimiter::new(settings(1.0, 1.0));
        assert!(limiter.try_acquire("a.example").is_ok());
        assert!(limiter.try_acquire("b.example").is_ok());
        assert!(limiter.try_acquire("a.example").is_err());
        assert!(limiter.try_acquire("b.example").is_err());
    }

    #[test]
    fn test_zero_capacity_never_admits() {
        let limiter = LocalRateLimiter::new(settings(0.0, 1.0));
        for _ in 0..10 {
            assert!(limiter.try_acquire("example.com").is_err());
        }
    }

    #[test]
    fn test_wait_hint_reflects_deficit() {
        let limiter = LocalRateLimiter::new(settings(1.0, 2.0));
        assert!(limiter.try_acquire("example.com").is_ok());
        let wait = limiter.try_acquire("example.com").expect_err("bucket drained");
        // One token at 2/sec refill is at most 500ms away
        assert!(wait <= Duration::from_millis(510), "wait was {wait:?}");
    }

    #[tokio::test]
    async fn test_acquire_blocks_then_admits() {
        let limiter = RateLimiter::local(settings(1.0, 20.0));
        let shutdown = ShutdownSignal::new();

        limiter.acquire("example.com", &shutdown).await.expect("first token");
        let waited = limiter.acquire("example.com", &shutdown).await.expect("second token");
        assert!(waited >= Duration::from_millis(20), "waited {waited:?}");
    }

    #[tokio::test]
    async fn test_acquire_cancelled_by_shutdown() {
        let limiter = RateLimiter::local(settings(0.0, 0.0));
        let shutdown = ShutdownSignal::new();
        let trigger = shutdown.clone();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.trigger();
        });

        let result = limiter.acquire("example.com", &shutdown).await;
        assert!(matches!(result, Err(HarvestError::Cancelled)));
    }
}
