//! Per-domain circuit breaker
//!
//! Tracks domain health across three states and short-circuits calls to
//! consistently failing domains:
//!
//! - Closed: normal operation, calls proceed
//! - Open: too many failures, calls fail fast with `CircuitOpen`
//! - `HalfOpen`: cooldown elapsed, exactly one probe call is admitted
//!
//! `Blocked` and repeated `ServerError` classifications count as failures;
//! `RateLimit` does not (the limiter absorbs it). Local and shared-store
//! variants carry identical semantics.

use std::time::{Duration, Instant};

use anyhow::Context;
use dashmap::DashMap;
use log::{debug, info, warn};

use crate::error::{HarvestError, HarvestResult};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation - calls proceed
    Closed,
    /// Failing - calls are rejected until the cooldown elapses
    Open,
    /// Cooldown elapsed - a single probe is admitted
    HalfOpen,
}

/// Breaker tuning
#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    /// Consecutive failures before the circuit opens
    pub failure_threshold: u32,
    /// How long an open circuit waits before admitting a probe
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: crate::utils::DEFAULT_BREAKER_FAILURE_THRESHOLD,
            cooldown: crate::utils::DEFAULT_BREAKER_COOLDOWN,
        }
    }
}

/// Health tracking for a single domain
#[derive(Debug, Clone)]
struct DomainHealth {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    half_open_probes_remaining: u32,
}

impl DomainHealth {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            half_open_probes_remaining: 0,
        }
    }
}

/// In-process breaker state
pub struct LocalCircuitBreaker {
    domains: DashMap<String, DomainHealth>,
    config: BreakerConfig,
}

impl LocalCircuitBreaker {
    #[must_use]
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            domains: DashMap::new(),
            config,
        }
    }

    pub fn check(&self, domain: &str) -> HarvestResult<()> {
        let mut health = self
            .domains
            .entry(domain.to_string())
            .or_insert_with(DomainHealth::new);

        match health.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let opened = health.opened_at.unwrap_or_else(Instant::now);
                let elapsed = opened.elapsed();
                if elapsed >= self.config.cooldown {
                    // Transition to HalfOpen and consume the single probe
                    health.state = CircuitState::HalfOpen;
                    health.half_open_probes_remaining = 0;
                    info!("Circuit HALF-OPEN for {domain} after {elapsed:?} cooldown, admitting probe");
                    Ok(())
                } else {
                    Err(HarvestError::CircuitOpen {
                        domain: domain.to_string(),
                        retry_in: self.config.cooldown - elapsed,
                    })
                }
            }
            CircuitState::HalfOpen => {
                if health.half_open_probes_remaining > 0 {
                    health.half_open_probes_remaining -= 1;
                    Ok(())
                } else {
                    // The probe is already in flight; fail fast
                    Err(HarvestError::CircuitOpen {
                        domain: domain.to_string(),
                        retry_in: self.config.cooldown,
                    })
                }
            }
        }
    }

    pub fn record_success(&self, domain: &str) {
        if let Some(mut health) = self.domains.get_mut(domain) {
            if health.state == CircuitState::HalfOpen {
                info!("Circuit CLOSED for {domain} (probe succeeded)");
            }
            health.state = CircuitState::Closed;
            health.consecutive_failures = 0;
            health.opened_at = None;
        }
    }

    pub fn record_failure(&self, domain: &str) -> bool {
        let mut health = self
            .domains
            .entry(domain.to_string())
            .or_insert_with(DomainHealth::new);

        health.consecutive_failures += 1;

        let should_open = match health.state {
            // A failed probe re-opens with a fresh cooldown
            CircuitState::HalfOpen => true,
            CircuitState::Closed => health.consecutive_failures >= self.config.failure_threshold,
            CircuitState::Open => false,
        };

        if should_open {
            health.state = CircuitState::Open;
            health.opened_at = Some(Instant::now());
            health.half_open_probes_remaining = 0;
            warn!(
                "Circuit OPEN for {domain} after {} consecutive failures",
                health.consecutive_failures
            );
            true
        } else {
            debug!(
                "Circuit failure for {domain} ({}/{})",
                health.consecutive_failures, self.config.failure_threshold
            );
            false
        }
    }

    #[must_use]
    pub fn state(&self, domain: &str) -> CircuitState {
        self.domains
            .get(domain)
            .map_or(CircuitState::Closed, |h| h.state)
    }
}

/// Check-and-transition against the shared store
///
/// KEYS[1] = `breaker:{domain}`; ARGV = cooldown_ms, now_ms. State hash is
/// `{state, failures, opened_at_ms}` with state 0=closed 1=open 2=half-open.
/// Returns `{1, 0}` when the call is admitted, `{0, retry_in_ms}` otherwise.
const CHECK_SCRIPT: &str = r#"
local cooldown = tonumber(ARGV[1])
local now_ms = tonumber(ARGV[2])

local s = redis.call('HMGET', KEYS[1], 'state', 'opened_at_ms')
local state = tonumber(s[1]) or 0
local opened = tonumber(s[2]) or 0

if state == 0 then
    return {1, 0}
end

if state == 1 then
    local elapsed = now_ms - opened
    if elapsed >= cooldown then
        redis.call('HMSET', KEYS[1], 'state', 2, 'probes', 0)
        return {1, 0}
    end
    return {0, cooldown - elapsed}
end

-- half-open: admit only while probes remain
local probes = tonumber(redis.call('HGET', KEYS[1], 'probes')) or 0
if probes > 0 then
    redis.call('HSET', KEYS[1], 'probes', probes - 1)
    return {1, 0}
end
return {0, cooldown}
"#;

/// Failure transition. ARGV = threshold, now_ms. Returns 1 if the circuit
/// opened on this failure.
const FAILURE_SCRIPT: &str = r#"
local threshold = tonumber(ARGV[1])
local now_ms = tonumber(ARGV[2])

local s = redis.call('HMGET', KEYS[1], 'state', 'failures')
local state = tonumber(s[1]) or 0
local failures = (tonumber(s[2]) or 0) + 1

redis.call('HSET', KEYS[1], 'failures', failures)

local open = 0
if state == 2 then
    open = 1
elseif state == 0 and failures >= threshold then
    open = 1
end

if open == 1 then
    redis.call('HMSET', KEYS[1], 'state', 1, 'opened_at_ms', now_ms, 'probes', 0)
end
redis.call('PEXPIRE', KEYS[1], 86400000)
return open
"#;

const SUCCESS_SCRIPT: &str = r#"
redis.call('HMSET', KEYS[1], 'state', 0, 'failures', 0, 'opened_at_ms', 0)
redis.call('PEXPIRE', KEYS[1], 86400000)
return 1
"#;

/// Shared-store breaker: one state machine per domain across processes
pub struct SharedCircuitBreaker {
    conn: redis::aio::ConnectionManager,
    check: redis::Script,
    failure: redis::Script,
    success: redis::Script,
    config: BreakerConfig,
}

impl SharedCircuitBreaker {
    pub async fn connect(store_url: &str, config: BreakerConfig) -> anyhow::Result<Self> {
        let client = redis::Client::open(store_url)
            .with_context(|| format!("Invalid shared-store URL: {store_url}"))?;
        let conn = client
            .get_connection_manager()
            .await
            .context("Failed to connect to shared store")?;
        Ok(Self {
            conn,
            check: redis::Script::new(CHECK_SCRIPT),
            failure: redis::Script::new(FAILURE_SCRIPT),
            success: redis::Script::new(SUCCESS_SCRIPT),
            config,
        })
    }

    async fn check(&self, domain: &str) -> HarvestResult<()> {
        let mut conn = self.conn.clone();
        let (admitted, retry_ms): (i64, i64) = self
            .check
            .key(format!("breaker:{domain}"))
            .arg(self.config.cooldown.as_millis() as i64)
            .arg(chrono::Utc::now().timestamp_millis())
            .invoke_async(&mut conn)
            .await
            .context("Breaker check script failed against shared store")?;

        if admitted == 1 {
            Ok(())
        } else {
            Err(HarvestError::CircuitOpen {
                domain: domain.to_string(),
                retry_in: Duration::from_millis(retry_ms.max(0) as u64),
            })
        }
    }

    async fn record_failure(&self, domain: &str) -> anyhow::Result<bool> {
        let mut conn = self.conn.clone();
        let opened: i64 = self
            .failure
            .key(format!("breaker:{domain}"))
            .arg(i64::from(self.config.failure_threshold))
            .arg(chrono::Utc::now().timestamp_millis())
            .invoke_async(&mut conn)
            .await
            .context("Breaker failure script failed against shared store")?;
        Ok(opened == 1)
    }

    async fn record_success(&self, domain: &str) -> anyhow::Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = self
            .success
            .key(format!("breaker:{domain}"))
            .invoke_async(&mut conn)
            .await
            .context("Breaker success script failed against shared store")?;
        Ok(())
    }
}

/// The breaker the engine holds; variant chosen by configuration
pub enum CircuitBreaker {
    Local(LocalCircuitBreaker),
    Shared(SharedCircuitBreaker),
}

impl CircuitBreaker {
    #[must_use]
    pub fn local(config: BreakerConfig) -> Self {
        Self::Local(LocalCircuitBreaker::new(config))
    }

    pub async fn shared(store_url: &str, config: BreakerConfig) -> anyhow::Result<Self> {
        Ok(Self::Shared(SharedCircuitBreaker::connect(store_url, config).await?))
    }

    /// Admit or reject a call for `domain`
    ///
    /// Open circuits fail fast with [`HarvestError::CircuitOpen`]; a
    /// half-open circuit admits exactly one probe.
    pub async fn check(&self, domain: &str) -> HarvestResult<()> {
        match self {
            Self::Local(breaker) => breaker.check(domain),
            Self::Shared(breaker) => breaker.check(domain).await,
        }
    }

    /// Record a successful call; closes a half-open circuit
    pub async fn record_success(&self, domain: &str) {
        match self {
            Self::Local(breaker) => breaker.record_success(domain),
            Self::Shared(breaker) => {
                if let Err(e) = breaker.record_success(domain).await {
                    warn!("Failed to record breaker success for {domain}: {e:#}");
                }
            }
        }
    }

    /// Record a breaker-countable failure; returns true if the circuit
    /// opened on this failure
    pub async fn record_failure(&self, domain: &str) -> bool {
        match self {
            Self::Local(breaker) => breaker.record_failure(domain),
            Self::Shared(breaker) => match breaker.record_failure(domain).await {
                Ok(opened) => opened,
                Err(e) => {
                    warn!("Failed to record breaker failure for {domain}: {e:#}");
                    false
                }
            },
        }
    }

    /// Current state for a domain (local variant only reports live state;
    /// unseen domains are Closed)
    #[must_use]
    pub fn local_state(&self, domain: &str) -> Option<CircuitState> {
        match self {
            Self::Local(breaker) => Some(breaker.state(domain)),
            Self::Shared(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, cooldown: Duration) -> LocalCircuitBreaker {
        LocalCircuitBreaker::new(BreakerConfig {
            failure_threshold: threshold,
            cooldown,
        })
    }

    #[test]
    fn test_closed_admits() {
        let cb = breaker(3, Duration::from_secs(60));
        assert!(cb.check("example.com").is_ok());
        cb.record_success("example.com");
        assert_eq!(cb.state("example.com"), CircuitState::Closed);
    }

    #[test]
    fn test_opens_after_threshold() {
        let cb = breaker(2, Duration::from_secs(60));

        assert!(!cb.record_failure("example.com"));
        assert!(cb.check("example.com").is_ok());

        assert!(cb.record_failure("example.com"));
        assert_eq!(cb.state("example.com"), CircuitState::Open);
        assert!(matches!(
            cb.check("example.com"),
            Err(HarvestError::CircuitOpen { .. })
        ));
    }

    #[test]
    fn test_half_open_admits_exactly_one_probe() {
        let cb = breaker(1, Duration::from_millis(20));
        cb.record_failure("example.com");
        assert!(cb.check("example.com").is_err());

        std::thread::sleep(Duration::from_millis(30));

        // First check after cooldown is the probe
        assert!(cb.check("example.com").is_ok());
        assert_eq!(cb.state("example.com"), CircuitState::HalfOpen);
        // Second check is rejected while the probe is in flight
        assert!(cb.check("example.com").is_err());
    }

    #[test]
    fn test_probe_success_closes() {
        let cb = breaker(1, Duration::from_millis(10));
        cb.record_failure("example.com");
        std::thread::sleep(Duration::from_millis(20));
        assert!(cb.check("example.com").is_ok());

        cb.record_success("example.com");
        assert_eq!(cb.state("example.com"), CircuitState::Closed);
        assert!(cb.check("example.com").is_ok());
    }

    #[test]
    fn test_probe_failure_reopens_with_fresh_cooldown() {
        let cb = breaker(5, Duration::from_millis(10));
        // Force open via repeated failures
        for _ in 0..5 {
            cb.record_failure("example.com");
        }
        assert_eq!(cb.state("example.com"), CircuitState::Open);

        std::thread::sleep(Duration::from_millis(20));
        assert!(cb.check("example.com").is_ok()); // probe admitted

        // Probe fails: back to Open regardless of threshold
        assert!(cb.record_failure("example.com"));
        assert_eq!(cb.state("example.com"), CircuitState::Open);
        assert!(cb.check("example.com").is_err());
    }

    #[test]
    fn test_domains_do_not_interfere() {
        let cb = breaker(1, Duration::from_secs(60));
        cb.record_failure("bad.example");
        assert!(cb.check("bad.example").is_err());
        assert!(cb.check("good.example").is_ok());
    }
}
