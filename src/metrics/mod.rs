//! In-memory session metrics
//!
//! Observer registered on the fetch layer and the resilience primitives.
//! All counters are lock-free atomics so the hot path never contends;
//! latency samples go through a short mutex push. `report()` produces the
//! per-run aggregate emitted at shutdown, including a coarse health verdict.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;

use crate::resilience::ErrorKind;

/// Coarse health verdict over a completed run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Critical,
}

/// Per-domain request tallies
#[derive(Debug, Default)]
struct DomainCounters {
    requests: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
}

/// Per-domain row in the session report
#[derive(Debug, Clone, Serialize)]
pub struct DomainBreakdown {
    pub domain: String,
    pub requests: u64,
    pub successes: u64,
    pub failures: u64,
}

/// Latency distribution summary in milliseconds
#[derive(Debug, Clone, Copy, Serialize)]
pub struct LatencySummary {
    pub count: usize,
    pub median_ms: u64,
    pub p95_ms: u64,
    pub max_ms: u64,
}

/// The per-run aggregate emitted at shutdown
#[derive(Debug, Clone, Serialize)]
pub struct SessionReport {
    pub total_requests: u64,
    pub successes: u64,
    pub failures_by_kind: Vec<(String, u64)>,
    pub per_domain: Vec<DomainBreakdown>,
    pub rate_limit_events: u64,
    pub circuit_breaker_trips: u64,
    pub pool_exhaustion_events: u64,
    pub latency: LatencySummary,
    pub health: HealthStatus,
}

/// Metrics aggregator shared across the engine
pub struct SessionMetrics {
    total_requests: AtomicU64,
    successes: AtomicU64,
    failures: [AtomicU64; ErrorKind::ALL.len()],
    per_domain: DashMap<String, DomainCounters>,
    rate_limit_events: AtomicU64,
    breaker_trips: AtomicU64,
    pool_exhaustion_events: AtomicU64,
    latencies_ms: Mutex<Vec<u64>>,
    latency_l1: Duration,
    latency_l2: Duration,
}

impl SessionMetrics {
    #[must_use]
    pub fn new(latency_l1: Duration, latency_l2: Duration) -> Self {
        Self {
            total_requests: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: Default::default(),
            per_domain: DashMap::new(),
            rate_limit_events: AtomicU64::new(0),
            breaker_trips: AtomicU64::new(0),
            pool_exhaustion_events: AtomicU64::new(0),
            latencies_ms: Mutex::new(Vec::new()),
            latency_l1,
            latency_l2,
        }
    }

    /// Record a completed fetch attempt
    pub fn observe_fetch(&self, domain: &str, elapsed: Duration, outcome: Result<(), ErrorKind>) {
        self.total_requests.fetch_add(1, Ordering::SeqCst);
        self.latencies_ms.lock().push(elapsed.as_millis() as u64);

        let counters = self.per_domain.entry(domain.to_string()).or_default();
        counters.requests.fetch_add(1, Ordering::SeqCst);

        match outcome {
            Ok(()) => {
                self.successes.fetch_add(1, Ordering::SeqCst);
                counters.successes.fetch_add(1, Ordering::SeqCst);
            }
            Err(kind) => {
                counters.failures.fetch_add(1, Ordering::SeqCst);
                if let Some(slot) = ErrorKind::ALL.iter().position(|k| *k == kind) {
                    self.failures[slot].fetch_add(1, Ordering::SeqCst);
                }
            }
        }
    }

    /// A rate-limiter acquire had to wait
    pub fn record_rate_limit_event(&self) {
        self.rate_limit_events.fetch_add(1, Ordering::SeqCst);
    }

    /// A circuit transitioned to Open
    pub fn record_breaker_trip(&self) {
        self.breaker_trips.fetch_add(1, Ordering::SeqCst);
    }

    /// The scorer ran dry and a refresh was forced
    pub fn record_pool_exhaustion(&self) {
        self.pool_exhaustion_events.fetch_add(1, Ordering::SeqCst);
    }

    fn latency_summary(&self) -> LatencySummary {
        let mut samples = self.latencies_ms.lock().clone();
        samples.sort_unstable();
        let count = samples.len();
        let percentile = |p: f64| -> u64 {
            if count == 0 {
                return 0;
            }
            let idx = ((count as f64 - 1.0) * p).round() as usize;
            samples[idx.min(count - 1)]
        };
        LatencySummary {
            count,
            median_ms: percentile(0.5),
            p95_ms: percentile(0.95),
            max_ms: samples.last().copied().unwrap_or(0),
        }
    }

    /// Health verdict per the configured latency thresholds
    #[must_use]
    pub fn health(&self) -> HealthStatus {
        let total = self.total_requests.load(Ordering::SeqCst);
        let successes = self.successes.load(Ordering::SeqCst);
        let success_rate = if total == 0 {
            1.0
        } else {
            successes as f64 / total as f64
        };
        let median = Duration::from_millis(self.latency_summary().median_ms);

        let degraded_by_rate = (0.5..0.9).contains(&success_rate);
        let degraded_by_latency = median > self.latency_l1 && median <= self.latency_l2;

        if success_rate >= 0.9 && median <= self.latency_l1 {
            HealthStatus::Healthy
        } else if degraded_by_rate || degraded_by_latency {
            HealthStatus::Degraded
        } else {
            HealthStatus::Critical
        }
    }

    /// Snapshot the run aggregate
    #[must_use]
    pub fn report(&self) -> SessionReport {
        let failures_by_kind = ErrorKind::ALL
            .iter()
            .enumerate()
            .map(|(i, kind)| (kind.as_str().to_string(), self.failures[i].load(Ordering::SeqCst)))
            .filter(|(_, count)| *count > 0)
            .collect();

        let mut per_domain: Vec<DomainBreakdown> = self
            .per_domain
            .iter()
            .map(|entry| DomainBreakdown {
                domain: entry.key().clone(),
                requests: entry.value().requests.load(Ordering::SeqCst),
                successes: entry.value().successes.load(Ordering::SeqCst),
                failures: entry.value().failures.load(Ordering::SeqCst),
            })
            .collect();
        per_domain.sort_by(|a, b| b.requests.cmp(&a.requests));

        SessionReport {
            total_requests: self.total_requests.load(Ordering::SeqCst),
            successes: self.successes.load(Ordering::SeqCst),
            failures_by_kind,
            per_domain,
            rate_limit_events: self.rate_limit_events.load(Ordering::SeqCst),
            circuit_breaker_trips: self.breaker_trips.load(Ordering::SeqCst),
            pool_exhaustion_events: self.pool_exhaustion_events.load(Ordering::SeqCst),
            latency: self.latency_summary(),
            health: self.health(),
        }
    }
}

impl Default for SessionMetrics {
    fn default() -> Self {
        Self::new(crate::utils::HEALTH_LATENCY_L1, crate::utils::HEALTH_LATENCY_L2)
    }
}
