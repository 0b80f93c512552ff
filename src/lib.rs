//! propharvest: resilient multi-site real-estate listing harvester
//!
//! The engine couples four subsystems into one acquire → validate → fetch →
//! recover loop:
//!
//! - proxy lifecycle: raw sourcing, chunked validation, runtime scoring,
//!   and a single supervised rotating front-door
//! - fetch orchestration: per-site dispatchers under rate limits and
//!   circuit breakers, retried under classified errors, checkpointed for
//!   crash recovery
//! - resilience primitives: retry engine, token-bucket limiter, breaker,
//!   response validator, checkpoint store
//! - subprocess supervision: the rotator child's lifetime is bound to the
//!   orchestrator's
//!
//! [`Orchestrator::run`] wires everything together; the binary in
//! `main.rs` is a thin shell over it.

pub mod checkpoint;
pub mod config;
pub mod dispatch;
pub mod enrich;
pub mod error;
pub mod fetch;
pub mod jobs;
pub mod metrics;
pub mod orchestrator;
pub mod proxy;
pub mod resilience;
pub mod shutdown;
pub mod sites;
pub mod store;
pub mod utils;

pub use checkpoint::{CheckpointSnapshot, CheckpointStore, FailureRecord, PendingUrl};
pub use config::{HarvestConfig, PaginationMode, SiteConfig};
pub use dispatch::{DispatcherDeps, SiteDispatcher, SiteSummary};
pub use enrich::{ListingEnricher, NoopEnricher};
pub use error::{HarvestError, HarvestResult};
pub use fetch::{FetchLayer, FetchMode, FetchRequest, FetchResponse, StealthFetcher};
pub use jobs::{Barrier, JobHandle, WorkerPool};
pub use metrics::{HealthStatus, SessionMetrics, SessionReport};
pub use orchestrator::{Orchestrator, RunOutcome};
pub use proxy::{
    Anonymity, ProxyEndpoint, ProxyScorer, ProxyValidator, Protocol, RefreshPipeline,
    RotatorSupervisor, ScorerConfig, Selection,
};
pub use resilience::{
    BreakerConfig, BucketConfig, CircuitBreaker, CircuitState, ErrorKind, FetchFailure,
    LimiterSettings, PageExpectations, RateLimiter, RecoveryAction, ResponseValidator,
    RetryOutcome, RetryPolicy, Validation,
};
pub use shutdown::ShutdownSignal;
pub use sites::{GenericStrategy, SiteStrategy, StrategyRegistry};
pub use store::{ListingRecord, ListingStore, UpsertOutcome};
