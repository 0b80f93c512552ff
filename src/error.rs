//! Error types surfaced across the harvesting engine
//!
//! The ten fetch-level error kinds live in [`crate::resilience::classify`];
//! this module holds the engine-level failures that cross component
//! boundaries and reach the orchestrator.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Engine-level failures that propagate past a single URL
#[derive(Debug, Error)]
pub enum HarvestError {
    /// The scorer has zero endpoints and the refresh pipeline could not
    /// restore the configured minimum
    #[error("proxy pool exhausted: {0}")]
    ProxyPoolExhausted(String),

    /// The circuit breaker rejected a call for this domain
    #[error("circuit open for domain {domain}, retry in {retry_in:?}")]
    CircuitOpen { domain: String, retry_in: Duration },

    /// A checkpoint file exists but could not be parsed
    #[error("checkpoint corrupt at {path}: {reason}")]
    CheckpointCorrupt { path: PathBuf, reason: String },

    /// A supervised child exited unexpectedly beyond its restart budget
    #[error("subprocess crashed beyond restart budget: {0}")]
    SubprocessCrash(String),

    /// Shutdown signal observed at a suspension point
    #[error("operation cancelled by shutdown")]
    Cancelled,

    /// Required configuration is absent or invalid
    #[error("configuration error: {0}")]
    Config(String),

    /// Anything else, with full context chain preserved
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Convenience alias used throughout the engine
pub type HarvestResult<T> = Result<T, HarvestError>;
