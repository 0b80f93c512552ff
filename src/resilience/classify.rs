//! Error classification for fetch failures
//!
//! Maps any failure (error value + optional HTTP status + optional body
//! snippet) to one of ten error kinds and a recovery plan. The retry engine,
//! circuit breaker, and dispatcher all act on the plan rather than on the
//! raw error.

use std::time::Duration;

use once_cell::sync::Lazy;
use regex::RegexSet;
use serde::{Deserialize, Serialize};

/// Body signatures that indicate a soft block on an otherwise-valid response
///
/// Compiled once; matched case-insensitively against a body snippet.
static BLOCK_SIGNATURES: Lazy<RegexSet> = Lazy::new(|| {
    RegexSet::new([
        r"(?i)unusual traffic from your computer network",
        r"(?i)\bcaptcha\b",
        r"(?i)are you a (?:human|robot)",
        r"(?i)access denied",
        r"(?i)request blocked",
        r"(?i)cf-challenge",
        r"(?i)attention required.{0,40}cloudflare",
        r"(?i)automated (?:queries|requests|access)",
    ])
    .expect("block signature patterns are valid")
});

/// The ten failure kinds the engine distinguishes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Request or read deadline exceeded
    NetworkTimeout,
    /// TCP connection refused or reset
    NetworkRefused,
    /// Hostname did not resolve
    DnsError,
    /// HTTP 429
    RateLimit,
    /// HTTP 403, or a body matching a CAPTCHA/unusual-traffic signature
    Blocked,
    /// HTTP 404
    NotFound,
    /// HTTP 5xx
    ServerError,
    /// Strategy failed to extract required fields
    ParseError,
    /// The upstream forward failed (rotator-level error)
    ProxyError,
    /// Anything unclassified
    Unknown,
}

impl ErrorKind {
    /// Stable lowercase name used in checkpoints and the session report
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::NetworkTimeout => "network_timeout",
            Self::NetworkRefused => "network_refused",
            Self::DnsError => "dns_error",
            Self::RateLimit => "rate_limit",
            Self::Blocked => "blocked",
            Self::NotFound => "not_found",
            Self::ServerError => "server_error",
            Self::ParseError => "parse_error",
            Self::ProxyError => "proxy_error",
            Self::Unknown => "unknown",
        }
    }

    /// All kinds, in report order
    pub const ALL: [ErrorKind; 10] = [
        Self::NetworkTimeout,
        Self::NetworkRefused,
        Self::DnsError,
        Self::RateLimit,
        Self::Blocked,
        Self::NotFound,
        Self::ServerError,
        Self::ParseError,
        Self::ProxyError,
        Self::Unknown,
    ];
}

/// What the caller should do about a classified failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Retry under exponential backoff with jitter
    RetryWithBackoff,
    /// Retry, but select a different forward index first
    RetryWithProxyRotation,
    /// Count toward the domain circuit breaker, then retry
    CircuitBreak,
    /// Drop the URL without retrying
    Skip,
    /// Log structured detail for manual review; no retry
    ManualReview,
}

/// Classification result: kind plus the recovery contract
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryPlan {
    pub kind: ErrorKind,
    pub action: RecoveryAction,
    pub recoverable: bool,
    pub max_retries: u32,
    /// Server-provided wait, honoured over computed backoff when present
    pub retry_after: Option<Duration>,
}

/// A failed fetch attempt, carrying everything the classifier needs
#[derive(Debug)]
pub struct FetchFailure {
    pub error: anyhow::Error,
    pub status: Option<u16>,
    pub body_snippet: Option<String>,
    pub retry_after: Option<Duration>,
    /// Forward index the attempt was routed through, for rotation exclusion
    pub proxy_index: Option<usize>,
}

impl FetchFailure {
    #[must_use]
    pub fn from_error(error: anyhow::Error) -> Self {
        Self {
            error,
            status: None,
            body_snippet: None,
            retry_after: None,
            proxy_index: None,
        }
    }

    #[must_use]
    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    #[must_use]
    pub fn with_body_snippet(mut self, snippet: impl Into<String>) -> Self {
        self.body_snippet = Some(snippet.into());
        self
    }

    #[must_use]
    pub fn with_proxy_index(mut self, index: usize) -> Self {
        self.proxy_index = Some(index);
        self
    }
}

/// Whether a body snippet matches a known block signature
#[must_use]
pub fn body_is_blocked(snippet: &str) -> bool {
    BLOCK_SIGNATURES.is_match(snippet)
}

/// Classify a failure into an [`ErrorKind`] and its [`RecoveryPlan`]
///
/// Status codes take priority, except that a blocked body signature wins
/// over any status (soft blocks arrive on 200s too). Network-level kinds
/// fall back to message-pattern matching on the error chain, which covers
/// both reqwest and browser-originated failures.
#[must_use]
pub fn classify(failure: &FetchFailure) -> RecoveryPlan {
    let kind = classify_kind(failure);
    plan_for(kind, failure.retry_after)
}

fn classify_kind(failure: &FetchFailure) -> ErrorKind {
    if let Some(snippet) = &failure.body_snippet
        && body_is_blocked(snippet)
    {
        return ErrorKind::Blocked;
    }

    if let Some(status) = failure.status {
        match status {
            429 => return ErrorKind::RateLimit,
            403 => return ErrorKind::Blocked,
            404 => return ErrorKind::NotFound,
            500..=599 => return ErrorKind::ServerError,
            _ => {}
        }
    }

    // reqwest keeps timeout/connect distinctions on the typed error
    if let Some(req_err) = failure.error.downcast_ref::<reqwest::Error>() {
        if req_err.is_timeout() {
            return ErrorKind::NetworkTimeout;
        }
        if req_err.is_connect() {
            // Connect failures through the rotator's local port mean the
            // rotator itself is down, which is a proxy-layer problem
            return ErrorKind::ProxyError;
        }
    }

    let msg = failure.error.to_string().to_lowercase();

    if msg.contains("proxy") || msg.contains("bad gateway from forward") || msg.contains("tunnel") {
        return ErrorKind::ProxyError;
    }
    if msg.contains("timeout") || msg.contains("timed out") || msg.contains("deadline") {
        return ErrorKind::NetworkTimeout;
    }
    if msg.contains("connection refused") || msg.contains("connection reset") || msg.contains("broken pipe") {
        return ErrorKind::NetworkRefused;
    }
    if msg.contains("dns") || msg.contains("failed to lookup") || msg.contains("name or service not known") {
        return ErrorKind::DnsError;
    }
    if msg.contains("parse") || msg.contains("selector") || msg.contains("missing field") || msg.contains("extract") {
        return ErrorKind::ParseError;
    }

    ErrorKind::Unknown
}

/// The recovery table: action, recoverability, and retry budget per kind
#[must_use]
pub fn plan_for(kind: ErrorKind, retry_after: Option<Duration>) -> RecoveryPlan {
    let (action, recoverable, max_retries) = match kind {
        ErrorKind::NetworkTimeout => (RecoveryAction::RetryWithBackoff, true, 3),
        ErrorKind::NetworkRefused => (RecoveryAction::RetryWithBackoff, true, 2),
        ErrorKind::DnsError => (RecoveryAction::Skip, false, 0),
        ErrorKind::RateLimit => (RecoveryAction::RetryWithBackoff, true, 5),
        ErrorKind::Blocked => (RecoveryAction::CircuitBreak, true, 2),
        ErrorKind::NotFound => (RecoveryAction::Skip, false, 0),
        ErrorKind::ServerError => (RecoveryAction::RetryWithBackoff, true, 3),
        ErrorKind::ParseError => (RecoveryAction::ManualReview, false, 0),
        ErrorKind::ProxyError => (RecoveryAction::RetryWithProxyRotation, true, 5),
        ErrorKind::Unknown => (RecoveryAction::RetryWithBackoff, true, 1),
    };

    RecoveryPlan {
        kind,
        action,
        recoverable,
        max_retries,
        // Only rate limiting honours a server-provided wait
        retry_after: if kind == ErrorKind::RateLimit { retry_after } else { None },
    }
}
