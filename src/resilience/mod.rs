//! Resilience primitives shared by the fetch layer and dispatcher
//!
//! Classification, retry, admission control, circuit breaking, and
//! soft-block detection. Each primitive is independent; the dispatcher
//! composes them per URL.

pub mod circuit_breaker;
pub mod classify;
pub mod rate_limit;
pub mod response_validator;
pub mod retry;

pub use circuit_breaker::{BreakerConfig, CircuitBreaker, CircuitState};
pub use classify::{ErrorKind, FetchFailure, RecoveryAction, RecoveryPlan, classify};
pub use rate_limit::{BucketConfig, LimiterSettings, RateLimiter};
pub use response_validator::{PageExpectations, ResponseValidator, Validation};
pub use retry::{AttemptContext, RetryOutcome, RetryPolicy};
