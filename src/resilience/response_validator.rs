//! Soft-block detection for otherwise-successful responses
//!
//! Hostile targets serve CAPTCHA interstitials, empty result pages, and
//! "unusual traffic" notices with a 200 status. Every 2xx response passes
//! through here before it is treated as a success; a positive detection is
//! converted to the `Blocked` error kind and fed back into the classifier.

use std::time::Duration;

use log::{debug, warn};

use super::classify::body_is_blocked;

/// What the site strategy promises about a page class
///
/// Strategies declare which pages must carry real content so that an empty
/// 200 can be distinguished from a legitimately sparse page.
#[derive(Debug, Clone, Copy)]
pub struct PageExpectations {
    /// The page is declared non-empty by the strategy
    pub non_empty: bool,
    /// Minimum plausible payload size for a non-empty page
    pub min_bytes: usize,
    /// A result list on this page cannot legitimately be empty
    pub results_expected: bool,
}

impl Default for PageExpectations {
    fn default() -> Self {
        Self {
            non_empty: false,
            min_bytes: 512,
            results_expected: false,
        }
    }
}

/// Validation verdict for a response
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Validation {
    /// Response is genuine
    Ok,
    /// Soft block detected; classify as `Blocked`
    Blocked { reason: String },
    /// Non-2xx carrying a Retry-After header
    RetryAfter(Duration),
}

/// Stateless validator applied to every fetch result
#[derive(Debug, Clone, Copy, Default)]
pub struct ResponseValidator;

impl ResponseValidator {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Validate a response against the strategy's expectations
    ///
    /// `retry_after` is the parsed `Retry-After` header when present.
    /// Markers of an empty result list are strategy-specific; callers pass
    /// whether the strategy found zero results in `zero_results`.
    #[must_use]
    pub fn validate(
        &self,
        url: &str,
        status: u16,
        body: &str,
        retry_after: Option<Duration>,
        expectations: PageExpectations,
        zero_results: bool,
    ) -> Validation {
        if !(200..300).contains(&status) {
            if let Some(wait) = retry_after {
                debug!("Retry-After {wait:?} on {status} for {url}");
                return Validation::RetryAfter(wait);
            }
            // Non-2xx without Retry-After is the classifier's problem
            return Validation::Ok;
        }

        // Signature match wins regardless of payload size
        let snippet = crate::utils::clip_snippet(body, 4096);
        if body_is_blocked(snippet) {
            warn!("Soft block signature in 2xx response for {url}");
            return Validation::Blocked {
                reason: "block signature in response body".to_string(),
            };
        }

        if expectations.non_empty && body.len() < expectations.min_bytes {
            warn!(
                "Suspiciously small payload ({} bytes) for non-empty page {url}",
                body.len()
            );
            return Validation::Blocked {
                reason: format!("payload {} bytes below non-empty floor", body.len()),
            };
        }

        if expectations.results_expected && zero_results {
            warn!("Zero results on a page declared never-empty: {url}");
            return Validation::Blocked {
                reason: "empty result list on never-empty page".to_string(),
            };
        }

        Validation::Ok
    }
}
