//! Fetch layer: fast HTTP and stealth browser through the rotator
//!
//! Every request routes through the rotator's local port and attaches
//! `Proxy-Forward-Index: <N>` so the weighted-selected forward is the one
//! actually used. Index pages go through plain HTTP; detail pages through
//! the stealth browser. Every attempt reports its outcome back into the
//! scorer for the selected index; on `ProxyError` the retry engine asks
//! for a fresh selection excluding the failed index.
//!
//! A `Blocked` response never penalizes the current forward: the target
//! blocked us, not the proxy. Only proxy-level failures feed the scorer's
//! failure path.

pub mod stealth;

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::anyhow;
use log::{debug, warn};

use crate::metrics::SessionMetrics;
use crate::proxy::{ProxyScorer, Selection};
use crate::resilience::classify::{ErrorKind, FetchFailure, classify};
use crate::utils::{CHROME_USER_AGENT, FORWARD_INDEX_HEADER, clip_snippet};

pub use stealth::StealthFetcher;

/// How a page should be fetched
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchMode {
    /// Plain request through the rotator; listing-index pages
    FastHttp,
    /// Headless browser with humanization; detail pages
    StealthBrowser,
}

/// A successful fetch
#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub status: u16,
    pub body: String,
    pub retry_after: Option<Duration>,
    pub elapsed: Duration,
    /// Forward index the response came through
    pub forward_index: usize,
}

/// One fetch request
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub url: String,
    pub mode: FetchMode,
    pub timeout: Duration,
}

/// The engine's single fetch facade
pub struct FetchLayer {
    http: reqwest::Client,
    scorer: Arc<ProxyScorer>,
    metrics: Arc<SessionMetrics>,
    stealth: StealthFetcher,
}

impl FetchLayer {
    /// Build the layer; all traffic goes through `rotator_url`
    pub fn new(
        rotator_url: &str,
        scorer: Arc<ProxyScorer>,
        metrics: Arc<SessionMetrics>,
        stealth: StealthFetcher,
    ) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .proxy(reqwest::Proxy::all(rotator_url)?)
            .user_agent(CHROME_USER_AGENT)
            // The rotator terminates HTTPS with its own CA
            .danger_accept_invalid_certs(true)
            .build()?;

        Ok(Self {
            http,
            scorer,
            metrics,
            stealth,
        })
    }

    /// Whether the live pool has run dry
    #[must_use]
    pub fn pool_is_empty(&self) -> bool {
        self.scorer.is_empty()
    }

    /// Close the stealth browser
    pub async fn shutdown_stealth(&self) {
        self.stealth.shutdown().await;
    }

    /// Fetch one URL through a weighted-selected forward
    ///
    /// `exclude_index` skips a forward that just failed, per the retry
    /// engine's rotation contract. The selected index is reported back to
    /// the scorer on success and on proxy-level failure.
    pub async fn fetch(
        &self,
        request: &FetchRequest,
        domain: &str,
        exclude_index: Option<usize>,
    ) -> Result<FetchResponse, FetchFailure> {
        let Some(selection) = self.scorer.select(exclude_index) else {
            return Err(FetchFailure::from_error(anyhow!(
                "proxy pool exhausted: no live forwards to route through"
            )));
        };

        let started = Instant::now();
        let result = match request.mode {
            FetchMode::FastHttp => self.fetch_http(request, &selection).await,
            FetchMode::StealthBrowser => {
                self.stealth
                    .fetch(&request.url, selection.index, request.timeout)
                    .await
            }
        };
        let elapsed = started.elapsed();

        match result {
            Ok(mut response) => {
                response.elapsed = elapsed;
                response.forward_index = selection.index;
                if let Err(e) = self.scorer.record_success(&selection) {
                    warn!("Failed to persist scorer success: {e:#}");
                }
                self.metrics.observe_fetch(domain, elapsed, Ok(()));
                Ok(response)
            }
            Err(mut failure) => {
                failure.proxy_index = Some(selection.index);
                let kind = classify(&failure).kind;
                // Only proxy-level failures penalize the forward; a Blocked
                // target is the target's doing
                if kind == ErrorKind::ProxyError {
                    match self.scorer.record_failure(&selection) {
                        Ok(true) => debug!("Forward {} pruned after failure", selection.endpoint.key()),
                        Ok(false) => {}
                        Err(e) => warn!("Failed to persist scorer failure: {e:#}"),
                    }
                }
                self.metrics.observe_fetch(domain, elapsed, Err(kind));
                Err(failure)
            }
        }
    }

    async fn fetch_http(
        &self,
        request: &FetchRequest,
        selection: &Selection,
    ) -> Result<FetchResponse, FetchFailure> {
        let response = self
            .http
            .get(&request.url)
            .header(FORWARD_INDEX_HEADER, selection.index.to_string())
            .timeout(request.timeout)
            .send()
            .await
            .map_err(|e| FetchFailure::from_error(anyhow::Error::new(e)))?;

        let status = response.status().as_u16();
        let retry_after = parse_retry_after(response.headers());
        // Upstream forward failures surface as 502/504 from the rotator
        let via_rotator_error = response
            .headers()
            .contains_key("x-rotator-upstream-error");

        let body = response
            .text()
            .await
            .map_err(|e| FetchFailure::from_error(anyhow::Error::new(e)).with_status(status))?;

        if via_rotator_error || (status == 502 || status == 504) {
            let mut failure = FetchFailure::from_error(anyhow!(
                "proxy error: rotator reported upstream failure (status {status})"
            ))
            .with_status(status);
            failure.retry_after = retry_after;
            return Err(failure);
        }

        if !(200..400).contains(&status) {
            let mut failure = FetchFailure::from_error(anyhow!("HTTP error: {status}"))
                .with_status(status)
                .with_body_snippet(clip_snippet(&body, 1024));
            failure.retry_after = retry_after;
            return Err(failure);
        }

        Ok(FetchResponse {
            status,
            body,
            retry_after,
            elapsed: Duration::ZERO, // overwritten by the caller
            forward_index: selection.index,
        })
    }
}

/// Parse a `Retry-After` header (seconds form)
#[must_use]
pub fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_retry_after_seconds() {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            reqwest::header::RETRY_AFTER,
            reqwest::header::HeaderValue::from_static("120"),
        );
        assert_eq!(parse_retry_after(&headers), Some(Duration::from_secs(120)));
    }

    #[test]
    fn test_parse_retry_after_absent_or_http_date() {
        let headers = reqwest::header::HeaderMap::new();
        assert_eq!(parse_retry_after(&headers), None);

        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            reqwest::header::RETRY_AFTER,
            reqwest::header::HeaderValue::from_static("Wed, 21 Oct 2026 07:28:00 GMT"),
        );
        // HTTP-date form is rare from scrape targets; treated as absent
        assert_eq!(parse_retry_after(&headers), None);
    }
}
