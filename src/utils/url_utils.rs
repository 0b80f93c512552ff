//! URL helpers shared across the harvesting engine

use anyhow::{Result, anyhow};

/// Extract the host portion of a URL
///
/// Used as the key for rate-limiter buckets, circuit-breaker state, and
/// per-domain metrics. Returns an error for URLs with no host.
pub fn extract_domain(url_str: &str) -> Result<String> {
    let url = url::Url::parse(url_str).map_err(|e| anyhow!("Failed to parse URL {url_str}: {e}"))?;
    url.host_str()
        .map(str::to_string)
        .ok_or_else(|| anyhow!("URL has no host: {url_str}"))
}

/// Clip a body to at most `max` bytes on a char boundary, for signature
/// matching and log snippets
#[must_use]
pub fn clip_snippet(body: &str, max: usize) -> &str {
    if body.len() <= max {
        return body;
    }
    let mut end = max;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    &body[..end]
}

/// Check whether a string parses as an absolute http(s) URL
#[must_use]
pub fn is_valid_url(candidate: &str) -> bool {
    url::Url::parse(candidate)
        .map(|u| matches!(u.scheme(), "http" | "https"))
        .unwrap_or(false)
}
