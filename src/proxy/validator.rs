//! Bulk candidate validation
//!
//! Consumes raw scraped endpoints (thousands) and produces the live list.
//! Per candidate chunk: a liveness pass through the rotator binary's check
//! mode, then per survivor an anonymity classification against an echo
//! judge, an exit-IP subnet check, and a quality probe against a reference
//! page. Chunks are independent units of work; the refresh pipeline fans
//! them out across the worker pool and aggregates in a single finalizer.

use std::io::Write;
use std::net::IpAddr;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use log::{debug, warn};
use tokio::io::AsyncReadExt;
use tokio::process::Command;

use crate::resilience::classify::body_is_blocked;

use super::endpoint::{Anonymity, ProxyEndpoint};

/// Validation pipeline tuning
#[derive(Debug, Clone)]
pub struct ValidatorConfig {
    /// Rotator binary, invoked in check mode for liveness probes
    pub rotator_binary: PathBuf,
    /// Echo judge returning the requester's headers and apparent IP
    pub judge_url: String,
    /// Plain IP-reporting endpoint
    pub ip_echo_url: String,
    /// Known reference page used for the CAPTCHA quality probe
    pub reference_url: String,
    /// Per-probe timeout
    pub probe_timeout: Duration,
    /// The machine's real egress IP, for transparency and subnet checks
    pub real_ip: Option<IpAddr>,
}

/// A candidate that survived every stage
#[derive(Debug, Clone)]
pub struct ValidatedProxy {
    pub endpoint: ProxyEndpoint,
}

/// Stateless validation stage runner
#[derive(Clone)]
pub struct ProxyValidator {
    config: ValidatorConfig,
    client_builder: fn(&ProxyEndpoint, Duration) -> Result<reqwest::Client>,
}

impl ProxyValidator {
    #[must_use]
    pub fn new(config: ValidatorConfig) -> Self {
        Self {
            config,
            client_builder: build_proxied_client,
        }
    }

    /// Validate one chunk of candidates end to end
    ///
    /// Never fails the chunk as a whole; candidates that error at any stage
    /// are dropped and the survivors returned.
    pub async fn validate_chunk(&self, chunk: Vec<ProxyEndpoint>) -> Vec<ValidatedProxy> {
        let alive = match self.liveness_pass(&chunk).await {
            Ok(alive) => alive,
            Err(e) => {
                warn!("Liveness pass failed for chunk of {}: {e:#}", chunk.len());
                return Vec::new();
            }
        };

        let mut validated = Vec::new();
        for mut endpoint in alive {
            match self.classify_candidate(&endpoint).await {
                Ok(Some(anonymity)) => {
                    endpoint.anonymity = Some(anonymity);
                    endpoint.last_alive = Some(Utc::now());
                    validated.push(ValidatedProxy { endpoint });
                }
                Ok(None) => {}
                Err(e) => {
                    debug!("Candidate {} rejected: {e:#}", endpoint.key());
                }
            }
        }
        validated
    }

    /// Liveness probe via the rotator binary's check mode
    ///
    /// The chunk is written to a temp list file; the binary prints one line
    /// per live endpoint as `{url} {latency_ms}`.
    async fn liveness_pass(&self, chunk: &[ProxyEndpoint]) -> Result<Vec<ProxyEndpoint>> {
        let mut list_file =
            tempfile::NamedTempFile::new().context("Failed to create check-mode list file")?;
        for ep in chunk {
            writeln!(list_file, "{}", ep.to_line()).context("Failed to write check-mode list")?;
        }
        list_file.flush().context("Failed to flush check-mode list")?;

        let timeout_secs = self.config.probe_timeout.as_secs().max(1);
        let mut child = Command::new(&self.config.rotator_binary)
            .arg("--check")
            .arg("--file")
            .arg(list_file.path())
            .arg("--timeout")
            .arg(timeout_secs.to_string())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| {
                format!(
                    "Failed to launch rotator check mode: {}",
                    self.config.rotator_binary.display()
                )
            })?;

        let mut stdout = child.stdout.take().context("Check mode produced no stdout")?;
        let mut output = String::new();

        // Generous overall budget: per-endpoint timeout is enforced by the
        // binary itself; this guards against a wedged child
        let budget = self.config.probe_timeout * (chunk.len().max(1) as u32);
        let read = async {
            stdout
                .read_to_string(&mut output)
                .await
                .context("Failed to read check-mode output")?;
            child.wait().await.context("Check-mode child failed")
        };
        match tokio::time::timeout(budget, read).await {
            Ok(status) => {
                let status = status?;
                if !status.success() {
                    warn!("Check mode exited with {status}");
                }
            }
            Err(_) => {
                let _ = child.start_kill();
                anyhow::bail!("Check mode exceeded {budget:?} for chunk of {}", chunk.len());
            }
        }

        let mut alive = Vec::new();
        for line in output.lines() {
            let mut parts = line.split_whitespace();
            let Some(url) = parts.next() else { continue };
            match ProxyEndpoint::from_line(url) {
                Ok(mut ep) => {
                    if let Some(ms) = parts.next().and_then(|v| v.parse::<u64>().ok()) {
                        ep.latency = Some(Duration::from_millis(ms));
                    }
                    alive.push(ep);
                }
                Err(e) => debug!("Ignoring unparseable check-mode line: {e}"),
            }
        }
        debug!("Liveness: {}/{} candidates alive", alive.len(), chunk.len());
        Ok(alive)
    }

    /// Stages 2-4 for one live candidate
    ///
    /// Returns the anonymity class for keepers, `None` for rejects.
    async fn classify_candidate(&self, endpoint: &ProxyEndpoint) -> Result<Option<Anonymity>> {
        let client = (self.client_builder)(endpoint, self.config.probe_timeout)?;

        // Stage 2: anonymity against the echo judge
        let judge_body = client
            .get(&self.config.judge_url)
            .send()
            .await
            .context("Judge request failed")?
            .text()
            .await
            .context("Judge response unreadable")?;

        let anonymity = classify_anonymity(&judge_body, self.config.real_ip);
        if anonymity == Anonymity::Transparent {
            debug!("Candidate {} is transparent, rejecting", endpoint.key());
            return Ok(None);
        }

        // Stage 3: exit-IP verification
        let exit_body = client
            .get(&self.config.ip_echo_url)
            .send()
            .await
            .context("IP echo request failed")?
            .text()
            .await
            .context("IP echo response unreadable")?;
        let exit_ip: IpAddr = exit_body
            .trim()
            .parse()
            .with_context(|| format!("IP echo returned garbage: {exit_body:.40}"))?;

        if let Some(real_ip) = self.config.real_ip
            && same_slash24(exit_ip, real_ip)
        {
            // Exit in our own /24 means the "proxy" routes directly
            debug!("Candidate {} exits in local /24, rejecting", endpoint.key());
            return Ok(None);
        }

        // Stage 4: quality probe against the reference page
        let reference = client
            .get(&self.config.reference_url)
            .send()
            .await
            .context("Reference probe failed")?;
        let status = reference.status().as_u16();
        let body = reference.text().await.unwrap_or_default();
        if status != 200 || body_is_blocked(crate::utils::clip_snippet(&body, 4096)) {
            debug!(
                "Candidate {} failed quality probe (status {status})",
                endpoint.key()
            );
            return Ok(None);
        }

        Ok(Some(anonymity))
    }
}

fn build_proxied_client(endpoint: &ProxyEndpoint, timeout: Duration) -> Result<reqwest::Client> {
    let proxy = reqwest::Proxy::all(endpoint.to_line())
        .with_context(|| format!("Invalid proxy URL {}", endpoint.to_line()))?;
    reqwest::Client::builder()
        .proxy(proxy)
        .timeout(timeout)
        .danger_accept_invalid_certs(true)
        .build()
        .context("Failed to build proxied client")
}

/// Map a judge response to an anonymity class
///
/// Transparent if the body leaks the real IP; Anonymous if proxy headers
/// are echoed; Elite otherwise.
#[must_use]
pub fn classify_anonymity(judge_body: &str, real_ip: Option<IpAddr>) -> Anonymity {
    if let Some(real_ip) = real_ip
        && judge_body.contains(&real_ip.to_string())
    {
        return Anonymity::Transparent;
    }

    let lower = judge_body.to_lowercase();
    let proxy_headers = [
        "via:",
        "\"via\"",
        "x-forwarded-for",
        "x-proxy-id",
        "proxy-connection",
        "forwarded:",
        "\"forwarded\"",
    ];
    if proxy_headers.iter().any(|h| lower.contains(h)) {
        return Anonymity::Anonymous;
    }

    Anonymity::Elite
}

/// Whether two addresses share an IPv4 /24 (or an IPv6 /56)
#[must_use]
pub fn same_slash24(a: IpAddr, b: IpAddr) -> bool {
    match (a, b) {
        (IpAddr::V4(a), IpAddr::V4(b)) => a.octets()[..3] == b.octets()[..3],
        (IpAddr::V6(a), IpAddr::V6(b)) => a.octets()[..7] == b.octets()[..7],
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_anonymity_transparent_on_real_ip_leak() {
        let real_ip: IpAddr = "198.51.100.7".parse().expect("ip");
        let body = r#"{"origin": "198.51.100.7, 203.0.113.10"}"#;
        assert_eq!(classify_anonymity(body, Some(real_ip)), Anonymity::Transparent);
    }

    #[test]
    fn test_anonymity_anonymous_on_proxy_headers() {
        let real_ip: IpAddr = "198.51.100.7".parse().expect("ip");
        let body = r#"{"headers": {"Via": "1.1 squid", "X-Forwarded-For": "203.0.113.10"}}"#;
        assert_eq!(classify_anonymity(body, Some(real_ip)), Anonymity::Anonymous);
    }

    #[test]
    fn test_anonymity_elite_when_clean() {
        let real_ip: IpAddr = "198.51.100.7".parse().expect("ip");
        let body = r#"{"headers": {"Accept": "*/*"}, "origin": "203.0.113.10"}"#;
        assert_eq!(classify_anonymity(body, Some(real_ip)), Anonymity::Elite);
    }

    #[test]
    fn test_slash24_check() {
        let a: IpAddr = "198.51.100.7".parse().expect("ip");
        let b: IpAddr = "198.51.100.200".parse().expect("ip");
        let c: IpAddr = "198.51.101.7".parse().expect("ip");
        assert!(same_slash24(a, b));
        assert!(!same_slash24(a, c));
    }
}
