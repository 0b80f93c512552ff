//! Proxy refresh pipeline: raw endpoints in, live pool out
//!
//! Triggered at startup and whenever the live pool drops below the
//! configured minimum. An external scraper emits raw candidates as
//! newline-delimited JSON; candidates are partitioned into chunks, each
//! chunk validated as an independent worker-pool job, and a single barrier
//! aggregates the survivors, persists the merged live list, and bumps the
//! shared `refresh:progress` key.
//!
//! The orchestrator waits on the barrier with a dynamic timeout. If the
//! completion handle times out it falls back to polling progress, then to
//! the endpoint file's mtime; a zero-progress window beyond the configured
//! threshold is fatal.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use log::{debug, info, warn};
use serde::Deserialize;
use tokio::process::Command;

use crate::error::HarvestError;
use crate::jobs::WorkerPool;
use crate::shutdown::ShutdownSignal;

use super::endpoint::{Protocol, ProxyEndpoint};
use super::scorer::ProxyScorer;
use super::validator::ProxyValidator;

/// Refresh pipeline tuning
#[derive(Debug, Clone)]
pub struct RefreshConfig {
    /// External raw-endpoint scraper binary
    pub scraper_binary: PathBuf,
    /// Path the scraper writes its NDJSON output to
    pub raw_output_path: PathBuf,
    /// Endpoint file whose mtime serves as a last-resort progress signal
    pub endpoint_file: PathBuf,
    /// Candidates per validation chunk
    pub chunk_size: usize,
    /// Wall-clock budget per chunk, for the dynamic barrier timeout
    pub per_chunk_budget: Duration,
    /// Floor for the dynamic timeout
    pub timeout_floor: Duration,
    /// Live endpoints required for the refresh to count as a success
    pub min_live: usize,
    /// Fatal if no chunk completes for this long during fallback polling
    pub zero_progress_window: Duration,
}

/// One raw candidate line from the scraper feed
#[derive(Debug, Deserialize)]
struct RawCandidate {
    host: String,
    port: u16,
    protocol: String,
}

/// Fan-out/fan-in refresh over the worker pool
pub struct RefreshPipeline {
    config: RefreshConfig,
    validator: ProxyValidator,
    pool: Arc<WorkerPool>,
    shared_store: Option<redis::aio::ConnectionManager>,
    shutdown: ShutdownSignal,
}

impl RefreshPipeline {
    #[must_use]
    pub fn new(
        config: RefreshConfig,
        validator: ProxyValidator,
        pool: Arc<WorkerPool>,
        shared_store: Option<redis::aio::ConnectionManager>,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            config,
            validator,
            pool,
            shared_store,
            shutdown,
        }
    }

    /// Run a full refresh and persist the merged live list into the scorer
    ///
    /// Returns the number of live endpoints after the merge. Fails with
    /// [`HarvestError::ProxyPoolExhausted`] when the result stays below the
    /// configured minimum.
    ///
    /// The fan-in finalizer persists the merged list itself, so even when
    /// the completion handle times out, fallback observation of the
    /// progress counter (and the endpoint file) can still declare success.
    pub async fn run(&self, scorer: &Arc<ProxyScorer>) -> Result<usize, HarvestError> {
        let candidates = self.scrape_raw_candidates().await?;
        if candidates.is_empty() {
            return Err(HarvestError::ProxyPoolExhausted(
                "raw-endpoint scraper produced zero candidates".to_string(),
            ));
        }

        let chunks: Vec<Vec<ProxyEndpoint>> = candidates
            .chunks(self.config.chunk_size.max(1))
            .map(<[ProxyEndpoint]>::to_vec)
            .collect();
        let num_chunks = chunks.len();
        info!(
            "Refresh: validating {} candidates in {num_chunks} chunks",
            candidates.len()
        );

        let barrier = self
            .pool
            .submit_group(chunks.into_iter().map(|chunk| {
                let validator = self.validator.clone();
                async move { validator.validate_chunk(chunk).await }
            }))
            .await
            .map_err(|e| HarvestError::Other(anyhow::anyhow!("refresh fan-out failed: {e}")))?;

        let progress = barrier.progress_counter();
        let timeout = self.dynamic_timeout(num_chunks);
        debug!("Refresh barrier timeout: {timeout:?}");

        // Fan-in node: gathers every chunk, merges, and persists into the
        // scorer regardless of whether anyone is still waiting on it
        let finalizer = {
            let scorer = Arc::clone(scorer);
            tokio::spawn(async move {
                let validated = barrier
                    .wait_timeout(Duration::from_secs(86_400))
                    .await
                    .map_err(|e| anyhow::anyhow!("refresh barrier failed: {e}"))?;
                let live: Vec<ProxyEndpoint> = validated
                    .into_iter()
                    .flatten()
                    .map(|v| v.endpoint)
                    .collect();
                let count = if scorer.is_empty() {
                    scorer.replace_all(live)?
                } else {
                    scorer.extend(live)?;
                    scorer.len()
                };
                Ok::<usize, anyhow::Error>(count)
            })
        };

        let count = match tokio::time::timeout(timeout, finalizer).await {
            Ok(Ok(Ok(count))) => count,
            Ok(Ok(Err(e))) => return Err(HarvestError::Other(e)),
            Ok(Err(join_err)) => {
                return Err(HarvestError::Other(anyhow::anyhow!(
                    "refresh finalizer panicked: {join_err}"
                )));
            }
            Err(_) => {
                // Completion handle timed out; fall back to observing the
                // progress counter before declaring the refresh dead. The
                // finalizer keeps running and persisting behind us.
                self.poll_progress_fallback(progress, num_chunks).await?;
                // Give the finalizer a beat to merge and persist
                tokio::time::sleep(Duration::from_secs(2)).await;
                scorer.len()
            }
        };

        self.publish_progress(num_chunks, num_chunks).await;

        if count < self.config.min_live {
            return Err(HarvestError::ProxyPoolExhausted(format!(
                "refresh produced {count} live endpoints, minimum is {}",
                self.config.min_live
            )));
        }

        info!("Refresh complete: {count} live endpoints");
        Ok(count)
    }

    /// `max((num_chunks / parallelism) · per_chunk_budget · 1.5, floor)`
    fn dynamic_timeout(&self, num_chunks: usize) -> Duration {
        let waves = num_chunks.div_ceil(self.pool.parallelism()).max(1) as u32;
        (self.config.per_chunk_budget * waves)
            .mul_f64(1.5)
            .max(self.config.timeout_floor)
    }

    /// Invoke the raw-endpoint scraper and parse its NDJSON feed
    async fn scrape_raw_candidates(&self) -> Result<Vec<ProxyEndpoint>, HarvestError> {
        let status = Command::new(&self.config.scraper_binary)
            .arg("--output")
            .arg(&self.config.raw_output_path)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status()
            .await
            .with_context(|| {
                format!(
                    "Failed to run raw-endpoint scraper {}",
                    self.config.scraper_binary.display()
                )
            })
            .map_err(HarvestError::Other)?;

        if !status.success() {
            warn!("Raw-endpoint scraper exited with {status}");
        }

        let text = tokio::fs::read_to_string(&self.config.raw_output_path)
            .await
            .with_context(|| {
                format!(
                    "Raw-endpoint feed missing at {}",
                    self.config.raw_output_path.display()
                )
            })
            .map_err(HarvestError::Other)?;

        Ok(parse_raw_feed(&text))
    }

    /// Fallback observation after a barrier timeout
    ///
    /// Polls the progress counter; a window with zero newly-completed
    /// chunks longer than the configured threshold is fatal.
    async fn poll_progress_fallback(
        &self,
        progress: Arc<std::sync::atomic::AtomicUsize>,
        total: usize,
    ) -> Result<(), HarvestError> {
        let mut last_seen = progress.load(std::sync::atomic::Ordering::SeqCst);
        let mut last_advance = Instant::now();

        loop {
            if self.shutdown.is_triggered() {
                return Err(HarvestError::Cancelled);
            }

            let done = progress.load(std::sync::atomic::Ordering::SeqCst);
            self.publish_progress(done, total).await;

            if done >= total {
                return Ok(());
            }
            if done > last_seen {
                last_seen = done;
                last_advance = Instant::now();
            } else if self.endpoint_file_touched_since(last_advance) {
                // Last resort: the scorer or a sibling process wrote the
                // endpoint file, so something is still alive
                last_advance = Instant::now();
            } else if last_advance.elapsed() > self.config.zero_progress_window {
                return Err(HarvestError::ProxyPoolExhausted(format!(
                    "refresh stalled at {done}/{total} chunks for {:?}",
                    self.config.zero_progress_window
                )));
            }

            tokio::time::sleep(Duration::from_secs(2)).await;
        }
    }

    /// Whether the endpoint file was modified after `since`
    fn endpoint_file_touched_since(&self, since: Instant) -> bool {
        let Ok(meta) = std::fs::metadata(&self.config.endpoint_file) else {
            return false;
        };
        let Ok(mtime) = meta.modified() else {
            return false;
        };
        let Ok(age) = mtime.elapsed() else {
            return false;
        };
        age < since.elapsed()
    }

    /// Bump `refresh:progress` in the shared store when configured
    async fn publish_progress(&self, done: usize, total: usize) {
        if let Some(conn) = &self.shared_store {
            let mut conn = conn.clone();
            let value = format!("{done}/{total}");
            let result: redis::RedisResult<()> = redis::cmd("SET")
                .arg("refresh:progress")
                .arg(&value)
                .arg("EX")
                .arg(3600)
                .query_async(&mut conn)
                .await;
            if let Err(e) = result {
                debug!("Failed to publish refresh progress: {e}");
            }
        }
    }
}

/// Parse the scraper's newline-delimited `{host, port, protocol}` records
///
/// Malformed lines are skipped; the feed is scraped content and arrives
/// dirty.
#[must_use]
pub fn parse_raw_feed(text: &str) -> Vec<ProxyEndpoint> {
    let mut candidates = Vec::new();
    for line in text.lines() {
        let line = line.trim().trim_end_matches(',');
        if line.is_empty() || line == "[" || line == "]" {
            continue;
        }
        match serde_json::from_str::<RawCandidate>(line) {
            Ok(raw) => {
                let protocol = raw.protocol.parse().unwrap_or(Protocol::Http);
                candidates.push(ProxyEndpoint::new(protocol, raw.host, raw.port));
            }
            Err(e) => debug!("Skipping malformed raw-endpoint line: {e}"),
        }
    }
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_raw_feed() {
        let feed = r#"
{"host": "203.0.113.1", "port": 8080, "protocol": "http"}
{"host": "203.0.113.2", "port": 1080, "protocol": "socks5"},
not json at all
{"host": "203.0.113.3", "port": 3128, "protocol": "weird"}
"#;
        let parsed = parse_raw_feed(feed);
        assert_eq!(parsed.len(), 3);
        assert_eq!(parsed[0].key(), "203.0.113.1:8080");
        assert_eq!(parsed[1].protocol, Protocol::Socks5);
        // Unknown protocol falls back to http rather than losing a candidate
        assert_eq!(parsed[2].protocol, Protocol::Http);
    }

    #[test]
    fn test_parse_raw_feed_empty() {
        assert!(parse_raw_feed("").is_empty());
        assert!(parse_raw_feed("[\n]\n").is_empty());
    }
}
