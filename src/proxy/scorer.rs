//! Runtime proxy selection by weighted score
//!
//! Holds the ordered live list and a parallel score map. Selection is
//! weighted-random over normalized scores and returns the endpoint's
//! current index, because downstream fetches route by index through the
//! rotator. Success multiplies a score by 1.1 and clears the failure
//! counter; failure halves it and increments the counter; endpoints are
//! pruned at 3 consecutive failures or a score below 0.01.
//!
//! One mutex guards the list, the scores, and file I/O. The endpoint file
//! is rewritten on every mutation so the rotator's watch mode stays in
//! sync, and scores are persisted after every update; both writes are
//! atomic (temp file + rename) under an advisory lock. Pool order is stable
//! across mutations except that removal shifts subsequent indices down by
//! one, so selections taken before a prune may carry a stale index; outcome
//! recording re-resolves by endpoint key when the index no longer matches.

use std::collections::HashMap;
use std::fs::File;
use std::io::Write;
#[cfg(unix)]
use std::os::fd::AsRawFd;
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::utils::{
    SCORER_FAILURE_FACTOR, SCORER_LATENCY_EPSILON, SCORER_PRUNE_FAILURES, SCORER_PRUNE_SCORE,
    SCORER_SUCCESS_FACTOR,
};

use super::endpoint::ProxyEndpoint;

/// Persisted per-endpoint score record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoreEntry {
    pub score: f64,
    pub failures: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used: Option<DateTime<Utc>>,
}

/// Scorer tuning
#[derive(Debug, Clone)]
pub struct ScorerConfig {
    /// Endpoint list file the rotator watches (line order = routing index)
    pub endpoint_file: PathBuf,
    /// Score map JSON, keyed `host:port`
    pub score_file: PathBuf,
}

/// A selected forward and its current routing index
#[derive(Debug, Clone)]
pub struct Selection {
    pub endpoint: ProxyEndpoint,
    pub index: usize,
}

#[derive(Debug, Default)]
struct ScorerInner {
    endpoints: Vec<ProxyEndpoint>,
    scores: HashMap<String, ScoreEntry>,
}

/// The live pool and its on-disk view
pub struct ProxyScorer {
    inner: Mutex<ScorerInner>,
    config: ScorerConfig,
}

impl ProxyScorer {
    #[must_use]
    pub fn new(config: ScorerConfig) -> Self {
        Self {
            inner: Mutex::new(ScorerInner::default()),
            config,
        }
    }

    /// Seed the pool from the endpoint file and score file, if present
    ///
    /// Unknown endpoints get a neutral score of 1.0; score entries for
    /// endpoints no longer listed are dropped.
    pub fn seed_from_files(&self) -> Result<usize> {
        let mut inner = self.inner.lock();

        let endpoints = match std::fs::read_to_string(&self.config.endpoint_file) {
            Ok(text) => text
                .lines()
                .filter(|l| !l.trim().is_empty())
                .map(ProxyEndpoint::from_line)
                .collect::<Result<Vec<_>, _>>()
                .map_err(anyhow::Error::msg)
                .context("Malformed endpoint file")?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                return Err(anyhow::Error::new(e).context(format!(
                    "Failed to read endpoint file {}",
                    self.config.endpoint_file.display()
                )));
            }
        };

        let mut scores: HashMap<String, ScoreEntry> =
            match std::fs::read_to_string(&self.config.score_file) {
                Ok(text) => serde_json::from_str(&text).unwrap_or_else(|e| {
                    warn!("Score file unreadable, starting fresh: {e}");
                    HashMap::new()
                }),
                Err(_) => HashMap::new(),
            };

        scores.retain(|key, _| endpoints.iter().any(|ep| ep.key() == *key));
        for ep in &endpoints {
            scores.entry(ep.key()).or_insert(ScoreEntry {
                score: 1.0,
                failures: 0,
                last_used: None,
            });
        }

        let count = endpoints.len();
        inner.endpoints = endpoints;
        inner.scores = scores;
        info!("Scorer seeded with {count} endpoints");
        Ok(count)
    }

    /// Replace the pool with freshly validated endpoints
    ///
    /// Initial score is `1 / max(latency_seconds, ε)`. Persists both files.
    pub fn replace_all(&self, endpoints: Vec<ProxyEndpoint>) -> Result<usize> {
        let mut inner = self.inner.lock();
        inner.scores.clear();
        for ep in &endpoints {
            let latency_secs = ep
                .latency
                .map_or(1.0, |d| d.as_secs_f64())
                .max(SCORER_LATENCY_EPSILON);
            inner.scores.insert(
                ep.key(),
                ScoreEntry {
                    score: 1.0 / latency_secs,
                    failures: 0,
                    last_used: None,
                },
            );
        }
        let count = endpoints.len();
        inner.endpoints = endpoints;
        self.persist_locked(&inner)?;
        info!("Scorer pool replaced with {count} endpoints");
        Ok(count)
    }

    /// Append newly validated endpoints not already in the pool
    pub fn extend(&self, endpoints: Vec<ProxyEndpoint>) -> Result<usize> {
        let mut inner = self.inner.lock();
        let mut added = 0;
        for ep in endpoints {
            if inner.endpoints.iter().any(|e| e.key() == ep.key()) {
                continue;
            }
            let latency_secs = ep
                .latency
                .map_or(1.0, |d| d.as_secs_f64())
                .max(SCORER_LATENCY_EPSILON);
            inner.scores.insert(
                ep.key(),
                ScoreEntry {
                    score: 1.0 / latency_secs,
                    failures: 0,
                    last_used: None,
                },
            );
            inner.endpoints.push(ep);
            added += 1;
        }
        if added > 0 {
            self.persist_locked(&inner)?;
            info!("Scorer pool extended with {added} endpoints");
        }
        Ok(added)
    }

    /// Number of live endpoints
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().endpoints.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().endpoints.is_empty()
    }

    /// Weighted-random selection over normalized scores
    ///
    /// Returns `None` on an empty pool (never panics, never blocks).
    /// `exclude` removes one index from consideration, for proxy rotation
    /// after a forward failure.
    #[must_use]
    pub fn select(&self, exclude: Option<usize>) -> Option<Selection> {
        let mut inner = self.inner.lock();
        if inner.endpoints.is_empty() {
            return None;
        }

        let weights: Vec<(usize, f64)> = inner
            .endpoints
            .iter()
            .enumerate()
            .filter(|(i, _)| Some(*i) != exclude || inner.endpoints.len() == 1)
            .map(|(i, ep)| {
                let score = inner.scores.get(&ep.key()).map_or(0.0, |s| s.score);
                (i, score.max(0.0))
            })
            .collect();

        let total: f64 = weights.iter().map(|(_, w)| w).sum();
        let index = if total <= f64::EPSILON {
            // All-zero weights: fall back to uniform choice
            weights[rand::rng().random_range(0..weights.len())].0
        } else {
            let mut pick = rand::rng().random_range(0.0..total);
            let mut chosen = weights[weights.len() - 1].0;
            for (i, w) in &weights {
                if pick < *w {
                    chosen = *i;
                    break;
                }
                pick -= w;
            }
            chosen
        };

        let endpoint = inner.endpoints[index].clone();
        if let Some(entry) = inner.scores.get_mut(&endpoint.key()) {
            entry.last_used = Some(Utc::now());
        }
        Some(Selection { endpoint, index })
    }

    /// Record a successful fetch through a forward
    pub fn record_success(&self, selection: &Selection) -> Result<()> {
        let mut inner = self.inner.lock();
        let key = selection.endpoint.key();
        if let Some(entry) = inner.scores.get_mut(&key) {
            entry.score *= SCORER_SUCCESS_FACTOR;
            entry.failures = 0;
            entry.last_used = Some(Utc::now());
        }
        self.persist_scores_locked(&inner)
    }

    /// Record a failed fetch through a forward; prunes if the endpoint
    /// crossed the failure or score threshold
    ///
    /// Returns true if the endpoint was pruned. Pruning removes it from
    /// both the in-memory list and the endpoint file the rotator watches;
    /// subsequent indices shift down by one.
    pub fn record_failure(&self, selection: &Selection) -> Result<bool> {
        let mut inner = self.inner.lock();
        let key = selection.endpoint.key();

        let should_prune = match inner.scores.get_mut(&key) {
            Some(entry) => {
                entry.score *= SCORER_FAILURE_FACTOR;
                entry.failures += 1;
                entry.last_used = Some(Utc::now());
                entry.failures >= SCORER_PRUNE_FAILURES || entry.score < SCORER_PRUNE_SCORE
            }
            None => return Ok(false), // already pruned by a concurrent failure
        };

        if should_prune {
            // Stale-index safe: re-resolve by key before removing
            if let Some(pos) = inner.endpoints.iter().position(|ep| ep.key() == key) {
                inner.endpoints.remove(pos);
            }
            inner.scores.remove(&key);
            warn!("Pruned forward {key}; {} remain", inner.endpoints.len());
            self.persist_locked(&inner)?;
            Ok(true)
        } else {
            self.persist_scores_locked(&inner)?;
            Ok(false)
        }
    }

    /// Snapshot of the ordered endpoint list
    #[must_use]
    pub fn endpoints(&self) -> Vec<ProxyEndpoint> {
        self.inner.lock().endpoints.clone()
    }

    /// Write both files; caller must hold the inner lock
    fn persist_locked(&self, inner: &ScorerInner) -> Result<()> {
        write_atomic(&self.config.endpoint_file, |file| {
            for ep in &inner.endpoints {
                writeln!(file, "{}", ep.to_line())?;
            }
            Ok(())
        })?;
        self.persist_scores_locked(inner)
    }

    fn persist_scores_locked(&self, inner: &ScorerInner) -> Result<()> {
        let json = serde_json::to_vec_pretty(&inner.scores).context("Failed to serialize scores")?;
        write_atomic(&self.config.score_file, |file| {
            file.write_all(&json)?;
            Ok(())
        })
    }
}

/// Atomic file replacement: temp write + advisory lock + rename
///
/// The advisory lock covers the rename window so the refresh finalizer and
/// the scorer never interleave a half-visible endpoint list.
fn write_atomic<F>(path: &std::path::Path, write_body: F) -> Result<()>
where
    F: FnOnce(&mut File) -> std::io::Result<()>,
{
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map_or_else(|| PathBuf::from("."), PathBuf::from);
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create directory {}", dir.display()))?;

    let mut tmp =
        tempfile::NamedTempFile::new_in(&dir).context("Failed to create temp file for atomic write")?;

    #[cfg(unix)]
    {
        let fd = tmp.as_file().as_raw_fd();
        // Best-effort advisory lock; contention only matters between our
        // own writers, which all go through this function
        if unsafe { libc::flock(fd, libc::LOCK_EX) } != 0 {
            debug!("flock unavailable for {}", path.display());
        }
    }

    write_body(tmp.as_file_mut())
        .with_context(|| format!("Failed to write temp file for {}", path.display()))?;
    tmp.as_file_mut()
        .flush()
        .context("Failed to flush temp file")?;
    tmp.persist(path)
        .with_context(|| format!("Failed to commit {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::endpoint::Protocol;
    use std::time::Duration;

    fn scorer_in(dir: &std::path::Path) -> ProxyScorer {
        ProxyScorer::new(ScorerConfig {
            endpoint_file: dir.join("endpoints.txt"),
            score_file: dir.join("scores.json"),
        })
    }

    fn endpoint(port: u16) -> ProxyEndpoint {
        let mut ep = ProxyEndpoint::new(Protocol::Http, "203.0.113.10", port);
        ep.latency = Some(Duration::from_millis(500));
        ep
    }

    #[test]
    fn test_empty_pool_selects_none() {
        let dir = tempfile::tempdir().expect("tempdir");
        let scorer = scorer_in(dir.path());
        assert!(scorer.select(None).is_none());
    }

    #[test]
    fn test_initial_score_from_latency() {
        let dir = tempfile::tempdir().expect("tempdir");
        let scorer = scorer_in(dir.path());
        scorer.replace_all(vec![endpoint(8080)]).expect("replace");

        let sel = scorer.select(None).expect("selection");
        assert_eq!(sel.index, 0);
        // 1 / 0.5s latency = 2.0
        let inner = scorer.inner.lock();
        let entry = inner.scores.get(&sel.endpoint.key()).expect("score entry");
        assert!((entry.score - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_success_and_failure_updates() {
        let dir = tempfile::tempdir().expect("tempdir");
        let scorer = scorer_in(dir.path());
        scorer.replace_all(vec![endpoint(8080)]).expect("replace");
        let sel = scorer.select(None).expect("selection");

        scorer.record_success(&sel).expect("success");
        {
            let inner = scorer.inner.lock();
            let entry = inner.scores.get(&sel.endpoint.key()).expect("entry");
            assert!((entry.score - 2.2).abs() < 1e-9);
            assert_eq!(entry.failures, 0);
        }

        scorer.record_failure(&sel).expect("failure");
        let inner = scorer.inner.lock();
        let entry = inner.scores.get(&sel.endpoint.key()).expect("entry");
        assert!((entry.score - 1.1).abs() < 1e-9);
        assert_eq!(entry.failures, 1);
    }

    #[test]
    fn test_prune_after_three_failures() {
        let dir = tempfile::tempdir().expect("tempdir");
        let scorer = scorer_in(dir.path());
        scorer
            .replace_all(vec![endpoint(8080), endpoint(8081)])
            .expect("replace");

        let sel = Selection {
            endpoint: endpoint(8080),
            index: 0,
        };
        assert!(!scorer.record_failure(&sel).expect("f1"));
        assert!(!scorer.record_failure(&sel).expect("f2"));
        assert!(scorer.record_failure(&sel).expect("f3 prunes"));

        assert_eq!(scorer.len(), 1);
        // Surviving endpoint shifted down to index 0
        let remaining = scorer.select(None).expect("selection");
        assert_eq!(remaining.index, 0);
        assert_eq!(remaining.endpoint.port, 8081);

        // Endpoint file mirrors memory
        let file = std::fs::read_to_string(dir.path().join("endpoints.txt")).expect("file");
        assert_eq!(file.trim(), "http://203.0.113.10:8081");
    }

    #[test]
    fn test_exclusion_for_rotation() {
        let dir = tempfile::tempdir().expect("tempdir");
        let scorer = scorer_in(dir.path());
        scorer
            .replace_all(vec![endpoint(8080), endpoint(8081)])
            .expect("replace");

        for _ in 0..20 {
            let sel = scorer.select(Some(0)).expect("selection");
            assert_eq!(sel.index, 1, "excluded index must not be selected");
        }
    }

    #[test]
    fn test_single_endpoint_ignores_exclusion() {
        let dir = tempfile::tempdir().expect("tempdir");
        let scorer = scorer_in(dir.path());
        scorer.replace_all(vec![endpoint(8080)]).expect("replace");
        // Excluding the only forward would starve the fetch layer
        assert!(scorer.select(Some(0)).is_some());
    }

    #[test]
    fn test_seed_roundtrip() {
        let dir = tempfile::tempdir().expect("tempdir");
        {
            let scorer = scorer_in(dir.path());
            scorer
                .replace_all(vec![endpoint(8080), endpoint(8081)])
                .expect("replace");
        }
        let scorer = scorer_in(dir.path());
        assert_eq!(scorer.seed_from_files().expect("seed"), 2);
        assert_eq!(scorer.len(), 2);
    }

    #[test]
    fn test_extend_skips_duplicates() {
        let dir = tempfile::tempdir().expect("tempdir");
        let scorer = scorer_in(dir.path());
        scorer.replace_all(vec![endpoint(8080)]).expect("replace");
        let added = scorer
            .extend(vec![endpoint(8080), endpoint(9090)])
            .expect("extend");
        assert_eq!(added, 1);
        assert_eq!(scorer.len(), 2);
    }
}
