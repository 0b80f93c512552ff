//! Durable per-site scrape progress
//!
//! One JSON checkpoint per site per run: the ordered pending queue, the
//! completed set, and terminal failures with attempt counters. Saves are
//! atomic (temp file + rename) so readers see either the old or the new
//! snapshot; a crash between temp-write and rename leaves the previous
//! checkpoint intact. Destroyed after the run completes cleanly.

use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::error::HarvestError;
use crate::resilience::ErrorKind;

/// A URL still to be processed, with its retry-cycle counter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingUrl {
    pub url: String,
    /// Completed retry cycles this URL has burned (0 = never attempted)
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error_kind: Option<ErrorKind>,
}

impl PendingUrl {
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            attempts: 0,
            last_error_kind: None,
        }
    }
}

/// Terminal failure record for a URL that exhausted its retry budget
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub attempts: u32,
    pub last_error_kind: ErrorKind,
}

/// Snapshot of one site's scrape progress
///
/// Invariant: `completed ∪ failed ⊆ issued` and
/// `pending = issued \ (completed ∪ failed)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointSnapshot {
    pub site: String,
    pub pending_urls: Vec<PendingUrl>,
    pub completed_urls: BTreeSet<String>,
    pub failed_urls: BTreeMap<String, FailureRecord>,
    pub started_at: DateTime<Utc>,
    pub last_saved_at: DateTime<Utc>,
}

impl CheckpointSnapshot {
    #[must_use]
    pub fn new(site: impl Into<String>, seed_urls: Vec<String>) -> Self {
        Self {
            site: site.into(),
            pending_urls: seed_urls.into_iter().map(PendingUrl::new).collect(),
            completed_urls: BTreeSet::new(),
            failed_urls: BTreeMap::new(),
            started_at: Utc::now(),
            last_saved_at: Utc::now(),
        }
    }

    /// Every URL this run has ever issued
    #[must_use]
    pub fn issued(&self) -> BTreeSet<String> {
        let mut set: BTreeSet<String> =
            self.pending_urls.iter().map(|p| p.url.clone()).collect();
        set.extend(self.completed_urls.iter().cloned());
        set.extend(self.failed_urls.keys().cloned());
        set
    }
}

/// Open handle to one site's checkpoint file
#[derive(Debug, Clone)]
pub struct CheckpointHandle {
    site: String,
    path: PathBuf,
}

impl CheckpointHandle {
    #[must_use]
    pub fn site(&self) -> &str {
        &self.site
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Store managing checkpoint files under a well-known directory
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    /// Create the store, ensuring the checkpoint directory exists
    pub async fn open_dir(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("Failed to create checkpoint directory {}", dir.display()))?;
        Ok(Self { dir })
    }

    /// Handle for a site's checkpoint file
    #[must_use]
    pub fn open(&self, site: &str) -> CheckpointHandle {
        CheckpointHandle {
            site: site.to_string(),
            path: self.dir.join(format!("{site}.checkpoint.json")),
        }
    }

    /// Persist a snapshot atomically
    ///
    /// Serialization and the temp-write + rename happen on the blocking
    /// pool; the rename is the commit point.
    pub async fn save(&self, handle: &CheckpointHandle, snapshot: &CheckpointSnapshot) -> Result<()> {
        let mut snapshot = snapshot.clone();
        snapshot.last_saved_at = Utc::now();
        let path = handle.path.clone();
        let dir = self.dir.clone();

        tokio::task::spawn_blocking(move || -> Result<()> {
            let json = serde_json::to_vec_pretty(&snapshot)
                .context("Failed to serialize checkpoint")?;
            let mut tmp = tempfile::NamedTempFile::new_in(&dir)
                .context("Failed to create checkpoint temp file")?;
            tmp.write_all(&json)
                .context("Failed to write checkpoint temp file")?;
            tmp.flush().context("Failed to flush checkpoint temp file")?;
            tmp.persist(&path)
                .with_context(|| format!("Failed to commit checkpoint to {}", path.display()))?;
            Ok(())
        })
        .await
        .context("Checkpoint save task panicked")??;

        debug!("Checkpoint saved for {}", handle.site);
        Ok(())
    }

    /// Restore a site's snapshot if one exists
    ///
    /// A present-but-unparseable file surfaces [`HarvestError::CheckpointCorrupt`];
    /// the dispatcher must not silently restart from scratch over a
    /// half-readable run.
    pub async fn restore(&self, site: &str) -> Result<Option<CheckpointSnapshot>, HarvestError> {
        let path = self.dir.join(format!("{site}.checkpoint.json"));
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(HarvestError::Other(
                    anyhow::Error::new(e).context(format!("Failed to read {}", path.display())),
                ));
            }
        };

        match serde_json::from_slice::<CheckpointSnapshot>(&bytes) {
            Ok(snapshot) => {
                info!(
                    "Restored checkpoint for {site}: {} pending, {} completed, {} failed",
                    snapshot.pending_urls.len(),
                    snapshot.completed_urls.len(),
                    snapshot.failed_urls.len()
                );
                Ok(Some(snapshot))
            }
            Err(e) => Err(HarvestError::CheckpointCorrupt {
                path,
                reason: e.to_string(),
            }),
        }
    }

    /// Close a handle; `clean` removes the file
    pub async fn close(&self, handle: CheckpointHandle, clean: bool) -> Result<()> {
        if clean {
            match tokio::fs::remove_file(&handle.path).await {
                Ok(()) => info!("Checkpoint removed for {} (clean run)", handle.site),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!("Failed to remove checkpoint {}: {e}", handle.path.display());
                }
            }
        }
        Ok(())
    }
}
