//! Core configuration types for the harvesting engine

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How a site's index pages advance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PaginationMode {
    /// `?page=N` style numbered pages
    #[default]
    Numbered,
    /// Opaque next-page link extracted from the current page
    Cursor,
    /// Single page, no pagination
    None,
}

/// Typed coercion hints for extracted fields
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Text,
    Number,
    Price,
    Area,
}

/// Per-site configuration table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteConfig {
    /// Whether the dispatcher runs this site
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Base URL used to absolutize discovered links
    pub base_url: String,
    /// Seed URLs issued when no checkpoint exists
    pub seed_urls: Vec<String>,
    /// Maximum URLs processed per seed set
    #[serde(default)]
    pub limit: Option<usize>,
    /// Inter-request delay in seconds; informs the rate limiter
    #[serde(default = "default_delay")]
    pub delay_secs: f64,
    /// Per-fetch timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    /// Strategy-private CSS selector table
    #[serde(default)]
    pub selectors: HashMap<String, String>,
    #[serde(default)]
    pub pagination: PaginationMode,
    /// Optional coercion hints per extracted field
    #[serde(default)]
    pub field_types: Option<HashMap<String, FieldType>>,
    /// Within-site parallelism opt-in; default is strictly sequential
    #[serde(default)]
    pub parallel: bool,
    /// Persist the checkpoint every K completions
    #[serde(default = "default_checkpoint_every")]
    pub checkpoint_every: usize,
    /// Publish progress every J completions
    #[serde(default = "default_progress_every")]
    pub progress_every: usize,
    /// Full retry cycles per URL before it is declared failed
    #[serde(default = "default_max_url_passes")]
    pub max_url_passes: u32,
}

fn default_true() -> bool {
    true
}
fn default_delay() -> f64 {
    crate::utils::DEFAULT_SITE_DELAY_SECS
}
fn default_timeout() -> u64 {
    crate::utils::DEFAULT_FETCH_TIMEOUT_SECS
}
fn default_checkpoint_every() -> usize {
    crate::utils::DEFAULT_CHECKPOINT_EVERY
}
fn default_progress_every() -> usize {
    crate::utils::DEFAULT_PROGRESS_EVERY
}
fn default_max_url_passes() -> u32 {
    crate::utils::DEFAULT_MAX_URL_PASSES
}

impl SiteConfig {
    #[must_use]
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Rate-limiter bucket derived from the configured delay
    #[must_use]
    pub fn bucket(&self) -> crate::resilience::BucketConfig {
        crate::resilience::BucketConfig {
            capacity: crate::utils::DEFAULT_BUCKET_CAPACITY,
            refill_per_sec: if self.delay_secs > 0.0 {
                1.0 / self.delay_secs
            } else {
                f64::INFINITY
            },
        }
    }
}

/// Engine-wide configuration
#[derive(Debug, Clone)]
pub struct HarvestConfig {
    /// Root for persistent state (endpoint list, scores, checkpoints, db)
    pub data_dir: PathBuf,
    /// Rotator binary path
    pub rotator_binary: PathBuf,
    /// Raw-endpoint scraper binary path
    pub endpoint_scraper_binary: PathBuf,
    /// Rotator listen address
    pub rotator_listen_addr: String,
    /// Health-check URL fetched through the rotator
    pub rotator_health_url: String,
    /// Echo judge for anonymity classification
    pub judge_url: String,
    /// Plain IP echo endpoint
    pub ip_echo_url: String,
    /// Reference page for the CAPTCHA quality probe
    pub reference_url: String,
    /// Shared-store (redis) URL; enables the shared limiter/breaker variants
    pub shared_store_url: Option<String>,
    /// Use the shared-store limiter/breaker variants
    pub use_shared_store: bool,
    /// Worker pool size
    pub worker_parallelism: usize,
    /// Minimum live forwards before dispatch starts
    pub min_live_pool: usize,
    /// Validation chunk size for the refresh pipeline
    pub validation_chunk_size: usize,
    /// Per-chunk budget for the refresh barrier timeout
    pub per_chunk_budget: Duration,
    /// Fatal zero-progress window during refresh fallback polling
    pub zero_progress_window: Duration,
    /// Retry engine tuning
    pub retry: crate::resilience::RetryPolicy,
    /// Circuit breaker tuning
    pub breaker: crate::resilience::BreakerConfig,
    /// Per-site tables, keyed by site name
    pub sites: HashMap<String, SiteConfig>,
    /// Optional explicit Chrome executable for the stealth browser
    pub chrome_executable: Option<PathBuf>,
}

impl HarvestConfig {
    #[must_use]
    pub fn builder() -> super::HarvestConfigBuilder {
        super::HarvestConfigBuilder::default()
    }

    #[must_use]
    pub fn endpoint_file(&self) -> PathBuf {
        self.data_dir.join("endpoints.txt")
    }

    #[must_use]
    pub fn score_file(&self) -> PathBuf {
        self.data_dir.join("proxy_scores.json")
    }

    #[must_use]
    pub fn checkpoint_dir(&self) -> PathBuf {
        self.data_dir.join("checkpoints")
    }

    #[must_use]
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("listings.sqlite")
    }

    #[must_use]
    pub fn raw_feed_path(&self) -> PathBuf {
        self.data_dir.join("raw_endpoints.ndjson")
    }

    #[must_use]
    pub fn browser_data_dir(&self) -> PathBuf {
        self.data_dir.join("browser_profile")
    }

    /// Enabled sites only
    #[must_use]
    pub fn enabled_sites(&self) -> impl Iterator<Item = (&String, &SiteConfig)> {
        self.sites.iter().filter(|(_, site)| site.enabled)
    }
}
