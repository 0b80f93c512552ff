//! Validating builder for [`HarvestConfig`]
//!
//! Required fields are checked in `build()`; missing required configuration
//! is a startup-fatal error, never a silent default.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Result, anyhow};

use crate::resilience::{BreakerConfig, RetryPolicy};

use super::types::{HarvestConfig, SiteConfig};

#[derive(Debug, Default)]
pub struct HarvestConfigBuilder {
    data_dir: Option<PathBuf>,
    rotator_binary: Option<PathBuf>,
    endpoint_scraper_binary: Option<PathBuf>,
    rotator_listen_addr: Option<String>,
    rotator_health_url: Option<String>,
    judge_url: Option<String>,
    ip_echo_url: Option<String>,
    reference_url: Option<String>,
    shared_store_url: Option<String>,
    use_shared_store: bool,
    worker_parallelism: Option<usize>,
    min_live_pool: Option<usize>,
    validation_chunk_size: Option<usize>,
    per_chunk_budget: Option<Duration>,
    zero_progress_window: Option<Duration>,
    retry: Option<RetryPolicy>,
    breaker: Option<BreakerConfig>,
    sites: HashMap<String, SiteConfig>,
    chrome_executable: Option<PathBuf>,
}

impl HarvestConfigBuilder {
    #[must_use]
    pub fn data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(dir.into());
        self
    }

    #[must_use]
    pub fn rotator_binary(mut self, path: impl Into<PathBuf>) -> Self {
        self.rotator_binary = Some(path.into());
        self
    }

    #[must_use]
    pub fn endpoint_scraper_binary(mut self, path: impl Into<PathBuf>) -> Self {
        self.endpoint_scraper_binary = Some(path.into());
        self
    }

    #[must_use]
    pub fn rotator_listen_addr(mut self, addr: impl Into<String>) -> Self {
        self.rotator_listen_addr = Some(addr.into());
        self
    }

    #[must_use]
    pub fn rotator_health_url(mut self, url: impl Into<String>) -> Self {
        self.rotator_health_url = Some(url.into());
        self
    }

    #[must_use]
    pub fn judge_url(mut self, url: impl Into<String>) -> Self {
        self.judge_url = Some(url.into());
        self
    }

    #[must_use]
    pub fn ip_echo_url(mut self, url: impl Into<String>) -> Self {
        self.ip_echo_url = Some(url.into());
        self
    }

    #[must_use]
    pub fn reference_url(mut self, url: impl Into<String>) -> Self {
        self.reference_url = Some(url.into());
        self
    }

    #[must_use]
    pub fn shared_store(mut self, url: impl Into<String>) -> Self {
        self.shared_store_url = Some(url.into());
        self.use_shared_store = true;
        self
    }

    #[must_use]
    pub fn worker_parallelism(mut self, n: usize) -> Self {
        self.worker_parallelism = Some(n);
        self
    }

    #[must_use]
    pub fn min_live_pool(mut self, n: usize) -> Self {
        self.min_live_pool = Some(n);
        self
    }

    #[must_use]
    pub fn validation_chunk_size(mut self, n: usize) -> Self {
        self.validation_chunk_size = Some(n);
        self
    }

    #[must_use]
    pub fn per_chunk_budget(mut self, d: Duration) -> Self {
        self.per_chunk_budget = Some(d);
        self
    }

    #[must_use]
    pub fn zero_progress_window(mut self, d: Duration) -> Self {
        self.zero_progress_window = Some(d);
        self
    }

    #[must_use]
    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    #[must_use]
    pub fn breaker(mut self, config: BreakerConfig) -> Self {
        self.breaker = Some(config);
        self
    }

    #[must_use]
    pub fn site(mut self, name: impl Into<String>, config: SiteConfig) -> Self {
        self.sites.insert(name.into(), config);
        self
    }

    #[must_use]
    pub fn chrome_executable(mut self, path: impl Into<PathBuf>) -> Self {
        self.chrome_executable = Some(path.into());
        self
    }

    /// Validate and produce the config
    pub fn build(self) -> Result<HarvestConfig> {
        let data_dir = self.data_dir.ok_or_else(|| anyhow!("data_dir is required"))?;
        let rotator_binary = self
            .rotator_binary
            .ok_or_else(|| anyhow!("rotator_binary is required"))?;
        let endpoint_scraper_binary = self
            .endpoint_scraper_binary
            .ok_or_else(|| anyhow!("endpoint_scraper_binary is required"))?;

        if self.sites.is_empty() {
            return Err(anyhow!("at least one site must be configured"));
        }
        for (name, site) in &self.sites {
            if site.seed_urls.is_empty() {
                return Err(anyhow!("site {name} has no seed URLs"));
            }
            if site.delay_secs < 0.0 {
                return Err(anyhow!("site {name} has a negative delay"));
            }
        }
        if self.use_shared_store && self.shared_store_url.is_none() {
            return Err(anyhow!("shared store enabled but no store URL configured"));
        }

        Ok(HarvestConfig {
            data_dir,
            rotator_binary,
            endpoint_scraper_binary,
            rotator_listen_addr: self
                .rotator_listen_addr
                .unwrap_or_else(|| "127.0.0.1:8899".to_string()),
            rotator_health_url: self
                .rotator_health_url
                .unwrap_or_else(|| "http://www.gstatic.com/generate_204".to_string()),
            judge_url: self
                .judge_url
                .unwrap_or_else(|| "http://httpbin.org/headers".to_string()),
            ip_echo_url: self
                .ip_echo_url
                .unwrap_or_else(|| "http://api.ipify.org".to_string()),
            reference_url: self
                .reference_url
                .unwrap_or_else(|| "https://www.example.com/".to_string()),
            shared_store_url: self.shared_store_url,
            use_shared_store: self.use_shared_store,
            worker_parallelism: self.worker_parallelism.unwrap_or(8),
            min_live_pool: self.min_live_pool.unwrap_or(crate::utils::DEFAULT_MIN_LIVE_POOL),
            validation_chunk_size: self
                .validation_chunk_size
                .unwrap_or(crate::utils::DEFAULT_VALIDATION_CHUNK_SIZE),
            per_chunk_budget: self.per_chunk_budget.unwrap_or(Duration::from_secs(60)),
            zero_progress_window: self.zero_progress_window.unwrap_or(Duration::from_secs(300)),
            retry: self.retry.unwrap_or_default(),
            breaker: self.breaker.unwrap_or_default(),
            sites: self.sites,
            chrome_executable: self.chrome_executable,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn site() -> SiteConfig {
        serde_json::from_value(serde_json::json!({
            "base_url": "https://listings.example",
            "seed_urls": ["https://listings.example/sale?page=1"]
        }))
        .expect("valid site config")
    }

    #[test]
    fn test_minimal_build() {
        let config = HarvestConfigBuilder::default()
            .data_dir("/tmp/propharvest")
            .rotator_binary("/usr/local/bin/rotator")
            .endpoint_scraper_binary("/usr/local/bin/endpoint-scraper")
            .site("example", site())
            .build()
            .expect("config builds");
        assert_eq!(config.sites.len(), 1);
        assert!(config.endpoint_file().ends_with("endpoints.txt"));
    }

    #[test]
    fn test_missing_required_fields() {
        assert!(HarvestConfigBuilder::default().build().is_err());

        let err = HarvestConfigBuilder::default()
            .data_dir("/tmp/x")
            .rotator_binary("/bin/r")
            .endpoint_scraper_binary("/bin/s")
            .build()
            .expect_err("no sites");
        assert!(err.to_string().contains("site"));
    }

    #[test]
    fn test_site_without_seeds_rejected() {
        let mut bad = site();
        bad.seed_urls.clear();
        assert!(
            HarvestConfigBuilder::default()
                .data_dir("/tmp/x")
                .rotator_binary("/bin/r")
                .endpoint_scraper_binary("/bin/s")
                .site("bad", bad)
                .build()
                .is_err()
        );
    }

    #[test]
    fn test_site_defaults() {
        let site = site();
        assert!(site.enabled);
        assert!((site.delay_secs - 2.0).abs() < f64::EPSILON);
        assert_eq!(site.timeout_secs, 30);
        assert_eq!(site.pagination, super::super::PaginationMode::Numbered);
        assert!(!site.parallel);
    }
}
