//! Environment variable surface
//!
//! Applied on top of a built config by the binary. Unset variables leave
//! the config untouched.
//!
//! | Variable | Effect |
//! |---|---|
//! | `PROPHARVEST_SHARED_STORE_URL` | shared-store address, enables shared variants |
//! | `PROPHARVEST_ROTATOR_BIN` | rotator binary path |
//! | `PROPHARVEST_ENDPOINT_SCRAPER_BIN` | raw-endpoint scraper path |
//! | `PROPHARVEST_DATA_DIR` | persistent state root |
//! | `PROPHARVEST_MAX_WORKERS` | worker pool size |
//! | `PROPHARVEST_SITES_FILE` | per-site overrides JSON path |

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use log::info;

use super::types::{HarvestConfig, SiteConfig};

/// Apply environment overrides to a built config
pub fn apply_env_overrides(mut config: HarvestConfig) -> Result<HarvestConfig> {
    if let Ok(url) = std::env::var("PROPHARVEST_SHARED_STORE_URL")
        && !url.is_empty()
    {
        config.shared_store_url = Some(url);
        config.use_shared_store = true;
    }
    if let Ok(path) = std::env::var("PROPHARVEST_ROTATOR_BIN")
        && !path.is_empty()
    {
        config.rotator_binary = PathBuf::from(path);
    }
    if let Ok(path) = std::env::var("PROPHARVEST_ENDPOINT_SCRAPER_BIN")
        && !path.is_empty()
    {
        config.endpoint_scraper_binary = PathBuf::from(path);
    }
    if let Ok(dir) = std::env::var("PROPHARVEST_DATA_DIR")
        && !dir.is_empty()
    {
        config.data_dir = PathBuf::from(dir);
    }
    if let Ok(workers) = std::env::var("PROPHARVEST_MAX_WORKERS") {
        config.worker_parallelism = workers
            .parse()
            .context("PROPHARVEST_MAX_WORKERS must be a positive integer")?;
    }
    if let Ok(path) = std::env::var("PROPHARVEST_SITES_FILE")
        && !path.is_empty()
    {
        let overrides = load_site_overrides(&PathBuf::from(&path))
            .with_context(|| format!("Failed to load site overrides from {path}"))?;
        let count = overrides.len();
        config.sites.extend(overrides);
        info!("Loaded {count} site overrides from {path}");
    }

    Ok(config)
}

/// Load the per-site overrides file: a JSON object of name → [`SiteConfig`]
pub fn load_site_overrides(path: &std::path::Path) -> Result<HashMap<String, SiteConfig>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&text).context("Site overrides file is not a valid site table")
}
