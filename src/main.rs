// propharvest: run the full harvesting pipeline in the foreground.
//
// Configuration comes from a small built-in baseline, the required site
// table (PROPHARVEST_SITES_FILE), and environment overrides (see
// config::env). Exit codes: 0 clean, 1 fatal startup failure, 2 fatal
// mid-run failure, 130 on signal.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::info;

use propharvest::config::{HarvestConfig, apply_env_overrides};
use propharvest::config::env::load_site_overrides;
use propharvest::orchestrator::Orchestrator;

fn build_config() -> Result<HarvestConfig> {
    let sites_path = std::env::var("PROPHARVEST_SITES_FILE")
        .context("PROPHARVEST_SITES_FILE is required (path to the per-site JSON table)")?;

    let mut builder = HarvestConfig::builder()
        .data_dir(data_dir_fallback())
        .rotator_binary("/usr/local/bin/proxy-rotator")
        .endpoint_scraper_binary("/usr/local/bin/endpoint-scraper");

    for (name, site) in load_site_overrides(Path::new(&sites_path))
        .with_context(|| format!("Failed to load site table from {sites_path}"))?
    {
        builder = builder.site(name, site);
    }

    let config = builder.build().context("Configuration is incomplete")?;
    apply_env_overrides(config)
}

fn data_dir_fallback() -> PathBuf {
    std::env::var_os("HOME").map(PathBuf::from).map_or_else(
        || PathBuf::from("/var/lib/propharvest"),
        |home| home.join(".local/share/propharvest"),
    )
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = match build_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("propharvest: configuration error: {e:#}");
            std::process::exit(1);
        }
    };

    info!(
        "Starting harvest: {} sites enabled, data dir {}",
        config.enabled_sites().count(),
        config.data_dir.display()
    );

    let outcome = Orchestrator::new(config).run().await;
    std::process::exit(outcome.exit_code());
}
