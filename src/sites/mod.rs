//! Per-site scraping strategies
//!
//! Each site contributes a [`SiteStrategy`]: its seed URLs, listing
//! extraction, pagination discovery, and the page-class declarations the
//! response validator relies on. The dispatcher only ever talks to the
//! trait; site-specific selector logic stays behind it. Config-driven sites
//! use [`generic::GenericStrategy`], parameterized entirely by the site's
//! selector table.

pub mod generic;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;

use crate::config::SiteConfig;
use crate::fetch::FetchMode;
use crate::resilience::PageExpectations;
use crate::store::ListingRecord;

pub use generic::GenericStrategy;

/// What kind of page a URL is, and what the engine may assume about it
#[derive(Debug, Clone, Copy)]
pub struct PageClass {
    /// Index pages go through fast HTTP; detail pages through the browser
    pub mode: FetchMode,
    /// Validator contract for this page class
    pub expectations: PageExpectations,
}

/// The capability set every site provides
pub trait SiteStrategy: Send + Sync {
    /// Site name; keys the registry, checkpoints, and config table
    fn name(&self) -> &str;

    /// URLs issued when no checkpoint exists
    fn seed_urls(&self) -> Vec<String>;

    /// Classify a URL into a page class
    fn classify_page(&self, url: &str) -> PageClass;

    /// Extract a listing from a detail page
    ///
    /// `Ok(None)` means the page is genuinely not a listing (index pages,
    /// interstitials); extraction failures on listing pages are errors.
    fn extract_listing(&self, html: &str, url: &str) -> Result<Option<ListingRecord>>;

    /// Discover follow-up URLs: pagination and detail links
    fn extract_pagination(&self, html: &str, url: &str) -> Vec<String>;

    /// Whether this index page is the last one
    fn is_last_page(&self, html: &str) -> bool;

    /// How many result items the strategy sees on an index page,
    /// for empty-SERP detection
    fn count_results(&self, html: &str) -> usize;
}

/// Name-keyed strategy registry
#[derive(Default, Clone)]
pub struct StrategyRegistry {
    strategies: HashMap<String, Arc<dyn SiteStrategy>>,
}

impl StrategyRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, strategy: Arc<dyn SiteStrategy>) {
        self.strategies.insert(strategy.name().to_string(), strategy);
    }

    #[must_use]
    pub fn get(&self, site: &str) -> Option<Arc<dyn SiteStrategy>> {
        self.strategies.get(site).cloned()
    }

    /// Build a registry of generic strategies from the config's site tables
    pub fn from_config(sites: &HashMap<String, SiteConfig>) -> Result<Self> {
        let mut registry = Self::new();
        for (name, site) in sites {
            if site.enabled {
                registry.register(Arc::new(GenericStrategy::from_config(name, site)?));
            }
        }
        Ok(registry)
    }
}
