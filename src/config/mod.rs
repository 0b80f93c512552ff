//! Harvest configuration
//!
//! [`HarvestConfig`] is built once by the binary (builder-validated, then
//! environment overrides) and owned by the orchestrator. Per-site tables
//! live in [`SiteConfig`]; everything else tunes the shared engine.

mod builder;
pub mod env;
mod types;

pub use builder::HarvestConfigBuilder;
pub use env::apply_env_overrides;
pub use types::{FieldType, HarvestConfig, PaginationMode, SiteConfig};
