//! Listing enrichment seam
//!
//! Enrichment (LLM-assisted field extraction lives behind this boundary)
//! runs between parse and upsert. The engine treats it as opaque: a failed
//! enrichment classifies as a parse error for manual review and never
//! aborts the URL's write.

use std::future::Future;
use std::pin::Pin;

use anyhow::Result;

use crate::store::ListingRecord;

/// Post-parse enrichment step
pub trait ListingEnricher: Send + Sync {
    /// Mutate the record in place with derived or inferred fields
    fn enrich<'a>(
        &'a self,
        record: &'a mut ListingRecord,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;
}

/// Enricher that does nothing
///
/// Default wiring when no enrichment backend is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopEnricher;

impl ListingEnricher for NoopEnricher {
    fn enrich<'a>(
        &'a self,
        _record: &'a mut ListingRecord,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async { Ok(()) })
    }
}
