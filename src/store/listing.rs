//! Listing record model
//!
//! A listing is keyed by `(site, external_id)`, created on first
//! observation, mutated by later observations, and never deleted. The
//! fingerprint field set deliberately excludes volatile attributes
//! (observation timestamps, rank metrics) so re-observing an unchanged
//! listing is a no-op.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One harvested listing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ListingRecord {
    pub site: String,
    pub external_id: String,
    pub url: String,

    pub title: Option<String>,
    pub price: Option<f64>,
    pub currency: Option<String>,
    pub price_per_sqm: Option<f64>,
    pub area_sqm: Option<f64>,
    pub rooms: Option<u32>,
    pub floor: Option<i32>,
    pub total_floors: Option<i32>,
    pub year_built: Option<i32>,
    pub construction_type: Option<String>,
    pub heating: Option<String>,
    pub furnishing: Option<String>,
    pub has_elevator: Option<bool>,
    pub has_parking: Option<bool>,
    pub has_balcony: Option<bool>,

    pub city: Option<String>,
    pub district: Option<String>,
    pub address: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,

    pub description: Option<String>,
    pub features: Vec<String>,
    pub images: Vec<String>,

    pub agency: Option<String>,
    pub contact_name: Option<String>,
    pub contact_phone: Option<String>,
    pub is_private_seller: Option<bool>,
    pub available_from: Option<String>,

    /// Volatile: when this observation happened (excluded from fingerprint)
    pub observed_at: Option<DateTime<Utc>>,
    /// Volatile: position in the source result list (excluded from fingerprint)
    pub rank: Option<u32>,
}

impl ListingRecord {
    #[must_use]
    pub fn new(site: impl Into<String>, external_id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            site: site.into(),
            external_id: external_id.into(),
            url: url.into(),
            observed_at: Some(Utc::now()),
            ..Self::default()
        }
    }

    /// Tracked fields in stable order, as (name, rendered value) pairs
    ///
    /// This is the fingerprint domain and the diff domain: everything the
    /// change detector compares, and nothing volatile.
    #[must_use]
    pub fn tracked_fields(&self) -> Vec<(&'static str, String)> {
        fn opt<T: std::fmt::Display>(v: &Option<T>) -> String {
            v.as_ref().map(ToString::to_string).unwrap_or_default()
        }

        vec![
            ("title", opt(&self.title)),
            ("price", opt(&self.price)),
            ("currency", opt(&self.currency)),
            ("price_per_sqm", opt(&self.price_per_sqm)),
            ("area_sqm", opt(&self.area_sqm)),
            ("rooms", opt(&self.rooms)),
            ("floor", opt(&self.floor)),
            ("total_floors", opt(&self.total_floors)),
            ("year_built", opt(&self.year_built)),
            ("construction_type", opt(&self.construction_type)),
            ("heating", opt(&self.heating)),
            ("furnishing", opt(&self.furnishing)),
            ("has_elevator", opt(&self.has_elevator)),
            ("has_parking", opt(&self.has_parking)),
            ("has_balcony", opt(&self.has_balcony)),
            ("city", opt(&self.city)),
            ("district", opt(&self.district)),
            ("address", opt(&self.address)),
            ("latitude", opt(&self.latitude)),
            ("longitude", opt(&self.longitude)),
            ("description", opt(&self.description)),
            ("features", self.features.join("|")),
            ("images", self.images.join("|")),
            ("agency", opt(&self.agency)),
            ("contact_name", opt(&self.contact_name)),
            ("contact_phone", opt(&self.contact_phone)),
            ("is_private_seller", opt(&self.is_private_seller)),
            ("available_from", opt(&self.available_from)),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_volatile_fields_not_tracked() {
        let mut record = ListingRecord::new("site_a", "L1", "https://a.example/1");
        let before = record.tracked_fields();

        record.observed_at = Some(Utc::now() + chrono::Duration::hours(1));
        record.rank = Some(42);
        let after = record.tracked_fields();

        assert_eq!(before, after);
    }

    #[test]
    fn test_price_change_is_tracked() {
        let mut record = ListingRecord::new("site_a", "L1", "https://a.example/1");
        record.price = Some(200_000.0);
        let before = record.tracked_fields();
        record.price = Some(195_000.0);
        assert_ne!(before, record.tracked_fields());
    }
}
