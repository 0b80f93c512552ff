//! Content fingerprinting and field-level diffs
//!
//! The fingerprint is a stable xxh3 hash over the tracked field set; it
//! changes only when at least one tracked field differs. Diffs feed the
//! append-only change log, and price changes additionally feed the bounded
//! price history.

use serde::{Deserialize, Serialize};
use xxhash_rust::xxh3::Xxh3;

use super::listing::ListingRecord;

/// One changed field between two observations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldChange {
    pub field: String,
    pub old_value: String,
    pub new_value: String,
}

/// Stable content fingerprint over the tracked field set
///
/// Field names participate in the hash so a value moving between fields
/// cannot collide with the original layout.
#[must_use]
pub fn compute_fingerprint(record: &ListingRecord) -> u64 {
    let mut hasher = Xxh3::new();
    for (name, value) in record.tracked_fields() {
        hasher.update(name.as_bytes());
        hasher.update(b"\x1f");
        hasher.update(value.as_bytes());
        hasher.update(b"\x1e");
    }
    hasher.digest()
}

/// Field-level diff between the stored record and a new observation
#[must_use]
pub fn diff_records(old: &ListingRecord, new: &ListingRecord) -> Vec<FieldChange> {
    old.tracked_fields()
        .into_iter()
        .zip(new.tracked_fields())
        .filter(|((_, old_value), (_, new_value))| old_value != new_value)
        .map(|((field, old_value), (_, new_value))| FieldChange {
            field: field.to_string(),
            old_value,
            new_value,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn record(price: f64) -> ListingRecord {
        let mut r = ListingRecord::new("site_a", "L1", "https://a.example/1");
        r.price = Some(price);
        r.title = Some("Two-bedroom near the park".to_string());
        r
    }

    #[test]
    fn test_fingerprint_stable_for_equal_records() {
        assert_eq!(compute_fingerprint(&record(200_000.0)), compute_fingerprint(&record(200_000.0)));
    }

    #[test]
    fn test_fingerprint_ignores_volatile_fields() {
        let a = record(200_000.0);
        let mut b = record(200_000.0);
        b.observed_at = Some(Utc::now() + chrono::Duration::days(1));
        b.rank = Some(7);
        assert_eq!(compute_fingerprint(&a), compute_fingerprint(&b));
    }

    #[test]
    fn test_fingerprint_changes_on_tracked_field() {
        assert_ne!(compute_fingerprint(&record(200_000.0)), compute_fingerprint(&record(195_000.0)));
    }

    #[test]
    fn test_diff_reports_changed_fields_only() {
        let old = record(200_000.0);
        let mut new = record(195_000.0);
        new.district = Some("Riverside".to_string());

        let changes = diff_records(&old, &new);
        assert_eq!(changes.len(), 2);
        assert!(changes.iter().any(|c| c.field == "price" && c.new_value == "195000"));
        assert!(changes.iter().any(|c| c.field == "district" && c.old_value.is_empty()));
    }

    #[test]
    fn test_diff_empty_for_identical() {
        assert!(diff_records(&record(1.0), &record(1.0)).is_empty());
    }
}
