//! Listing store integration tests against a file-backed database

use propharvest::store::{ListingRecord, ListingStore, UpsertOutcome};

fn listing(external_id: &str, price: f64) -> ListingRecord {
    let mut record = ListingRecord::new(
        "metro_homes",
        external_id,
        format!("https://metro-homes.example/listing/{external_id}"),
    );
    record.title = Some("Sunny three-bedroom with garage".to_string());
    record.price = Some(price);
    record.currency = Some("EUR".to_string());
    record.area_sqm = Some(92.0);
    record.rooms = Some(3);
    record.city = Some("Springfield".to_string());
    record.district = Some("Riverside".to_string());
    record.features = vec!["garage".to_string(), "south-facing".to_string()];
    record
}

/// Scenario: first observed at 200000, then 195000, then 195000 again.
/// price_history = [200000, 195000], exactly one change-log append, and
/// the third observation leaves the fingerprint untouched.
#[tokio::test]
async fn test_price_change_history() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = ListingStore::open(&dir.path().join("listings.sqlite"))
        .await
        .expect("store");

    assert_eq!(
        store.upsert_listing(&listing("L1", 200_000.0)).await.expect("first"),
        UpsertOutcome::Inserted
    );

    match store.upsert_listing(&listing("L1", 195_000.0)).await.expect("second") {
        UpsertOutcome::Changed { fields, price_changed } => {
            assert!(price_changed);
            assert_eq!(fields, vec!["price".to_string()]);
        }
        other => panic!("expected Changed, got {other:?}"),
    }

    assert_eq!(
        store.upsert_listing(&listing("L1", 195_000.0)).await.expect("third"),
        UpsertOutcome::Unchanged
    );

    assert_eq!(
        store.price_history("metro_homes", "L1").await.expect("history"),
        vec![200_000.0, 195_000.0]
    );
    assert_eq!(store.change_count("metro_homes", "L1").await.expect("count"), 1);
}

/// Upsert followed by an identical upsert never appends to the change log
#[tokio::test]
async fn test_upsert_idempotence() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = ListingStore::open(&dir.path().join("listings.sqlite"))
        .await
        .expect("store");

    let record = listing("L2", 120_000.0);
    store.upsert_listing(&record).await.expect("insert");
    for _ in 0..5 {
        assert_eq!(
            store.upsert_listing(&record).await.expect("re-observe"),
            UpsertOutcome::Unchanged
        );
    }
    assert_eq!(store.change_count("metro_homes", "L2").await.expect("count"), 0);
    assert_eq!(
        store.price_history("metro_homes", "L2").await.expect("history").len(),
        1
    );
}

/// Volatile fields never produce a change-log entry
#[tokio::test]
async fn test_volatile_fields_do_not_churn() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = ListingStore::open(&dir.path().join("listings.sqlite"))
        .await
        .expect("store");

    let mut record = listing("L3", 99_000.0);
    store.upsert_listing(&record).await.expect("insert");

    record.observed_at = Some(chrono::Utc::now() + chrono::Duration::days(2));
    record.rank = Some(17);
    assert_eq!(
        store.upsert_listing(&record).await.expect("re-observe"),
        UpsertOutcome::Unchanged
    );
}

/// Listings from different sites never collide on external id
#[tokio::test]
async fn test_site_scoped_keys() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = ListingStore::open(&dir.path().join("listings.sqlite"))
        .await
        .expect("store");

    let mut other_site = listing("L1", 300_000.0);
    other_site.site = "city_estates".to_string();

    store.upsert_listing(&listing("L1", 200_000.0)).await.expect("site a");
    assert_eq!(
        store.upsert_listing(&other_site).await.expect("site b"),
        UpsertOutcome::Inserted
    );

    assert_eq!(
        store.price_history("metro_homes", "L1").await.expect("a"),
        vec![200_000.0]
    );
    assert_eq!(
        store.price_history("city_estates", "L1").await.expect("b"),
        vec![300_000.0]
    );
}
