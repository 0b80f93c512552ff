//! Checkpoint store integration tests: crash-resume semantics

use std::collections::BTreeSet;

use propharvest::checkpoint::{
    CheckpointSnapshot, CheckpointStore, FailureRecord, PendingUrl,
};
use propharvest::error::HarvestError;
use propharvest::resilience::ErrorKind;

fn url(i: usize) -> String {
    format!("https://site-a.example/listing/{i}")
}

/// Fifty seeds: ten completed, seven failed one retryable cycle (back in
/// pending with attempts=1), thirty-three untouched. The restored snapshot
/// must reproduce exactly that state.
#[tokio::test]
async fn test_crash_resume_scenario() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = CheckpointStore::open_dir(dir.path()).await.expect("store");
    let handle = store.open("site_a");

    let seeds: Vec<String> = (0..50).map(url).collect();
    let mut snapshot = CheckpointSnapshot::new("site_a", seeds.clone());

    // Ten completed
    for i in 0..10 {
        snapshot.pending_urls.retain(|p| p.url != url(i));
        snapshot.completed_urls.insert(url(i));
    }
    // Seven failed once, retryable: attempts bumped, still pending
    for i in 10..17 {
        for pending in &mut snapshot.pending_urls {
            if pending.url == url(i) {
                pending.attempts = 1;
                pending.last_error_kind = Some(ErrorKind::NetworkTimeout);
            }
        }
    }

    // SIGTERM: final save before exit
    store.save(&handle, &snapshot).await.expect("save");

    // Restart
    let restored = store
        .restore("site_a")
        .await
        .expect("restore")
        .expect("snapshot present");

    assert_eq!(restored.completed_urls.len(), 10);
    assert_eq!(restored.pending_urls.len(), 40);

    let once_failed: Vec<_> = restored
        .pending_urls
        .iter()
        .filter(|p| p.attempts == 1)
        .collect();
    assert_eq!(once_failed.len(), 7);
    assert!(
        once_failed
            .iter()
            .all(|p| p.last_error_kind == Some(ErrorKind::NetworkTimeout))
    );
    assert_eq!(
        restored.pending_urls.iter().filter(|p| p.attempts == 0).count(),
        33
    );

    // Set algebra: pending = issued \ (completed ∪ failed)
    let issued = restored.issued();
    assert_eq!(issued, seeds.into_iter().collect::<BTreeSet<_>>());
    for pending in &restored.pending_urls {
        assert!(!restored.completed_urls.contains(&pending.url));
        assert!(!restored.failed_urls.contains_key(&pending.url));
    }
}

#[tokio::test]
async fn test_failed_urls_survive_for_next_run() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = CheckpointStore::open_dir(dir.path()).await.expect("store");
    let handle = store.open("site_a");

    let mut snapshot = CheckpointSnapshot::new("site_a", vec![url(1), url(2)]);
    snapshot.pending_urls.retain(|p| p.url != url(1));
    snapshot.failed_urls.insert(
        url(1),
        FailureRecord {
            attempts: 2,
            last_error_kind: ErrorKind::Blocked,
        },
    );
    store.save(&handle, &snapshot).await.expect("save");

    // close(clean=false) keeps the file
    store.close(handle, false).await.expect("close");
    let restored = store
        .restore("site_a")
        .await
        .expect("restore")
        .expect("still present");
    assert_eq!(
        restored.failed_urls.get(&url(1)),
        Some(&FailureRecord {
            attempts: 2,
            last_error_kind: ErrorKind::Blocked,
        })
    );
}

#[tokio::test]
async fn test_repeated_saves_keep_latest() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = CheckpointStore::open_dir(dir.path()).await.expect("store");
    let handle = store.open("site_a");

    let mut snapshot = CheckpointSnapshot::new("site_a", (0..5).map(url).collect());
    store.save(&handle, &snapshot).await.expect("save 1");

    snapshot.completed_urls.insert(url(0));
    snapshot.pending_urls.retain(|p| p.url != url(0));
    store.save(&handle, &snapshot).await.expect("save 2");

    let restored = store
        .restore("site_a")
        .await
        .expect("restore")
        .expect("present");
    assert!(restored.completed_urls.contains(&url(0)));
    assert_eq!(restored.pending_urls.len(), 4);
}

#[tokio::test]
async fn test_sites_are_isolated() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = CheckpointStore::open_dir(dir.path()).await.expect("store");

    let a = store.open("site_a");
    let b = store.open("site_b");
    store
        .save(&a, &CheckpointSnapshot::new("site_a", vec![url(1)]))
        .await
        .expect("save a");
    store
        .save(&b, &CheckpointSnapshot::new("site_b", vec![url(2)]))
        .await
        .expect("save b");

    store.close(a, true).await.expect("close a");
    assert!(store.restore("site_a").await.expect("restore a").is_none());
    assert!(store.restore("site_b").await.expect("restore b").is_some());
}

#[tokio::test]
async fn test_corrupt_checkpoint_is_not_silently_ignored() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = CheckpointStore::open_dir(dir.path()).await.expect("store");

    tokio::fs::write(
        dir.path().join("site_a.checkpoint.json"),
        b"{\"pending_urls\": [truncated",
    )
    .await
    .expect("write corrupt file");

    match store.restore("site_a").await {
        Err(HarvestError::CheckpointCorrupt { path, .. }) => {
            assert!(path.ends_with("site_a.checkpoint.json"));
        }
        other => panic!("expected CheckpointCorrupt, got {other:?}"),
    }

    // A pristine PendingUrl list round-trips through serde unchanged
    let pending = PendingUrl::new(url(9));
    let json = serde_json::to_string(&pending).expect("serialize");
    assert_eq!(serde_json::from_str::<PendingUrl>(&json).expect("parse"), pending);
}
