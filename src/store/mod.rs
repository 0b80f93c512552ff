//! Persistent listing store (SQLite)
//!
//! Writes go through the change detector: a new observation either inserts,
//! bumps a consecutive-unchanged counter, or records field-level diffs in
//! the append-only change log (plus the bounded price history when the
//! price moved). WAL mode keeps readers concurrent; busy writers retry with
//! jittered backoff.

pub mod change_detector;
pub mod listing;

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use log::{debug, info, warn};
use rand::Rng;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};

pub use change_detector::{FieldChange, compute_fingerprint, diff_records};
pub use listing::ListingRecord;

/// SQL schema for the listing store
const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS listings (
    site TEXT NOT NULL,
    external_id TEXT NOT NULL,
    url TEXT NOT NULL,
    title TEXT,
    price REAL,
    area_sqm REAL,
    rooms INTEGER,
    city TEXT,
    district TEXT,
    record_json TEXT NOT NULL,
    content_fingerprint TEXT NOT NULL,
    consecutive_unchanged INTEGER NOT NULL DEFAULT 0,
    first_seen_at INTEGER NOT NULL,
    last_seen_at INTEGER NOT NULL,
    PRIMARY KEY (site, external_id)
);

CREATE INDEX IF NOT EXISTS idx_listings_site ON listings(site);
CREATE INDEX IF NOT EXISTS idx_listings_price ON listings(price);

CREATE TABLE IF NOT EXISTS scrape_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id TEXT NOT NULL,
    site TEXT NOT NULL,
    started_at INTEGER NOT NULL,
    finished_at INTEGER,
    urls_processed INTEGER NOT NULL DEFAULT 0,
    succeeded INTEGER NOT NULL DEFAULT 0,
    failed INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS listing_changes (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    site TEXT NOT NULL,
    external_id TEXT NOT NULL,
    field TEXT NOT NULL,
    old_value TEXT NOT NULL,
    new_value TEXT NOT NULL,
    changed_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_changes_listing ON listing_changes(site, external_id);

CREATE TABLE IF NOT EXISTS price_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    site TEXT NOT NULL,
    external_id TEXT NOT NULL,
    price REAL NOT NULL,
    recorded_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_price_history_listing ON price_history(site, external_id);
"#;

/// Outcome of writing one observation through the change detector
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// First observation of this listing
    Inserted,
    /// Fingerprint matched; consecutive-unchanged counter bumped
    Unchanged,
    /// Tracked fields differed; diffs recorded
    Changed { fields: Vec<String>, price_changed: bool },
}

/// The listing store handle
#[derive(Clone)]
pub struct ListingStore {
    pool: SqlitePool,
}

impl ListingStore {
    /// Open or create the database and run idempotent migrations
    pub async fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .context("Failed to create database directory")?;
        }

        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .context("Failed to open listing database")?;

        sqlx::query(SCHEMA_SQL)
            .execute(&pool)
            .await
            .context("Failed to initialize listing schema")?;

        info!("Listing store open at {}", db_path.display());
        Ok(Self { pool })
    }

    /// In-memory store for tests
    pub async fn open_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(":memory:")
            .journal_mode(SqliteJournalMode::Memory);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .context("Failed to open in-memory database")?;
        sqlx::query(SCHEMA_SQL)
            .execute(&pool)
            .await
            .context("Failed to initialize listing schema")?;
        Ok(Self { pool })
    }

    /// Write one observation through the change detector
    ///
    /// Idempotent for identical observations: an equal fingerprint touches
    /// only `last_seen_at` and the unchanged counter, never the change log.
    pub async fn upsert_listing(&self, record: &ListingRecord) -> Result<UpsertOutcome> {
        let mut attempt = 0u32;
        loop {
            match self.upsert_once(record).await {
                Ok(outcome) => return Ok(outcome),
                Err(e) if is_busy(&e) && attempt < 5 => {
                    attempt += 1;
                    let backoff = busy_backoff(attempt);
                    debug!("Database busy, retrying upsert in {backoff:?} (attempt {attempt})");
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => return Err(anyhow::Error::new(e).context("Listing upsert failed")),
            }
        }
    }

    async fn upsert_once(&self, record: &ListingRecord) -> Result<UpsertOutcome, sqlx::Error> {
        let fingerprint = format!("{:016x}", compute_fingerprint(record));
        let now = Utc::now().timestamp();
        let record_json = serde_json::to_string(record)
            .map_err(|e| sqlx::Error::Encode(Box::new(e)))?;

        let mut tx = self.pool.begin().await?;

        let existing = sqlx::query(
            "SELECT record_json, content_fingerprint FROM listings WHERE site = ? AND external_id = ?",
        )
        .bind(&record.site)
        .bind(&record.external_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = existing else {
            sqlx::query(
                r"INSERT INTO listings
                  (site, external_id, url, title, price, area_sqm, rooms, city, district,
                   record_json, content_fingerprint, consecutive_unchanged, first_seen_at, last_seen_at)
                  VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?, ?)",
            )
            .bind(&record.site)
            .bind(&record.external_id)
            .bind(&record.url)
            .bind(&record.title)
            .bind(record.price)
            .bind(record.area_sqm)
            .bind(record.rooms)
            .bind(&record.city)
            .bind(&record.district)
            .bind(&record_json)
            .bind(&fingerprint)
            .bind(now)
            .bind(now)
            .execute(&mut *tx)
            .await?;

            if let Some(price) = record.price {
                self.append_price(&mut tx, record, price, now).await?;
            }

            tx.commit().await?;
            return Ok(UpsertOutcome::Inserted);
        };

        let stored_fingerprint: String = row.get("content_fingerprint");
        if stored_fingerprint == fingerprint {
            sqlx::query(
                r"UPDATE listings
                  SET consecutive_unchanged = consecutive_unchanged + 1, last_seen_at = ?
                  WHERE site = ? AND external_id = ?",
            )
            .bind(now)
            .bind(&record.site)
            .bind(&record.external_id)
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;
            return Ok(UpsertOutcome::Unchanged);
        }

        let stored_json: String = row.get("record_json");
        let stored_record: ListingRecord = serde_json::from_str(&stored_json)
            .map_err(|e| sqlx::Error::Decode(Box::new(e)))?;

        let changes = diff_records(&stored_record, record);
        let price_changed = changes.iter().any(|c| c.field == "price");

        sqlx::query(
            r"UPDATE listings
              SET url = ?, title = ?, price = ?, area_sqm = ?, rooms = ?, city = ?, district = ?,
                  record_json = ?, content_fingerprint = ?, consecutive_unchanged = 0, last_seen_at = ?
              WHERE site = ? AND external_id = ?",
        )
        .bind(&record.url)
        .bind(&record.title)
        .bind(record.price)
        .bind(record.area_sqm)
        .bind(record.rooms)
        .bind(&record.city)
        .bind(&record.district)
        .bind(&record_json)
        .bind(&fingerprint)
        .bind(now)
        .bind(&record.site)
        .bind(&record.external_id)
        .execute(&mut *tx)
        .await?;

        for change in &changes {
            sqlx::query(
                r"INSERT INTO listing_changes (site, external_id, field, old_value, new_value, changed_at)
                  VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(&record.site)
            .bind(&record.external_id)
            .bind(&change.field)
            .bind(&change.old_value)
            .bind(&change.new_value)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        if price_changed && let Some(price) = record.price {
            self.append_price(&mut tx, record, price, now).await?;
        }

        tx.commit().await?;
        Ok(UpsertOutcome::Changed {
            fields: changes.into_iter().map(|c| c.field).collect(),
            price_changed,
        })
    }

    /// Append a price point and trim the history to its bound
    async fn append_price(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        record: &ListingRecord,
        price: f64,
        now: i64,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO price_history (site, external_id, price, recorded_at) VALUES (?, ?, ?, ?)",
        )
        .bind(&record.site)
        .bind(&record.external_id)
        .bind(price)
        .bind(now)
        .execute(&mut **tx)
        .await?;

        sqlx::query(
            r"DELETE FROM price_history
              WHERE site = ? AND external_id = ? AND id NOT IN (
                  SELECT id FROM price_history
                  WHERE site = ? AND external_id = ?
                  ORDER BY id DESC LIMIT ?
              )",
        )
        .bind(&record.site)
        .bind(&record.external_id)
        .bind(&record.site)
        .bind(&record.external_id)
        .bind(crate::utils::PRICE_HISTORY_LIMIT as i64)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }

    /// Price points for a listing, oldest first
    pub async fn price_history(&self, site: &str, external_id: &str) -> Result<Vec<f64>> {
        let rows = sqlx::query(
            "SELECT price FROM price_history WHERE site = ? AND external_id = ? ORDER BY id ASC",
        )
        .bind(site)
        .bind(external_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to read price history")?;
        Ok(rows.iter().map(|r| r.get("price")).collect())
    }

    /// Change-log row count for a listing
    pub async fn change_count(&self, site: &str, external_id: &str) -> Result<i64> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM listing_changes WHERE site = ? AND external_id = ?",
        )
        .bind(site)
        .bind(external_id)
        .fetch_one(&self.pool)
        .await
        .context("Failed to count changes")?;
        Ok(row.get("n"))
    }

    /// Open a scrape_history row for a site; returns its id
    pub async fn record_run_start(&self, run_id: &str, site: &str) -> Result<i64> {
        let result = sqlx::query(
            "INSERT INTO scrape_history (run_id, site, started_at) VALUES (?, ?, ?)",
        )
        .bind(run_id)
        .bind(site)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await
        .context("Failed to record run start")?;
        Ok(result.last_insert_rowid())
    }

    /// Close a scrape_history row with final counters
    pub async fn record_run_finish(
        &self,
        history_id: i64,
        processed: u64,
        succeeded: u64,
        failed: u64,
    ) -> Result<()> {
        sqlx::query(
            r"UPDATE scrape_history
              SET finished_at = ?, urls_processed = ?, succeeded = ?, failed = ?
              WHERE id = ?",
        )
        .bind(Utc::now().timestamp())
        .bind(processed as i64)
        .bind(succeeded as i64)
        .bind(failed as i64)
        .bind(history_id)
        .execute(&self.pool)
        .await
        .context("Failed to record run finish")?;
        Ok(())
    }

    /// Close the pool
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Whether a sqlx error is a transient SQLITE_BUSY/LOCKED
fn is_busy(error: &sqlx::Error) -> bool {
    match error {
        sqlx::Error::Database(db) => {
            let msg = db.message().to_lowercase();
            msg.contains("locked") || msg.contains("busy")
        }
        _ => false,
    }
}

/// Jittered backoff for busy retries
fn busy_backoff(attempt: u32) -> Duration {
    let base_ms = 50u64.saturating_mul(1 << attempt.min(6));
    let jitter_ms = rand::rng().random_range(0..base_ms.max(1));
    Duration::from_millis(base_ms + jitter_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn listing(price: f64) -> ListingRecord {
        let mut r = ListingRecord::new("site_a", "L1", "https://a.example/listing/1");
        r.title = Some("Two-bedroom near the park".to_string());
        r.price = Some(price);
        r.rooms = Some(2);
        r.city = Some("Springfield".to_string());
        r
    }

    #[tokio::test]
    async fn test_insert_then_unchanged() {
        let store = ListingStore::open_in_memory().await.expect("store");

        assert_eq!(
            store.upsert_listing(&listing(200_000.0)).await.expect("insert"),
            UpsertOutcome::Inserted
        );
        assert_eq!(
            store.upsert_listing(&listing(200_000.0)).await.expect("re-observe"),
            UpsertOutcome::Unchanged
        );
        assert_eq!(store.change_count("site_a", "L1").await.expect("count"), 0);
    }

    #[tokio::test]
    async fn test_price_change_scenario() {
        let store = ListingStore::open_in_memory().await.expect("store");

        store.upsert_listing(&listing(200_000.0)).await.expect("first");
        let outcome = store.upsert_listing(&listing(195_000.0)).await.expect("second");
        match outcome {
            UpsertOutcome::Changed { price_changed, .. } => assert!(price_changed),
            other => panic!("expected Changed, got {other:?}"),
        }
        store.upsert_listing(&listing(195_000.0)).await.expect("third");

        // price_history = [200000, 195000]; one change-log append; third
        // observation left the fingerprint untouched
        assert_eq!(
            store.price_history("site_a", "L1").await.expect("history"),
            vec![200_000.0, 195_000.0]
        );
        assert_eq!(store.change_count("site_a", "L1").await.expect("count"), 1);
    }

    #[tokio::test]
    async fn test_price_history_bounded() {
        let store = ListingStore::open_in_memory().await.expect("store");
        for i in 0..15 {
            store
                .upsert_listing(&listing(100_000.0 + f64::from(i) * 1000.0))
                .await
                .expect("upsert");
        }
        let history = store.price_history("site_a", "L1").await.expect("history");
        assert_eq!(history.len(), crate::utils::PRICE_HISTORY_LIMIT);
        assert_eq!(*history.last().expect("nonempty"), 114_000.0);
    }

    #[tokio::test]
    async fn test_run_history_roundtrip() {
        let store = ListingStore::open_in_memory().await.expect("store");
        let id = store.record_run_start("run-1", "site_a").await.expect("start");
        store.record_run_finish(id, 50, 40, 10).await.expect("finish");
    }
}
