//! SQLite-backed deduplicating item repository.
//!
//! ## Schema
//!
//! ```text
//! items            (source_id, guid) PRIMARY KEY, published_at as Unix millis,
//!                  categories as an ordered JSON array, content fingerprint
//! item_categories  (source_id, guid, category COLLATE NOCASE), for filtering
//! ```
//!
//! Each `upsert_many` call is one transaction. A re-seen guid is updated in
//! place; the fingerprint decides whether it counts as updated or unchanged.
//!
//! SQLite allows one writer per database, and a deferred transaction that
//! upgrades from read to write fails with `SQLITE_BUSY` instead of waiting.
//! Write transactions are therefore serialised across the whole repository;
//! reads run concurrently on the other pool connections (WAL).

use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::{FromRow, Sqlite, Transaction};

use crate::error::{AppError, Result};
use crate::models::ContentItem;
use crate::storage::{ItemQuery, ItemRepository, UpsertOutcome};

const MIGRATIONS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS items (
        source_id     TEXT    NOT NULL,
        guid          TEXT    NOT NULL,
        title         TEXT    NOT NULL,
        link          TEXT    NOT NULL,
        published_at  INTEGER NOT NULL,
        summary       TEXT    NOT NULL,
        categories    TEXT    NOT NULL,
        image_url     TEXT,
        fingerprint   TEXT    NOT NULL,
        first_seen_at INTEGER NOT NULL,
        updated_at    INTEGER NOT NULL,
        PRIMARY KEY (source_id, guid)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS item_categories (
        source_id TEXT NOT NULL,
        guid      TEXT NOT NULL,
        category  TEXT NOT NULL COLLATE NOCASE,
        PRIMARY KEY (source_id, guid, category),
        FOREIGN KEY (source_id, guid) REFERENCES items (source_id, guid) ON DELETE CASCADE
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_items_source_published ON items (source_id, published_at DESC, guid)",
    "CREATE INDEX IF NOT EXISTS idx_items_published ON items (published_at DESC, guid)",
    "CREATE INDEX IF NOT EXISTS idx_item_categories_category ON item_categories (category)",
];

const UPSERT_ITEM: &str = r#"
    INSERT INTO items (
        source_id, guid, title, link, published_at, summary,
        categories, image_url, fingerprint, first_seen_at, updated_at
    )
    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)
    ON CONFLICT (source_id, guid) DO UPDATE SET
        title        = excluded.title,
        link         = excluded.link,
        published_at = excluded.published_at,
        summary      = excluded.summary,
        categories   = excluded.categories,
        image_url    = excluded.image_url,
        fingerprint  = excluded.fingerprint,
        updated_at   = excluded.updated_at
"#;

const SELECT_ITEMS: &str = r#"
    SELECT source_id, guid, title, link, published_at, summary, categories, image_url
    FROM items AS i
    WHERE (?1 IS NULL OR i.source_id = ?1)
      AND (?2 IS NULL OR EXISTS (
            SELECT 1 FROM item_categories AS c
            WHERE c.source_id = i.source_id AND c.guid = i.guid AND c.category = ?2
          ))
    ORDER BY i.published_at DESC, i.guid ASC, i.source_id ASC
    LIMIT ?3
"#;

#[derive(Debug, FromRow)]
struct ItemRow {
    source_id: String,
    guid: String,
    title: String,
    link: String,
    published_at: i64,
    summary: String,
    categories: String,
    image_url: Option<String>,
}

impl TryFrom<ItemRow> for ContentItem {
    type Error = AppError;

    fn try_from(row: ItemRow) -> Result<Self> {
        let published_at = DateTime::<Utc>::from_timestamp_millis(row.published_at)
            .ok_or_else(|| {
                AppError::validation(format!(
                    "stored item {}/{} has an out-of-range timestamp",
                    row.source_id, row.guid
                ))
            })?;
        Ok(ContentItem {
            categories: serde_json::from_str(&row.categories)?,
            source_id: row.source_id,
            guid: row.guid,
            title: row.title,
            link: row.link,
            published_at,
            summary: row.summary,
            image_url: row.image_url,
        })
    }
}

/// Item repository on an embedded SQLite database.
#[derive(Clone)]
pub struct SqliteRepository {
    pool: SqlitePool,
    write_lock: Arc<tokio::sync::Mutex<()>>,
}

impl SqliteRepository {
    /// Open (or create) the database file and run migrations.
    pub async fn open(path: impl AsRef<Path>, max_connections: u32) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5))
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(options)
            .await?;

        log::info!("Opened item database at {}", path.display());
        Self::with_pool(pool).await
    }

    /// Private in-memory database, for tests and dry runs.
    ///
    /// Pinned to one connection that never idles out, since every SQLite
    /// in-memory connection is its own database.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        Self::with_pool(pool).await
    }

    async fn with_pool(pool: SqlitePool) -> Result<Self> {
        for statement in MIGRATIONS {
            sqlx::query(statement).execute(&pool).await?;
        }
        Ok(Self {
            pool,
            write_lock: Arc::new(tokio::sync::Mutex::new(())),
        })
    }

    async fn upsert_one(
        tx: &mut Transaction<'_, Sqlite>,
        item: &ContentItem,
        now_millis: i64,
    ) -> Result<Change> {
        let fingerprint = item.fingerprint();
        let existing: Option<String> =
            sqlx::query_scalar("SELECT fingerprint FROM items WHERE source_id = ?1 AND guid = ?2")
                .bind(&item.source_id)
                .bind(&item.guid)
                .fetch_optional(&mut **tx)
                .await?;

        let change = match existing {
            None => Change::Inserted,
            Some(previous) if previous == fingerprint => return Ok(Change::Unchanged),
            Some(_) => Change::Updated,
        };

        sqlx::query(UPSERT_ITEM)
            .bind(&item.source_id)
            .bind(&item.guid)
            .bind(&item.title)
            .bind(&item.link)
            .bind(item.published_at.timestamp_millis())
            .bind(&item.summary)
            .bind(serde_json::to_string(&item.categories)?)
            .bind(&item.image_url)
            .bind(&fingerprint)
            .bind(now_millis)
            .execute(&mut **tx)
            .await?;

        sqlx::query("DELETE FROM item_categories WHERE source_id = ?1 AND guid = ?2")
            .bind(&item.source_id)
            .bind(&item.guid)
            .execute(&mut **tx)
            .await?;
        for category in &item.categories {
            sqlx::query(
                "INSERT OR IGNORE INTO item_categories (source_id, guid, category) VALUES (?1, ?2, ?3)",
            )
            .bind(&item.source_id)
            .bind(&item.guid)
            .bind(category)
            .execute(&mut **tx)
            .await?;
        }

        Ok(change)
    }
}

enum Change {
    Inserted,
    Updated,
    Unchanged,
}

/// Keep only the last occurrence of each guid, preserving batch order.
fn last_occurrence_per_guid(items: Vec<ContentItem>) -> Vec<ContentItem> {
    let mut last_index: HashMap<String, usize> = HashMap::with_capacity(items.len());
    for (index, item) in items.iter().enumerate() {
        last_index.insert(item.guid.clone(), index);
    }
    items
        .into_iter()
        .enumerate()
        .filter(|(index, item)| last_index.get(&item.guid) == Some(index))
        .map(|(_, item)| item)
        .collect()
}

#[async_trait]
impl ItemRepository for SqliteRepository {
    async fn upsert_many(
        &self,
        source_id: &str,
        items: Vec<ContentItem>,
    ) -> Result<UpsertOutcome> {
        if let Some(stray) = items.iter().find(|i| i.source_id != source_id) {
            return Err(AppError::validation(format!(
                "item {} belongs to source '{}', not '{}'",
                stray.guid, stray.source_id, source_id
            )));
        }
        let items = last_occurrence_per_guid(items);
        if items.is_empty() {
            return Ok(UpsertOutcome::default());
        }

        let _writer = self.write_lock.lock().await;

        let now_millis = Utc::now().timestamp_millis();
        let mut outcome = UpsertOutcome::default();
        let mut tx = self.pool.begin().await?;
        for item in &items {
            let change = match Self::upsert_one(&mut tx, item, now_millis).await {
                Ok(change) => change,
                Err(e) => {
                    if let Err(rollback) = tx.rollback().await {
                        log::warn!("Rollback of {} batch failed: {}", source_id, rollback);
                    }
                    return Err(e);
                }
            };
            match change {
                Change::Inserted => outcome.inserted += 1,
                Change::Updated => outcome.updated += 1,
                Change::Unchanged => outcome.unchanged += 1,
            }
        }
        tx.commit().await?;

        log::debug!(
            "Upserted {} items for {}: {} new, {} updated, {} unchanged",
            items.len(),
            source_id,
            outcome.inserted,
            outcome.updated,
            outcome.unchanged
        );
        Ok(outcome)
    }

    async fn query(&self, query: &ItemQuery) -> Result<Vec<ContentItem>> {
        if query.limit == 0 {
            return Ok(Vec::new());
        }
        let limit = i64::try_from(query.limit).unwrap_or(i64::MAX);
        let rows: Vec<ItemRow> = sqlx::query_as(SELECT_ITEMS)
            .bind(query.source.as_deref())
            .bind(query.category.as_deref())
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(ContentItem::try_from).collect()
    }

    async fn count(&self, source: Option<&str>) -> Result<u64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM items WHERE (?1 IS NULL OR source_id = ?1)")
                .bind(source)
                .fetch_one(&self.pool)
                .await?;
        Ok(u64::try_from(count).unwrap_or_default())
    }

    async fn latest_published(&self, source: &str) -> Result<Option<DateTime<Utc>>> {
        let millis: Option<i64> =
            sqlx::query_scalar("SELECT MAX(published_at) FROM items WHERE source_id = ?1")
                .bind(source)
                .fetch_one(&self.pool)
                .await?;
        Ok(millis.and_then(DateTime::<Utc>::from_timestamp_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn item(source: &str, guid: &str, minute: u32) -> ContentItem {
        ContentItem {
            source_id: source.to_string(),
            guid: guid.to_string(),
            title: format!("Item {guid}"),
            link: format!("https://example.com/{source}/{guid}"),
            published_at: Utc.with_ymd_and_hms(2026, 2, 1, 10, minute, 0).unwrap(),
            summary: String::new(),
            categories: vec!["News".to_string()],
            image_url: None,
        }
    }

    fn query(source: Option<&str>, category: Option<&str>, limit: usize) -> ItemQuery {
        ItemQuery {
            source: source.map(str::to_string),
            category: category.map(str::to_string),
            limit,
        }
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent() {
        let repo = SqliteRepository::in_memory().await.unwrap();
        let batch = vec![item("en", "a", 1), item("en", "b", 2)];

        let first = repo.upsert_many("en", batch.clone()).await.unwrap();
        assert_eq!(first.inserted, 2);

        let second = repo.upsert_many("en", batch).await.unwrap();
        assert_eq!(second.inserted, 0);
        assert_eq!(second.updated, 0);
        assert_eq!(second.unchanged, 2);
        assert_eq!(repo.count(Some("en")).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_changed_content_counts_as_update() {
        let repo = SqliteRepository::in_memory().await.unwrap();
        repo.upsert_many("en", vec![item("en", "a", 1)]).await.unwrap();

        let mut edited = item("en", "a", 1);
        edited.title = "Corrected title".into();
        let outcome = repo.upsert_many("en", vec![edited]).await.unwrap();
        assert_eq!(outcome.updated, 1);

        let stored = repo.query(&query(Some("en"), None, 10)).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].title, "Corrected title");
    }

    #[tokio::test]
    async fn test_query_orders_by_date_then_guid() {
        let repo = SqliteRepository::in_memory().await.unwrap();
        repo.upsert_many(
            "en",
            vec![
                item("en", "c", 5),
                item("en", "b", 5),
                item("en", "old", 1),
                item("en", "a", 5),
                item("en", "new", 9),
            ],
        )
        .await
        .unwrap();

        let guids: Vec<String> = repo
            .query(&query(Some("en"), None, 10))
            .await
            .unwrap()
            .into_iter()
            .map(|i| i.guid)
            .collect();
        assert_eq!(guids, vec!["new", "a", "b", "c", "old"]);

        let top: Vec<String> = repo
            .query(&query(Some("en"), None, 2))
            .await
            .unwrap()
            .into_iter()
            .map(|i| i.guid)
            .collect();
        assert_eq!(top, vec!["new", "a"]);
    }

    #[tokio::test]
    async fn test_category_filter_ignores_case() {
        let repo = SqliteRepository::in_memory().await.unwrap();
        let mut tech = item("en", "t", 2);
        tech.categories = vec!["Tech".into()];
        repo.upsert_many("en", vec![item("en", "n", 1), tech])
            .await
            .unwrap();

        let found = repo.query(&query(None, Some("tech"), 10)).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].guid, "t");
        assert_eq!(found[0].categories, vec!["Tech".to_string()]);
    }

    #[tokio::test]
    async fn test_sources_are_independent() {
        let repo = SqliteRepository::in_memory().await.unwrap();
        repo.upsert_many("en", vec![item("en", "x", 1)]).await.unwrap();
        let outcome = repo.upsert_many("de", vec![item("de", "x", 1)]).await.unwrap();
        assert_eq!(outcome.inserted, 1);
        assert_eq!(repo.count(None).await.unwrap(), 2);
        assert_eq!(repo.query(&query(Some("de"), None, 10)).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_guid_in_batch_keeps_last() {
        let repo = SqliteRepository::in_memory().await.unwrap();
        let mut later = item("en", "a", 1);
        later.summary = "second".into();
        let outcome = repo
            .upsert_many("en", vec![item("en", "a", 1), later])
            .await
            .unwrap();
        assert_eq!(outcome.inserted, 1);

        let stored = repo.query(&query(Some("en"), None, 10)).await.unwrap();
        assert_eq!(stored[0].summary, "second");
    }

    #[tokio::test]
    async fn test_rejects_item_from_other_source() {
        let repo = SqliteRepository::in_memory().await.unwrap();
        let result = repo.upsert_many("en", vec![item("de", "a", 1)]).await;
        assert!(matches!(result, Err(AppError::Validation(_))));
        assert_eq!(repo.count(None).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_equal_date_and_guid_across_sources_order_by_source() {
        let repo = SqliteRepository::in_memory().await.unwrap();
        repo.upsert_many("fr", vec![item("fr", "x", 4)]).await.unwrap();
        repo.upsert_many("de", vec![item("de", "x", 4)]).await.unwrap();
        repo.upsert_many("en", vec![item("en", "x", 4)]).await.unwrap();

        let sources: Vec<String> = repo
            .query(&query(None, None, 10))
            .await
            .unwrap()
            .into_iter()
            .map(|i| i.source_id)
            .collect();
        assert_eq!(sources, vec!["de", "en", "fr"]);
    }

    #[tokio::test]
    async fn test_failed_batch_leaves_no_partial_rows() {
        let repo = SqliteRepository::in_memory().await.unwrap();
        repo.upsert_many("en", vec![item("en", "a", 1)]).await.unwrap();
        sqlx::query(
            "CREATE TRIGGER reject_bad_guid BEFORE INSERT ON items WHEN NEW.guid = 'bad'
             BEGIN SELECT RAISE(ABORT, 'rejected'); END",
        )
        .execute(&repo.pool)
        .await
        .unwrap();

        let mut edited = item("en", "a", 1);
        edited.title = "Edited".into();
        let batch = vec![edited, item("en", "b", 2), item("en", "bad", 3), item("en", "c", 4)];
        let result = repo.upsert_many("en", batch).await;
        assert!(matches!(result, Err(AppError::Database(_))));

        let stored = repo.query(&query(Some("en"), None, 10)).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].guid, "a");
        assert_eq!(stored[0].title, "Item a");
        let categories: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM item_categories")
            .fetch_one(&repo.pool)
            .await
            .unwrap();
        assert_eq!(categories, 1);

        // The repository stays usable after the rollback.
        let outcome = repo.upsert_many("en", vec![item("en", "b", 2)]).await.unwrap();
        assert_eq!(outcome.inserted, 1);
    }

    #[tokio::test]
    async fn test_concurrent_sources_on_file_database() {
        let dir = TempDir::new().unwrap();
        let repo = SqliteRepository::open(dir.path().join("items.db"), 5)
            .await
            .unwrap();
        let sources = ["en", "de", "fr", "it", "es", "nl"];

        let batches = sources.iter().map(|source| {
            let repo = repo.clone();
            let batch: Vec<ContentItem> = (0..200)
                .map(|n| item(source, &format!("{source}-{n}"), n % 60))
                .collect();
            async move { repo.upsert_many(source, batch).await }
        });
        let outcomes = futures::future::join_all(batches).await;

        for (source, outcome) in sources.iter().zip(&outcomes) {
            match outcome {
                Ok(outcome) => assert_eq!(outcome.inserted, 200, "source {source}"),
                Err(e) => panic!("batch for {source} failed: {e}"),
            }
        }
        assert_eq!(repo.count(None).await.unwrap(), 1200);
    }

    #[tokio::test]
    async fn test_persists_across_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("db").join("items.db");

        {
            let repo = SqliteRepository::open(&path, 2).await.unwrap();
            repo.upsert_many("en", vec![item("en", "a", 3)]).await.unwrap();
        }

        let repo = SqliteRepository::open(&path, 2).await.unwrap();
        assert_eq!(repo.count(Some("en")).await.unwrap(), 1);
        assert_eq!(
            repo.latest_published("en").await.unwrap(),
            Some(Utc.with_ymd_and_hms(2026, 2, 1, 10, 3, 0).unwrap())
        );
        assert_eq!(repo.latest_published("de").await.unwrap(), None);
    }
}
