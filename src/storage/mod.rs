//! Persistence and caching.
//!
//! - [`ItemRepository`]: deduplicating store for [`ContentItem`]s, backed by
//!   SQLite in [`SqliteRepository`].
//! - [`TtlCache`]: the generic cache behind both cache tiers.
//!
//! ## Cache Tiers
//!
//! ```text
//! metadata  version:{source}                          long TTL
//! output    feed:{source|*}:{format}:{limit}:{cat|*}  short TTL
//! ```

pub mod cache;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::Result;
use crate::models::{CacheConfig, ContentItem};
use crate::render::FeedDocument;

// Re-export for convenience
pub use cache::{CacheStats, TtlCache};
pub use sqlite::SqliteRepository;

/// Per-batch counts returned by [`ItemRepository::upsert_many`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UpsertOutcome {
    /// Guids stored for the first time
    pub inserted: usize,
    /// Known guids whose content changed
    pub updated: usize,
    /// Known guids re-seen with identical content
    pub unchanged: usize,
}

/// Filter for [`ItemRepository::query`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ItemQuery {
    /// Restrict to one source; `None` spans all sources
    pub source: Option<String>,
    /// Restrict to items tagged with this category (case-insensitive)
    pub category: Option<String>,
    pub limit: usize,
}

/// Trait for content item stores.
///
/// Implementations must make `upsert_many` atomic per batch and idempotent:
/// re-submitting a batch never creates a second row for a `(source_id, guid)`.
#[async_trait]
pub trait ItemRepository: Send + Sync {
    /// Insert or update a batch of items belonging to `source_id`.
    async fn upsert_many(&self, source_id: &str, items: Vec<ContentItem>)
    -> Result<UpsertOutcome>;

    /// Items ordered by `published_at` descending, ties by `guid` then
    /// `source_id` ascending.
    async fn query(&self, query: &ItemQuery) -> Result<Vec<ContentItem>>;

    /// Number of stored items, optionally for one source.
    async fn count(&self, source: Option<&str>) -> Result<u64>;

    /// Newest publication time stored for a source.
    async fn latest_published(&self, source: &str) -> Result<Option<DateTime<Utc>>>;
}

/// The two cache tiers shared by the orchestrator and the feed generator.
#[derive(Clone)]
pub struct CacheTiers {
    /// Upstream version tokens; `None` for unversioned sources
    pub metadata: TtlCache<Option<String>>,
    /// Rendered feed documents
    pub output: TtlCache<FeedDocument>,
    pub config: CacheConfig,
}

impl CacheTiers {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            metadata: TtlCache::new("metadata"),
            output: TtlCache::new("output"),
            config,
        }
    }

    /// Key of a source's version token in the metadata tier.
    pub fn version_key(source_id: &str) -> String {
        format!("version:{source_id}")
    }

    /// Drop every rendered document that can contain items of `source_id`.
    ///
    /// Aggregated documents span all sources, so they go too.
    pub fn invalidate_source_output(&self, source_id: &str) -> usize {
        self.output.invalidate(&format!("feed:{source_id}:"))
            + self.output.invalidate("feed:*:")
    }

    /// Start the expired-entry sweepers when an interval is configured.
    pub fn spawn_sweepers(&self) -> Vec<tokio::task::JoinHandle<()>> {
        if self.config.sweep_interval_secs == 0 {
            return Vec::new();
        }
        let interval = std::time::Duration::from_secs(self.config.sweep_interval_secs);
        vec![
            self.metadata.spawn_sweeper(interval),
            self.output.spawn_sweeper(interval),
        ]
    }

    pub fn stats(&self) -> TierStats {
        TierStats {
            metadata: self.metadata.stats(),
            output: self.output.stats(),
        }
    }
}

/// Counters of both tiers, for status reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TierStats {
    pub metadata: CacheStats,
    pub output: CacheStats,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::FeedFormat;
    use std::time::Duration;

    fn doc(body: &str) -> FeedDocument {
        FeedDocument::new(FeedFormat::Rss, body.to_string())
    }

    #[tokio::test]
    async fn test_invalidate_source_output_keeps_other_sources() {
        let tiers = CacheTiers::new(CacheConfig::default());
        let ttl = Duration::from_secs(60);
        tiers.output.set("feed:en:rss:10:*", doc("en"), ttl);
        tiers.output.set("feed:de:rss:10:*", doc("de"), ttl);
        tiers.output.set("feed:*:rss:10:*", doc("all"), ttl);

        assert_eq!(tiers.invalidate_source_output("en"), 2);
        assert!(tiers.output.get("feed:de:rss:10:*").is_some());
        assert!(tiers.output.get("feed:*:rss:10:*").is_none());
    }
}
