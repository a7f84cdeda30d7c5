//! Feed document generation.
//!
//! Reads go through the output cache tier first. On a miss a single
//! populating call queries the repository and renders the document, which is
//! then shared by every concurrent caller for the same key.

use std::sync::Arc;

use chrono::Utc;
use url::Url;

use crate::error::{AppError, Result};
use crate::models::{Config, SourceConfig};
use crate::render::{self, Channel, FeedDocument, FeedFormat};
use crate::storage::{CacheTiers, ItemQuery, ItemRepository};
use crate::utils::resolve_url;

/// What to generate.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeedRequest {
    /// One source, or every source when `None`
    pub source: Option<String>,
    pub category: Option<String>,
    /// Requested item count; 0 selects the configured default
    pub limit: usize,
    pub format: FeedFormat,
}

impl FeedRequest {
    pub fn new(format: FeedFormat) -> Self {
        Self {
            format,
            ..Self::default()
        }
    }

    pub fn for_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn in_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }
}

/// Builds feed documents from stored items.
#[derive(Clone)]
pub struct FeedGenerator {
    repository: Arc<dyn ItemRepository>,
    cache: CacheTiers,
    config: Arc<Config>,
}

impl FeedGenerator {
    pub fn new(repository: Arc<dyn ItemRepository>, cache: CacheTiers, config: Arc<Config>) -> Self {
        Self {
            repository,
            cache,
            config,
        }
    }

    /// Clamp a requested limit into `[1, max_limit]`; 0 means the default.
    pub fn effective_limit(&self, requested: usize) -> usize {
        let feed = &self.config.feed;
        let limit = if requested == 0 {
            feed.default_limit
        } else {
            requested
        };
        limit.clamp(1, feed.max_limit.max(1))
    }

    /// Output-tier key; category matching ignores case, so the key does too.
    pub fn cache_key(source: Option<&str>, category: Option<&str>, limit: usize, format: FeedFormat) -> String {
        format!(
            "feed:{}:{}:{}:{}",
            source.unwrap_or("*"),
            format.as_str(),
            limit,
            category.map(str::to_lowercase).as_deref().unwrap_or("*")
        )
    }

    /// Generate (or serve from cache) the document for `request`.
    pub async fn generate(&self, request: &FeedRequest) -> Result<FeedDocument> {
        let source = match request.source.as_deref() {
            Some(id) => Some(
                self.config
                    .source(id)
                    .ok_or_else(|| AppError::UnknownSource(id.to_string()))?,
            ),
            None => None,
        };
        let category = request
            .category
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty());
        let limit = self.effective_limit(request.limit);
        let key = Self::cache_key(
            source.map(|s| s.id.as_str()),
            category,
            limit,
            request.format,
        );

        let query = ItemQuery {
            source: source.map(|s| s.id.clone()),
            category: category.map(str::to_string),
            limit,
        };
        let channel = self.channel(source, category);
        let base = Url::parse(&channel.link).ok();
        let format = request.format;
        let repository = Arc::clone(&self.repository);

        self.cache
            .output
            .get_or_try_insert_with(&key, self.cache.config.output_ttl(), move || async move {
                let mut items = repository.query(&query).await?;
                items.truncate(query.limit);
                if let Some(base) = &base {
                    for item in &mut items {
                        if Url::parse(&item.link).is_err() {
                            item.link = resolve_url(base, &item.link);
                        }
                    }
                }
                log::debug!(
                    "Rendering {} feed for {} with {} items",
                    format,
                    query.source.as_deref().unwrap_or("all sources"),
                    items.len()
                );
                render::render(format, &channel, &items, Utc::now())
            })
            .await
    }

    /// Channel metadata: per-source overrides over the global `[feed]` section.
    fn channel(&self, source: Option<&SourceConfig>, category: Option<&str>) -> Channel {
        let feed = &self.config.feed;
        let title = source
            .and_then(|s| s.title.clone())
            .unwrap_or_else(|| feed.title.clone());
        Channel {
            title: match category {
                Some(category) => format!("{title}: {category}"),
                None => title,
            },
            link: source
                .and_then(|s| s.base_url.clone())
                .unwrap_or_else(|| feed.link.clone()),
            description: source
                .and_then(|s| s.description.clone())
                .unwrap_or_else(|| feed.description.clone()),
            language: source
                .and_then(|s| s.language.clone())
                .or_else(|| feed.language.clone()),
        }
    }
}
