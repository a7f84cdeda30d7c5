//! One ingestion run over every configured source.
//!
//! ## Per-source flow
//!
//! ```text
//! breaker.execute(timeout(
//!     metadata tier: version token (single-flight)
//!     source.fetch(token)
//! ))
//! -> normalize (malformed items skipped)
//! -> repository.upsert_many (one transaction)
//! ```
//!
//! Sources are processed concurrently up to `fetch.max_concurrent`. A failing
//! or panicking source is recorded in the run and never affects the others. Once every
//! source is done, cached output of changed sources is invalidated and the
//! notification sink hears about sources with new items.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::{AppError, Result};
use crate::metrics;
use crate::models::{Config, ContentItem, RawItem, SourceResult, Trigger, UpdateRun};
use crate::pipeline::circuit_breaker::CircuitBreaker;
use crate::pipeline::scheduler::UpdateRunner;
use crate::services::{NotificationSink, Source};
use crate::storage::{CacheTiers, ItemRepository};

/// Runs ingestion for all sources.
pub struct UpdateOrchestrator {
    config: Arc<Config>,
    sources: Vec<Arc<dyn Source>>,
    repository: Arc<dyn ItemRepository>,
    breaker: Arc<CircuitBreaker>,
    cache: CacheTiers,
    notifier: Option<Arc<dyn NotificationSink>>,
    fetch_timeout: Duration,
}

impl UpdateOrchestrator {
    pub fn new(
        config: Arc<Config>,
        sources: Vec<Arc<dyn Source>>,
        repository: Arc<dyn ItemRepository>,
        breaker: Arc<CircuitBreaker>,
        cache: CacheTiers,
    ) -> Self {
        metrics::ensure_described();
        let fetch_timeout = config.fetch.timeout();
        Self {
            config,
            sources,
            repository,
            breaker,
            cache,
            notifier: None,
            fetch_timeout,
        }
    }

    /// Notify `sink` about sources that gained new items.
    pub fn with_notifier(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.notifier = Some(sink);
        self
    }

    /// Override the per-call fetch timeout from `[fetch]`.
    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    pub fn source_ids(&self) -> Vec<&str> {
        self.sources.iter().map(|s| s.id()).collect()
    }

    /// Run every source once.
    pub async fn run(&self, trigger: Trigger, cancel: &CancellationToken) -> UpdateRun {
        let mut run = UpdateRun::begin(trigger);
        let concurrency = self.config.fetch.max_concurrent.max(1);
        log::info!(
            "Update run ({:?}) over {} sources, {} at a time",
            trigger,
            self.sources.len(),
            concurrency
        );

        let tasks: Vec<_> = self
            .sources
            .iter()
            .map(|source| self.process(Arc::clone(source), cancel))
            .collect();
        let results: Vec<(String, SourceResult)> = stream::iter(tasks)
            .buffer_unordered(concurrency)
            .collect()
            .await;

        for (id, result) in &results {
            if result.changed_output() {
                let dropped = self.cache.invalidate_source_output(id);
                log::debug!("[{}] invalidated {} cached documents", id, dropped);
            }
        }
        run.per_source = results.into_iter().collect();

        if let Some(notifier) = &self.notifier {
            let gained: Vec<(String, usize)> = run
                .per_source
                .iter()
                .filter(|(_, r)| r.new > 0)
                .map(|(id, r)| (id.clone(), r.new))
                .collect();
            for (id, new) in gained {
                if let Err(e) = notifier.notify_new_content(&id, new).await {
                    log::warn!("[{}] notification failed: {}", id, e);
                }
            }
        }

        let run = run.finish();
        metrics::record_run();
        let failed = run.failed_sources();
        if failed.is_empty() {
            log::info!("Update run finished: {} new items", run.total_new());
        } else {
            log::warn!(
                "Update run finished: {} new items, {} failed sources ({})",
                run.total_new(),
                failed.len(),
                failed.join(", ")
            );
        }
        run
    }

    /// One source, with cancellation checked before it starts and panics contained.
    async fn process(
        &self,
        source: Arc<dyn Source>,
        cancel: &CancellationToken,
    ) -> (String, SourceResult) {
        let id = source.id().to_string();
        if cancel.is_cancelled() {
            log::info!("[{}] skipped, run cancelled", id);
            return (id, SourceResult::failed("cancelled"));
        }
        let result = match AssertUnwindSafe(self.update_source(source))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(payload) => {
                let e = AppError::from_panic(payload);
                metrics::record_fetch_failure(&id);
                log::error!("[{}] update panicked: {}", id, e);
                SourceResult::failed(e.to_string())
            }
        };
        (id, result)
    }

    async fn update_source(&self, source: Arc<dyn Source>) -> SourceResult {
        let id = source.id().to_string();
        metrics::record_fetch_attempt(&id);

        let fetched = self
            .breaker
            .execute(&id, || async {
                tokio::time::timeout(self.fetch_timeout, self.fetch(Arc::clone(&source)))
                    .await
                    .map_err(|_| AppError::Timeout {
                        source_id: id.clone(),
                        secs: self.fetch_timeout.as_secs(),
                    })?
            })
            .await;

        let raw_items = match fetched {
            Ok(items) => items,
            Err(e) => {
                metrics::record_fetch_failure(&id);
                if e.is_breaker_open() {
                    log::debug!("[{}] skipped: {}", id, e);
                } else {
                    log::warn!("[{}] fetch failed: {}", id, e);
                    self.cache.metadata.remove(&CacheTiers::version_key(&id));
                }
                return SourceResult::failed(e.to_string());
            }
        };

        let mut result = SourceResult {
            fetched: raw_items.len(),
            ..SourceResult::default()
        };
        let items = self.normalize(&id, raw_items, &mut result);

        match self.repository.upsert_many(&id, items).await {
            Ok(outcome) => {
                result.new = outcome.inserted;
                result.updated = outcome.updated;
                result.unchanged = outcome.unchanged;
                metrics::record_fetch_success(&id, result.new, result.skipped);
                log::info!(
                    "[{}] {} fetched, {} new, {} updated, {} skipped",
                    id,
                    result.fetched,
                    result.new,
                    result.updated,
                    result.skipped
                );
            }
            Err(e) => {
                metrics::record_fetch_failure(&id);
                log::error!("[{}] storing items failed, batch rolled back: {}", id, e);
                result.error = Some(e.to_string());
            }
        }
        result
    }

    /// Resolve the version token through the metadata tier, then fetch.
    async fn fetch(&self, source: Arc<dyn Source>) -> Result<Vec<RawItem>> {
        let key = CacheTiers::version_key(source.id());
        let resolver = Arc::clone(&source);
        let token = self
            .cache
            .metadata
            .get_or_try_insert_with(&key, self.cache.config.metadata_ttl(), move || async move {
                resolver.version_token().await
            })
            .await?;
        source.fetch(token.as_deref()).await
    }

    fn normalize(
        &self,
        source_id: &str,
        raw_items: Vec<RawItem>,
        result: &mut SourceResult,
    ) -> Vec<ContentItem> {
        let base = self
            .config
            .source(source_id)
            .and_then(|s| s.base_url.as_deref())
            .and_then(|b| Url::parse(b).ok());

        let mut items = Vec::with_capacity(raw_items.len());
        for raw in raw_items {
            match raw.normalize(source_id, base.as_ref()) {
                Ok(item) => items.push(item),
                Err(e) => {
                    result.skipped += 1;
                    log::warn!("[{}] skipping malformed item: {}", source_id, e);
                }
            }
        }
        items
    }
}

#[async_trait]
impl UpdateRunner for UpdateOrchestrator {
    async fn run_update(&self, trigger: Trigger, cancel: CancellationToken) -> UpdateRun {
        self.run(trigger, &cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BreakerConfig, RawTimestamp, SourceConfig};
    use crate::pipeline::circuit_breaker::BreakerState;
    use crate::render::{FeedDocument, FeedFormat};
    use crate::storage::SqliteRepository;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    enum Behavior {
        Items(Vec<RawItem>),
        Hang,
        Fail,
        Panic,
    }

    struct FakeSource {
        id: String,
        behavior: Behavior,
        version: Option<String>,
        fetches: AtomicUsize,
        version_calls: AtomicUsize,
        seen_tokens: Mutex<Vec<Option<String>>>,
    }

    impl FakeSource {
        fn new(id: &str, behavior: Behavior) -> Arc<Self> {
            Self::versioned(id, behavior, None)
        }

        fn versioned(id: &str, behavior: Behavior, version: Option<&str>) -> Arc<Self> {
            Arc::new(Self {
                id: id.into(),
                behavior,
                version: version.map(str::to_string),
                fetches: AtomicUsize::new(0),
                version_calls: AtomicUsize::new(0),
                seen_tokens: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Source for FakeSource {
        fn id(&self) -> &str {
            &self.id
        }

        async fn version_token(&self) -> Result<Option<String>> {
            self.version_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.version.clone())
        }

        async fn fetch(&self, token: Option<&str>) -> Result<Vec<RawItem>> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            self.seen_tokens
                .lock()
                .unwrap()
                .push(token.map(str::to_string));
            match &self.behavior {
                Behavior::Items(items) => Ok(items.clone()),
                Behavior::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(Vec::new())
                }
                Behavior::Fail => Err(AppError::upstream(&self.id, "HTTP 503")),
                Behavior::Panic => panic!("upstream parser blew up"),
            }
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        calls: Mutex<Vec<(String, usize)>>,
    }

    #[async_trait]
    impl NotificationSink for RecordingSink {
        async fn notify_new_content(&self, source_id: &str, new_count: usize) -> Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push((source_id.to_string(), new_count));
            Ok(())
        }
    }

    fn raw(guid: &str, title: Option<&str>) -> RawItem {
        RawItem {
            guid: Some(guid.into()),
            title: title.map(str::to_string),
            link: Some(format!("/items/{guid}")),
            published_at: Some(RawTimestamp::Unix(1_769_940_000)),
            ..RawItem::default()
        }
    }

    fn config(ids: &[&str], threshold: u32) -> Arc<Config> {
        let mut config = Config::default();
        config.breaker = BreakerConfig {
            failure_threshold: threshold,
            ..BreakerConfig::default()
        };
        for id in ids {
            let mut source = SourceConfig::new(*id, format!("https://example.com/{id}.json"));
            source.base_url = Some("https://example.com/".into());
            config.sources.push(source);
        }
        Arc::new(config)
    }

    async fn orchestrator(
        config: Arc<Config>,
        sources: Vec<Arc<FakeSource>>,
    ) -> (UpdateOrchestrator, Arc<SqliteRepository>, CacheTiers) {
        let sources = sources
            .into_iter()
            .map(|s| s as Arc<dyn Source>)
            .collect();
        let repo = Arc::new(SqliteRepository::in_memory().await.unwrap());
        let cache = CacheTiers::new(config.cache.clone());
        let breaker = Arc::new(CircuitBreaker::from_config(&config));
        let orchestrator =
            UpdateOrchestrator::new(config, sources, repo.clone(), breaker, cache.clone())
                .with_fetch_timeout(Duration::from_millis(50));
        (orchestrator, repo, cache)
    }

    #[tokio::test]
    async fn test_failing_source_does_not_affect_others() {
        let healthy = FakeSource::new(
            "en",
            Behavior::Items(vec![raw("1", Some("A")), raw("2", Some("B")), raw("3", Some("C"))]),
        );
        let hanging = FakeSource::new("de", Behavior::Hang);
        let (orchestrator, repo, _) =
            orchestrator(config(&["en", "de"], 3), vec![healthy, hanging]).await;

        let run = orchestrator
            .run(Trigger::Manual, &CancellationToken::new())
            .await;

        assert_eq!(run.per_source["en"].new, 3);
        assert!(run.per_source["en"].is_ok());
        assert!(run.per_source["de"].error.as_deref().unwrap().contains("timed out"));
        assert_eq!(repo.count(Some("en")).await.unwrap(), 3);
        assert_eq!(
            orchestrator.breaker.snapshot("de").consecutive_failures,
            1
        );
    }

    #[tokio::test]
    async fn test_panicking_source_is_recorded_and_others_complete() {
        let healthy = FakeSource::new("en", Behavior::Items(vec![raw("1", Some("A"))]));
        let broken = FakeSource::new("de", Behavior::Panic);
        let (orchestrator, repo, _) =
            orchestrator(config(&["de", "en"], 3), vec![broken, healthy]).await;

        let run = orchestrator
            .run(Trigger::Manual, &CancellationToken::new())
            .await;

        let error = run.per_source["de"].error.as_deref().unwrap();
        assert!(error.contains("upstream parser blew up"), "{error}");
        assert_eq!(run.per_source["en"].new, 1);
        assert_eq!(repo.count(Some("en")).await.unwrap(), 1);

        // The next run is unaffected.
        let again = orchestrator
            .run(Trigger::Manual, &CancellationToken::new())
            .await;
        assert_eq!(again.per_source["en"].unchanged, 1);
    }

    #[tokio::test]
    async fn test_breaker_opens_after_repeated_failures() {
        let failing = FakeSource::new("de", Behavior::Fail);
        let (orchestrator, _, _) = orchestrator(config(&["de"], 2), vec![failing.clone()]).await;
        let cancel = CancellationToken::new();

        orchestrator.run(Trigger::Scheduled, &cancel).await;
        orchestrator.run(Trigger::Scheduled, &cancel).await;
        assert_eq!(orchestrator.breaker.snapshot("de").state, BreakerState::Open);

        let run = orchestrator.run(Trigger::Scheduled, &cancel).await;
        assert!(run.per_source["de"].error.as_deref().unwrap().contains("breaker open"));
        assert_eq!(failing.fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_malformed_items_are_skipped() {
        let source = FakeSource::new(
            "en",
            Behavior::Items(vec![raw("1", Some("A")), raw("2", None)]),
        );
        let (orchestrator, repo, _) = orchestrator(config(&["en"], 3), vec![source]).await;

        let run = orchestrator
            .run(Trigger::Manual, &CancellationToken::new())
            .await;
        let result = &run.per_source["en"];
        assert_eq!(result.fetched, 2);
        assert_eq!(result.skipped, 1);
        assert_eq!(result.new, 1);

        let stored = repo
            .query(&crate::storage::ItemQuery {
                source: Some("en".into()),
                category: None,
                limit: 10,
            })
            .await
            .unwrap();
        assert_eq!(stored[0].link, "https://example.com/items/1");
    }

    #[tokio::test]
    async fn test_new_items_invalidate_output_and_notify() {
        let source = FakeSource::new("en", Behavior::Items(vec![raw("1", Some("A"))]));
        let (orchestrator, _, cache) = orchestrator(config(&["en", "de"], 3), vec![source]).await;
        let sink = Arc::new(RecordingSink::default());
        let orchestrator = orchestrator.with_notifier(sink.clone());

        let ttl = Duration::from_secs(60);
        let doc = FeedDocument::new(FeedFormat::Rss, "stale".into());
        cache.output.set("feed:en:rss:50:*", doc.clone(), ttl);
        cache.output.set("feed:*:rss:50:*", doc.clone(), ttl);
        cache.output.set("feed:de:rss:50:*", doc, ttl);

        let cancel = CancellationToken::new();
        orchestrator.run(Trigger::Manual, &cancel).await;
        assert!(cache.output.get("feed:en:rss:50:*").is_none());
        assert!(cache.output.get("feed:*:rss:50:*").is_none());
        assert!(cache.output.get("feed:de:rss:50:*").is_some());

        // Re-running identical data changes nothing and notifies nobody.
        orchestrator.run(Trigger::Manual, &cancel).await;
        assert_eq!(*sink.calls.lock().unwrap(), vec![("en".to_string(), 1)]);
    }

    #[tokio::test]
    async fn test_version_token_is_cached_between_runs() {
        let source = FakeSource::versioned("en", Behavior::Items(vec![]), Some("v7"));
        let (orchestrator, _, _) = orchestrator(config(&["en"], 3), vec![source.clone()]).await;
        let cancel = CancellationToken::new();

        orchestrator.run(Trigger::Manual, &cancel).await;
        orchestrator.run(Trigger::Manual, &cancel).await;

        assert_eq!(source.version_calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            *source.seen_tokens.lock().unwrap(),
            vec![Some("v7".to_string()), Some("v7".to_string())]
        );
    }

    #[tokio::test]
    async fn test_cancelled_run_skips_unstarted_sources() {
        let source = FakeSource::new("en", Behavior::Items(vec![raw("1", Some("A"))]));
        let (orchestrator, _, _) = orchestrator(config(&["en"], 3), vec![source.clone()]).await;

        let cancel = CancellationToken::new();
        cancel.cancel();
        let run = orchestrator.run(Trigger::Manual, &cancel).await;

        assert_eq!(run.per_source["en"].error.as_deref(), Some("cancelled"));
        assert_eq!(source.fetches.load(Ordering::SeqCst), 0);
    }
}
