//! Service facade wiring the pipeline together.
//!
//! ```text
//! FeedService
//! ├── Scheduler<UpdateOrchestrator>   background + manual runs
//! │   └── UpdateOrchestrator          sources, breaker, repository, cache
//! ├── FeedGenerator                   output tier -> repository -> render
//! └── CacheTiers                      metadata + output
//! ```

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;

use crate::error::Result;
use crate::models::{Config, UpdateRun};
use crate::pipeline::{
    BreakerSnapshot, CircuitBreaker, FeedGenerator, FeedRequest, Scheduler, SchedulerStatus,
    UpdateOrchestrator,
};
use crate::render::FeedDocument;
use crate::services::{self, LogNotifier, NotificationSink, Source, WebhookNotifier};
use crate::storage::{CacheTiers, ItemRepository, SqliteRepository, TierStats};
use crate::utils::http;

/// Stored item totals of one source.
#[derive(Debug, Clone, Serialize)]
pub struct SourceItems {
    pub source_id: String,
    pub count: u64,
    pub latest_published: Option<DateTime<Utc>>,
}

/// Everything `get_status` reports.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub scheduler: SchedulerStatus,
    pub breakers: Vec<BreakerSnapshot>,
    pub cache: TierStats,
    pub items: Vec<SourceItems>,
    pub total_items: u64,
}

impl ServiceStatus {
    pub fn last_run(&self) -> Option<&UpdateRun> {
        self.scheduler.last_run.as_ref()
    }
}

/// Builder for [`FeedService`]; every collaborator defaults from the config.
pub struct FeedServiceBuilder {
    config: Config,
    repository: Option<Arc<dyn ItemRepository>>,
    sources: Option<Vec<Arc<dyn Source>>>,
    notifier: Option<Arc<dyn NotificationSink>>,
    fetch_timeout: Option<Duration>,
}

impl FeedServiceBuilder {
    pub fn repository(mut self, repository: Arc<dyn ItemRepository>) -> Self {
        self.repository = Some(repository);
        self
    }

    pub fn sources(mut self, sources: Vec<Arc<dyn Source>>) -> Self {
        self.sources = Some(sources);
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn NotificationSink>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = Some(timeout);
        self
    }

    /// Validate the config and assemble the service. Nothing runs until
    /// [`FeedService::start`] or [`FeedService::trigger_update`].
    pub async fn build(self) -> Result<FeedService> {
        self.config.validate()?;
        let config = Arc::new(self.config);

        let repository: Arc<dyn ItemRepository> = match self.repository {
            Some(repository) => repository,
            None => Arc::new(
                SqliteRepository::open(
                    &config.storage.database_path,
                    config.storage.max_connections,
                )
                .await?,
            ),
        };
        let sources = match self.sources {
            Some(sources) => sources,
            None => services::http_sources(&config)?,
        };
        let notifier: Arc<dyn NotificationSink> = match self.notifier {
            Some(notifier) => notifier,
            None => {
                let client = http::create_client(&config.fetch)?;
                match WebhookNotifier::from_config(&config.notify, client) {
                    Some(webhook) => Arc::new(webhook),
                    None => Arc::new(LogNotifier),
                }
            }
        };

        let cache = CacheTiers::new(config.cache.clone());
        let breaker = Arc::new(CircuitBreaker::from_config(&config));
        let mut orchestrator = UpdateOrchestrator::new(
            Arc::clone(&config),
            sources,
            Arc::clone(&repository),
            Arc::clone(&breaker),
            cache.clone(),
        )
        .with_notifier(notifier);
        if let Some(timeout) = self.fetch_timeout {
            orchestrator = orchestrator.with_fetch_timeout(timeout);
        }

        let generator = FeedGenerator::new(Arc::clone(&repository), cache.clone(), Arc::clone(&config));
        log::info!(
            "feedhub ready with {} sources ({})",
            config.sources.len(),
            orchestrator.source_ids().join(", ")
        );

        Ok(FeedService {
            config,
            repository,
            cache,
            breaker,
            scheduler: Scheduler::new(Arc::new(orchestrator)),
            generator,
            sweepers: Mutex::new(Vec::new()),
        })
    }
}

/// The assembled ingestion-and-serving pipeline.
pub struct FeedService {
    config: Arc<Config>,
    repository: Arc<dyn ItemRepository>,
    cache: CacheTiers,
    breaker: Arc<CircuitBreaker>,
    scheduler: Scheduler<UpdateOrchestrator>,
    generator: FeedGenerator,
    sweepers: Mutex<Vec<JoinHandle<()>>>,
}

impl FeedService {
    pub fn builder(config: Config) -> FeedServiceBuilder {
        FeedServiceBuilder {
            config,
            repository: None,
            sources: None,
            notifier: None,
            fetch_timeout: None,
        }
    }

    /// Build with every collaborator taken from the config.
    pub async fn from_config(config: Config) -> Result<Self> {
        Self::builder(config).build().await
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn scheduler(&self) -> &Scheduler<UpdateOrchestrator> {
        &self.scheduler
    }

    /// Start the background timer and the cache sweepers.
    pub fn start(&self) {
        let scheduler = &self.config.scheduler;
        self.scheduler
            .start(scheduler.interval(), scheduler.run_on_start);
        let mut sweepers = self.sweepers.lock().unwrap_or_else(PoisonError::into_inner);
        if sweepers.is_empty() {
            sweepers.extend(self.cache.spawn_sweepers());
        }
    }

    /// Request a run and wait for the run that satisfies it.
    ///
    /// Per-source failures are inside the returned run; only a stopped
    /// scheduler is an error.
    pub async fn trigger_update(&self) -> Result<UpdateRun> {
        self.scheduler.run_now().await
    }

    pub async fn get_feed(&self, request: &FeedRequest) -> Result<FeedDocument> {
        self.generator.generate(request).await
    }

    pub async fn get_status(&self) -> Result<ServiceStatus> {
        let mut items = Vec::with_capacity(self.config.sources.len());
        for source in &self.config.sources {
            items.push(SourceItems {
                source_id: source.id.clone(),
                count: self.repository.count(Some(&source.id)).await?,
                latest_published: self.repository.latest_published(&source.id).await?,
            });
        }
        let breakers = self
            .config
            .sources
            .iter()
            .map(|s| self.breaker.snapshot(&s.id))
            .collect();

        Ok(ServiceStatus {
            scheduler: self.scheduler.status(),
            breakers,
            cache: self.cache.stats(),
            items,
            total_items: self.repository.count(None).await?,
        })
    }

    /// Stop the scheduler (waiting for the in-flight run) and the sweepers.
    pub async fn shutdown(&self) {
        self.scheduler.stop().await;
        let sweepers: Vec<_> = self
            .sweepers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for sweeper in sweepers {
            sweeper.abort();
        }
    }
}
