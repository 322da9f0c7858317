//! Scheduling, retry and state-machine orchestration for AIKG.

use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use aikg_adapters::{
    ChatClient, ChatClientConfig, HttpPageFetcher, LogMailer, Mailer, PageFetcher, RelayMailer,
    RelayMailerConfig, TextGenerator,
};
use aikg_core::{DiscoveredBatch, NewSubscription, NewWebsite, SubscriptionChange};
use aikg_storage::{HttpClientConfig, HttpFetcher, MemoryStore, PgStore, Store, TokenBucketConfig};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_cron_scheduler::JobScheduler;
use tracing::{error, info, warn};
use uuid::Uuid;

pub mod articles;
pub mod config;
pub mod content;
pub mod dispatch;
pub mod registry;
pub mod scrape;
pub mod subscriptions;

#[cfg(test)]
mod testing;

pub use articles::{ArticlePipeline, PipelineSettings, ProcessOutcome};
pub use config::{AppConfig, ConfigError, CronSettings};
pub use content::{ContentGenerationFlow, GeneratedContent};
pub use dispatch::Dispatcher;
pub use registry::{job_task, CronBackend, JobRegistry, JobTask, TokioCronBackend};
pub use scrape::{ManualScrape, ScrapeSettings, WebsiteScrapeScheduler};
pub use subscriptions::{
    ChangeEventBus, SendOutcome, SubscriptionError, SubscriptionScheduler,
    SubscriptionSchedulerSettings, SubscriptionService,
};

pub const CRATE_NAME: &str = "aikg-sync";

const DB_MAX_CONNECTIONS: u32 = 10;

/// Initial websites and subscriptions, loaded into an empty store at startup.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SeedFile {
    #[serde(default)]
    pub websites: Vec<NewWebsite>,
    #[serde(default)]
    pub subscriptions: Vec<NewSubscription>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SeedSummary {
    pub websites: usize,
    pub subscriptions: usize,
}

pub async fn load_seed_file(path: &Path) -> Result<SeedFile> {
    let text = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

/// Inserts each seed section only when the matching table is empty, so restarts never
/// duplicate rows.
pub async fn apply_seed(store: &dyn Store, seed: &SeedFile) -> Result<SeedSummary> {
    let mut summary = SeedSummary::default();
    if store.list_websites().await?.is_empty() {
        for website in &seed.websites {
            store.insert_website(website.clone()).await?;
            summary.websites += 1;
        }
    }
    if store.list_subscriptions().await?.is_empty() {
        for subscription in &seed.subscriptions {
            store.insert_subscription(subscription.clone()).await?;
            summary.subscriptions += 1;
        }
    }
    info!(
        websites = summary.websites,
        subscriptions = summary.subscriptions,
        "seed data applied"
    );
    Ok(summary)
}

/// The external collaborators the orchestration layer runs against.
pub struct Capabilities {
    pub store: Arc<dyn Store>,
    pub pages: Arc<dyn PageFetcher>,
    pub llm: Arc<dyn TextGenerator>,
    pub mailer: Arc<dyn Mailer>,
}

impl Capabilities {
    pub async fn from_config(config: &AppConfig) -> Result<Self> {
        let store: Arc<dyn Store> = match &config.database_url {
            Some(url) => {
                let store = PgStore::connect(url, DB_MAX_CONNECTIONS)
                    .await
                    .context("connecting to postgres")?;
                store.ensure_schema().await.context("creating schema")?;
                Arc::new(store)
            }
            None => {
                warn!("DATABASE_URL not set; using the in-memory store");
                Arc::new(MemoryStore::new())
            }
        };
        if let Some(path) = &config.seed_file {
            let seed = load_seed_file(path).await?;
            apply_seed(store.as_ref(), &seed).await?;
        }

        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            token_bucket: (config.fetch_min_interval_ms > 0).then(|| TokenBucketConfig {
                capacity: 1,
                refill_every: Duration::from_millis(config.fetch_min_interval_ms),
            }),
            ..HttpClientConfig::default()
        })
        .context("building http client")?;

        let llm = ChatClient::new(ChatClientConfig {
            api_key: config.llm.api_key.clone(),
            base_url: config.llm.base_url.clone(),
            model: config.llm.model.clone(),
            timeout: Duration::from_secs(config.llm.timeout_secs),
            temperature: None,
        })
        .context("building llm client")?;

        let mailer: Arc<dyn Mailer> = match &config.mail.relay_url {
            Some(endpoint) => Arc::new(
                RelayMailer::new(RelayMailerConfig {
                    endpoint: endpoint.clone(),
                    token: config.mail.relay_token.clone(),
                    from: config.mail.from.clone(),
                    timeout: Duration::from_secs(config.http_timeout_secs),
                })
                .context("building mail relay client")?,
            ),
            None => {
                warn!("MAIL_RELAY_URL not set; emails are logged instead of sent");
                Arc::new(LogMailer)
            }
        };

        Ok(Self {
            store,
            pages: Arc::new(HttpPageFetcher::new(Arc::new(http))),
            llm: Arc::new(llm),
            mailer,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ScrapeRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub websites_scraped: usize,
    pub batches: usize,
    pub articles_created: usize,
}

type Receivers = (
    mpsc::UnboundedReceiver<DiscoveredBatch>,
    mpsc::UnboundedReceiver<SubscriptionChange>,
);

/// All components wired together, plus the triggers that drive them.
pub struct AikgRuntime {
    pub config: AppConfig,
    pub store: Arc<dyn Store>,
    pub scraper: Arc<WebsiteScrapeScheduler>,
    pub pipeline: Arc<ArticlePipeline>,
    pub subscriptions: Arc<SubscriptionService>,
    pub sender: Arc<SubscriptionScheduler>,
    backend: Arc<dyn CronBackend>,
    scheduler: Option<JobScheduler>,
    dispatcher: Dispatcher,
    receivers: Mutex<Option<Receivers>>,
    loops: Mutex<Vec<JoinHandle<()>>>,
}

impl AikgRuntime {
    pub async fn from_config(config: AppConfig) -> Result<Self> {
        let capabilities = Capabilities::from_config(&config).await?;
        let scheduler = JobScheduler::new().await.context("creating scheduler")?;
        let backend = Arc::new(TokioCronBackend::new(scheduler.clone()));
        let mut runtime = Self::assemble(config, capabilities, backend);
        runtime.scheduler = Some(scheduler);
        Ok(runtime)
    }

    pub fn assemble(
        config: AppConfig,
        capabilities: Capabilities,
        backend: Arc<dyn CronBackend>,
    ) -> Self {
        let Capabilities {
            store,
            pages,
            llm,
            mailer,
        } = capabilities;
        let dispatcher = Dispatcher::new(config.worker_concurrency);
        let (batch_tx, batch_rx) = mpsc::unbounded_channel();
        let (bus, change_rx) = ChangeEventBus::channel();

        let scraper = Arc::new(WebsiteScrapeScheduler::new(
            store.clone(),
            pages.clone(),
            llm.clone(),
            batch_tx,
            dispatcher.clone(),
            ScrapeSettings {
                max_retry: config.website_max_retry,
                extraction_backoff: config.llm_backoff(),
            },
        ));
        let pipeline = Arc::new(ArticlePipeline::new(
            store.clone(),
            pages,
            llm.clone(),
            dispatcher.clone(),
            PipelineSettings {
                max_retry: config.article_max_retry,
                batch_size: config.article_batch_size,
                timeout: config.article_timeout(),
                summary_backoff: config.llm_backoff(),
            },
        ));
        let sender = Arc::new(SubscriptionScheduler::new(
            store.clone(),
            backend.clone(),
            Arc::new(ContentGenerationFlow::new(llm)),
            mailer,
            dispatcher.clone(),
            SubscriptionSchedulerSettings {
                default_cron: config.crons.default_send.clone(),
                admin_recipients: config.mail.admin_recipients.clone(),
            },
        ));

        Self {
            subscriptions: Arc::new(SubscriptionService::new(store.clone(), bus)),
            config,
            store,
            scraper,
            pipeline,
            sender,
            backend,
            scheduler: None,
            dispatcher,
            receivers: Mutex::new(Some((batch_rx, change_rx))),
            loops: Mutex::new(Vec::new()),
        }
    }

    fn take_receivers(&self) -> Result<Receivers> {
        self.receivers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .context("runtime already started")
    }

    /// Starts the consumer loops, schedules subscriptions and registers every trigger.
    pub async fn start(&self) -> Result<()> {
        let (batches, changes) = self.take_receivers()?;
        let mut loops = vec![
            tokio::spawn(Arc::clone(&self.pipeline).run_ingest_loop(batches)),
            tokio::spawn(Arc::clone(&self.sender).run_event_loop(changes)),
        ];

        self.sender.start().await?;
        self.register_triggers().await?;

        let scraper = Arc::clone(&self.scraper);
        let delay = self.config.startup_delay();
        loops.push(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(err) = scraper.startup_trigger().await {
                error!(error = ?err, "startup scrape failed");
            }
        }));
        self.loops
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(loops);

        if let Some(scheduler) = &self.scheduler {
            scheduler.start().await.context("starting scheduler")?;
        }
        info!(
            workers = self.dispatcher.capacity(),
            startup_delay_secs = delay.as_secs(),
            "aikg runtime started"
        );
        Ok(())
    }

    async fn register_triggers(&self) -> Result<()> {
        let crons = &self.config.crons;

        let scraper = Arc::clone(&self.scraper);
        self.add_trigger("retry_reset", &crons.retry_reset, move || {
            let scraper = Arc::clone(&scraper);
            async move { scraper.reset_trigger().await.map(|_| ()) }
        })
        .await?;

        let scraper = Arc::clone(&self.scraper);
        self.add_trigger("website_sweep", &crons.website_sweep, move || {
            let scraper = Arc::clone(&scraper);
            async move { scraper.pending_sweep().await.map(|_| ()) }
        })
        .await?;

        let scraper = Arc::clone(&self.scraper);
        self.add_trigger("failed_retry", &crons.failed_retry, move || {
            let scraper = Arc::clone(&scraper);
            async move { scraper.failed_retry().await.map(|_| ()) }
        })
        .await?;

        let pipeline = Arc::clone(&self.pipeline);
        self.add_trigger("pending_articles", &crons.pending_articles, move || {
            let pipeline = Arc::clone(&pipeline);
            async move { pipeline.pending_sweep().await.map(|_| ()) }
        })
        .await?;

        let pipeline = Arc::clone(&self.pipeline);
        self.add_trigger("timeout_articles", &crons.timeout_articles, move || {
            let pipeline = Arc::clone(&pipeline);
            async move { pipeline.timeout_sweep().await.map(|_| ()) }
        })
        .await?;

        let sender = Arc::downgrade(&self.sender);
        self.add_trigger("subscription_refresh", &crons.subscription_refresh, move || {
            let sender = sender.clone();
            async move {
                match sender.upgrade() {
                    Some(sender) => sender.refresh_all().await.map(|_| ()),
                    None => Ok(()),
                }
            }
        })
        .await?;
        Ok(())
    }

    async fn add_trigger<F, Fut>(&self, name: &'static str, cron: &str, body: F) -> Result<()>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        let task = job_task(move || {
            let run = body();
            async move {
                if let Err(err) = run.await {
                    error!(trigger = name, error = ?err, "trigger failed");
                }
            }
        });
        let job_id = self
            .backend
            .add(cron, task)
            .await
            .with_context(|| format!("registering trigger {name}"))?;
        info!(trigger = name, cron, %job_id, "trigger registered");
        Ok(())
    }

    /// Runs the startup scrape immediately and processes everything it discovers, waiting for
    /// all of it to finish.
    pub async fn scrape_once(&self) -> Result<ScrapeRunSummary> {
        let started_at = Utc::now();
        let (mut batches, changes) = self.take_receivers()?;

        let scrapes = self.scraper.startup_trigger().await?;
        let websites_scraped = scrapes.len();
        for handle in scrapes {
            handle.await.context("scrape task panicked")?;
        }

        let mut batch_count = 0;
        let mut processing = Vec::new();
        while let Ok(batch) = batches.try_recv() {
            batch_count += 1;
            processing.extend(self.pipeline.ingest(batch).await?);
        }
        let articles_created = processing.len();
        for handle in processing {
            handle.await.context("article task panicked")?;
        }

        *self
            .receivers
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some((batches, changes));

        let summary = ScrapeRunSummary {
            run_id: Uuid::new_v4(),
            started_at,
            finished_at: Utc::now(),
            websites_scraped,
            batches: batch_count,
            articles_created,
        };
        info!(
            run_id = %summary.run_id,
            websites = websites_scraped,
            articles = articles_created,
            "scrape run finished"
        );
        Ok(summary)
    }

    /// Stops triggers, refuses new work and ends the consumer loops.
    pub async fn shutdown(&self) -> Result<()> {
        if let Some(scheduler) = &self.scheduler {
            let mut scheduler = scheduler.clone();
            scheduler.shutdown().await.context("stopping scheduler")?;
        }
        self.dispatcher.close();
        for handle in self
            .loops
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
        {
            handle.abort();
        }
        info!("aikg runtime stopped");
        Ok(())
    }
}

pub async fn run_scrape_once_from_env() -> Result<ScrapeRunSummary> {
    let config = AppConfig::from_env()?;
    AikgRuntime::from_config(config).await?.scrape_once().await
}
