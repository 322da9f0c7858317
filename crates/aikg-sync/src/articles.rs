//! Article lifecycle: ingestion, processing and the recovery sweeps.

use std::sync::Arc;

use aikg_adapters::{PageFetcher, PageFormat, TextGenerator, TextRequest};
use aikg_core::{retry_with_backoff, Article, ArticleId, BackoffPolicy, DiscoveredBatch};
use aikg_storage::{Store, StoreResult};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::dispatch::Dispatcher;

/// Longest article text sent for summarization, in characters.
pub const MAX_SUMMARY_INPUT_CHARS: usize = 15_000;
const TRUNCATION_MARKER: &str = "... (content truncated)";

pub const SUMMARY_SYSTEM_PROMPT: &str = "You are a professional article summarizer. Extract the \
key information from the provided text and write an objective, accurate summary of no more than \
300 words. Do not include personal opinions or evaluations.";
const TRUNCATED_NOTE: &str = " Note: the content was truncated because it is too long; write the \
best summary you can from the available text.";

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub max_retry: u32,
    pub batch_size: usize,
    pub timeout: chrono::Duration,
    pub summary_backoff: BackoffPolicy,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            max_retry: 3,
            batch_size: 10,
            timeout: chrono::Duration::minutes(30),
            summary_backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    Completed,
    Failed,
    /// Already claimed elsewhere, terminal, or out of budget.
    Skipped,
}

pub struct ArticlePipeline {
    store: Arc<dyn Store>,
    pages: Arc<dyn PageFetcher>,
    llm: Arc<dyn TextGenerator>,
    dispatcher: Dispatcher,
    settings: PipelineSettings,
}

impl ArticlePipeline {
    pub fn new(
        store: Arc<dyn Store>,
        pages: Arc<dyn PageFetcher>,
        llm: Arc<dyn TextGenerator>,
        dispatcher: Dispatcher,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            store,
            pages,
            llm,
            dispatcher,
            settings,
        }
    }

    /// Stores the batch's new candidates as Pending articles. Candidates without a title or
    /// url, and urls already known, are skipped.
    pub async fn persist_batch(&self, batch: &DiscoveredBatch) -> StoreResult<Vec<Article>> {
        let mut created = Vec::new();
        let mut skipped = 0usize;
        for candidate in &batch.candidates {
            let Some(article) = candidate.to_new_article(Some(batch.source_url.as_str())) else {
                skipped += 1;
                continue;
            };
            match self.store.insert_article_if_absent(article).await? {
                Some(row) => created.push(row),
                None => {
                    debug!(url = ?candidate.url, "article already known; skipped");
                    skipped += 1;
                }
            }
        }
        info!(
            source = %batch.source_url,
            created = created.len(),
            skipped,
            "discovered articles ingested"
        );
        Ok(created)
    }

    /// Persists the batch and dispatches each new article without waiting for it.
    pub async fn ingest(
        self: &Arc<Self>,
        batch: DiscoveredBatch,
    ) -> anyhow::Result<Vec<JoinHandle<()>>> {
        let created = self.persist_batch(&batch).await?;
        Ok(created.into_iter().map(|a| self.dispatch(a.id)).collect())
    }

    /// Consumes scrape batches until every sender is gone.
    pub async fn run_ingest_loop(
        self: Arc<Self>,
        mut batches: mpsc::UnboundedReceiver<DiscoveredBatch>,
    ) {
        while let Some(batch) = batches.recv().await {
            if let Err(err) = self.ingest(batch).await {
                warn!(error = ?err, "article ingestion failed");
            }
        }
        debug!("article ingestion channel closed");
    }

    pub fn dispatch(self: &Arc<Self>, id: ArticleId) -> JoinHandle<()> {
        let this = Arc::clone(self);
        self.dispatcher.spawn("process_article", async move {
            this.process_article(id).await.map(|_| ())
        })
    }

    /// Dispatches up to `batch_size` Pending articles.
    pub async fn pending_sweep(self: &Arc<Self>) -> anyhow::Result<Vec<JoinHandle<()>>> {
        let pending = self
            .store
            .find_pending_articles(self.settings.batch_size)
            .await?;
        info!(pending = pending.len(), "pending article sweep");
        Ok(pending.into_iter().map(|a| self.dispatch(a.id)).collect())
    }

    /// Re-dispatches articles stuck past the timeout that still have budget, and fails the
    /// stuck ones that do not.
    pub async fn timeout_sweep(self: &Arc<Self>) -> anyhow::Result<Vec<JoinHandle<()>>> {
        let timeout = self.settings.timeout;
        let max_retry = self.settings.max_retry;
        let expired = self
            .store
            .expire_exhausted_articles(
                timeout,
                max_retry,
                &format!("processing timed out after {max_retry} attempts"),
            )
            .await?;
        let stuck = self.store.find_timeout_articles(timeout, max_retry).await?;
        info!(stuck = stuck.len(), expired, "timeout article sweep");
        Ok(stuck.into_iter().map(|a| self.dispatch(a.id)).collect())
    }

    /// Runs one article through Processing to Completed or Failed.
    pub async fn process_article(&self, id: ArticleId) -> anyhow::Result<ProcessOutcome> {
        let Some(article) = self
            .store
            .claim_article(id, self.settings.max_retry, self.settings.timeout)
            .await?
        else {
            debug!(article_id = id, "article not claimable; skipped");
            return Ok(ProcessOutcome::Skipped);
        };
        info!(
            article_id = id,
            attempt = article.process_count,
            url = %article.url,
            "processing article"
        );

        let content = match self.pages.fetch_page(&article.url, PageFormat::Text).await {
            Ok(text) if !text.trim().is_empty() => text,
            Ok(_) => {
                return self
                    .fail(id, "article content is empty".to_string())
                    .await;
            }
            Err(err) => {
                return self
                    .fail(id, format!("failed to fetch article content: {err}"))
                    .await;
            }
        };

        match self.summarize(&article, &content).await {
            Ok(summary) => {
                self.store.complete_article(id, &summary).await?;
                info!(article_id = id, summary_chars = summary.len(), "article completed");
                Ok(ProcessOutcome::Completed)
            }
            Err(err) => self.fail(id, err.to_string()).await,
        }
    }

    async fn fail(&self, id: ArticleId, message: String) -> anyhow::Result<ProcessOutcome> {
        warn!(article_id = id, error = %message, "article processing failed");
        self.store.fail_article(id, &message).await?;
        Ok(ProcessOutcome::Failed)
    }

    async fn summarize(&self, article: &Article, content: &str) -> anyhow::Result<String> {
        let (content, truncated) = truncate_chars(content, MAX_SUMMARY_INPUT_CHARS);
        if truncated {
            debug!(article_id = article.id, "article content truncated for summary");
        }
        let mut system = SUMMARY_SYSTEM_PROMPT.to_string();
        if truncated {
            system.push_str(TRUNCATED_NOTE);
        }
        let request = TextRequest::new(
            system,
            format!(
                "Article title: {}\n\nSummarize the following article text:\n\n{}",
                article.title, content
            ),
        );
        let operation = format!("summarize_article[{}]", article.id);
        let summary = retry_with_backoff(&self.settings.summary_backoff, &operation, |_attempt| {
            let llm = Arc::clone(&self.llm);
            let request = request.clone();
            async move {
                let reply = llm.generate_text(request).await?;
                let reply = reply.trim().to_string();
                if reply.is_empty() {
                    anyhow::bail!("empty summary");
                }
                Ok(reply)
            }
        })
        .await?;
        Ok(summary)
    }
}

/// Cuts `text` to `max` characters, appending a marker when anything was dropped.
pub fn truncate_chars(text: &str, max: usize) -> (String, bool) {
    match text.char_indices().nth(max) {
        Some((byte_index, _)) => (format!("{}{TRUNCATION_MARKER}", &text[..byte_index]), true),
        None => (text.to_string(), false),
    }
}
