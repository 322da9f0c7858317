//! Website scrape triggers and the scrape attempt itself.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use aikg_adapters::{AdapterError, PageFetcher, PageFormat, TextGenerator, TextRequest};
use aikg_core::{
    retry_with_backoff, ArticleCandidate, BackoffPolicy, DiscoveredBatch, FetchStatus,
    RetryExhausted, WebsiteConfig, WebsiteId, UNTITLED_ARTICLE,
};
use aikg_storage::Store;
use chrono::Utc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::dispatch::Dispatcher;

pub const EXTRACTION_SYSTEM_PROMPT: &str = "You are an HTML parsing assistant. Extract every link \
on the page that looks like an article: news items, notices, announcements, policy documents. \
Ignore navigation links, buttons and other non-article content. Make every URL absolute using the \
base domain when it is relative. Reply with a JSON array only, no other text, in the form \
[{\"title\": \"Article title\", \"url\": \"Article link\"}].";

#[derive(Debug, Error)]
pub enum ScrapeError {
    #[error("page fetch failed: {0}")]
    Fetch(#[source] AdapterError),
    #[error("page {0} returned no content")]
    EmptyPage(String),
    #[error(transparent)]
    Extraction(#[from] RetryExhausted),
}

#[derive(Debug, Clone)]
pub struct ScrapeSettings {
    pub max_retry: u32,
    pub extraction_backoff: BackoffPolicy,
}

impl Default for ScrapeSettings {
    fn default() -> Self {
        Self {
            max_retry: 5,
            extraction_backoff: BackoffPolicy::default(),
        }
    }
}

/// Outcome of a manual scrape request.
#[derive(Debug)]
pub enum ManualScrape {
    Dispatched(JoinHandle<()>),
    NotFound,
    AlreadyRunning,
}

pub struct WebsiteScrapeScheduler {
    store: Arc<dyn Store>,
    pages: Arc<dyn PageFetcher>,
    llm: Arc<dyn TextGenerator>,
    batches: mpsc::UnboundedSender<DiscoveredBatch>,
    dispatcher: Dispatcher,
    settings: ScrapeSettings,
    in_flight: Arc<Mutex<HashSet<WebsiteId>>>,
}

/// Marks a website as being scraped until dropped.
struct InFlightGuard {
    set: Arc<Mutex<HashSet<WebsiteId>>>,
    id: WebsiteId,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}

impl WebsiteScrapeScheduler {
    pub fn new(
        store: Arc<dyn Store>,
        pages: Arc<dyn PageFetcher>,
        llm: Arc<dyn TextGenerator>,
        batches: mpsc::UnboundedSender<DiscoveredBatch>,
        dispatcher: Dispatcher,
        settings: ScrapeSettings,
    ) -> Self {
        Self {
            store,
            pages,
            llm,
            batches,
            dispatcher,
            settings,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Scrapes every enabled website with retry budget left.
    pub async fn startup_trigger(self: &Arc<Self>) -> anyhow::Result<Vec<JoinHandle<()>>> {
        let websites = self
            .store
            .find_enabled_with_retry_available(self.settings.max_retry)
            .await?;
        Ok(self.dispatch_all("startup", websites))
    }

    /// Sets every website's retry counter back to zero.
    pub async fn reset_trigger(&self) -> anyhow::Result<u64> {
        let reset = self.store.reset_all_retry_counts().await?;
        info!(websites = reset, "daily retry counters reset");
        Ok(reset)
    }

    /// Scrapes enabled websites that were never fetched or last failed.
    pub async fn pending_sweep(self: &Arc<Self>) -> anyhow::Result<Vec<JoinHandle<()>>> {
        let websites = self
            .store
            .find_pending_websites(self.settings.max_retry)
            .await?;
        Ok(self.dispatch_all("pending_sweep", websites))
    }

    pub async fn failed_retry(self: &Arc<Self>) -> anyhow::Result<Vec<JoinHandle<()>>> {
        let websites = self
            .store
            .find_failed_with_retry_available(self.settings.max_retry)
            .await?;
        Ok(self.dispatch_all("failed_retry", websites))
    }

    /// Admin-requested scrape. Ignores the retry budget; the attempt still counts.
    pub async fn manual_scrape(self: &Arc<Self>, id: WebsiteId) -> anyhow::Result<ManualScrape> {
        let Some(website) = self.store.get_website(id).await? else {
            return Ok(ManualScrape::NotFound);
        };
        Ok(match self.dispatch(website, None) {
            Some(handle) => ManualScrape::Dispatched(handle),
            None => ManualScrape::AlreadyRunning,
        })
    }

    fn dispatch_all(
        self: &Arc<Self>,
        trigger: &'static str,
        websites: Vec<WebsiteConfig>,
    ) -> Vec<JoinHandle<()>> {
        let eligible = websites.len();
        let budget = Some(self.settings.max_retry);
        let handles: Vec<_> = websites
            .into_iter()
            .filter_map(|website| self.dispatch(website, budget))
            .collect();
        info!(
            trigger,
            eligible,
            dispatched = handles.len(),
            busy = self.dispatcher.busy(),
            "scrape trigger fired"
        );
        handles
    }

    fn try_mark_in_flight(&self, id: WebsiteId) -> Option<InFlightGuard> {
        let mut set = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        set.insert(id).then(|| InFlightGuard {
            set: Arc::clone(&self.in_flight),
            id,
        })
    }

    fn dispatch(
        self: &Arc<Self>,
        website: WebsiteConfig,
        budget: Option<u32>,
    ) -> Option<JoinHandle<()>> {
        let Some(guard) = self.try_mark_in_flight(website.id) else {
            debug!(website_id = website.id, "scrape already in flight; skipped");
            return None;
        };
        let this = Arc::clone(self);
        Some(self.dispatcher.spawn("scrape_website", async move {
            let _guard = guard;
            this.scrape_website(&website, budget).await.map(|_| ())
        }))
    }

    /// One scrape attempt plus its bookkeeping: the fetch result is recorded exactly once.
    /// Returns `None` when the retry budget was spent by another trigger, before or during the
    /// attempt; nothing is counted or emitted then.
    pub async fn scrape_website(
        &self,
        website: &WebsiteConfig,
        budget: Option<u32>,
    ) -> anyhow::Result<Option<FetchStatus>> {
        if let Some(max) = budget {
            let remaining = self
                .store
                .get_website(website.id)
                .await?
                .map(|current| current.retry_budget(max))
                .filter(|retry| retry.is_eligible())
                .map(|retry| retry.remaining());
            let Some(remaining) = remaining else {
                debug!(website_id = website.id, "retry budget spent since selection; skipped");
                return Ok(None);
            };
            debug!(website_id = website.id, remaining, "scrape attempt starting");
        }

        let outcome = self.attempt(website).await;
        let status = match &outcome {
            Ok(_) => FetchStatus::Success,
            Err(_) => FetchStatus::Failed,
        };

        let recorded = self
            .store
            .record_fetch_result(website.id, status, Utc::now(), budget)
            .await?;
        if !recorded {
            warn!(
                website_id = website.id,
                "retry budget exhausted by a concurrent attempt; result discarded"
            );
            return Ok(None);
        }

        match outcome {
            Ok(candidates) => {
                info!(
                    website_id = website.id,
                    name = %website.name,
                    candidates = candidates.len(),
                    "website scraped"
                );
                let batch = DiscoveredBatch {
                    website_id: Some(website.id),
                    source_url: website.url.clone(),
                    candidates,
                };
                if self.batches.send(batch).is_err() {
                    warn!(website_id = website.id, "article ingestion channel closed; batch dropped");
                }
            }
            Err(err) => {
                warn!(website_id = website.id, name = %website.name, error = %err, "website scrape failed");
            }
        }
        Ok(Some(status))
    }

    pub async fn attempt(
        &self,
        website: &WebsiteConfig,
    ) -> Result<Vec<ArticleCandidate>, ScrapeError> {
        let page = self
            .pages
            .fetch_page(&website.url, PageFormat::Html)
            .await
            .map_err(ScrapeError::Fetch)?;
        if page.trim().is_empty() {
            return Err(ScrapeError::EmptyPage(website.url.clone()));
        }
        let candidates = self.extract_candidates(website, &page).await?;
        Ok(normalize_candidates(&website.base_domain, candidates))
    }

    /// Asks the LLM for `{title, url}` pairs; empty or unparseable replies are retried.
    pub async fn extract_candidates(
        &self,
        website: &WebsiteConfig,
        html: &str,
    ) -> Result<Vec<ArticleCandidate>, RetryExhausted> {
        let request = TextRequest::new(
            EXTRACTION_SYSTEM_PROMPT,
            format!(
                "Base domain: {}\n\nExtract the article titles and links from this HTML:\n\n{}",
                website.base_domain, html
            ),
        );
        let operation = format!("extract_articles[{}]", website.id);
        retry_with_backoff(&self.settings.extraction_backoff, &operation, |_attempt| {
            let llm = Arc::clone(&self.llm);
            let request = request.clone();
            async move {
                let reply = llm.generate_text(request).await?;
                parse_candidates(&reply)
            }
        })
        .await
    }
}

/// Parses a JSON array of `{title, url}` objects, tolerating code fences and prose around it.
pub fn parse_candidates(reply: &str) -> Result<Vec<ArticleCandidate>, AdapterError> {
    let (Some(start), Some(end)) = (reply.find('['), reply.rfind(']')) else {
        return Err(AdapterError::MalformedResponse(
            "reply does not contain a JSON array".into(),
        ));
    };
    if end < start {
        return Err(AdapterError::MalformedResponse("unbalanced JSON array".into()));
    }
    let candidates: Vec<ArticleCandidate> = serde_json::from_str(&reply[start..=end])
        .map_err(|e| AdapterError::MalformedResponse(e.to_string()))?;
    if candidates.is_empty() {
        return Err(AdapterError::MalformedResponse("no articles extracted".into()));
    }
    Ok(candidates)
}

/// Resolves relative urls against `base_domain` and gives blank titles a placeholder.
pub fn normalize_candidates(
    base_domain: &str,
    candidates: Vec<ArticleCandidate>,
) -> Vec<ArticleCandidate> {
    candidates
        .into_iter()
        .map(|candidate| ArticleCandidate {
            title: Some(
                candidate
                    .title
                    .map(|t| t.trim().to_string())
                    .filter(|t| !t.is_empty())
                    .unwrap_or_else(|| UNTITLED_ARTICLE.to_string()),
            ),
            url: candidate
                .url
                .map(|u| u.trim().to_string())
                .filter(|u| !u.is_empty())
                .map(|u| normalize_url(base_domain, &u)),
        })
        .collect()
}

pub fn normalize_url(base_domain: &str, url: &str) -> String {
    if url.starts_with("http://") || url.starts_with("https://") {
        return url.to_string();
    }
    if let Some(rest) = url.strip_prefix("//") {
        return format!("https://{rest}");
    }
    let base = base_domain.trim_end_matches('/');
    if url.starts_with('/') {
        format!("{base}{url}")
    } else {
        format!("{base}/{url}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ScriptedGenerator, StaticPages};
    use aikg_core::NewWebsite;
    use aikg_storage::{MemoryStore, WebsiteStore};
    use std::time::Duration;

    struct Harness {
        store: Arc<MemoryStore>,
        llm: Arc<ScriptedGenerator>,
        scheduler: Arc<WebsiteScrapeScheduler>,
        batches: mpsc::UnboundedReceiver<DiscoveredBatch>,
    }

    fn harness(pages: StaticPages, llm: ScriptedGenerator) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let llm = Arc::new(llm);
        let (tx, rx) = mpsc::unbounded_channel();
        let scheduler = Arc::new(WebsiteScrapeScheduler::new(
            store.clone(),
            Arc::new(pages),
            llm.clone(),
            tx,
            Dispatcher::new(4),
            ScrapeSettings::default(),
        ));
        Harness {
            store,
            llm,
            scheduler,
            batches: rx,
        }
    }

    fn site() -> NewWebsite {
        NewWebsite {
            name: "x".into(),
            url: "https://x.com/news".into(),
            base_domain: "https://x.com".into(),
            enabled: true,
        }
    }

    async fn join(handles: Vec<JoinHandle<()>>) {
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn startup_scrape_marks_success_and_emits_absolute_urls() {
        let mut h = harness(
            StaticPages::default().with("https://x.com/news", "<a href='/a'>A</a>"),
            ScriptedGenerator::always(r#"[{"title":"A","url":"/a"}]"#),
        );
        let w = h.store.insert_website(site()).await.unwrap();

        join(h.scheduler.startup_trigger().await.unwrap()).await;

        let row = h.store.get_website(w.id).await.unwrap().unwrap();
        assert_eq!(row.last_fetch_status, FetchStatus::Success);
        assert_eq!(row.today_retry_count, 1);
        assert!(row.last_fetch_time.is_some());

        let batch = h.batches.try_recv().unwrap();
        assert_eq!(batch.website_id, Some(w.id));
        assert_eq!(batch.candidates, vec![ArticleCandidate::new("A", "https://x.com/a")]);
    }

    #[tokio::test(start_paused = true)]
    async fn extraction_retries_empty_replies_with_doubling_backoff() {
        let mut h = harness(
            StaticPages::default().with("https://x.com/news", "<html>page</html>"),
            ScriptedGenerator::new([
                Ok("[]"),
                Ok("[]"),
                Ok(r#"```json
[{"title":"A","url":"https://x.com/a"}]
```"#),
            ]),
        );
        let w = h.store.insert_website(site()).await.unwrap();
        let started = tokio::time::Instant::now();

        join(h.scheduler.startup_trigger().await.unwrap()).await;

        assert!(started.elapsed() >= Duration::from_secs(3));
        assert_eq!(h.llm.calls(), 3);
        let row = h.store.get_website(w.id).await.unwrap().unwrap();
        assert_eq!(row.last_fetch_status, FetchStatus::Success);
        assert_eq!(row.today_retry_count, 1);
        assert_eq!(h.batches.try_recv().unwrap().candidates.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_extraction_marks_failure_and_counts_once() {
        let mut h = harness(
            StaticPages::default().with("https://x.com/news", "<html>page</html>"),
            ScriptedGenerator::always("I could not find any articles."),
        );
        let w = h.store.insert_website(site()).await.unwrap();

        join(h.scheduler.pending_sweep().await.unwrap()).await;

        assert_eq!(h.llm.calls(), 3);
        let row = h.store.get_website(w.id).await.unwrap().unwrap();
        assert_eq!(row.last_fetch_status, FetchStatus::Failed);
        assert_eq!(row.today_retry_count, 1);
        assert!(h.batches.try_recv().is_err());
    }

    #[tokio::test]
    async fn fetch_failure_skips_the_llm() {
        let h = harness(StaticPages::default(), ScriptedGenerator::always("[]"));
        let w = h.store.insert_website(site()).await.unwrap();

        join(h.scheduler.failed_retry().await.unwrap()).await;
        assert_eq!(h.llm.calls(), 0, "never-fetched sites are not failed-retry candidates");

        join(h.scheduler.pending_sweep().await.unwrap()).await;
        assert_eq!(h.llm.calls(), 0);
        let row = h.store.get_website(w.id).await.unwrap().unwrap();
        assert_eq!(row.last_fetch_status, FetchStatus::Failed);

        join(h.scheduler.failed_retry().await.unwrap()).await;
        let row = h.store.get_website(w.id).await.unwrap().unwrap();
        assert_eq!(row.today_retry_count, 2);
    }

    #[tokio::test]
    async fn exhausted_budget_excludes_site_until_reset() {
        let h = harness(StaticPages::default(), ScriptedGenerator::always("[]"));
        let w = h.store.insert_website(site()).await.unwrap();
        h.store.override_retry_count(w.id, 5).await;

        assert!(h.scheduler.startup_trigger().await.unwrap().is_empty());
        assert!(h.scheduler.pending_sweep().await.unwrap().is_empty());

        assert_eq!(h.scheduler.reset_trigger().await.unwrap(), 1);
        assert_eq!(h.scheduler.pending_sweep().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn overlapping_triggers_scrape_a_site_once() {
        let h = harness(StaticPages::default(), ScriptedGenerator::always("[]"));
        let w = h.store.insert_website(site()).await.unwrap();

        let guard = h.scheduler.try_mark_in_flight(w.id).unwrap();
        assert!(h.scheduler.startup_trigger().await.unwrap().is_empty());
        assert!(matches!(
            h.scheduler.manual_scrape(w.id).await.unwrap(),
            ManualScrape::AlreadyRunning
        ));
        drop(guard);

        assert!(matches!(
            h.scheduler.manual_scrape(999).await.unwrap(),
            ManualScrape::NotFound
        ));
        let ManualScrape::Dispatched(handle) = h.scheduler.manual_scrape(w.id).await.unwrap() else {
            panic!("expected a dispatched scrape");
        };
        handle.await.unwrap();
        assert_eq!(
            h.store.get_website(w.id).await.unwrap().unwrap().today_retry_count,
            1
        );
    }

    #[tokio::test]
    async fn manual_scrape_bypasses_the_budget_but_still_counts() {
        let h = harness(StaticPages::default(), ScriptedGenerator::always("[]"));
        let w = h.store.insert_website(site()).await.unwrap();
        h.store.override_retry_count(w.id, 5).await;

        let ManualScrape::Dispatched(handle) = h.scheduler.manual_scrape(w.id).await.unwrap() else {
            panic!("expected a dispatched scrape");
        };
        handle.await.unwrap();
        assert_eq!(
            h.store.get_website(w.id).await.unwrap().unwrap().today_retry_count,
            6
        );
    }

    #[tokio::test]
    async fn attempt_is_skipped_when_budget_was_spent_after_selection() {
        let mut h = harness(
            StaticPages::default().with("https://x.com/news", "<a href='/a'>A</a>"),
            ScriptedGenerator::always(r#"[{"title":"A","url":"/a"}]"#),
        );
        let selected = h.store.insert_website(site()).await.unwrap();
        h.store.override_retry_count(selected.id, 5).await;

        let outcome = h.scheduler.scrape_website(&selected, Some(5)).await.unwrap();

        assert_eq!(outcome, None);
        assert_eq!(h.llm.calls(), 0);
        let row = h.store.get_website(selected.id).await.unwrap().unwrap();
        assert_eq!(row.today_retry_count, 5);
        assert_eq!(row.last_fetch_status, FetchStatus::NotFetched);
        assert!(h.batches.try_recv().is_err());

        let outcome = h.scheduler.scrape_website(&selected, None).await.unwrap();
        assert_eq!(outcome, Some(FetchStatus::Success));
        assert_eq!(h.batches.try_recv().unwrap().candidates.len(), 1);
    }

    #[test]
    fn relative_urls_resolve_against_the_base_domain() {
        assert_eq!(normalize_url("https://x.com", "/a"), "https://x.com/a");
        assert_eq!(normalize_url("https://x.com/", "a/b"), "https://x.com/a/b");
        assert_eq!(normalize_url("https://x.com", "https://y.com/c"), "https://y.com/c");
        assert_eq!(normalize_url("https://x.com", "//cdn.x.com/d"), "https://cdn.x.com/d");
        assert_eq!(normalize_url("https://x.com", "httpdocs/a"), "https://x.com/httpdocs/a");
        assert_eq!(normalize_url("https://x.com", "/http-guide"), "https://x.com/http-guide");
    }

    #[test]
    fn blank_titles_get_a_placeholder() {
        let normalized = normalize_candidates(
            "https://x.com",
            vec![
                ArticleCandidate {
                    title: Some(" ".into()),
                    url: Some("/a".into()),
                },
                ArticleCandidate {
                    title: Some("B".into()),
                    url: None,
                },
            ],
        );
        assert_eq!(normalized[0].title.as_deref(), Some(UNTITLED_ARTICLE));
        assert_eq!(normalized[0].url.as_deref(), Some("https://x.com/a"));
        assert_eq!(normalized[1].url, None);
    }

    #[test]
    fn malformed_replies_are_rejected() {
        assert!(parse_candidates("no json here").is_err());
        assert!(parse_candidates("[]").is_err());
        assert!(parse_candidates("] oops [").is_err());
        assert!(parse_candidates(r#"[{"title": 3}]"#).is_err());
        let parsed = parse_candidates(r#"Here you go: [{"title":"A","url":"/a"}] done"#).unwrap();
        assert_eq!(parsed.len(), 1);
    }
}
