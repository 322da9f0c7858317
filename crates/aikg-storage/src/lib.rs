//! Persistence query contracts, stores and the shared HTTP fetcher for AIKG.
//!
//! Every mutation that concurrent triggers can race on (website fetch results, article
//! claims) is a single conditional update keyed by entity id, in both store backends.

use aikg_core::{
    Article, ArticleId, ArticleStatus, FetchStatus, NewArticle, NewSubscription, NewWebsite,
    Subscription, SubscriptionId, WebsiteConfig, WebsiteId,
};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use thiserror::Error;

mod http;
mod memory;
mod postgres;

pub use http::{
    classify_reqwest_error, classify_status, FetchError, FetchedResponse, HttpClientConfig,
    HttpFetcher, RetryDisposition, SimpleTokenBucket, TokenBucketConfig,
};
pub use memory::MemoryStore;
pub use postgres::PgStore;

pub const CRATE_NAME: &str = "aikg-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },
    #[error("corrupt {entity} row: {detail}")]
    Corrupt { entity: &'static str, detail: String },
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait WebsiteStore: Send + Sync {
    async fn list_websites(&self) -> StoreResult<Vec<WebsiteConfig>>;

    async fn get_website(&self, id: WebsiteId) -> StoreResult<Option<WebsiteConfig>>;

    async fn insert_website(&self, website: NewWebsite) -> StoreResult<WebsiteConfig>;

    /// Replaces the admin-editable fields; fetch state and counters are kept.
    async fn update_website(
        &self,
        id: WebsiteId,
        website: NewWebsite,
    ) -> StoreResult<Option<WebsiteConfig>>;

    async fn set_website_enabled(
        &self,
        id: WebsiteId,
        enabled: bool,
    ) -> StoreResult<Option<WebsiteConfig>>;

    /// `enabled AND today_retry_count < max_retry`
    async fn find_enabled_with_retry_available(
        &self,
        max_retry: u32,
    ) -> StoreResult<Vec<WebsiteConfig>>;

    /// `enabled AND status = Failed AND today_retry_count < max_retry`
    async fn find_failed_with_retry_available(
        &self,
        max_retry: u32,
    ) -> StoreResult<Vec<WebsiteConfig>>;

    /// `enabled AND status IN (NotFetched, Failed) AND today_retry_count < max_retry`
    async fn find_pending_websites(&self, max_retry: u32) -> StoreResult<Vec<WebsiteConfig>>;

    /// Sets the fetch status/time and increments `today_retry_count` by one, in one step.
    ///
    /// With `max_retry = Some(max)` the update only applies while the counter is below `max`;
    /// returns whether a row was updated.
    async fn record_fetch_result(
        &self,
        id: WebsiteId,
        status: FetchStatus,
        at: DateTime<Utc>,
        max_retry: Option<u32>,
    ) -> StoreResult<bool>;

    async fn reset_all_retry_counts(&self) -> StoreResult<u64>;
}

#[async_trait]
pub trait ArticleStore: Send + Sync {
    /// Inserts a Pending article unless its url is already known (`None` then).
    async fn insert_article_if_absent(&self, article: NewArticle) -> StoreResult<Option<Article>>;

    async fn find_article_by_url(&self, url: &str) -> StoreResult<Option<Article>>;

    async fn get_article(&self, id: ArticleId) -> StoreResult<Option<Article>>;

    async fn list_articles(
        &self,
        status: Option<ArticleStatus>,
        limit: usize,
        offset: usize,
    ) -> StoreResult<Vec<Article>>;

    /// Oldest Pending articles first.
    async fn find_pending_articles(&self, limit: usize) -> StoreResult<Vec<Article>>;

    /// Processing or Failed articles not updated for longer than `timeout`, with budget left.
    /// Ages are measured against the store's own clock, the one that stamps `update_time`.
    async fn find_timeout_articles(
        &self,
        timeout: Duration,
        max_retry: u32,
    ) -> StoreResult<Vec<Article>>;

    /// Moves an article into Processing and increments `process_count`, atomically.
    ///
    /// Applies when `process_count < max_retry` and the article is Pending, or is
    /// Processing/Failed and not updated for longer than `timeout`. Returns the claimed row.
    async fn claim_article(
        &self,
        id: ArticleId,
        max_retry: u32,
        timeout: Duration,
    ) -> StoreResult<Option<Article>>;

    /// Processing -> Completed with the summary.
    async fn complete_article(&self, id: ArticleId, summary: &str) -> StoreResult<bool>;

    /// Processing -> Failed with the error message.
    async fn fail_article(&self, id: ArticleId, error_message: &str) -> StoreResult<bool>;

    /// Marks Processing articles stuck longer than `timeout` with no budget left as Failed.
    async fn expire_exhausted_articles(
        &self,
        timeout: Duration,
        max_retry: u32,
        error_message: &str,
    ) -> StoreResult<u64>;
}

#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    async fn list_subscriptions(&self) -> StoreResult<Vec<Subscription>>;

    async fn get_subscription(&self, id: SubscriptionId) -> StoreResult<Option<Subscription>>;

    async fn find_active_subscriptions(&self) -> StoreResult<Vec<Subscription>>;

    async fn find_subscriptions_by_email(&self, email: &str) -> StoreResult<Vec<Subscription>>;

    async fn find_subscriptions_by_area(&self, area: &str) -> StoreResult<Vec<Subscription>>;

    async fn insert_subscription(&self, subscription: NewSubscription)
        -> StoreResult<Subscription>;

    async fn update_subscription(
        &self,
        id: SubscriptionId,
        subscription: NewSubscription,
    ) -> StoreResult<Option<Subscription>>;

    /// Returns the removed row, if any.
    async fn delete_subscription(&self, id: SubscriptionId) -> StoreResult<Option<Subscription>>;

    async fn set_subscription_active(
        &self,
        id: SubscriptionId,
        active: bool,
    ) -> StoreResult<Option<Subscription>>;

    async fn set_subscription_cron(
        &self,
        id: SubscriptionId,
        cron: Option<String>,
    ) -> StoreResult<Option<Subscription>>;
}

/// Everything the orchestration layer needs from persistence.
pub trait Store: WebsiteStore + ArticleStore + SubscriptionStore {}

impl<T> Store for T where T: WebsiteStore + ArticleStore + SubscriptionStore {}

fn is_reclaimable(article: &Article, max_retry: u32, stale_before: DateTime<Utc>) -> bool {
    if article.process_count >= max_retry {
        return false;
    }
    match article.status {
        ArticleStatus::Pending => true,
        ArticleStatus::Processing | ArticleStatus::Failed => article.update_time < stale_before,
        ArticleStatus::Completed => false,
    }
}
