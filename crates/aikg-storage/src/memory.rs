//! In-process store used when no database is configured, and by tests.

use std::collections::{BTreeMap, HashMap};

use aikg_core::{
    Article, ArticleId, ArticleStatus, FetchStatus, NewArticle, NewSubscription, NewWebsite,
    RetryBudget, Subscription, SubscriptionId, WebsiteConfig, WebsiteId,
};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{
    is_reclaimable, ArticleStore, StoreResult, SubscriptionStore, WebsiteStore,
};

#[derive(Debug, Default)]
struct MemoryState {
    next_website_id: WebsiteId,
    next_article_id: ArticleId,
    websites: BTreeMap<WebsiteId, WebsiteConfig>,
    articles: BTreeMap<ArticleId, Article>,
    article_ids_by_url: HashMap<String, ArticleId>,
    subscriptions: BTreeMap<SubscriptionId, Subscription>,
}

/// Each operation takes the state lock once, so every update is atomic per call.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rewrites an article's `update_time`; lets callers simulate work stuck in flight.
    pub async fn override_article_update_time(&self, id: ArticleId, at: DateTime<Utc>) -> bool {
        let mut state = self.state.lock().await;
        match state.articles.get_mut(&id) {
            Some(article) => {
                article.update_time = at;
                true
            }
            None => false,
        }
    }

    /// Overwrites the retry counter of one website.
    pub async fn override_retry_count(&self, id: WebsiteId, count: u32) -> bool {
        let mut state = self.state.lock().await;
        match state.websites.get_mut(&id) {
            Some(website) => {
                website.today_retry_count = count;
                true
            }
            None => false,
        }
    }
}

fn filter_websites<F>(state: &MemoryState, predicate: F) -> Vec<WebsiteConfig>
where
    F: Fn(&WebsiteConfig) -> bool,
{
    state
        .websites
        .values()
        .filter(|w| predicate(w))
        .cloned()
        .collect()
}

#[async_trait]
impl WebsiteStore for MemoryStore {
    async fn list_websites(&self) -> StoreResult<Vec<WebsiteConfig>> {
        let state = self.state.lock().await;
        Ok(state.websites.values().cloned().collect())
    }

    async fn get_website(&self, id: WebsiteId) -> StoreResult<Option<WebsiteConfig>> {
        let state = self.state.lock().await;
        Ok(state.websites.get(&id).cloned())
    }

    async fn insert_website(&self, website: NewWebsite) -> StoreResult<WebsiteConfig> {
        let mut state = self.state.lock().await;
        state.next_website_id += 1;
        let now = Utc::now();
        let row = WebsiteConfig {
            id: state.next_website_id,
            name: website.name,
            url: website.url,
            base_domain: website.base_domain,
            enabled: website.enabled,
            today_retry_count: 0,
            last_fetch_status: FetchStatus::NotFetched,
            last_fetch_time: None,
            create_time: now,
            update_time: now,
        };
        state.websites.insert(row.id, row.clone());
        Ok(row)
    }

    async fn update_website(
        &self,
        id: WebsiteId,
        website: NewWebsite,
    ) -> StoreResult<Option<WebsiteConfig>> {
        let mut state = self.state.lock().await;
        Ok(state.websites.get_mut(&id).map(|row| {
            row.name = website.name;
            row.url = website.url;
            row.base_domain = website.base_domain;
            row.enabled = website.enabled;
            row.update_time = Utc::now();
            row.clone()
        }))
    }

    async fn set_website_enabled(
        &self,
        id: WebsiteId,
        enabled: bool,
    ) -> StoreResult<Option<WebsiteConfig>> {
        let mut state = self.state.lock().await;
        Ok(state.websites.get_mut(&id).map(|row| {
            row.enabled = enabled;
            row.update_time = Utc::now();
            row.clone()
        }))
    }

    async fn find_enabled_with_retry_available(
        &self,
        max_retry: u32,
    ) -> StoreResult<Vec<WebsiteConfig>> {
        let state = self.state.lock().await;
        Ok(filter_websites(&state, |w| {
            w.enabled && RetryBudget::allows(w.today_retry_count, max_retry)
        }))
    }

    async fn find_failed_with_retry_available(
        &self,
        max_retry: u32,
    ) -> StoreResult<Vec<WebsiteConfig>> {
        let state = self.state.lock().await;
        Ok(filter_websites(&state, |w| {
            w.enabled
                && w.last_fetch_status == FetchStatus::Failed
                && RetryBudget::allows(w.today_retry_count, max_retry)
        }))
    }

    async fn find_pending_websites(&self, max_retry: u32) -> StoreResult<Vec<WebsiteConfig>> {
        let state = self.state.lock().await;
        Ok(filter_websites(&state, |w| {
            w.enabled
                && matches!(
                    w.last_fetch_status,
                    FetchStatus::NotFetched | FetchStatus::Failed
                )
                && RetryBudget::allows(w.today_retry_count, max_retry)
        }))
    }

    async fn record_fetch_result(
        &self,
        id: WebsiteId,
        status: FetchStatus,
        at: DateTime<Utc>,
        max_retry: Option<u32>,
    ) -> StoreResult<bool> {
        let mut state = self.state.lock().await;
        let Some(row) = state.websites.get_mut(&id) else {
            return Ok(false);
        };
        if let Some(max) = max_retry {
            if !RetryBudget::allows(row.today_retry_count, max) {
                return Ok(false);
            }
        }
        row.last_fetch_status = status;
        row.last_fetch_time = Some(at);
        row.today_retry_count += 1;
        row.update_time = at;
        Ok(true)
    }

    async fn reset_all_retry_counts(&self) -> StoreResult<u64> {
        let mut state = self.state.lock().await;
        let mut touched = 0u64;
        for row in state.websites.values_mut() {
            row.today_retry_count = 0;
            touched += 1;
        }
        Ok(touched)
    }
}

#[async_trait]
impl ArticleStore for MemoryStore {
    async fn insert_article_if_absent(&self, article: NewArticle) -> StoreResult<Option<Article>> {
        let mut state = self.state.lock().await;
        if state.article_ids_by_url.contains_key(&article.url) {
            return Ok(None);
        }
        state.next_article_id += 1;
        let now = Utc::now();
        let row = Article {
            id: state.next_article_id,
            title: article.title,
            url: article.url,
            source_url: article.source_url,
            status: ArticleStatus::Pending,
            process_count: 0,
            summary: None,
            error_message: None,
            create_time: now,
            update_time: now,
        };
        state.article_ids_by_url.insert(row.url.clone(), row.id);
        state.articles.insert(row.id, row.clone());
        Ok(Some(row))
    }

    async fn find_article_by_url(&self, url: &str) -> StoreResult<Option<Article>> {
        let state = self.state.lock().await;
        Ok(state
            .article_ids_by_url
            .get(url)
            .and_then(|id| state.articles.get(id))
            .cloned())
    }

    async fn get_article(&self, id: ArticleId) -> StoreResult<Option<Article>> {
        let state = self.state.lock().await;
        Ok(state.articles.get(&id).cloned())
    }

    async fn list_articles(
        &self,
        status: Option<ArticleStatus>,
        limit: usize,
        offset: usize,
    ) -> StoreResult<Vec<Article>> {
        let state = self.state.lock().await;
        Ok(state
            .articles
            .values()
            .rev()
            .filter(|a| status.map_or(true, |s| a.status == s))
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn find_pending_articles(&self, limit: usize) -> StoreResult<Vec<Article>> {
        let state = self.state.lock().await;
        Ok(state
            .articles
            .values()
            .filter(|a| a.status == ArticleStatus::Pending)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn find_timeout_articles(
        &self,
        timeout: Duration,
        max_retry: u32,
    ) -> StoreResult<Vec<Article>> {
        let cutoff = Utc::now() - timeout;
        let state = self.state.lock().await;
        let mut rows: Vec<Article> = state
            .articles
            .values()
            .filter(|a| {
                matches!(a.status, ArticleStatus::Processing | ArticleStatus::Failed)
                    && a.update_time < cutoff
                    && a.process_count < max_retry
            })
            .cloned()
            .collect();
        rows.sort_by_key(|a| a.update_time);
        Ok(rows)
    }

    async fn claim_article(
        &self,
        id: ArticleId,
        max_retry: u32,
        timeout: Duration,
    ) -> StoreResult<Option<Article>> {
        let stale_before = Utc::now() - timeout;
        let mut state = self.state.lock().await;
        let Some(row) = state.articles.get_mut(&id) else {
            return Ok(None);
        };
        if !is_reclaimable(row, max_retry, stale_before) {
            return Ok(None);
        }
        row.status = ArticleStatus::Processing;
        row.process_count += 1;
        row.update_time = Utc::now();
        Ok(Some(row.clone()))
    }

    async fn complete_article(&self, id: ArticleId, summary: &str) -> StoreResult<bool> {
        let mut state = self.state.lock().await;
        match state.articles.get_mut(&id) {
            Some(row) if row.status == ArticleStatus::Processing => {
                row.status = ArticleStatus::Completed;
                row.summary = Some(summary.to_string());
                row.error_message = None;
                row.update_time = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn fail_article(&self, id: ArticleId, error_message: &str) -> StoreResult<bool> {
        let mut state = self.state.lock().await;
        match state.articles.get_mut(&id) {
            Some(row) if row.status == ArticleStatus::Processing => {
                row.status = ArticleStatus::Failed;
                row.error_message = Some(error_message.to_string());
                row.update_time = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn expire_exhausted_articles(
        &self,
        timeout: Duration,
        max_retry: u32,
        error_message: &str,
    ) -> StoreResult<u64> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let cutoff = now - timeout;
        let mut expired = 0u64;
        for row in state.articles.values_mut() {
            if row.status == ArticleStatus::Processing
                && row.update_time < cutoff
                && row.process_count >= max_retry
            {
                row.status = ArticleStatus::Failed;
                row.error_message = Some(error_message.to_string());
                row.update_time = now;
                expired += 1;
            }
        }
        Ok(expired)
    }
}

#[async_trait]
impl SubscriptionStore for MemoryStore {
    async fn list_subscriptions(&self) -> StoreResult<Vec<Subscription>> {
        let state = self.state.lock().await;
        let mut rows: Vec<_> = state.subscriptions.values().cloned().collect();
        rows.sort_by_key(|s| s.create_time);
        Ok(rows)
    }

    async fn get_subscription(&self, id: SubscriptionId) -> StoreResult<Option<Subscription>> {
        let state = self.state.lock().await;
        Ok(state.subscriptions.get(&id).cloned())
    }

    async fn find_active_subscriptions(&self) -> StoreResult<Vec<Subscription>> {
        let state = self.state.lock().await;
        Ok(state
            .subscriptions
            .values()
            .filter(|s| s.active)
            .cloned()
            .collect())
    }

    async fn find_subscriptions_by_email(&self, email: &str) -> StoreResult<Vec<Subscription>> {
        let state = self.state.lock().await;
        Ok(state
            .subscriptions
            .values()
            .filter(|s| s.reader_email.eq_ignore_ascii_case(email))
            .cloned()
            .collect())
    }

    async fn find_subscriptions_by_area(&self, area: &str) -> StoreResult<Vec<Subscription>> {
        let state = self.state.lock().await;
        Ok(state
            .subscriptions
            .values()
            .filter(|s| s.area == area)
            .cloned()
            .collect())
    }

    async fn insert_subscription(
        &self,
        subscription: NewSubscription,
    ) -> StoreResult<Subscription> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let row = Subscription {
            id: Uuid::new_v4(),
            area: subscription.area,
            reader: subscription.reader,
            reader_email: subscription.reader_email,
            active: subscription.active,
            schedule_cron: subscription.schedule_cron,
            create_time: now,
            update_time: now,
        };
        state.subscriptions.insert(row.id, row.clone());
        Ok(row)
    }

    async fn update_subscription(
        &self,
        id: SubscriptionId,
        subscription: NewSubscription,
    ) -> StoreResult<Option<Subscription>> {
        let mut state = self.state.lock().await;
        Ok(state.subscriptions.get_mut(&id).map(|row| {
            row.area = subscription.area;
            row.reader = subscription.reader;
            row.reader_email = subscription.reader_email;
            row.active = subscription.active;
            row.schedule_cron = subscription.schedule_cron;
            row.update_time = Utc::now();
            row.clone()
        }))
    }

    async fn delete_subscription(&self, id: SubscriptionId) -> StoreResult<Option<Subscription>> {
        let mut state = self.state.lock().await;
        Ok(state.subscriptions.remove(&id))
    }

    async fn set_subscription_active(
        &self,
        id: SubscriptionId,
        active: bool,
    ) -> StoreResult<Option<Subscription>> {
        let mut state = self.state.lock().await;
        Ok(state.subscriptions.get_mut(&id).map(|row| {
            row.active = active;
            row.update_time = Utc::now();
            row.clone()
        }))
    }

    async fn set_subscription_cron(
        &self,
        id: SubscriptionId,
        cron: Option<String>,
    ) -> StoreResult<Option<Subscription>> {
        let mut state = self.state.lock().await;
        Ok(state.subscriptions.get_mut(&id).map(|row| {
            row.schedule_cron = cron;
            row.update_time = Utc::now();
            row.clone()
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn website(name: &str) -> NewWebsite {
        NewWebsite {
            name: name.to_string(),
            url: format!("https://{name}.example/news"),
            base_domain: format!("https://{name}.example"),
            enabled: true,
        }
    }

    fn article(url: &str) -> NewArticle {
        NewArticle {
            title: "A".into(),
            url: url.into(),
            source_url: Some("https://x.com".into()),
        }
    }

    #[tokio::test]
    async fn fetch_results_increment_once_and_respect_budget() {
        let store = MemoryStore::new();
        let w = store.insert_website(website("x")).await.unwrap();

        for _ in 0..5 {
            assert!(store
                .record_fetch_result(w.id, FetchStatus::Failed, Utc::now(), Some(5))
                .await
                .unwrap());
        }
        assert!(!store
            .record_fetch_result(w.id, FetchStatus::Success, Utc::now(), Some(5))
            .await
            .unwrap());

        let row = store.get_website(w.id).await.unwrap().unwrap();
        assert_eq!(row.today_retry_count, 5);
        assert_eq!(row.last_fetch_status, FetchStatus::Failed);
        assert!(store.find_pending_websites(5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn concurrent_fetch_results_never_lose_updates() {
        let store = Arc::new(MemoryStore::new());
        let w = store.insert_website(website("x")).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..20 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .record_fetch_result(w.id, FetchStatus::Success, Utc::now(), Some(5))
                    .await
                    .unwrap()
            }));
        }
        let mut applied = 0;
        for handle in handles {
            if handle.await.unwrap() {
                applied += 1;
            }
        }

        assert_eq!(applied, 5);
        let row = store.get_website(w.id).await.unwrap().unwrap();
        assert_eq!(row.today_retry_count, 5);
    }

    #[tokio::test]
    async fn reset_twice_equals_reset_once() {
        let store = MemoryStore::new();
        let a = store.insert_website(website("a")).await.unwrap();
        let b = store.insert_website(website("b")).await.unwrap();
        store.override_retry_count(a.id, 5).await;
        store.override_retry_count(b.id, 2).await;

        store.reset_all_retry_counts().await.unwrap();
        let once = store.list_websites().await.unwrap();
        store.reset_all_retry_counts().await.unwrap();
        let twice = store.list_websites().await.unwrap();

        assert_eq!(once, twice);
        assert!(twice.iter().all(|w| w.today_retry_count == 0));
    }

    #[tokio::test]
    async fn website_queries_follow_status_and_budget() {
        let store = MemoryStore::new();
        let fresh = store.insert_website(website("fresh")).await.unwrap();
        let ok = store.insert_website(website("ok")).await.unwrap();
        let failed = store.insert_website(website("failed")).await.unwrap();
        let disabled = store.insert_website(website("disabled")).await.unwrap();
        store.set_website_enabled(disabled.id, false).await.unwrap();
        store
            .record_fetch_result(ok.id, FetchStatus::Success, Utc::now(), Some(5))
            .await
            .unwrap();
        store
            .record_fetch_result(failed.id, FetchStatus::Failed, Utc::now(), Some(5))
            .await
            .unwrap();

        let ids = |rows: Vec<WebsiteConfig>| rows.into_iter().map(|w| w.id).collect::<Vec<_>>();
        assert_eq!(
            ids(store.find_enabled_with_retry_available(5).await.unwrap()),
            vec![fresh.id, ok.id, failed.id]
        );
        assert_eq!(
            ids(store.find_pending_websites(5).await.unwrap()),
            vec![fresh.id, failed.id]
        );
        assert_eq!(
            ids(store.find_failed_with_retry_available(5).await.unwrap()),
            vec![failed.id]
        );
        assert!(store.find_failed_with_retry_available(1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn duplicate_urls_are_not_inserted_twice() {
        let store = MemoryStore::new();
        assert!(store
            .insert_article_if_absent(article("https://x.com/a"))
            .await
            .unwrap()
            .is_some());
        assert!(store
            .insert_article_if_absent(article("https://x.com/a"))
            .await
            .unwrap()
            .is_none());
        assert_eq!(store.list_articles(None, 10, 0).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn claim_increments_process_count_and_blocks_fresh_reclaim() {
        let store = MemoryStore::new();
        let a = store
            .insert_article_if_absent(article("https://x.com/a"))
            .await
            .unwrap()
            .unwrap();
        let timeout = Duration::minutes(30);

        let claimed = store.claim_article(a.id, 3, timeout).await.unwrap().unwrap();
        assert_eq!(claimed.status, ArticleStatus::Processing);
        assert_eq!(claimed.process_count, 1);
        assert!(store.claim_article(a.id, 3, timeout).await.unwrap().is_none());

        store
            .override_article_update_time(a.id, Utc::now() - Duration::minutes(45))
            .await;
        let reclaimed = store.claim_article(a.id, 3, timeout).await.unwrap().unwrap();
        assert_eq!(reclaimed.process_count, 2);
    }

    #[tokio::test]
    async fn timeout_queries_skip_exhausted_articles_and_expire_them() {
        let store = MemoryStore::new();
        let a = store
            .insert_article_if_absent(article("https://x.com/a"))
            .await
            .unwrap()
            .unwrap();
        let long_ago = Utc::now() - Duration::hours(2);
        for _ in 0..3 {
            store.override_article_update_time(a.id, long_ago).await;
            store.claim_article(a.id, 3, Duration::zero()).await.unwrap().unwrap();
        }
        store.override_article_update_time(a.id, long_ago).await;
        let timeout = Duration::minutes(30);

        assert!(store.find_timeout_articles(timeout, 3).await.unwrap().is_empty());
        assert!(store.claim_article(a.id, 3, timeout).await.unwrap().is_none());
        assert_eq!(
            store
                .expire_exhausted_articles(timeout, 3, "timed out")
                .await
                .unwrap(),
            1
        );
        let row = store.get_article(a.id).await.unwrap().unwrap();
        assert_eq!(row.status, ArticleStatus::Failed);
        assert_eq!(row.process_count, 3);
        assert_eq!(row.error_message.as_deref(), Some("timed out"));
    }

    #[tokio::test]
    async fn subscription_status_and_cron_updates() {
        let store = MemoryStore::new();
        let sub = store
            .insert_subscription(NewSubscription {
                area: "llm".into(),
                reader: "engineer".into(),
                reader_email: "Reader@Example.com".into(),
                active: true,
                schedule_cron: None,
            })
            .await
            .unwrap();

        assert_eq!(store.find_active_subscriptions().await.unwrap().len(), 1);
        store.set_subscription_active(sub.id, false).await.unwrap();
        assert!(store.find_active_subscriptions().await.unwrap().is_empty());
        let updated = store
            .set_subscription_cron(sub.id, Some("0 0 9 * * *".into()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.schedule_cron.as_deref(), Some("0 0 9 * * *"));
        assert_eq!(
            store
                .find_subscriptions_by_email("reader@example.com")
                .await
                .unwrap()
                .len(),
            1
        );
        assert!(store.delete_subscription(sub.id).await.unwrap().is_some());
        assert!(store.delete_subscription(sub.id).await.unwrap().is_none());
    }
}
