//! Core domain model, retry budgets and backoff for AIKG.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

pub const CRATE_NAME: &str = "aikg-core";

pub type WebsiteId = i64;
pub type ArticleId = i64;
pub type SubscriptionId = Uuid;

/// Title stored for extracted candidates that came back without one.
pub const UNTITLED_ARTICLE: &str = "Untitled";

/// Outcome of the most recent scrape attempt for a website.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FetchStatus {
    #[default]
    NotFetched,
    Success,
    Failed,
}

impl FetchStatus {
    pub fn as_i16(self) -> i16 {
        match self {
            Self::NotFetched => 0,
            Self::Success => 1,
            Self::Failed => 2,
        }
    }

    pub fn from_i16(value: i16) -> Option<Self> {
        match value {
            0 => Some(Self::NotFetched),
            1 => Some(Self::Success),
            2 => Some(Self::Failed),
            _ => None,
        }
    }
}

/// A listing page that is scraped for article links.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebsiteConfig {
    pub id: WebsiteId,
    pub name: String,
    pub url: String,
    pub base_domain: String,
    pub enabled: bool,
    pub today_retry_count: u32,
    pub last_fetch_status: FetchStatus,
    pub last_fetch_time: Option<DateTime<Utc>>,
    pub create_time: DateTime<Utc>,
    pub update_time: DateTime<Utc>,
}

impl WebsiteConfig {
    pub fn retry_budget(&self, max: u32) -> RetryBudget {
        RetryBudget::new(self.today_retry_count, max)
    }
}

/// Admin-supplied fields for creating or replacing a website.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewWebsite {
    pub name: String,
    pub url: String,
    pub base_domain: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ArticleStatus {
    #[default]
    Pending,
    Processing,
    Completed,
    Failed,
}

impl ArticleStatus {
    pub fn as_i16(self) -> i16 {
        match self {
            Self::Pending => 0,
            Self::Processing => 1,
            Self::Completed => 2,
            Self::Failed => 3,
        }
    }

    pub fn from_i16(value: i16) -> Option<Self> {
        match value {
            0 => Some(Self::Pending),
            1 => Some(Self::Processing),
            2 => Some(Self::Completed),
            3 => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "pending" | "0" => Some(Self::Pending),
            "processing" | "1" => Some(Self::Processing),
            "completed" | "2" => Some(Self::Completed),
            "failed" | "3" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// A discovered article. The full text is never persisted, only the summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Article {
    pub id: ArticleId,
    pub title: String,
    pub url: String,
    pub source_url: Option<String>,
    pub status: ArticleStatus,
    pub process_count: u32,
    pub summary: Option<String>,
    pub error_message: Option<String>,
    pub create_time: DateTime<Utc>,
    pub update_time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewArticle {
    pub title: String,
    pub url: String,
    pub source_url: Option<String>,
}

/// One `{title, url}` pair extracted from a listing page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ArticleCandidate {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
}

impl ArticleCandidate {
    pub fn new(title: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            title: Some(title.into()),
            url: Some(url.into()),
        }
    }

    /// Returns the trimmed title and url, or `None` when either is missing.
    pub fn to_new_article(&self, source_url: Option<&str>) -> Option<NewArticle> {
        let title = self.title.as_deref().map(str::trim).filter(|t| !t.is_empty())?;
        let url = self.url.as_deref().map(str::trim).filter(|u| !u.is_empty())?;
        Some(NewArticle {
            title: title.to_string(),
            url: url.to_string(),
            source_url: source_url.map(str::to_string),
        })
    }
}

/// Batch emitted by a successful scrape attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredBatch {
    pub website_id: Option<WebsiteId>,
    pub source_url: String,
    pub candidates: Vec<ArticleCandidate>,
}

/// A newsletter subscription: one topic, one persona, one recipient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub area: String,
    pub reader: String,
    pub reader_email: String,
    pub active: bool,
    pub schedule_cron: Option<String>,
    pub create_time: DateTime<Utc>,
    pub update_time: DateTime<Utc>,
}

impl Subscription {
    /// The subscription's own cron, or `default` when unset or blank.
    pub fn effective_cron<'a>(&'a self, default: &'a str) -> &'a str {
        match self.schedule_cron.as_deref().map(str::trim) {
            Some(cron) if !cron.is_empty() => cron,
            _ => default,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewSubscription {
    pub area: String,
    pub reader: String,
    pub reader_email: String,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default)]
    pub schedule_cron: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionChangeKind {
    Created,
    Updated,
    Deleted,
    Activated,
    Deactivated,
    ScheduleUpdated,
}

impl SubscriptionChangeKind {
    /// Whether the live job must be (re)created, as opposed to cancelled.
    pub fn requires_schedule(self) -> bool {
        matches!(
            self,
            Self::Created | Self::Updated | Self::Activated | Self::ScheduleUpdated
        )
    }
}

/// Published after every successful subscription mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionChange {
    pub kind: SubscriptionChangeKind,
    pub subscription: Subscription,
}

/// Bounded attempt counter for one entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryBudget {
    pub used: u32,
    pub max: u32,
}

impl RetryBudget {
    pub fn new(used: u32, max: u32) -> Self {
        Self { used, max }
    }

    pub fn allows(used: u32, max: u32) -> bool {
        used < max
    }

    pub fn is_eligible(&self) -> bool {
        Self::allows(self.used, self.max)
    }

    pub fn remaining(&self) -> u32 {
        self.max.saturating_sub(self.used)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{operation} gave up after {attempts} attempts: {last_error}")]
pub struct RetryExhausted {
    pub operation: String,
    pub attempts: usize,
    pub last_error: String,
}

/// Runs `attempt_fn` until it succeeds or `policy.max_attempts` is reached, sleeping
/// `delay_for_attempt(n)` between consecutive attempts. No sleep follows the final attempt.
pub async fn retry_with_backoff<T, E, F, Fut>(
    policy: &BackoffPolicy,
    operation: &str,
    mut attempt_fn: F,
) -> Result<T, RetryExhausted>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let attempts = policy.max_attempts.max(1);
    let mut last_error = String::new();

    for attempt in 0..attempts {
        match attempt_fn(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => {
                last_error = err.to_string();
                if attempt + 1 < attempts {
                    let delay = policy.delay_for_attempt(attempt);
                    warn!(
                        operation,
                        attempt = attempt + 1,
                        max_attempts = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %last_error,
                        "attempt failed; backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    warn!(operation, attempts, error = %last_error, "retries exhausted");
    Err(RetryExhausted {
        operation: operation.to_string(),
        attempts,
        last_error,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 24, 12, 0, 0).single().unwrap()
    }

    #[test]
    fn retry_budget_gates_on_strictly_less_than_max() {
        assert!(RetryBudget::new(0, 5).is_eligible());
        assert!(RetryBudget::new(4, 5).is_eligible());
        assert!(!RetryBudget::new(5, 5).is_eligible());
        assert!(!RetryBudget::new(0, 0).is_eligible());
        assert_eq!(RetryBudget::new(7, 5).remaining(), 0);
    }

    #[test]
    fn backoff_doubles_from_one_second_and_caps() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_sleeps_between_attempts_and_returns_first_success() {
        let calls = AtomicUsize::new(0);
        let started = tokio::time::Instant::now();
        let result = retry_with_backoff(&BackoffPolicy::default(), "test-op", |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 2 {
                    Err("empty response")
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;

        assert_eq!(result, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(started.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_reports_last_error_when_exhausted() {
        let err = retry_with_backoff(&BackoffPolicy::default(), "summary", |attempt| async move {
            Err::<(), _>(format!("boom {attempt}"))
        })
        .await
        .unwrap_err();

        assert_eq!(err.attempts, 3);
        assert_eq!(err.last_error, "boom 2");
        assert_eq!(err.operation, "summary");
    }

    #[test]
    fn candidate_without_title_or_url_is_rejected() {
        assert!(ArticleCandidate::default().to_new_article(None).is_none());
        assert!(ArticleCandidate {
            title: Some("  ".into()),
            url: Some("https://x.com/a".into())
        }
        .to_new_article(None)
        .is_none());
        let article = ArticleCandidate::new(" A ", " https://x.com/a ")
            .to_new_article(Some("https://x.com"))
            .unwrap();
        assert_eq!(article.title, "A");
        assert_eq!(article.url, "https://x.com/a");
        assert_eq!(article.source_url.as_deref(), Some("https://x.com"));
    }

    #[test]
    fn effective_cron_falls_back_for_blank_values() {
        let mut sub = Subscription {
            id: Uuid::new_v4(),
            area: "llm".into(),
            reader: "engineer".into(),
            reader_email: "a@b.c".into(),
            active: true,
            schedule_cron: Some("   ".into()),
            create_time: ts(),
            update_time: ts(),
        };
        assert_eq!(sub.effective_cron("0 0 8 * * *"), "0 0 8 * * *");
        sub.schedule_cron = Some("0 30 9 * * *".into());
        assert_eq!(sub.effective_cron("0 0 8 * * *"), "0 30 9 * * *");
    }

    #[test]
    fn status_codes_round_trip_through_storage_encoding() {
        for status in [
            ArticleStatus::Pending,
            ArticleStatus::Processing,
            ArticleStatus::Completed,
            ArticleStatus::Failed,
        ] {
            assert_eq!(ArticleStatus::from_i16(status.as_i16()), Some(status));
        }
        assert_eq!(FetchStatus::from_i16(2), Some(FetchStatus::Failed));
        assert_eq!(ArticleStatus::parse("Completed"), Some(ArticleStatus::Completed));
        assert_eq!(
            serde_json::to_string(&SubscriptionChangeKind::ScheduleUpdated).unwrap(),
            "\"schedule_updated\""
        );
    }
}
