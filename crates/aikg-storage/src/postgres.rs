//! Postgres-backed store.

use aikg_core::{
    Article, ArticleId, ArticleStatus, FetchStatus, NewArticle, NewSubscription, NewWebsite,
    Subscription, SubscriptionId, WebsiteConfig, WebsiteId,
};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use tracing::info;
use uuid::Uuid;

use crate::{ArticleStore, StoreError, StoreResult, SubscriptionStore, WebsiteStore};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS website_config (
        id BIGSERIAL PRIMARY KEY,
        name TEXT NOT NULL,
        url TEXT NOT NULL,
        base_domain TEXT NOT NULL,
        enabled BOOLEAN NOT NULL DEFAULT TRUE,
        today_retry_count INTEGER NOT NULL DEFAULT 0,
        last_fetch_status SMALLINT NOT NULL DEFAULT 0,
        last_fetch_time TIMESTAMPTZ,
        create_time TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        update_time TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS article (
        id BIGSERIAL PRIMARY KEY,
        title TEXT NOT NULL,
        url TEXT NOT NULL UNIQUE,
        source_url TEXT,
        status SMALLINT NOT NULL DEFAULT 0,
        process_count INTEGER NOT NULL DEFAULT 0,
        summary TEXT,
        error_message TEXT,
        create_time TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        update_time TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    "CREATE INDEX IF NOT EXISTS article_status_update_idx ON article (status, update_time)",
    r#"
    CREATE TABLE IF NOT EXISTS subscription_role (
        id UUID PRIMARY KEY,
        area TEXT NOT NULL,
        reader TEXT NOT NULL,
        reader_email TEXT NOT NULL,
        active BOOLEAN NOT NULL DEFAULT TRUE,
        schedule_cron TEXT,
        create_time TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        update_time TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
];

const WEBSITE_COLUMNS: &str = "id, name, url, base_domain, enabled, today_retry_count, \
     last_fetch_status, last_fetch_time, create_time, update_time";
const ARTICLE_COLUMNS: &str = "id, title, url, source_url, status, process_count, summary, \
     error_message, create_time, update_time";
const SUBSCRIPTION_COLUMNS: &str =
    "id, area, reader, reader_email, active, schedule_cron, create_time, update_time";

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Creates missing tables; existing tables are left untouched.
    pub async fn ensure_schema(&self) -> StoreResult<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        info!("database schema ready");
        Ok(())
    }
}

fn non_negative(value: i32) -> u32 {
    u32::try_from(value).unwrap_or(0)
}

fn website_from_row(row: &PgRow) -> StoreResult<WebsiteConfig> {
    let status: i16 = row.try_get("last_fetch_status")?;
    Ok(WebsiteConfig {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        url: row.try_get("url")?,
        base_domain: row.try_get("base_domain")?,
        enabled: row.try_get("enabled")?,
        today_retry_count: non_negative(row.try_get("today_retry_count")?),
        last_fetch_status: FetchStatus::from_i16(status).ok_or_else(|| StoreError::Corrupt {
            entity: "website_config",
            detail: format!("unknown last_fetch_status {status}"),
        })?,
        last_fetch_time: row.try_get("last_fetch_time")?,
        create_time: row.try_get("create_time")?,
        update_time: row.try_get("update_time")?,
    })
}

fn article_from_row(row: &PgRow) -> StoreResult<Article> {
    let status: i16 = row.try_get("status")?;
    Ok(Article {
        id: row.try_get("id")?,
        title: row.try_get("title")?,
        url: row.try_get("url")?,
        source_url: row.try_get("source_url")?,
        status: ArticleStatus::from_i16(status).ok_or_else(|| StoreError::Corrupt {
            entity: "article",
            detail: format!("unknown status {status}"),
        })?,
        process_count: non_negative(row.try_get("process_count")?),
        summary: row.try_get("summary")?,
        error_message: row.try_get("error_message")?,
        create_time: row.try_get("create_time")?,
        update_time: row.try_get("update_time")?,
    })
}

fn subscription_from_row(row: &PgRow) -> StoreResult<Subscription> {
    Ok(Subscription {
        id: row.try_get("id")?,
        area: row.try_get("area")?,
        reader: row.try_get("reader")?,
        reader_email: row.try_get("reader_email")?,
        active: row.try_get("active")?,
        schedule_cron: row.try_get("schedule_cron")?,
        create_time: row.try_get("create_time")?,
        update_time: row.try_get("update_time")?,
    })
}

fn collect<T>(rows: Vec<PgRow>, map: fn(&PgRow) -> StoreResult<T>) -> StoreResult<Vec<T>> {
    rows.iter().map(map).collect()
}

fn as_i32(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

/// `update_time` older than the interval bound at `$param`, measured on the database clock
/// that also stamps `update_time`.
fn stale_since(param: usize) -> String {
    format!("update_time < NOW() - make_interval(secs => ${param})")
}

fn as_secs(value: Duration) -> f64 {
    value.num_milliseconds() as f64 / 1000.0
}

fn as_i64(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

#[async_trait]
impl WebsiteStore for PgStore {
    async fn list_websites(&self) -> StoreResult<Vec<WebsiteConfig>> {
        let rows = sqlx::query(&format!(
            "SELECT {WEBSITE_COLUMNS} FROM website_config ORDER BY id"
        ))
        .fetch_all(&self.pool)
        .await?;
        collect(rows, website_from_row)
    }

    async fn get_website(&self, id: WebsiteId) -> StoreResult<Option<WebsiteConfig>> {
        let row = sqlx::query(&format!(
            "SELECT {WEBSITE_COLUMNS} FROM website_config WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(website_from_row).transpose()
    }

    async fn insert_website(&self, website: NewWebsite) -> StoreResult<WebsiteConfig> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO website_config (name, url, base_domain, enabled)
            VALUES ($1, $2, $3, $4)
            RETURNING {WEBSITE_COLUMNS}
            "#
        ))
        .bind(&website.name)
        .bind(&website.url)
        .bind(&website.base_domain)
        .bind(website.enabled)
        .fetch_one(&self.pool)
        .await?;
        website_from_row(&row)
    }

    async fn update_website(
        &self,
        id: WebsiteId,
        website: NewWebsite,
    ) -> StoreResult<Option<WebsiteConfig>> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE website_config
               SET name = $2, url = $3, base_domain = $4, enabled = $5, update_time = NOW()
             WHERE id = $1
            RETURNING {WEBSITE_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(&website.name)
        .bind(&website.url)
        .bind(&website.base_domain)
        .bind(website.enabled)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(website_from_row).transpose()
    }

    async fn set_website_enabled(
        &self,
        id: WebsiteId,
        enabled: bool,
    ) -> StoreResult<Option<WebsiteConfig>> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE website_config SET enabled = $2, update_time = NOW()
             WHERE id = $1
            RETURNING {WEBSITE_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(enabled)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(website_from_row).transpose()
    }

    async fn find_enabled_with_retry_available(
        &self,
        max_retry: u32,
    ) -> StoreResult<Vec<WebsiteConfig>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {WEBSITE_COLUMNS} FROM website_config
             WHERE enabled AND today_retry_count < $1
             ORDER BY id
            "#
        ))
        .bind(as_i32(max_retry))
        .fetch_all(&self.pool)
        .await?;
        collect(rows, website_from_row)
    }

    async fn find_failed_with_retry_available(
        &self,
        max_retry: u32,
    ) -> StoreResult<Vec<WebsiteConfig>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {WEBSITE_COLUMNS} FROM website_config
             WHERE enabled AND last_fetch_status = $1 AND today_retry_count < $2
             ORDER BY id
            "#
        ))
        .bind(FetchStatus::Failed.as_i16())
        .bind(as_i32(max_retry))
        .fetch_all(&self.pool)
        .await?;
        collect(rows, website_from_row)
    }

    async fn find_pending_websites(&self, max_retry: u32) -> StoreResult<Vec<WebsiteConfig>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {WEBSITE_COLUMNS} FROM website_config
             WHERE enabled AND last_fetch_status IN ($1, $2) AND today_retry_count < $3
             ORDER BY id
            "#
        ))
        .bind(FetchStatus::NotFetched.as_i16())
        .bind(FetchStatus::Failed.as_i16())
        .bind(as_i32(max_retry))
        .fetch_all(&self.pool)
        .await?;
        collect(rows, website_from_row)
    }

    async fn record_fetch_result(
        &self,
        id: WebsiteId,
        status: FetchStatus,
        at: DateTime<Utc>,
        max_retry: Option<u32>,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE website_config
               SET last_fetch_status = $2,
                   last_fetch_time = $3,
                   today_retry_count = today_retry_count + 1,
                   update_time = $3
             WHERE id = $1
               AND ($4::INTEGER IS NULL OR today_retry_count < $4)
            "#,
        )
        .bind(id)
        .bind(status.as_i16())
        .bind(at)
        .bind(max_retry.map(as_i32))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn reset_all_retry_counts(&self) -> StoreResult<u64> {
        let result = sqlx::query("UPDATE website_config SET today_retry_count = 0")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl ArticleStore for PgStore {
    async fn insert_article_if_absent(&self, article: NewArticle) -> StoreResult<Option<Article>> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO article (title, url, source_url, status)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (url) DO NOTHING
            RETURNING {ARTICLE_COLUMNS}
            "#
        ))
        .bind(&article.title)
        .bind(&article.url)
        .bind(&article.source_url)
        .bind(ArticleStatus::Pending.as_i16())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(article_from_row).transpose()
    }

    async fn find_article_by_url(&self, url: &str) -> StoreResult<Option<Article>> {
        let row = sqlx::query(&format!("SELECT {ARTICLE_COLUMNS} FROM article WHERE url = $1"))
            .bind(url)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(article_from_row).transpose()
    }

    async fn get_article(&self, id: ArticleId) -> StoreResult<Option<Article>> {
        let row = sqlx::query(&format!("SELECT {ARTICLE_COLUMNS} FROM article WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(article_from_row).transpose()
    }

    async fn list_articles(
        &self,
        status: Option<ArticleStatus>,
        limit: usize,
        offset: usize,
    ) -> StoreResult<Vec<Article>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {ARTICLE_COLUMNS} FROM article
             WHERE ($1::SMALLINT IS NULL OR status = $1)
             ORDER BY id DESC
             LIMIT $2 OFFSET $3
            "#
        ))
        .bind(status.map(ArticleStatus::as_i16))
        .bind(as_i64(limit))
        .bind(as_i64(offset))
        .fetch_all(&self.pool)
        .await?;
        collect(rows, article_from_row)
    }

    async fn find_pending_articles(&self, limit: usize) -> StoreResult<Vec<Article>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {ARTICLE_COLUMNS} FROM article
             WHERE status = $1
             ORDER BY create_time, id
             LIMIT $2
            "#
        ))
        .bind(ArticleStatus::Pending.as_i16())
        .bind(as_i64(limit))
        .fetch_all(&self.pool)
        .await?;
        collect(rows, article_from_row)
    }

    async fn find_timeout_articles(
        &self,
        timeout: Duration,
        max_retry: u32,
    ) -> StoreResult<Vec<Article>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {ARTICLE_COLUMNS} FROM article
             WHERE status IN ($1, $2) AND {} AND process_count < $4
             ORDER BY update_time
            "#,
            stale_since(3)
        ))
        .bind(ArticleStatus::Processing.as_i16())
        .bind(ArticleStatus::Failed.as_i16())
        .bind(as_secs(timeout))
        .bind(as_i32(max_retry))
        .fetch_all(&self.pool)
        .await?;
        collect(rows, article_from_row)
    }

    async fn claim_article(
        &self,
        id: ArticleId,
        max_retry: u32,
        timeout: Duration,
    ) -> StoreResult<Option<Article>> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE article
               SET status = $4, process_count = process_count + 1, update_time = NOW()
             WHERE id = $1
               AND process_count < $2
               AND (status = $5 OR (status IN ($4, $6) AND {}))
            RETURNING {ARTICLE_COLUMNS}
            "#,
            stale_since(3)
        ))
        .bind(id)
        .bind(as_i32(max_retry))
        .bind(as_secs(timeout))
        .bind(ArticleStatus::Processing.as_i16())
        .bind(ArticleStatus::Pending.as_i16())
        .bind(ArticleStatus::Failed.as_i16())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(article_from_row).transpose()
    }

    async fn complete_article(&self, id: ArticleId, summary: &str) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE article
               SET status = $3, summary = $2, error_message = NULL, update_time = NOW()
             WHERE id = $1 AND status = $4
            "#,
        )
        .bind(id)
        .bind(summary)
        .bind(ArticleStatus::Completed.as_i16())
        .bind(ArticleStatus::Processing.as_i16())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn fail_article(&self, id: ArticleId, error_message: &str) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE article
               SET status = $3, error_message = $2, update_time = NOW()
             WHERE id = $1 AND status = $4
            "#,
        )
        .bind(id)
        .bind(error_message)
        .bind(ArticleStatus::Failed.as_i16())
        .bind(ArticleStatus::Processing.as_i16())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn expire_exhausted_articles(
        &self,
        timeout: Duration,
        max_retry: u32,
        error_message: &str,
    ) -> StoreResult<u64> {
        let result = sqlx::query(&format!(
            r#"
            UPDATE article
               SET status = $4, error_message = $3, update_time = NOW()
             WHERE status = $5 AND {} AND process_count >= $2
            "#,
            stale_since(1)
        ))
        .bind(as_secs(timeout))
        .bind(as_i32(max_retry))
        .bind(error_message)
        .bind(ArticleStatus::Failed.as_i16())
        .bind(ArticleStatus::Processing.as_i16())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl SubscriptionStore for PgStore {
    async fn list_subscriptions(&self) -> StoreResult<Vec<Subscription>> {
        let rows = sqlx::query(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscription_role ORDER BY create_time"
        ))
        .fetch_all(&self.pool)
        .await?;
        collect(rows, subscription_from_row)
    }

    async fn get_subscription(&self, id: SubscriptionId) -> StoreResult<Option<Subscription>> {
        let row = sqlx::query(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscription_role WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(subscription_from_row).transpose()
    }

    async fn find_active_subscriptions(&self) -> StoreResult<Vec<Subscription>> {
        let rows = sqlx::query(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscription_role WHERE active ORDER BY create_time"
        ))
        .fetch_all(&self.pool)
        .await?;
        collect(rows, subscription_from_row)
    }

    async fn find_subscriptions_by_email(&self, email: &str) -> StoreResult<Vec<Subscription>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {SUBSCRIPTION_COLUMNS} FROM subscription_role
             WHERE LOWER(reader_email) = LOWER($1)
             ORDER BY create_time
            "#
        ))
        .bind(email)
        .fetch_all(&self.pool)
        .await?;
        collect(rows, subscription_from_row)
    }

    async fn find_subscriptions_by_area(&self, area: &str) -> StoreResult<Vec<Subscription>> {
        let rows = sqlx::query(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscription_role WHERE area = $1 ORDER BY create_time"
        ))
        .bind(area)
        .fetch_all(&self.pool)
        .await?;
        collect(rows, subscription_from_row)
    }

    async fn insert_subscription(
        &self,
        subscription: NewSubscription,
    ) -> StoreResult<Subscription> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO subscription_role (id, area, reader, reader_email, active, schedule_cron)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING {SUBSCRIPTION_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(&subscription.area)
        .bind(&subscription.reader)
        .bind(&subscription.reader_email)
        .bind(subscription.active)
        .bind(&subscription.schedule_cron)
        .fetch_one(&self.pool)
        .await?;
        subscription_from_row(&row)
    }

    async fn update_subscription(
        &self,
        id: SubscriptionId,
        subscription: NewSubscription,
    ) -> StoreResult<Option<Subscription>> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE subscription_role
               SET area = $2, reader = $3, reader_email = $4, active = $5,
                   schedule_cron = $6, update_time = NOW()
             WHERE id = $1
            RETURNING {SUBSCRIPTION_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(&subscription.area)
        .bind(&subscription.reader)
        .bind(&subscription.reader_email)
        .bind(subscription.active)
        .bind(&subscription.schedule_cron)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(subscription_from_row).transpose()
    }

    async fn delete_subscription(&self, id: SubscriptionId) -> StoreResult<Option<Subscription>> {
        let row = sqlx::query(&format!(
            "DELETE FROM subscription_role WHERE id = $1 RETURNING {SUBSCRIPTION_COLUMNS}"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(subscription_from_row).transpose()
    }

    async fn set_subscription_active(
        &self,
        id: SubscriptionId,
        active: bool,
    ) -> StoreResult<Option<Subscription>> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE subscription_role SET active = $2, update_time = NOW()
             WHERE id = $1
            RETURNING {SUBSCRIPTION_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(active)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(subscription_from_row).transpose()
    }

    async fn set_subscription_cron(
        &self,
        id: SubscriptionId,
        cron: Option<String>,
    ) -> StoreResult<Option<Subscription>> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE subscription_role SET schedule_cron = $2, update_time = NOW()
             WHERE id = $1
            RETURNING {SUBSCRIPTION_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(cron)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(subscription_from_row).transpose()
    }
}
