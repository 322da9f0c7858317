use std::path::PathBuf;
use std::time::Duration;

use aikg_core::BackoffPolicy;
use thiserror::Error;
use tokio_cron_scheduler::Job;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),
    #[error("invalid value for {name}: {value:?}")]
    Invalid { name: &'static str, value: String },
    #[error("invalid cron expression for {name}: {cron:?} ({reason})")]
    InvalidCron {
        name: &'static str,
        cron: String,
        reason: String,
    },
}

/// Checks a six-field (seconds-first) cron expression.
pub fn validate_cron(name: &'static str, cron: &str) -> Result<(), ConfigError> {
    Job::new_async(cron, |_uuid, _l| Box::pin(async {}))
        .map(|_| ())
        .map_err(|e| ConfigError::InvalidCron {
            name,
            cron: cron.to_string(),
            reason: e.to_string(),
        })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LlmSettings {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailSettings {
    pub relay_url: Option<String>,
    pub relay_token: Option<String>,
    pub from: String,
    pub admin_recipients: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSettings {
    pub retry_reset: String,
    pub website_sweep: String,
    pub failed_retry: String,
    pub pending_articles: String,
    pub timeout_articles: String,
    pub default_send: String,
    pub subscription_refresh: String,
}

impl Default for CronSettings {
    fn default() -> Self {
        Self {
            retry_reset: "0 0 0 * * *".to_string(),
            website_sweep: "0 */10 * * * *".to_string(),
            failed_retry: "0 */10 * * * *".to_string(),
            pending_articles: "0 */5 * * * *".to_string(),
            timeout_articles: "0 */30 * * * *".to_string(),
            default_send: "0 0 8 * * *".to_string(),
            subscription_refresh: "0 0 1 * * *".to_string(),
        }
    }
}

impl CronSettings {
    pub fn named(&self) -> [(&'static str, &str); 7] {
        [
            ("CRON_RETRY_RESET", &self.retry_reset),
            ("CRON_WEBSITE_SWEEP", &self.website_sweep),
            ("CRON_FAILED_RETRY", &self.failed_retry),
            ("CRON_PENDING_ARTICLES", &self.pending_articles),
            ("CRON_TIMEOUT_ARTICLES", &self.timeout_articles),
            ("CRON_DEFAULT_SEND", &self.default_send),
            ("CRON_SUBSCRIPTION_REFRESH", &self.subscription_refresh),
        ]
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, cron) in self.named() {
            validate_cron(name, cron)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    pub database_url: Option<String>,
    pub seed_file: Option<PathBuf>,
    pub llm: LlmSettings,
    pub mail: MailSettings,
    pub crons: CronSettings,
    pub website_max_retry: u32,
    pub article_max_retry: u32,
    pub article_batch_size: usize,
    pub article_timeout_minutes: i64,
    pub scrape_startup_delay_secs: u64,
    pub worker_concurrency: usize,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub fetch_min_interval_ms: u64,
    pub bind_addr: String,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds the config from any key lookup; unset or blank keys take their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let text = |name: &str, default: &str| get(name).unwrap_or_else(|| default.to_string());

        let api_key = get("LLM_API_KEY").ok_or(ConfigError::Missing("LLM_API_KEY"))?;

        let config = Self {
            database_url: get("DATABASE_URL"),
            seed_file: get("AIKG_SEED_FILE").map(PathBuf::from),
            llm: LlmSettings {
                api_key,
                base_url: text("LLM_BASE_URL", "https://api.openai.com/v1"),
                model: text("LLM_MODEL", "gpt-4o-mini"),
                timeout_secs: parse_number(&get, "LLM_TIMEOUT_SECS", 120)?,
            },
            mail: MailSettings {
                relay_url: get("MAIL_RELAY_URL"),
                relay_token: get("MAIL_RELAY_TOKEN"),
                from: text("MAIL_FROM", "aikg@localhost"),
                admin_recipients: get("MAIL_ADMIN_RECIPIENTS")
                    .map(|v| {
                        v.split(',')
                            .map(str::trim)
                            .filter(|s| !s.is_empty())
                            .map(ToString::to_string)
                            .collect()
                    })
                    .unwrap_or_default(),
            },
            crons: CronSettings {
                retry_reset: text("CRON_RETRY_RESET", "0 0 0 * * *"),
                website_sweep: text("CRON_WEBSITE_SWEEP", "0 */10 * * * *"),
                failed_retry: text("CRON_FAILED_RETRY", "0 */10 * * * *"),
                pending_articles: text("CRON_PENDING_ARTICLES", "0 */5 * * * *"),
                timeout_articles: text("CRON_TIMEOUT_ARTICLES", "0 */30 * * * *"),
                default_send: text("CRON_DEFAULT_SEND", "0 0 8 * * *"),
                subscription_refresh: text("CRON_SUBSCRIPTION_REFRESH", "0 0 1 * * *"),
            },
            website_max_retry: parse_number(&get, "WEBSITE_MAX_RETRY", 5)?,
            article_max_retry: parse_number(&get, "ARTICLE_MAX_RETRY", 3)?,
            article_batch_size: parse_number(&get, "ARTICLE_BATCH_SIZE", 10)?,
            article_timeout_minutes: parse_number(&get, "ARTICLE_TIMEOUT_MINUTES", 30)?,
            scrape_startup_delay_secs: parse_number(&get, "SCRAPE_STARTUP_DELAY_SECS", 5)?,
            worker_concurrency: parse_number(&get, "WORKER_CONCURRENCY", 10)?,
            http_timeout_secs: parse_number(&get, "HTTP_TIMEOUT_SECS", 20)?,
            user_agent: text("AIKG_USER_AGENT", "aikg-bot/0.1"),
            fetch_min_interval_ms: parse_number(&get, "FETCH_MIN_INTERVAL_MS", 1000)?,
            bind_addr: text("AIKG_BIND", "0.0.0.0:8080"),
        };

        if config.article_timeout_minutes <= 0 {
            return Err(ConfigError::Invalid {
                name: "ARTICLE_TIMEOUT_MINUTES",
                value: config.article_timeout_minutes.to_string(),
            });
        }
        config.crons.validate()?;
        Ok(config)
    }

    pub fn article_timeout(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.article_timeout_minutes)
    }

    pub fn startup_delay(&self) -> Duration {
        Duration::from_secs(self.scrape_startup_delay_secs)
    }

    /// Backoff shared by article extraction and summary generation: 3 attempts, 1s then 2s.
    pub fn llm_backoff(&self) -> BackoffPolicy {
        BackoffPolicy::default()
    }
}

fn parse_number<T, G>(get: &G, name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    G: Fn(&str) -> Option<String>,
{
    match get(name) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid {
            name,
            value: raw,
        }),
    }
}
