//! External capability contracts (page fetch, text generation, email) and their implementations.

use std::collections::BTreeMap;

use aikg_storage::FetchError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

mod llm;
mod mail;
mod page;

pub use llm::{render_template, ChatClient, ChatClientConfig, PLAIN_TEXT_INSTRUCTION};
pub use mail::{LogMailer, RelayMailer, RelayMailerConfig};
pub use page::{clean_html, html_to_text, HttpPageFetcher};

pub const CRATE_NAME: &str = "aikg-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("page fetch failed: {0}")]
    Fetch(#[from] FetchError),
    #[error("text generation failed: {0}")]
    Llm(String),
    #[error("mail delivery failed: {0}")]
    Mail(String),
    #[error("malformed response: {0}")]
    MalformedResponse(String),
    #[error("configuration error: {0}")]
    Config(String),
}

/// How a fetched page should be returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PageFormat {
    /// Markup kept, scripts/styles/comments and noisy attributes removed.
    #[default]
    Html,
    /// Visible text only.
    Text,
}

/// A single-turn generation request. `{name}` placeholders in `system_prompt` are
/// filled from `variables`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TextRequest {
    pub system_prompt: String,
    pub user_prompt: String,
    pub variables: BTreeMap<String, String>,
}

impl TextRequest {
    pub fn new(system_prompt: impl Into<String>, user_prompt: impl Into<String>) -> Self {
        Self {
            system_prompt: system_prompt.into(),
            user_prompt: user_prompt.into(),
            variables: BTreeMap::new(),
        }
    }

    pub fn with_variable(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.variables.insert(name.into(), value.into());
        self
    }
}

#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch_page(&self, url: &str, format: PageFormat) -> Result<String, AdapterError>;
}

/// Callers own retry and backoff; implementations make exactly one call.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate_text(&self, request: TextRequest) -> Result<String, AdapterError>;
}

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send_email(&self, to: &str, subject: &str, body: &str) -> Result<(), AdapterError>;

    /// One message addressed to every recipient.
    async fn send_batch_email(
        &self,
        to: &[String],
        subject: &str,
        body: &str,
    ) -> Result<(), AdapterError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_request_collects_variables() {
        let request = TextRequest::new("sys {area}", "user")
            .with_variable("area", "robotics")
            .with_variable("reader", "student");
        assert_eq!(request.variables.len(), 2);
        assert_eq!(request.variables["area"], "robotics");
    }

    #[test]
    fn adapter_errors_render_their_source() {
        let err = AdapterError::MalformedResponse("expected a JSON array".into());
        assert_eq!(err.to_string(), "malformed response: expected a JSON array");
    }

    #[test]
    fn fetch_failures_convert_into_adapter_errors() {
        let err: AdapterError = FetchError::HttpStatus {
            status: 503,
            url: "https://x.com/news".into(),
        }
        .into();
        assert!(matches!(err, AdapterError::Fetch(FetchError::HttpStatus { status: 503, .. })));
        assert_eq!(
            err.to_string(),
            "page fetch failed: http status 503 for https://x.com/news"
        );
    }
}
