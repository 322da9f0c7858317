//! Outbound email through an HTTP relay, or a log-only stand-in.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header;
use serde::Serialize;
use tracing::{info, warn};

use crate::{AdapterError, Mailer};

#[derive(Debug, Clone)]
pub struct RelayMailerConfig {
    pub endpoint: String,
    pub token: Option<String>,
    pub from: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct RelayMailer {
    http: reqwest::Client,
    endpoint: String,
    token: Option<String>,
    from: String,
}

#[derive(Debug, Serialize, PartialEq)]
struct RelayMessage<'a> {
    from: &'a str,
    to: &'a [String],
    subject: &'a str,
    text: &'a str,
}

impl RelayMailer {
    pub fn new(config: RelayMailerConfig) -> Result<Self, AdapterError> {
        if config.endpoint.trim().is_empty() {
            return Err(AdapterError::Config("mail relay url is empty".into()));
        }
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| AdapterError::Config(format!("building mail http client: {e}")))?;
        Ok(Self {
            http,
            endpoint: config.endpoint,
            token: config.token.filter(|t| !t.trim().is_empty()),
            from: config.from,
        })
    }
}

#[async_trait]
impl Mailer for RelayMailer {
    async fn send_email(&self, to: &str, subject: &str, body: &str) -> Result<(), AdapterError> {
        self.send_batch_email(&[to.to_string()], subject, body).await
    }

    async fn send_batch_email(
        &self,
        to: &[String],
        subject: &str,
        body: &str,
    ) -> Result<(), AdapterError> {
        if to.is_empty() {
            return Err(AdapterError::Mail("no recipients".into()));
        }
        let message = RelayMessage {
            from: &self.from,
            to,
            subject,
            text: body,
        };
        let mut request = self.http.post(&self.endpoint).json(&message);
        if let Some(token) = &self.token {
            request = request.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }

        let response = request.send().await.map_err(|e| {
            warn!(error = %e, recipients = to.len(), "mail relay request failed");
            AdapterError::Mail(e.to_string())
        })?;
        let status = response.status();
        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            warn!(status = %status, error = %error_body, "mail relay rejected message");
            return Err(AdapterError::Mail(format!("relay status {status}: {error_body}")));
        }

        info!(recipients = to.len(), subject, "email sent");
        Ok(())
    }
}

/// Logs messages instead of delivering them.
#[derive(Debug, Clone, Default)]
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send_email(&self, to: &str, subject: &str, body: &str) -> Result<(), AdapterError> {
        info!(to, subject, body_chars = body.len(), "mail relay not configured; email logged");
        Ok(())
    }

    async fn send_batch_email(
        &self,
        to: &[String],
        subject: &str,
        body: &str,
    ) -> Result<(), AdapterError> {
        info!(
            to = %to.join(","),
            subject,
            body_chars = body.len(),
            "mail relay not configured; batch email logged"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relay_payload_lists_every_recipient() {
        let to = vec!["a@x.com".to_string(), "b@x.com".to_string()];
        let message = RelayMessage {
            from: "aikg@localhost",
            to: &to,
            subject: "AIKG-Hello",
            text: "body",
        };
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "from": "aikg@localhost",
                "to": ["a@x.com", "b@x.com"],
                "subject": "AIKG-Hello",
                "text": "body"
            })
        );
    }

    #[test]
    fn relay_requires_an_endpoint_and_drops_blank_tokens() {
        assert!(matches!(
            RelayMailer::new(RelayMailerConfig {
                endpoint: " ".into(),
                token: None,
                from: "aikg@localhost".into(),
                timeout: Duration::from_secs(5),
            }),
            Err(AdapterError::Config(_))
        ));
        let mailer = RelayMailer::new(RelayMailerConfig {
            endpoint: "http://127.0.0.1:9/send".into(),
            token: Some("".into()),
            from: "aikg@localhost".into(),
            timeout: Duration::from_secs(5),
        })
        .unwrap();
        assert!(mailer.token.is_none());
    }

    #[tokio::test]
    async fn empty_batches_are_rejected_before_any_request() {
        let mailer = RelayMailer::new(RelayMailerConfig {
            endpoint: "http://127.0.0.1:9/send".into(),
            token: None,
            from: "aikg@localhost".into(),
            timeout: Duration::from_secs(5),
        })
        .unwrap();
        let err = mailer.send_batch_email(&[], "s", "b").await.unwrap_err();
        assert!(matches!(err, AdapterError::Mail(_)));
    }

    #[tokio::test]
    async fn log_mailer_always_succeeds() {
        LogMailer.send_email("a@x.com", "s", "b").await.unwrap();
        LogMailer
            .send_batch_email(&["a@x.com".into()], "s", "b")
            .await
            .unwrap();
    }
}
