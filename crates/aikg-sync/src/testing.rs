//! Hand-written fakes for the external capabilities.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use aikg_adapters::{AdapterError, Mailer, PageFetcher, PageFormat, TextGenerator, TextRequest};
use async_trait::async_trait;

/// Replies with queued responses in order; repeats `fallback` once the queue is empty.
#[derive(Default)]
pub struct ScriptedGenerator {
    replies: Mutex<VecDeque<Result<String, String>>>,
    fallback: Option<String>,
    pub requests: Mutex<Vec<TextRequest>>,
    calls: AtomicUsize,
}

impl ScriptedGenerator {
    pub fn new<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = Result<S, S>>,
        S: Into<String>,
    {
        Self {
            replies: Mutex::new(
                replies
                    .into_iter()
                    .map(|r| r.map(Into::into).map_err(Into::into))
                    .collect(),
            ),
            ..Self::default()
        }
    }

    pub fn always(reply: impl Into<String>) -> Self {
        Self {
            fallback: Some(reply.into()),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TextGenerator for ScriptedGenerator {
    async fn generate_text(&self, request: TextRequest) -> Result<String, AdapterError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request);
        let next = self.replies.lock().unwrap().pop_front();
        match (next, &self.fallback) {
            (Some(Ok(text)), _) => Ok(text),
            (Some(Err(err)), _) => Err(AdapterError::Llm(err)),
            (None, Some(text)) => Ok(text.clone()),
            (None, None) => Err(AdapterError::Llm("no scripted reply".into())),
        }
    }
}

/// Serves fixed bodies per url; unknown urls fail.
#[derive(Default)]
pub struct StaticPages {
    pages: HashMap<String, String>,
    pub fetches: Mutex<Vec<(String, PageFormat)>>,
}

impl StaticPages {
    pub fn with(mut self, url: &str, body: &str) -> Self {
        self.pages.insert(url.to_string(), body.to_string());
        self
    }
}

#[async_trait]
impl PageFetcher for StaticPages {
    async fn fetch_page(&self, url: &str, format: PageFormat) -> Result<String, AdapterError> {
        self.fetches.lock().unwrap().push((url.to_string(), format));
        self.pages
            .get(url)
            .cloned()
            .ok_or_else(|| AdapterError::Llm(format!("no page for {url}")))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMail {
    pub to: Vec<String>,
    pub subject: String,
    pub body: String,
}

#[derive(Default)]
pub struct RecordingMailer {
    pub sent: Mutex<Vec<SentMail>>,
    fail_for: Option<String>,
}

impl RecordingMailer {
    /// Rejects every message addressed to `address`.
    pub fn failing_for(address: &str) -> Self {
        Self {
            fail_for: Some(address.to_string()),
            ..Self::default()
        }
    }

    pub fn sent(&self) -> Vec<SentMail> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Mailer for RecordingMailer {
    async fn send_email(&self, to: &str, subject: &str, body: &str) -> Result<(), AdapterError> {
        self.send_batch_email(&[to.to_string()], subject, body).await
    }

    async fn send_batch_email(
        &self,
        to: &[String],
        subject: &str,
        body: &str,
    ) -> Result<(), AdapterError> {
        if let Some(bad) = &self.fail_for {
            if to.iter().any(|t| t == bad) {
                return Err(AdapterError::Mail(format!("relay rejected {bad}")));
            }
        }
        self.sent.lock().unwrap().push(SentMail {
            to: to.to_vec(),
            subject: subject.to_string(),
            body: body.to_string(),
        });
        Ok(())
    }
}
