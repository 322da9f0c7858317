//! OpenAI-compatible chat-completions client.

use std::collections::BTreeMap;
use std::sync::LazyLock;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use regex::{Captures, Regex};
use reqwest::header;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{AdapterError, TextGenerator, TextRequest};

pub const PLAIN_TEXT_INSTRUCTION: &str = "Respond in plain text only. Do not use Markdown or any \
other markup: no headings, bold, lists or tables.";

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("placeholder regex"));

/// Replaces `{name}` with `variables[name]`; unknown placeholders are left untouched.
pub fn render_template(template: &str, variables: &BTreeMap<String, String>) -> String {
    PLACEHOLDER
        .replace_all(template, |caps: &Captures<'_>| match variables.get(&caps[1]) {
            Some(value) => value.clone(),
            None => caps[0].to_string(),
        })
        .into_owned()
}

#[derive(Debug, Clone)]
pub struct ChatClientConfig {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub timeout: Duration,
    pub temperature: Option<f32>,
}

#[derive(Debug, Clone)]
pub struct ChatClient {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    temperature: Option<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Serialize)]
struct ChatRequestBody<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Deserialize)]
struct ChatResponseRaw {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessageResponse,
}

#[derive(Debug, Deserialize)]
struct ChatMessageResponse {
    #[serde(default)]
    content: Option<String>,
}

impl ChatClient {
    pub fn new(config: ChatClientConfig) -> Result<Self, AdapterError> {
        if config.api_key.trim().is_empty() {
            return Err(AdapterError::Config("LLM API key is empty".into()));
        }
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| AdapterError::Config(format!("building LLM http client: {e}")))?;
        Ok(Self {
            http,
            api_key: config.api_key,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model,
            temperature: config.temperature,
        })
    }
}

fn build_messages(request: &TextRequest, timestamp_ms: i64) -> Vec<ChatMessage> {
    let mut variables = request.variables.clone();
    variables.insert("timestamp".to_string(), timestamp_ms.to_string());

    let mut system = render_template(&request.system_prompt, &variables);
    if !system.to_ascii_lowercase().contains("plain text") {
        if !system.is_empty() {
            system.push('\n');
        }
        system.push_str(PLAIN_TEXT_INSTRUCTION);
    }
    system.push_str(&format!("\nCurrent timestamp: {timestamp_ms}"));

    vec![
        ChatMessage {
            role: "system",
            content: system,
        },
        ChatMessage {
            role: "user",
            content: request.user_prompt.clone(),
        },
    ]
}

fn first_completion(raw: ChatResponseRaw) -> Result<String, AdapterError> {
    raw.choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .ok_or_else(|| AdapterError::MalformedResponse("completion has no content".into()))
}

#[async_trait]
impl TextGenerator for ChatClient {
    async fn generate_text(&self, request: TextRequest) -> Result<String, AdapterError> {
        let started = Instant::now();
        let body = ChatRequestBody {
            model: &self.model,
            messages: build_messages(&request, Utc::now().timestamp_millis()),
            temperature: self.temperature,
        };
        debug!(
            system_chars = body.messages[0].content.len(),
            user_chars = request.user_prompt.len(),
            "calling chat completion"
        );

        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .header(header::AUTHORIZATION, format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                warn!(error = %e, "chat completion request failed");
                AdapterError::Llm(e.to_string())
            })?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            warn!(status = %status, error = %error_text, "chat completion api error");
            return Err(AdapterError::Llm(format!("status {status}: {error_text}")));
        }

        let raw: ChatResponseRaw = response
            .json()
            .await
            .map_err(|e| AdapterError::MalformedResponse(e.to_string()))?;
        let content = first_completion(raw)?;

        info!(
            model = %self.model,
            duration_ms = started.elapsed().as_millis() as u64,
            response_chars = content.len(),
            "chat completion finished"
        );
        Ok(content)
    }
}
