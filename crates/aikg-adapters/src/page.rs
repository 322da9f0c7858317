//! Page fetch through the shared rate-limited fetcher.

use std::sync::{Arc, LazyLock};

use aikg_storage::HttpFetcher;
use async_trait::async_trait;
use regex::Regex;
use scraper::Html;
use tracing::debug;

use crate::{AdapterError, PageFetcher, PageFormat};

static NOISY_BLOCKS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?is)<script\b[^>]*>.*?</script\s*>",
        r"(?is)<style\b[^>]*>.*?</style\s*>",
        r"(?is)<noscript\b[^>]*>.*?</noscript\s*>",
        r"(?is)<iframe\b[^>]*>.*?</iframe\s*>",
        r"(?s)<!--.*?-->",
        r"(?i)<(?:meta|link)\b[^>]*>",
    ]
    .iter()
    .map(|pattern| Regex::new(pattern).expect("block regex"))
    .collect()
});

static NOISY_ATTRIBUTES: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)\s+(?:on[a-z]+|data-[a-z0-9_-]+)\s*=\s*(?:"[^"]*"|'[^']*'|[^\s>]+)"#)
        .expect("attribute regex")
});

static BLANK_RUNS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n[ \t]*(?:\n[ \t]*)+").expect("blank-run regex"));

/// Removes scripts, styles, noscript blocks, iframes, comments, meta/link tags, inline event
/// handlers and `data-*` attributes; collapses blank-line runs.
pub fn clean_html(html: &str) -> String {
    let mut cleaned = html.to_string();
    for block in NOISY_BLOCKS.iter() {
        cleaned = block.replace_all(&cleaned, "").into_owned();
    }
    let cleaned = NOISY_ATTRIBUTES.replace_all(&cleaned, "");
    BLANK_RUNS.replace_all(&cleaned, "\n").trim().to_string()
}

/// Visible text of a document, one text run per line.
pub fn html_to_text(html: &str) -> String {
    let document = Html::parse_document(&clean_html(html));
    document
        .root_element()
        .text()
        .map(|t| t.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

#[derive(Debug, Clone)]
pub struct HttpPageFetcher {
    http: Arc<HttpFetcher>,
}

impl HttpPageFetcher {
    pub fn new(http: Arc<HttpFetcher>) -> Self {
        Self { http }
    }
}

#[async_trait]
impl PageFetcher for HttpPageFetcher {
    async fn fetch_page(&self, url: &str, format: PageFormat) -> Result<String, AdapterError> {
        let response = self.http.fetch_bytes(url).await?;
        let raw = response.text();
        let page = match format {
            PageFormat::Html => clean_html(&raw),
            PageFormat::Text => html_to_text(&raw),
        };
        debug!(
            url,
            final_url = %response.final_url,
            raw_chars = raw.len(),
            chars = page.len(),
            ?format,
            "page fetched"
        );
        Ok(page)
    }
}
