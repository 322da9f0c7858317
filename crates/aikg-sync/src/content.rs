//! Title-then-body newsletter generation for one (area, reader) pair.

use std::sync::{Arc, LazyLock, Mutex, PoisonError};
use std::time::Instant;

use aikg_adapters::{AdapterError, TextGenerator, TextRequest};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use regex::Regex;
use tracing::{debug, info, warn};

pub const SUBJECT_PREFIX: &str = "AIKG-";
pub const FALLBACK_TITLE: &str = "AIKG Daily Digest";
pub const MAX_TITLES: usize = 60;

pub const TITLE_SYSTEM_PROMPT: &str = "You are a professional content creator who writes \
compelling titles for a specific field and target audience.\n\
Reply in plain text only, without Markdown or any other formatting.\n\
Before writing, think about the core concepts of the field and what the readers care about.\n\
Produce 60 titles on completely different topics. Every title must:\n\
1. be engaging and focus on one concrete piece of knowledge\n\
2. be highly relevant to the field and the readers\n\
3. not be time-sensitive\n\
4. be original and substantial\n\
5. vary in style, avoiding repeated sentence structures\n\
6. use varied forms such as questions, statements and exclamations\n\
7. cover these types:\n\
   - question (Why ...? How ...?)\n\
   - numeric list (5 tips for ..., 3 ways to ...)\n\
   - comparison (... vs ..., the difference between ... and ...)\n\
   - story (the story of ..., the legend of ...)\n\
   - opinion (the truth about ..., myths of ...)\n\
   - trend (the future of ..., where ... is heading)\n\
   - practical (a guide to ..., the ... handbook)\n\
8. use vivid verbs and adjectives\n\
9. spark the reader's curiosity\n\
Return only the list, one title per line, with no numbering or commentary.\n\
Field: {area}. Readers: {reader}.";

pub const CONTENT_SYSTEM_PROMPT: &str = "You are a professional writer skilled at deep \
analysis.\n\
Reply in plain text only, without Markdown or any other formatting.\n\
Think carefully before writing so the piece is well reasoned, clear and insightful.\n\
The article must be authoritative yet easy for the target readers to follow, must not be \
time-sensitive, and must not contain mathematical formulas or program code.\n\
Every article must be original and clearly different from earlier ones.\n\
Requirements:\n\
1. Length: at least 2000 characters.\n\
2. Structure:\n\
   - Introduction: present the topic and the question or claim\n\
   - Body: 3 to 5 main sections of 300 to 500 characters each\n\
   - Conclusion: summarize the key points and look ahead\n\
   - Further reading: 3 to 5 related article titles with links and a one-line note on each\n\
3. Depth: analyze root causes, support claims with evidence, compare viewpoints and offer \
several solutions.\n\
4. Craft: use concrete examples and analogies, pose questions to the reader and give \
practical advice.\n\
Style: {style_guidance}\n\
End the article with a note that it was generated by AI and readers should judge its \
accuracy for themselves.";

/// Writing-style guidance, one picked uniformly per article.
pub const WRITING_STYLES: [&str; 8] = [
    "Academic paper style with introduction, method, results and discussion; rigorous and \
     logically tight, with detailed supporting arguments.",
    "Storytelling style that explains complex ideas through vivid cases and metaphors and \
     draws the reader into the narrative.",
    "Question-and-answer style that anticipates the reader's questions and answers them in \
     depth, each question leading further into the topic.",
    "Opinion-analysis style that states one central argument, examines it from several angles \
     and contrasts competing views.",
    "Practical-guide style with concrete steps, methods and advice, including implementation \
     details and caveats.",
    "Interview style that simulates a conversation with a domain expert and surfaces \
     professional insight through questions and answers.",
    "Case-study style that analyzes specific cases in depth and ties theory to practice.",
    "Trend-forecast style that reviews the current state and projects future directions from \
     history and evidence.",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedContent {
    pub title: String,
    pub style: &'static str,
    pub subject: String,
    pub body: String,
}

pub struct ContentGenerationFlow {
    llm: Arc<dyn TextGenerator>,
    rng: Mutex<StdRng>,
}

impl ContentGenerationFlow {
    pub fn new(llm: Arc<dyn TextGenerator>) -> Self {
        Self::with_rng(llm, StdRng::from_entropy())
    }

    pub fn with_rng(llm: Arc<dyn TextGenerator>, rng: StdRng) -> Self {
        Self {
            llm,
            rng: Mutex::new(rng),
        }
    }

    pub async fn generate(
        &self,
        area: &str,
        reader: &str,
    ) -> Result<GeneratedContent, AdapterError> {
        let started = Instant::now();

        let titles = self.generate_titles(area, reader).await?;
        let title = self.select_title(&titles);
        let style = self.select_style();
        info!(area, reader, candidates = titles.len(), title = %title, "title selected");

        let raw = self
            .llm
            .generate_text(
                TextRequest::new(
                    CONTENT_SYSTEM_PROMPT,
                    format!(
                        "Write a high-quality article from the following brief.\n\
                         Field: {area}\nReaders: {reader}\nTitle: {title}\n\n\
                         Keep it closely tied to the field and the title, accessible, engaging \
                         and practical, at least 2000 characters, and end with a further-reading \
                         section of 3 to 5 related articles."
                    ),
                )
                .with_variable("area", area)
                .with_variable("reader", reader)
                .with_variable("title", title.as_str())
                .with_variable("style_guidance", style),
            )
            .await?;
        let body = normalize_plain_text(&raw);
        debug!(
            raw_chars = raw.chars().count(),
            body_chars = body.chars().count(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "content generated"
        );

        Ok(GeneratedContent {
            subject: format!("{SUBJECT_PREFIX}{title}"),
            title,
            style,
            body,
        })
    }

    async fn generate_titles(
        &self,
        area: &str,
        reader: &str,
    ) -> Result<Vec<String>, AdapterError> {
        let reply = self
            .llm
            .generate_text(
                TextRequest::new(
                    TITLE_SYSTEM_PROMPT,
                    format!(
                        "Generate 60 high-quality article titles for this field and audience.\n\
                         Field: {area}\nReaders: {reader}\n\n\
                         Mix the types (how-to, list, question, opinion and so on), give every \
                         title its own concrete topic, and vary the wording and structure."
                    ),
                )
                .with_variable("area", area)
                .with_variable("reader", reader),
            )
            .await?;
        let titles = parse_titles(&reply);
        if titles.is_empty() {
            warn!(area, reader, "title generation returned no usable titles");
        }
        Ok(titles)
    }

    fn select_title(&self, titles: &[String]) -> String {
        if titles.is_empty() {
            return FALLBACK_TITLE.to_string();
        }
        let index = self
            .rng
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .gen_range(0..titles.len());
        titles[index].clone()
    }

    fn select_style(&self) -> &'static str {
        let index = self
            .rng
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .gen_range(0..WRITING_STYLES.len());
        WRITING_STYLES[index]
    }
}

static NUMBERED_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d+\.").expect("numbered line regex"));
static BULLET_PREFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[-*]\s+").expect("bullet prefix regex"));

/// One title per non-blank line. Numbered lines are dropped, bullets stripped, and at most
/// [`MAX_TITLES`] kept.
pub fn parse_titles(reply: &str) -> Vec<String> {
    reply
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter(|line| !NUMBERED_LINE.is_match(line))
        .map(|line| BULLET_PREFIX.replace(line, "").trim().to_string())
        .filter(|line| !line.is_empty())
        .take(MAX_TITLES)
        .collect()
}

static FENCED_CODE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"```[^`]*```").expect("fenced code regex"));
static LIST_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^[ \t]*[-*+][ \t]+").expect("list marker regex"));
static ORDERED_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^[ \t]*\d+\.[ \t]+").expect("ordered marker regex"));
static BOLD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\*\*(.+?)\*\*").expect("bold regex"));
static ITALIC: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\*(.+?)\*").expect("italic regex"));
static HEADING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^[ \t]*#+[ \t]+").expect("heading regex"));
static LINK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[([^\]]+)\]\([^)]*\)").expect("link regex"));
static INLINE_CODE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"`([^`]+)`").expect("inline code regex"));
static BLANK_RUN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n(?:[ \t]*\n){2,}").expect("blank run regex"));

/// Strips Markdown down to its visible text. List markers go before emphasis so a leading
/// `* ` is never read as an italic opener.
pub fn normalize_plain_text(markdown: &str) -> String {
    let text = FENCED_CODE.replace_all(markdown, "");
    let text = LIST_MARKER.replace_all(&text, "");
    let text = ORDERED_MARKER.replace_all(&text, "");
    let text = BOLD.replace_all(&text, "${1}");
    let text = ITALIC.replace_all(&text, "${1}");
    let text = HEADING.replace_all(&text, "");
    let text = LINK.replace_all(&text, "${1}");
    let text = INLINE_CODE.replace_all(&text, "${1}");
    let text = BLANK_RUN.replace_all(&text, "\n\n");
    text.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedGenerator;

    fn flow(
        replies: Vec<Result<&str, &str>>,
        seed: u64,
    ) -> (Arc<ScriptedGenerator>, ContentGenerationFlow) {
        let llm = Arc::new(ScriptedGenerator::new(replies));
        let flow = ContentGenerationFlow::with_rng(llm.clone(), StdRng::seed_from_u64(seed));
        (llm, flow)
    }

    #[test]
    fn markdown_markers_are_removed_completely() {
        let input = "# Heading\n\n**bold** then `code` and [text](https://x.com/a)";
        assert_eq!(
            normalize_plain_text(input),
            "Heading\n\nbold then code and text"
        );
    }

    #[test]
    fn normalization_handles_lists_code_blocks_and_blank_runs() {
        let input = "  \n## Intro\n\n\n\n- first *point*\n* second\n1. third\n\n```rust\nfn main() {}\n```\nDone.\n";
        assert_eq!(
            normalize_plain_text(input),
            "Intro\n\nfirst point\nsecond\nthird\n\nDone."
        );
    }

    #[test]
    fn title_parsing_drops_numbering_and_bullets() {
        let reply = "\n  Why robots dream  \n1. numbered title\n- A bulleted title\n* Starred title\n\n   \nPlain title";
        assert_eq!(
            parse_titles(reply),
            vec![
                "Why robots dream",
                "A bulleted title",
                "Starred title",
                "Plain title"
            ]
        );
    }

    #[test]
    fn title_parsing_caps_the_list() {
        let reply = (0..80).map(|i| format!("Title {i}")).collect::<Vec<_>>().join("\n");
        let titles = parse_titles(&reply);
        assert_eq!(titles.len(), MAX_TITLES);
        assert_eq!(titles[59], "Title 59");
    }

    #[tokio::test]
    async fn generation_prefixes_the_subject_and_normalizes_the_body() {
        let (llm, flow) = flow(
            vec![
                Ok("Only one title"),
                Ok("## Section\n\n**Key idea** explained.\n\nThis article was generated by AI."),
            ],
            7,
        );
        let content = flow.generate("robotics", "students").await.unwrap();

        assert_eq!(content.title, "Only one title");
        assert_eq!(content.subject, "AIKG-Only one title");
        assert_eq!(
            content.body,
            "Section\n\nKey idea explained.\n\nThis article was generated by AI."
        );
        assert!(WRITING_STYLES.contains(&content.style));

        let requests = llm.requests.lock().unwrap();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].variables["area"], "robotics");
        assert_eq!(requests[1].variables["title"], "Only one title");
        assert_eq!(requests[1].variables["style_guidance"], content.style);
    }

    #[tokio::test]
    async fn empty_title_list_falls_back_to_the_default_title() {
        let (_llm, flow) = flow(vec![Ok("1. only numbered\n2. lines"), Ok("Body")], 1);
        let content = flow.generate("history", "kids").await.unwrap();
        assert_eq!(content.title, FALLBACK_TITLE);
        assert_eq!(content.subject, format!("{SUBJECT_PREFIX}{FALLBACK_TITLE}"));
    }

    #[tokio::test]
    async fn generation_errors_propagate() {
        let (llm, flow) = flow(vec![Err("upstream down")], 1);
        let err = flow.generate("history", "kids").await.unwrap_err();
        assert!(err.to_string().contains("upstream down"));
        assert_eq!(llm.calls(), 1);
    }

    #[test]
    fn selection_stays_within_bounds() {
        let flow = ContentGenerationFlow::with_rng(
            Arc::new(ScriptedGenerator::default()),
            StdRng::seed_from_u64(42),
        );
        let titles: Vec<String> = (0..5).map(|i| format!("T{i}")).collect();
        for _ in 0..50 {
            assert!(titles.contains(&flow.select_title(&titles)));
            assert!(WRITING_STYLES.contains(&flow.select_style()));
        }
    }
}
