//! Deterministic capability stubs for tests.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream;

use crate::capability::{LiteratureIndex, PiiRedaction, TextGeneration, TextStream};
use crate::error::{Capability, CapabilityError};
use crate::model::{AnalyzedArticle, ArticleCandidate, ChatTurn, SearchHit};

pub fn hit(id: &str, similarity: f64, journal_rank: f64) -> SearchHit {
    SearchHit {
        id: id.to_string(),
        title: format!("Article {id}"),
        abstract_text: format!("Abstract of {id}"),
        similarity,
        journal_rank,
        full_text_available: false,
    }
}

pub fn candidate(id: &str, similarity: f64, journal_rank: f64) -> ArticleCandidate {
    ArticleCandidate {
        id: id.to_string(),
        title: format!("Article {id}"),
        abstract_text: format!("Abstract of {id}"),
        score: similarity,
        similarity,
        journal_rank,
        full_text_available: false,
    }
}

pub fn analyzed(id: &str) -> AnalyzedArticle {
    AnalyzedArticle {
        candidate: candidate(id, 0.8, 0.5),
        relevance_summary: format!("Summary of {id}"),
        extracted_evidence: vec![format!("Finding from {id}")],
    }
}

#[derive(Debug, Clone)]
enum Action {
    Reply(String),
    Fail,
    Panic,
    Delay(Duration),
}

#[derive(Default)]
struct GeneratorState {
    completed: AtomicUsize,
    last_chat: Mutex<Vec<ChatTurn>>,
}

/// Generator answering by the first rule whose needle occurs in the prompt.
///
/// Matching delay rules are applied before the reply. Unmatched prompts get an
/// empty reply.
#[derive(Clone, Default)]
pub struct ScriptedGenerator {
    rules: Vec<(String, Action)>,
    chunks: Vec<String>,
    chat_fails: bool,
    state: Arc<GeneratorState>,
}

impl ScriptedGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reply(mut self, needle: &str, response: &str) -> Self {
        self.rules
            .push((needle.to_string(), Action::Reply(response.to_string())));
        self
    }

    pub fn fail_on(mut self, needle: &str) -> Self {
        self.rules.push((needle.to_string(), Action::Fail));
        self
    }

    pub fn panic_on(mut self, needle: &str) -> Self {
        self.rules.push((needle.to_string(), Action::Panic));
        self
    }

    pub fn delay_on(mut self, needle: &str, delay: Duration) -> Self {
        self.rules.push((needle.to_string(), Action::Delay(delay)));
        self
    }

    pub fn chat_chunks<I, S>(mut self, chunks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.chunks = chunks.into_iter().map(Into::into).collect();
        self
    }

    pub fn failing_chat(mut self) -> Self {
        self.chat_fails = true;
        self
    }

    /// Number of `generate` calls that ran to completion.
    pub fn completed_calls(&self) -> usize {
        self.state.completed.load(Ordering::SeqCst)
    }

    pub fn last_chat_turns(&self) -> Vec<ChatTurn> {
        self.state
            .last_chat
            .lock()
            .map(|turns| turns.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl TextGeneration for ScriptedGenerator {
    async fn generate(&self, _preamble: &str, prompt: &str) -> Result<String, CapabilityError> {
        for (needle, action) in &self.rules {
            if let Action::Delay(delay) = action {
                if prompt.contains(needle.as_str()) {
                    tokio::time::sleep(*delay).await;
                }
            }
        }

        let action = self.rules.iter().find_map(|(needle, action)| {
            (prompt.contains(needle.as_str()) && !matches!(action, Action::Delay(_)))
                .then_some(action)
        });
        if matches!(action, Some(Action::Panic)) {
            panic!("scripted panic");
        }
        self.state.completed.fetch_add(1, Ordering::SeqCst);

        match action {
            Some(Action::Reply(response)) => Ok(response.clone()),
            Some(Action::Fail) => Err(CapabilityError::request(
                Capability::Generation,
                "scripted failure",
            )),
            _ => Ok(String::new()),
        }
    }

    async fn stream_chat(
        &self,
        _preamble: &str,
        turns: &[ChatTurn],
    ) -> Result<TextStream, CapabilityError> {
        if let Ok(mut last) = self.state.last_chat.lock() {
            *last = turns.to_vec();
        }
        if self.chat_fails {
            return Err(CapabilityError::request(
                Capability::Generation,
                "scripted chat failure",
            ));
        }
        let chunks: Vec<Result<String, CapabilityError>> =
            self.chunks.iter().cloned().map(Ok).collect();
        Ok(Box::pin(stream::iter(chunks)))
    }
}

#[derive(Default)]
struct IndexState {
    last_limit: Mutex<Option<usize>>,
    searches: AtomicUsize,
}

/// In-memory literature index returning a fixed hit list.
#[derive(Clone, Default)]
pub struct StubIndex {
    hits: Vec<SearchHit>,
    fail_search: bool,
    search_delay: Option<Duration>,
    fail_fetch: HashSet<String>,
    state: Arc<IndexState>,
}

impl StubIndex {
    pub fn new(hits: Vec<SearchHit>) -> Self {
        Self {
            hits,
            ..Self::default()
        }
    }

    pub fn failing() -> Self {
        Self {
            fail_search: true,
            ..Self::default()
        }
    }

    pub fn fail_fetch(mut self, id: &str) -> Self {
        self.fail_fetch.insert(id.to_string());
        self
    }

    pub fn delay_search(mut self, delay: Duration) -> Self {
        self.search_delay = Some(delay);
        self
    }

    /// Number of searches that ran to completion.
    pub fn completed_searches(&self) -> usize {
        self.state.searches.load(Ordering::SeqCst)
    }

    pub fn last_limit(&self) -> Option<usize> {
        self.state.last_limit.lock().ok().and_then(|limit| *limit)
    }
}

#[async_trait]
impl LiteratureIndex for StubIndex {
    async fn search(&self, _query: &str, limit: usize) -> Result<Vec<SearchHit>, CapabilityError> {
        if let Ok(mut last) = self.state.last_limit.lock() {
            *last = Some(limit);
        }
        if let Some(delay) = self.search_delay {
            tokio::time::sleep(delay).await;
        }
        self.state.searches.fetch_add(1, Ordering::SeqCst);
        if self.fail_search {
            return Err(CapabilityError::request(Capability::Search, "index unavailable"));
        }
        Ok(self.hits.iter().take(limit).cloned().collect())
    }

    async fn fetch_content(&self, article: &ArticleCandidate) -> Result<String, CapabilityError> {
        if self.fail_fetch.contains(&article.id) {
            return Err(CapabilityError::request(
                Capability::Search,
                format!("detail for {} unavailable", article.id),
            ));
        }
        Ok(article.abstract_text.clone())
    }
}

/// Redactor masking a fixed word, or failing every call.
#[derive(Clone, Default)]
pub struct StubRedactor {
    fail: bool,
}

impl StubRedactor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self { fail: true }
    }
}

#[async_trait]
impl PiiRedaction for StubRedactor {
    async fn redact(&self, text: &str) -> Result<String, CapabilityError> {
        if self.fail {
            return Err(CapabilityError::request(Capability::Redaction, "redactor down"));
        }
        Ok(text.replace("Jane Doe", "[NAME]"))
    }
}
