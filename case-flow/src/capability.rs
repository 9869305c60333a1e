//! Interfaces to the external services the pipeline calls but does not implement.
//!
//! Implementations are shared across requests, so they must be safe for concurrent use
//! (`Send + Sync`, connection pools inside).

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::Stream;

use crate::error::CapabilityError;
use crate::model::{ArticleCandidate, ChatTurn, SearchHit};

/// Incremental text produced by a streaming generation.
pub type TextStream = Pin<Box<dyn Stream<Item = Result<String, CapabilityError>> + Send>>;

/// Generative-text model.
#[async_trait]
pub trait TextGeneration: Send + Sync {
    /// Single completion for `prompt` under the given system `preamble`.
    async fn generate(&self, preamble: &str, prompt: &str) -> Result<String, CapabilityError>;

    /// Streams the assistant's reply to the conversation in `turns`.
    async fn stream_chat(
        &self,
        preamble: &str,
        turns: &[ChatTurn],
    ) -> Result<TextStream, CapabilityError>;
}

/// Embedding search over the literature corpus plus article detail lookup.
#[async_trait]
pub trait LiteratureIndex: Send + Sync {
    /// Returns up to `limit` hits ordered by descending similarity.
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>, CapabilityError>;

    /// Fetches the text to analyze for `article`: full text when available, else the abstract.
    async fn fetch_content(&self, article: &ArticleCandidate) -> Result<String, CapabilityError>;
}

/// PII redaction service.
#[async_trait]
pub trait PiiRedaction: Send + Sync {
    async fn redact(&self, text: &str) -> Result<String, CapabilityError>;
}
