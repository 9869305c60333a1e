use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A patient case as it moves through the pipeline.
///
/// Each stage derives a new `Case` carrying one more populated field; earlier
/// fields are never rewritten.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Case {
    raw_text: String,
    redacted_text: Option<String>,
    disease: Option<String>,
    events: Option<Vec<String>>,
}

impl Case {
    pub fn new(raw_text: impl Into<String>) -> Self {
        Self {
            raw_text: raw_text.into(),
            redacted_text: None,
            disease: None,
            events: None,
        }
    }

    pub fn with_redacted(self, redacted_text: impl Into<String>) -> Self {
        Self {
            redacted_text: Some(redacted_text.into()),
            ..self
        }
    }

    pub fn with_features(self, disease: impl Into<String>, events: Vec<String>) -> Self {
        Self {
            disease: Some(disease.into()),
            events: Some(events),
            ..self
        }
    }

    pub fn raw_text(&self) -> &str {
        &self.raw_text
    }

    pub fn redacted_text(&self) -> Option<&str> {
        self.redacted_text.as_deref()
    }

    /// Text downstream stages should see: redacted when available.
    pub fn working_text(&self) -> &str {
        self.redacted_text.as_deref().unwrap_or(&self.raw_text)
    }

    pub fn disease(&self) -> Option<&str> {
        self.disease.as_deref()
    }

    pub fn events(&self) -> &[String] {
        self.events.as_deref().unwrap_or(&[])
    }
}

/// Raw hit returned by the literature index before reranking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchHit {
    pub id: String,
    pub title: String,
    #[serde(rename = "abstract")]
    pub abstract_text: String,
    pub similarity: f64,
    pub journal_rank: f64,
    pub full_text_available: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArticleCandidate {
    /// PubMed identifier.
    pub id: String,
    pub title: String,
    #[serde(rename = "abstract")]
    pub abstract_text: String,
    /// Composite of similarity and journal rank.
    pub score: f64,
    pub similarity: f64,
    pub journal_rank: f64,
    pub full_text_available: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyzedArticle {
    #[serde(flatten)]
    pub candidate: ArticleCandidate,
    pub relevance_summary: String,
    pub extracted_evidence: Vec<String>,
}

impl AnalyzedArticle {
    pub fn id(&self) -> &str {
        &self.candidate.id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    High,
    Moderate,
    Low,
}

impl Confidence {
    /// Grades a recommendation by how much of the analyzed literature it cites.
    pub fn from_citations(cited: usize, analyzed: usize) -> Self {
        if cited == 0 || analyzed == 0 {
            return Confidence::Low;
        }
        if cited >= 3 && cited * 2 >= analyzed {
            Confidence::High
        } else {
            Confidence::Moderate
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalAnalysis {
    pub recommendation: String,
    pub citations: Vec<String>,
    pub confidence: Confidence,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatTurn {
    pub role: ChatRole,
    pub content: String,
    pub at: DateTime<Utc>,
}

impl ChatTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
            at: Utc::now(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
            at: Utc::now(),
        }
    }
}
