use std::time::Duration;

use serde::Deserialize;

use crate::error::{PipelineError, Result};

/// Upper bound on `overfetchFactor`.
pub const MAX_OVERFETCH_FACTOR: usize = 10;

/// Weights for the composite article score.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RankingWeights {
    pub similarity_weight: f64,
    pub journal_weight: f64,
}

impl Default for RankingWeights {
    fn default() -> Self {
        Self {
            similarity_weight: 0.7,
            journal_weight: 0.3,
        }
    }
}

/// What to do when the redaction capability fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RedactionPolicy {
    /// Abort the request.
    #[default]
    FailClosed,
    /// Continue with the unredacted text and log a warning.
    BestEffort,
}

/// Output contract expected from the model when extracting clinical events.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventFormat {
    /// A JSON array of strings, falling back to quote-delimited parsing.
    #[default]
    JsonArray,
    /// Events wrapped in double quotes.
    Quoted,
}

/// Pipeline settings, resolved once at startup and shared read-only.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PipelineConfig {
    pub ranking: RankingWeights,
    /// Candidates fetched per requested article before reranking.
    pub overfetch_factor: usize,
    /// Bound on concurrent per-article analyses; defaults to `overfetch_factor`.
    pub max_concurrency: Option<usize>,
    pub default_num_articles: usize,
    pub max_num_articles: usize,
    pub retrieval_deadline_secs: u64,
    pub redaction: RedactionPolicy,
    pub event_format: EventFormat,
    pub channel_capacity: usize,
    pub max_chat_turns: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            ranking: RankingWeights::default(),
            overfetch_factor: 3,
            max_concurrency: None,
            default_num_articles: 5,
            max_num_articles: 25,
            retrieval_deadline_secs: 120,
            redaction: RedactionPolicy::default(),
            event_format: EventFormat::default(),
            channel_capacity: 64,
            max_chat_turns: 50,
        }
    }
}

impl PipelineConfig {
    pub fn concurrency(&self) -> usize {
        self.max_concurrency.unwrap_or(self.overfetch_factor).max(1)
    }

    pub fn retrieval_deadline(&self) -> Duration {
        Duration::from_secs(self.retrieval_deadline_secs)
    }

    /// Resolves the requested article count against the configured default and ceiling.
    pub fn num_articles(&self, requested: Option<usize>) -> usize {
        requested
            .unwrap_or(self.default_num_articles)
            .min(self.max_num_articles)
    }

    pub fn validate(&self) -> Result<()> {
        let weights = &self.ranking;
        if !weights.similarity_weight.is_finite() || !weights.journal_weight.is_finite() {
            return Err(PipelineError::validation("ranking weights must be finite numbers"));
        }
        if weights.similarity_weight < 0.0 || weights.journal_weight < 0.0 {
            return Err(PipelineError::validation("ranking weights must be non-negative"));
        }
        if weights.similarity_weight + weights.journal_weight == 0.0 {
            return Err(PipelineError::validation("ranking weights cannot both be zero"));
        }
        if self.overfetch_factor == 0 || self.overfetch_factor > MAX_OVERFETCH_FACTOR {
            return Err(PipelineError::validation(format!(
                "overfetchFactor must be between 1 and {MAX_OVERFETCH_FACTOR}"
            )));
        }
        if self.max_concurrency == Some(0) {
            return Err(PipelineError::validation("maxConcurrency must be at least 1"));
        }
        if self.channel_capacity == 0 {
            return Err(PipelineError::validation("channelCapacity must be at least 1"));
        }
        if self.max_num_articles == 0 {
            return Err(PipelineError::validation("maxNumArticles must be at least 1"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_overfetch() {
        let config = PipelineConfig::default();
        assert_eq!(config.concurrency(), 3);
        assert_eq!(config.num_articles(None), 5);
        assert_eq!(config.num_articles(Some(100)), 25);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config: PipelineConfig = serde_json::from_str(
            r#"{"ranking": {"journalWeight": 0.5}, "redaction": "best_effort", "maxConcurrency": 8}"#,
        )
        .unwrap();
        assert_eq!(config.ranking.similarity_weight, 0.7);
        assert_eq!(config.ranking.journal_weight, 0.5);
        assert_eq!(config.redaction, RedactionPolicy::BestEffort);
        assert_eq!(config.concurrency(), 8);
        assert_eq!(config.event_format, EventFormat::JsonArray);
    }

    #[test]
    fn rejects_degenerate_settings() {
        let mut config = PipelineConfig::default();
        config.ranking = RankingWeights {
            similarity_weight: 0.0,
            journal_weight: 0.0,
        };
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.overfetch_factor = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_nan_weights_and_oversized_pools() {
        let mut config = PipelineConfig::default();
        config.ranking.similarity_weight = f64::NAN;
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.ranking.journal_weight = f64::INFINITY;
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.overfetch_factor = usize::MAX;
        assert!(config.validate().is_err());
        config.overfetch_factor = MAX_OVERFETCH_FACTOR;
        assert!(config.validate().is_ok());
    }
}
