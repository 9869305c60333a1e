use std::collections::HashSet;
use std::sync::{Arc, LazyLock};

use regex::Regex;
use serde::Deserialize;
use tracing::{info, warn};

use crate::capability::{TextGeneration, TextStream};
use crate::error::{PipelineError, Result};
use crate::model::{AnalyzedArticle, ArticleCandidate, ChatTurn, Confidence, FinalAnalysis};
use crate::prompts;

static CITATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[PMID:\s*([A-Za-z0-9._-]+)\s*\]").expect("citation pattern is valid")
});

#[derive(Debug, Deserialize)]
struct ArticleAssessment {
    relevance_summary: String,
    #[serde(default)]
    evidence: Vec<String>,
}

/// Per-article analysis, final cited synthesis and follow-up chat.
#[derive(Clone)]
pub struct AnalysisSynthesizer {
    generator: Arc<dyn TextGeneration>,
}

impl AnalysisSynthesizer {
    pub fn new(generator: Arc<dyn TextGeneration>) -> Self {
        Self { generator }
    }

    pub async fn analyze_article(
        &self,
        article: &ArticleCandidate,
        content: &str,
        disease: &str,
        events: &[String],
        methodology: Option<&str>,
    ) -> Result<AnalyzedArticle> {
        let failed = |cause: String| PipelineError::AnalysisFailed {
            article_id: article.id.clone(),
            cause,
        };

        let prompt = prompts::article_prompt(article, content, disease, events, methodology);
        let response = self
            .generator
            .generate(prompts::ANALYSIS_PREAMBLE, &prompt)
            .await
            .map_err(|e| failed(e.to_string()))?;

        let assessment = parse_assessment(&response).map_err(failed)?;
        let relevance_summary = assessment.relevance_summary.trim().to_string();
        if relevance_summary.is_empty() {
            return Err(failed("model returned an empty relevance summary".to_string()));
        }

        Ok(AnalyzedArticle {
            candidate: article.clone(),
            relevance_summary,
            extracted_evidence: assessment
                .evidence
                .into_iter()
                .map(|e| e.trim().to_string())
                .filter(|e| !e.is_empty())
                .collect(),
        })
    }

    /// Builds the cited recommendation from the full set of analyzed articles.
    ///
    /// Citations are restricted to ids present in `articles`, in order of first mention.
    pub async fn synthesize_final(
        &self,
        case_notes: &str,
        disease: &str,
        events: &[String],
        articles: &[AnalyzedArticle],
    ) -> Result<FinalAnalysis> {
        let prompt = prompts::synthesis_prompt(case_notes, disease, events, articles);
        let recommendation = self
            .generator
            .generate(prompts::SYNTHESIS_PREAMBLE, &prompt)
            .await
            .map_err(|e| PipelineError::SynthesisFailed {
                cause: e.to_string(),
            })?
            .trim()
            .to_string();

        if recommendation.is_empty() {
            return Err(PipelineError::SynthesisFailed {
                cause: "model returned an empty recommendation".to_string(),
            });
        }

        let citations = extract_citations(&recommendation, articles);
        let confidence = Confidence::from_citations(citations.len(), articles.len());
        info!(
            citations = citations.len(),
            articles = articles.len(),
            ?confidence,
            "Final analysis synthesized"
        );

        Ok(FinalAnalysis {
            recommendation,
            citations,
            confidence,
        })
    }

    /// Streams the model's reply to `message` given the earlier turns of the conversation.
    pub async fn chat(&self, message: &str, prior_turns: &[ChatTurn]) -> Result<TextStream> {
        if message.trim().is_empty() {
            return Err(PipelineError::validation("message is required"));
        }
        let mut turns = prior_turns.to_vec();
        turns.push(ChatTurn::user(message));
        let stream = self
            .generator
            .stream_chat(prompts::CHAT_PREAMBLE, &turns)
            .await?;
        Ok(stream)
    }
}

fn parse_assessment(response: &str) -> std::result::Result<ArticleAssessment, String> {
    let start = response
        .find('{')
        .ok_or_else(|| "No JSON object found in response".to_string())?;
    let end = response
        .rfind('}')
        .filter(|end| *end > start)
        .ok_or_else(|| "No closing brace found in response".to_string())?;
    serde_json::from_str(&response[start..=end])
        .map_err(|e| format!("Failed to parse article assessment: {e}"))
}

fn extract_citations(text: &str, articles: &[AnalyzedArticle]) -> Vec<String> {
    let known: HashSet<&str> = articles.iter().map(|a| a.id()).collect();
    let mut seen = HashSet::new();
    let mut citations = Vec::new();

    for cap in CITATION.captures_iter(text) {
        let id = &cap[1];
        if !known.contains(id) {
            warn!(article_id = %id, "Recommendation cites an article that was not analyzed; dropped");
            continue;
        }
        if seen.insert(id.to_string()) {
            citations.push(id.to_string());
        }
    }
    citations
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ScriptedGenerator, analyzed, candidate};
    use futures_util::StreamExt;

    #[tokio::test]
    async fn analyze_article_parses_assessment() {
        let generator = Arc::new(ScriptedGenerator::new().reply(
            "Article PMID 101:",
            r#"Sure. {"relevance_summary": " Phase II trial in relapsed ALL. ", "evidence": ["CR 45%", ""]}"#,
        ));
        let synthesizer = AnalysisSynthesizer::new(generator);
        let article = candidate("101", 0.9, 0.5);
        let analyzed = synthesizer
            .analyze_article(&article, "abstract", "ALL", &[], None)
            .await
            .unwrap();
        assert_eq!(analyzed.relevance_summary, "Phase II trial in relapsed ALL.");
        assert_eq!(analyzed.extracted_evidence, vec!["CR 45%"]);
        assert_eq!(analyzed.candidate, article);
    }

    #[tokio::test]
    async fn malformed_assessment_is_analysis_failure() {
        let generator = Arc::new(ScriptedGenerator::new().reply("Article PMID 7:", "not json"));
        let synthesizer = AnalysisSynthesizer::new(generator);
        let err = synthesizer
            .analyze_article(&candidate("7", 0.5, 0.5), "abstract", "ALL", &[], None)
            .await
            .unwrap_err();
        match err {
            PipelineError::AnalysisFailed { article_id, .. } => assert_eq!(article_id, "7"),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn citations_are_a_subset_of_analyzed_ids() {
        let generator = Arc::new(ScriptedGenerator::new().reply(
            "Recommendation:",
            "Consider venetoclax [PMID:1] and blinatumomab [PMID: 2]. See also [PMID:999] and [PMID:1].",
        ));
        let synthesizer = AnalysisSynthesizer::new(generator);
        let articles = vec![analyzed("1"), analyzed("2"), analyzed("3")];
        let analysis = synthesizer
            .synthesize_final("notes", "ALL", &["relapse".into()], &articles)
            .await
            .unwrap();

        assert_eq!(analysis.citations, vec!["1", "2"]);
        let ids: HashSet<&str> = articles.iter().map(|a| a.id()).collect();
        assert!(analysis.citations.iter().all(|c| ids.contains(c.as_str())));
        assert_eq!(analysis.confidence, Confidence::Moderate);
    }

    #[tokio::test]
    async fn synthesis_without_articles_has_low_confidence() {
        let generator =
            Arc::new(ScriptedGenerator::new().reply("Recommendation:", "Standard of care [PMID:5]."));
        let synthesizer = AnalysisSynthesizer::new(generator);
        let analysis = synthesizer
            .synthesize_final("notes", "ALL", &[], &[])
            .await
            .unwrap();
        assert!(analysis.citations.is_empty());
        assert_eq!(analysis.confidence, Confidence::Low);
    }

    #[tokio::test]
    async fn synthesis_capability_error_is_synthesis_failure() {
        let generator = Arc::new(ScriptedGenerator::new().fail_on("Recommendation:"));
        let synthesizer = AnalysisSynthesizer::new(generator);
        let err = synthesizer
            .synthesize_final("notes", "ALL", &[], &[analyzed("1")])
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::SynthesisFailed { .. }));
    }

    #[tokio::test]
    async fn chat_streams_chunks_in_order() {
        let generator =
            Arc::new(ScriptedGenerator::new().chat_chunks(["Relapse ", "risk ", "is high."]));
        let synthesizer = AnalysisSynthesizer::new(generator.clone());
        let prior = vec![ChatTurn::user("Summarize"), ChatTurn::assistant("Done.")];
        let chunks: Vec<String> = synthesizer
            .chat("What about relapse?", &prior)
            .await
            .unwrap()
            .map(|chunk| chunk.unwrap())
            .collect()
            .await;
        assert_eq!(chunks, vec!["Relapse ", "risk ", "is high."]);

        let seen = generator.last_chat_turns();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[2].content, "What about relapse?");
    }

    #[tokio::test]
    async fn empty_chat_message_is_rejected() {
        let synthesizer = AnalysisSynthesizer::new(Arc::new(ScriptedGenerator::new()));
        assert!(matches!(
            synthesizer.chat("  ", &[]).await,
            Err(PipelineError::Validation(_))
        ));
    }
}
