use std::sync::Arc;

use tracing::{debug, info};

use crate::capability::TextGeneration;
use crate::config::EventFormat;
use crate::error::{PipelineError, Result};
use crate::prompts;

/// Turns raw model output into an ordered list of clinical events.
pub trait EventParser: Send + Sync {
    fn parse(&self, output: &str) -> std::result::Result<Vec<String>, String>;
}

/// Events delimited by double quotes. Segments made only of separators are dropped.
#[derive(Debug, Clone, Copy, Default)]
pub struct QuotedEventParser;

impl EventParser for QuotedEventParser {
    fn parse(&self, output: &str) -> std::result::Result<Vec<String>, String> {
        Ok(output
            .split('"')
            .map(str::trim)
            .filter(|segment| !is_separator(segment))
            .map(str::to_string)
            .collect())
    }
}

fn is_separator(segment: &str) -> bool {
    segment
        .chars()
        .all(|c| c.is_whitespace() || matches!(c, ',' | ';' | '[' | ']'))
}

/// A JSON array of strings, located anywhere in the output.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonArrayEventParser {
    fallback_to_quoted: bool,
}

impl JsonArrayEventParser {
    pub fn with_quoted_fallback() -> Self {
        Self {
            fallback_to_quoted: true,
        }
    }
}

impl EventParser for JsonArrayEventParser {
    fn parse(&self, output: &str) -> std::result::Result<Vec<String>, String> {
        let parsed = match (output.find('['), output.rfind(']')) {
            (Some(start), Some(end)) if start < end => {
                serde_json::from_str::<Vec<String>>(&output[start..=end])
                    .map_err(|e| format!("Failed to parse extracted JSON: {e}"))
            }
            _ => Err("No JSON array found in response".to_string()),
        };

        match parsed {
            Ok(events) => Ok(events
                .into_iter()
                .map(|e| e.trim().to_string())
                .filter(|e| !e.is_empty())
                .collect()),
            Err(e) if self.fallback_to_quoted && output.contains('"') => {
                debug!("JSON event parsing failed ({e}), falling back to quoted parsing");
                QuotedEventParser.parse(output)
            }
            Err(e) => Err(e),
        }
    }
}

pub fn parser_for(format: EventFormat) -> Arc<dyn EventParser> {
    match format {
        EventFormat::JsonArray => Arc::new(JsonArrayEventParser::with_quoted_fallback()),
        EventFormat::Quoted => Arc::new(QuotedEventParser),
    }
}

/// Extracts the disease label and clinical events from case notes.
#[derive(Clone)]
pub struct FeatureExtractor {
    generator: Arc<dyn TextGeneration>,
    parser: Arc<dyn EventParser>,
}

impl FeatureExtractor {
    pub fn new(generator: Arc<dyn TextGeneration>, parser: Arc<dyn EventParser>) -> Self {
        Self { generator, parser }
    }

    pub async fn extract_disease(&self, text: &str) -> Result<String> {
        if text.trim().is_empty() {
            return Err(PipelineError::validation("text is required"));
        }

        let response = self
            .generator
            .generate(prompts::EXTRACTION_PREAMBLE, &prompts::disease_prompt(text))
            .await
            .map_err(|e| PipelineError::ExtractionFailed {
                cause: e.to_string(),
            })?;

        let disease = response.trim().trim_matches('"').trim().to_string();
        if disease.is_empty() {
            return Err(PipelineError::ExtractionFailed {
                cause: "model returned no disease".to_string(),
            });
        }

        info!(%disease, "Extracted disease");
        Ok(disease)
    }

    /// An empty result is valid: retrieval then runs on the disease alone.
    pub async fn extract_events(
        &self,
        text: &str,
        prompt_template: Option<&str>,
    ) -> Result<Vec<String>> {
        if text.trim().is_empty() {
            return Err(PipelineError::validation("text is required"));
        }

        let prompt = prompts::events_prompt(prompt_template, text);
        let response = self
            .generator
            .generate(prompts::EXTRACTION_PREAMBLE, &prompt)
            .await
            .map_err(|e| PipelineError::ExtractionFailed {
                cause: e.to_string(),
            })?;

        let events = self
            .parser
            .parse(&response)
            .map_err(|cause| PipelineError::ExtractionFailed { cause })?;

        info!(count = events.len(), "Extracted clinical events");
        Ok(events)
    }
}
