use std::sync::Arc;

use async_trait::async_trait;
use case_flow::{Capability, CapabilityError, PiiRedaction, TextGeneration, prompts};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

#[derive(Serialize)]
struct RedactRequest<'a> {
    text: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RedactResponse {
    redacted_text: String,
}

/// Delegates redaction to an external PII service speaking `{text}` -> `{redactedText}`.
pub struct HttpRedactor {
    http: reqwest::Client,
    url: String,
}

impl HttpRedactor {
    pub fn new(http: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            http,
            url: url.into(),
        }
    }
}

#[async_trait]
impl PiiRedaction for HttpRedactor {
    async fn redact(&self, text: &str) -> Result<String, CapabilityError> {
        let response = self
            .http
            .post(&self.url)
            .json(&RedactRequest { text })
            .send()
            .await
            .map_err(|e| {
                CapabilityError::request(Capability::Redaction, format!("Redaction request failed: {e}"))
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(CapabilityError::request(
                Capability::Redaction,
                format!("HTTP {status}: {error_text}"),
            ));
        }

        let body: Value = response.json().await.map_err(|e| {
            CapabilityError::invalid(Capability::Redaction, format!("Failed to parse response: {e}"))
        })?;
        parse_redact_response(body)
    }
}

fn parse_redact_response(body: Value) -> Result<String, CapabilityError> {
    serde_json::from_value::<RedactResponse>(body)
        .map(|response| response.redacted_text)
        .map_err(|e| {
            CapabilityError::invalid(
                Capability::Redaction,
                format!("Response is missing redactedText: {e}"),
            )
        })
}

/// Asks the generative model to replace identifiers with placeholders.
///
/// Used when no redaction service is configured.
pub struct GenerativeRedactor {
    generator: Arc<dyn TextGeneration>,
}

impl GenerativeRedactor {
    pub fn new(generator: Arc<dyn TextGeneration>) -> Self {
        Self { generator }
    }
}

#[async_trait]
impl PiiRedaction for GenerativeRedactor {
    async fn redact(&self, text: &str) -> Result<String, CapabilityError> {
        let prompt = format!("Clinical notes:\n{text}\n\nRedacted notes:");
        let redacted = self
            .generator
            .generate(prompts::REDACTION_PREAMBLE, &prompt)
            .await
            .map_err(|e| CapabilityError::request(Capability::Redaction, e.to_string()))?;

        let redacted = redacted.trim();
        if redacted.is_empty() {
            return Err(CapabilityError::invalid(
                Capability::Redaction,
                "model returned empty redacted text",
            ));
        }
        info!(chars = redacted.len(), "Case text redacted by model");
        Ok(redacted.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use case_flow::testing::ScriptedGenerator;
    use serde_json::json;

    #[test]
    fn reads_redacted_text() {
        let body = json!({"redactedText": "[NAME], 8y, DIPG"});
        assert_eq!(parse_redact_response(body).unwrap(), "[NAME], 8y, DIPG");
    }

    #[test]
    fn missing_field_is_invalid_response() {
        let err = parse_redact_response(json!({"text": "x"})).unwrap_err();
        assert!(matches!(err, CapabilityError::InvalidResponse { .. }));
        assert_eq!(err.capability(), Capability::Redaction);
    }

    #[tokio::test]
    async fn generative_redactor_uses_model_output() {
        let generator = ScriptedGenerator::new().reply("Redacted notes:", "  [NAME] has relapsed ALL.\n");
        let redactor = GenerativeRedactor::new(Arc::new(generator));
        let redacted = redactor.redact("Jane Doe has relapsed ALL.").await.unwrap();
        assert_eq!(redacted, "[NAME] has relapsed ALL.");
    }

    #[tokio::test]
    async fn generative_redactor_rejects_empty_output() {
        let redactor = GenerativeRedactor::new(Arc::new(ScriptedGenerator::new()));
        assert!(redactor.redact("notes").await.is_err());
    }
}
