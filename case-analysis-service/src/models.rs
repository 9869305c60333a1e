use case_flow::{AnalyzedArticle, FinalAnalysis};
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize)]
pub struct TextRequest {
    #[serde(default)]
    pub text: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RedactResponse {
    pub redacted_text: String,
}

#[derive(Debug, Serialize)]
pub struct DiseaseResponse {
    pub disease: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractEventsRequest {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub prompt_template: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct EventsResponse {
    pub events: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalAnalysisRequest {
    #[serde(default)]
    pub case_notes: String,
    #[serde(default)]
    pub disease: String,
    #[serde(default)]
    pub events: Vec<String>,
    #[serde(default)]
    pub analyzed_articles: Vec<AnalyzedArticle>,
}

#[derive(Debug, Serialize)]
pub struct FinalAnalysisResponse {
    pub analysis: FinalAnalysis,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub chat_id: String,
}

/// One SSE frame of a chat reply.
#[derive(Debug, Serialize, Deserialize)]
pub struct ChatChunk {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct FeedbackResponse {
    pub success: bool,
}
