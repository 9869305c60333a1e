use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    Router,
    body::Body,
    extract::State,
    http::header,
    response::{
        IntoResponse, Json, Response,
        sse::{Event, KeepAlive, Sse},
    },
    routing::{get, post},
};
use case_flow::{
    CapabilityError, CaseRequest, ChatKey, ChatStore, ChatTurn, InMemoryChatStore,
    PipelineComponents, PipelineOrchestrator, ProgressStream, RetrievalRequest, TextGeneration,
    wire::DONE_SENTINEL,
};
use futures_util::{StreamExt, stream};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{Instrument, debug, info, info_span, warn};

use crate::clients::{
    Feedback, FeedbackSink, GenerativeRedactor, HttpRedactor, OpenRouterGenerator,
    PgVectorIndex, PubMedClient, SendGridSink,
};
use crate::config::ServiceConfig;
use crate::error::ApiError;
use crate::models::{
    ChatChunk, ChatRequest, DiseaseResponse, EventsResponse, ExtractEventsRequest,
    FeedbackResponse, FinalAnalysisRequest, FinalAnalysisResponse, RedactResponse, TextRequest,
};

type ApiResult<T> = Result<Json<T>, ApiError>;

const NDJSON: &str = "application/x-ndjson";

#[derive(Clone)]
pub struct AppState {
    pub components: PipelineComponents,
    pub orchestrator: PipelineOrchestrator,
    pub chat_store: Arc<dyn ChatStore>,
    pub feedback: Arc<dyn FeedbackSink>,
}

impl AppState {
    pub fn new(
        components: PipelineComponents,
        chat_store: Arc<dyn ChatStore>,
        feedback: Arc<dyn FeedbackSink>,
    ) -> Self {
        Self {
            orchestrator: PipelineOrchestrator::new(components.clone()),
            components,
            chat_store,
            feedback,
        }
    }
}

pub async fn create_app(config: &ServiceConfig) -> anyhow::Result<Router> {
    let app_state = create_app_state(config).await?;
    Ok(build_router(app_state))
}

async fn create_app_state(config: &ServiceConfig) -> anyhow::Result<AppState> {
    let http = reqwest::Client::new();
    let pipeline = Arc::new(config.pipeline.clone());

    let generator: Arc<dyn TextGeneration> = Arc::new(OpenRouterGenerator::new(
        http.clone(),
        &config.openrouter_api_key,
        &config.openrouter_model,
    ));

    let pubmed = PubMedClient::new(http.clone(), config.pubmed_base_url.clone());
    let index = PgVectorIndex::connect(&config.database_url, pubmed)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to connect to PostgreSQL: {e}"))?;

    let redactor: Arc<dyn case_flow::PiiRedaction> = match &config.redactor_url {
        Some(url) => {
            info!(%url, "Using HTTP redaction service");
            Arc::new(HttpRedactor::new(http.clone(), url.clone()))
        }
        None => {
            info!("No redaction service configured, redacting with the language model");
            Arc::new(GenerativeRedactor::new(generator.clone()))
        }
    };

    let components = PipelineComponents::new(generator, Arc::new(index), redactor, pipeline.clone());
    let chat_store = Arc::new(InMemoryChatStore::new(pipeline.max_chat_turns));
    let feedback = Arc::new(SendGridSink::new(
        http,
        config.sendgrid_api_key.clone(),
        config.feedback.clone(),
    ));

    Ok(AppState::new(components, chat_store, feedback))
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health_check))
        .route("/redact", post(redact))
        .route("/extract-disease", post(extract_disease))
        .route("/extract-events", post(extract_events))
        .route("/retrieve-and-analyze", post(retrieve_and_analyze))
        .route("/final-analysis", post(final_analysis))
        .route("/chat", post(chat))
        .route("/analyze-case", post(analyze_case))
        .route("/feedback", post(submit_feedback))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(app_state)
}

async fn root() -> Json<Value> {
    Json(json!({
        "service": "Case Analysis Service",
        "version": env!("CARGO_PKG_VERSION"),
        "description": "Literature-backed analysis of patient cases with streamed, cited recommendations",
        "endpoints": {
            "POST /redact": "Remove personal information from case text",
            "POST /extract-disease": "Extract the primary disease from case text",
            "POST /extract-events": "Extract clinical events from case text",
            "POST /retrieve-and-analyze": "Stream literature retrieval and per-article analysis (NDJSON)",
            "POST /final-analysis": "Synthesize a cited recommendation from analyzed articles",
            "POST /chat": "Follow-up conversation over the case (SSE)",
            "POST /analyze-case": "Run the whole pipeline for a case (NDJSON)",
            "POST /feedback": "Send feedback to the team",
            "GET /health": "Health check"
        }
    }))
}

async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

fn require(value: &str, field: &str) -> Result<(), ApiError> {
    if value.trim().is_empty() {
        return Err(ApiError::BadRequest(format!("{field} is required")));
    }
    Ok(())
}

async fn redact(
    State(state): State<AppState>,
    Json(request): Json<TextRequest>,
) -> ApiResult<RedactResponse> {
    require(&request.text, "text")?;
    let redacted_text = state.components.redactor.redact(&request.text).await?;
    Ok(Json(RedactResponse { redacted_text }))
}

async fn extract_disease(
    State(state): State<AppState>,
    Json(request): Json<TextRequest>,
) -> ApiResult<DiseaseResponse> {
    let disease = state.components.extractor.extract_disease(&request.text).await?;
    Ok(Json(DiseaseResponse { disease }))
}

async fn extract_events(
    State(state): State<AppState>,
    Json(request): Json<ExtractEventsRequest>,
) -> ApiResult<EventsResponse> {
    let events = state
        .components
        .extractor
        .extract_events(&request.text, request.prompt_template.as_deref())
        .await?;
    Ok(Json(EventsResponse { events }))
}

async fn retrieve_and_analyze(
    State(state): State<AppState>,
    Json(mut request): Json<RetrievalRequest>,
) -> Response {
    info!(disease = %request.disease, events = request.events.len(), "Retrieval requested");
    if request.num_articles == 0 {
        request.num_articles = state.components.config.default_num_articles;
    }
    ndjson(state.components.retriever.retrieve(request))
}

async fn final_analysis(
    State(state): State<AppState>,
    Json(request): Json<FinalAnalysisRequest>,
) -> ApiResult<FinalAnalysisResponse> {
    require(&request.disease, "disease")?;
    let analysis = state
        .components
        .synthesizer
        .synthesize_final(
            &request.case_notes,
            &request.disease,
            &request.events,
            &request.analyzed_articles,
        )
        .await?;
    Ok(Json(FinalAnalysisResponse { analysis }))
}

async fn analyze_case(
    State(state): State<AppState>,
    Json(request): Json<CaseRequest>,
) -> Response {
    ndjson(state.orchestrator.run(request))
}

/// Streams progress events as newline-delimited JSON.
///
/// The body owns the stream, so a client disconnect drops it and cancels the run.
fn ndjson(events: ProgressStream) -> Response {
    let body = Body::from_stream(events.map(|event| Ok::<_, Infallible>(event.to_line())));
    ([(header::CONTENT_TYPE, NDJSON)], body).into_response()
}

async fn chat(
    State(state): State<AppState>,
    Json(request): Json<ChatRequest>,
) -> Result<Sse<impl futures_util::Stream<Item = Result<Event, Infallible>>>, ApiError> {
    require(&request.message, "message")?;
    require(&request.user_id, "userId")?;
    require(&request.chat_id, "chatId")?;

    let key = ChatKey::new(request.user_id, request.chat_id);
    let history = state.chat_store.history(&key).await?;
    let reply = state
        .components
        .synthesizer
        .chat(&request.message, &history)
        .await?;
    state
        .chat_store
        .append(&key, ChatTurn::user(request.message))
        .await?;

    let (tx, rx) = mpsc::channel::<Event>(state.components.config.channel_capacity.max(1));
    let span = info_span!("chat", user_id = %key.user_id, chat_id = %key.chat_id);
    let store = state.chat_store.clone();
    tokio::spawn(relay_chat(reply, tx, store, key).instrument(span));

    let events = stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|event| (Ok(event), rx))
    });
    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

/// Forwards model chunks as SSE frames and ends with the `[DONE]` sentinel.
///
/// The assistant turn is stored only when the whole reply reached the caller.
async fn relay_chat(
    mut reply: case_flow::TextStream,
    tx: mpsc::Sender<Event>,
    store: Arc<dyn ChatStore>,
    key: ChatKey,
) {
    let mut text = String::new();
    let mut failed = false;

    while let Some(chunk) = reply.next().await {
        let frame = match chunk {
            Ok(delta) => {
                text.push_str(&delta);
                ChatChunk {
                    text: Some(delta),
                    error: None,
                }
            }
            Err(e) => {
                warn!(error = %e, "Chat stream failed");
                failed = true;
                ChatChunk {
                    text: None,
                    error: Some(e.to_string()),
                }
            }
        };
        if tx.send(chat_event(&frame)).await.is_err() {
            debug!("Chat caller disconnected");
            return;
        }
        if failed {
            break;
        }
    }

    if !failed {
        if let Err(e) = store.append(&key, ChatTurn::assistant(text)).await {
            warn!(error = %e, "Failed to record assistant turn");
        }
    }
    let _ = tx.send(Event::default().data(DONE_SENTINEL)).await;
}

fn chat_event(chunk: &ChatChunk) -> Event {
    let data = serde_json::to_string(chunk)
        .unwrap_or_else(|e| json!({ "error": e.to_string() }).to_string());
    Event::default().data(data)
}

async fn submit_feedback(
    State(state): State<AppState>,
    Json(feedback): Json<Feedback>,
) -> ApiResult<FeedbackResponse> {
    if feedback.text().is_none() {
        return Err(ApiError::BadRequest("No feedback text provided".to_string()));
    }
    info!(from = feedback.display_name(), "Feedback received");

    state.feedback.deliver(&feedback).await.map_err(|e| match e {
        CapabilityError::NotConfigured(_) => {
            ApiError::Internal("Email service configuration error".to_string())
        }
        other => ApiError::from(other),
    })?;
    Ok(Json(FeedbackResponse { success: true }))
}
