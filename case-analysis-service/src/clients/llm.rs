use std::collections::VecDeque;
use std::pin::Pin;

use async_trait::async_trait;
use case_flow::{
    Capability, CapabilityError, ChatTurn, SseDecoder, SseFrame, TextGeneration, TextStream,
};
use futures_util::{Stream, StreamExt, stream};
use rig::completion::Prompt;
use rig::prelude::*;
use rig::providers::openrouter;
use serde_json::{Value, json};
use tracing::{debug, info};

const OPENROUTER_CHAT_URL: &str = "https://openrouter.ai/api/v1/chat/completions";

type ByteStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>, reqwest::Error>> + Send>>;

/// OpenRouter-backed text generation.
///
/// Completions go through a rig agent built per call with the caller's preamble;
/// chat is streamed straight from the chat-completions endpoint.
pub struct OpenRouterGenerator {
    client: openrouter::Client,
    http: reqwest::Client,
    api_key: String,
    model: String,
}

impl OpenRouterGenerator {
    pub fn new(http: reqwest::Client, api_key: &str, model: &str) -> Self {
        Self {
            client: openrouter::Client::new(api_key),
            http,
            api_key: api_key.to_string(),
            model: model.to_string(),
        }
    }
}

#[async_trait]
impl TextGeneration for OpenRouterGenerator {
    async fn generate(&self, preamble: &str, prompt: &str) -> Result<String, CapabilityError> {
        let agent = self.client.agent(&self.model).preamble(preamble).build();
        let response = agent
            .prompt(prompt)
            .await
            .map_err(|e| CapabilityError::request(Capability::Generation, e.to_string()))?;
        debug!(chars = response.len(), "LLM completion received");
        Ok(response)
    }

    async fn stream_chat(
        &self,
        preamble: &str,
        turns: &[ChatTurn],
    ) -> Result<TextStream, CapabilityError> {
        let payload = json!({
            "model": self.model,
            "messages": chat_messages(preamble, turns),
            "stream": true,
        });

        let response = self
            .http
            .post(OPENROUTER_CHAT_URL)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&payload)
            .send()
            .await
            .map_err(|e| {
                CapabilityError::request(Capability::Generation, format!("Failed to send request: {e}"))
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(CapabilityError::request(
                Capability::Generation,
                format!("HTTP {status}: {error_text}"),
            ));
        }

        info!(turns = turns.len(), "LLM chat stream opened");
        let bytes: ByteStream = Box::pin(
            response
                .bytes_stream()
                .map(|result| result.map(|bytes| bytes.to_vec())),
        );
        Ok(Box::pin(chat_text_stream(bytes)))
    }
}

fn chat_messages(preamble: &str, turns: &[ChatTurn]) -> Vec<Value> {
    std::iter::once(json!({"role": "system", "content": preamble}))
        .chain(
            turns
                .iter()
                .map(|turn| json!({"role": turn.role, "content": turn.content})),
        )
        .collect()
}

struct ChatStreamState {
    bytes: ByteStream,
    decoder: SseDecoder,
    pending: VecDeque<Result<String, CapabilityError>>,
    failed: bool,
}

impl ChatStreamState {
    fn fail(&mut self, err: CapabilityError) {
        self.failed = true;
        self.pending.push_back(Err(err));
    }
}

/// Decodes OpenAI-style SSE chunks into the text deltas they carry.
///
/// Ends after `[DONE]`, at end of body, or right after the first error.
fn chat_text_stream(bytes: ByteStream) -> impl Stream<Item = Result<String, CapabilityError>> + Send {
    let state = ChatStreamState {
        bytes,
        decoder: SseDecoder::new(),
        pending: VecDeque::new(),
        failed: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(item) = state.pending.pop_front() {
                return Some((item, state));
            }
            if state.failed || state.decoder.is_finished() {
                return None;
            }

            let frames = match state.bytes.next().await {
                Some(Ok(chunk)) => state.decoder.push(&chunk),
                Some(Err(e)) => Err(CapabilityError::request(
                    Capability::Generation,
                    format!("Chat stream interrupted: {e}"),
                )),
                None => return None,
            };

            match frames {
                Ok(frames) => {
                    for frame in frames {
                        let SseFrame::Data(data) = frame else {
                            continue;
                        };
                        match delta_text(&data) {
                            Ok(Some(text)) => state.pending.push_back(Ok(text)),
                            Ok(None) => {}
                            Err(e) => {
                                state.fail(e);
                                break;
                            }
                        }
                    }
                }
                Err(e) => state.fail(e),
            }
        }
    })
}

/// Text of one streamed chat-completion chunk; `None` for chunks without content.
fn delta_text(data: &str) -> Result<Option<String>, CapabilityError> {
    let chunk: Value = serde_json::from_str(data).map_err(|e| {
        CapabilityError::invalid(Capability::Generation, format!("Malformed stream chunk: {e}"))
    })?;

    if let Some(message) = chunk["error"]["message"].as_str() {
        return Err(CapabilityError::request(Capability::Generation, message));
    }

    Ok(chunk["choices"][0]["delta"]["content"]
        .as_str()
        .filter(|text| !text.is_empty())
        .map(str::to_string))
}
