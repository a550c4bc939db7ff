//! OpenAI-Compatible LLM Provider
//!
//! One `LlmProvider` implementation for every backend that speaks the
//! `/chat/completions` protocol: OpenAI, DeepSeek, Qwen, ModelScope, Kimi,
//! Zhipu, Ollama, vLLM and any custom endpoint.

use std::time::Duration;

use agent_core::{
    error::{AgentError, Result},
    message::{Message, Role},
    provider::{
        Completion, CompletionStream, FinishReason, GenerationOptions, LlmProvider, ModelInfo,
        ProviderInfo, StreamChunk, TokenUsage,
    },
};
use async_stream::try_stream;
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use reqwest::{header, Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::detect::ProviderConfig;

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct WireMessage<'a> {
    role: &'static str,
    content: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "<[String]>::is_empty")]
    stop: &'a [String],
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChunkResponse {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
    #[serde(default)]
    total_tokens: u32,
}

impl From<WireUsage> for TokenUsage {
    fn from(u: WireUsage) -> Self {
        TokenUsage {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
            total_tokens: u.total_tokens,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ModelList {
    #[serde(default)]
    data: Vec<WireModel>,
}

#[derive(Debug, Deserialize)]
struct WireModel {
    id: String,
    #[serde(default)]
    owned_by: Option<String>,
}

// ---------------------------------------------------------------------------
// Server-sent events
// ---------------------------------------------------------------------------

/// One decoded `data:` payload
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SseEvent {
    Data(String),
    Done,
}

/// Incremental decoder for `text/event-stream` bodies
///
/// Network chunks may split lines (and UTF-8 sequences) anywhere, so bytes
/// are buffered until a full line is available.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes, returning every event completed by them
    pub fn push(&mut self, bytes: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(bytes);
        let mut events = Vec::new();

        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            if let Some(event) = Self::decode_line(&line) {
                events.push(event);
            }
        }
        events
    }

    /// Flush a trailing line that had no newline
    pub fn finish(&mut self) -> Option<SseEvent> {
        let line = std::mem::take(&mut self.buffer);
        Self::decode_line(&line)
    }

    fn decode_line(line: &[u8]) -> Option<SseEvent> {
        let line = String::from_utf8_lossy(line);
        let line = line.trim_end_matches(['\r', '\n']);
        let payload = line.strip_prefix("data:")?.trim();
        match payload {
            "" => None,
            "[DONE]" => Some(SseEvent::Done),
            data => Some(SseEvent::Data(data.to_string())),
        }
    }
}

/// Turn a chat-completions SSE body into text deltas plus a final `done` chunk
fn decode_chunks<S, B>(mut body: S) -> impl Stream<Item = Result<StreamChunk>> + Send
where
    S: Stream<Item = Result<B>> + Send + Unpin,
    B: AsRef<[u8]> + Send,
{
    try_stream! {
        let mut decoder = SseDecoder::new();
        let mut usage: Option<TokenUsage> = None;

        'read: while let Some(next) = body.next().await {
            let bytes = next?;
            for event in decoder.push(bytes.as_ref()) {
                match event {
                    SseEvent::Done => break 'read,
                    SseEvent::Data(data) => match serde_json::from_str::<ChunkResponse>(&data) {
                        Ok(chunk) => {
                            if let Some(u) = chunk.usage {
                                usage = Some(u.into());
                            }
                            let delta: String = chunk
                                .choices
                                .into_iter()
                                .filter_map(|c| c.delta.content)
                                .collect();
                            if !delta.is_empty() {
                                yield StreamChunk { delta, done: false, usage: None };
                            }
                        }
                        Err(e) => warn!("Failed to parse stream chunk: {}, data: {}", e, data),
                    },
                }
            }
        }

        if let Some(SseEvent::Data(data)) = decoder.finish() {
            trace!("Discarding trailing partial event: {}", data);
        }
        yield StreamChunk { delta: String::new(), done: true, usage };
    }
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

/// Pull `error.message` out of an OpenAI-style error body
fn error_detail(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| {
            v.pointer("/error/message")
                .and_then(|m| m.as_str())
                .map(str::to_string)
        })
        .unwrap_or_else(|| body.trim().chars().take(500).collect())
}

fn status_error(status: StatusCode, body: &str) -> AgentError {
    let detail = format!("HTTP {}: {}", status.as_u16(), error_detail(body));
    match status.as_u16() {
        401 | 403 => AgentError::Auth(detail),
        429 => AgentError::RateLimited(detail),
        500..=599 => AgentError::ProviderUnavailable(detail),
        _ => AgentError::Provider(detail),
    }
}

fn transport_error(err: reqwest::Error) -> AgentError {
    if err.is_connect() || err.is_timeout() {
        AgentError::ProviderUnavailable(err.to_string())
    } else {
        AgentError::Provider(err.to_string())
    }
}

// ---------------------------------------------------------------------------
// Provider
// ---------------------------------------------------------------------------

/// Chat-completions client for any OpenAI-compatible server
pub struct OpenAiCompatProvider {
    client: Client,
    config: ProviderConfig,
}

impl OpenAiCompatProvider {
    pub fn new(config: ProviderConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| AgentError::Config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { client, config })
    }

    /// Detect and configure the provider from environment variables
    pub fn from_env() -> Result<Self> {
        Self::new(ProviderConfig::from_env()?)
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    fn convert_messages(messages: &[Message]) -> Vec<WireMessage<'_>> {
        messages
            .iter()
            .map(|m| {
                let tool_call_id = m.metadata.get("tool_call_id").and_then(|v| v.as_str());
                let role = match (&m.role, tool_call_id) {
                    (Role::System, _) => "system",
                    (Role::User, _) => "user",
                    (Role::Assistant, _) => "assistant",
                    (Role::Tool, Some(_)) => "tool",
                    // Without a call ID the API rejects the tool role
                    (Role::Tool, None) => "user",
                };
                WireMessage {
                    role,
                    content: &m.content,
                    tool_call_id: if role == "tool" { tool_call_id } else { None },
                }
            })
            .collect()
    }

    fn build_request<'a>(
        &'a self,
        messages: &'a [Message],
        options: &'a GenerationOptions,
        stream: bool,
    ) -> ChatRequest<'a> {
        ChatRequest {
            model: options.model.as_deref().unwrap_or(&self.config.model),
            messages: Self::convert_messages(messages),
            temperature: options.temperature,
            max_tokens: options.max_tokens,
            top_p: options.top_p,
            stop: &options.stop_sequences,
            stream,
        }
    }

    async fn post(&self, body: &ChatRequest<'_>) -> Result<reqwest::Response> {
        let url = self.config.endpoint("chat/completions");
        if let Ok(json) = serde_json::to_string(body) {
            trace!(url = %url, "request: {}", json);
        }

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .header(header::CONTENT_TYPE, "application/json")
            .json(body)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            warn!(provider = %self.config.kind, status = status.as_u16(), "Chat completion rejected");
            return Err(status_error(status, &text));
        }
        Ok(response)
    }

    fn convert_completion(response: ChatResponse, fallback_model: &str) -> Result<Completion> {
        let ChatResponse { model, choices, usage } = response;
        let choice = choices
            .into_iter()
            .next()
            .ok_or_else(|| AgentError::Provider("Response contained no choices".into()))?;

        Ok(Completion {
            content: choice.message.content.unwrap_or_default(),
            model: model.unwrap_or_else(|| fallback_model.to_string()),
            usage: usage.map(Into::into),
            finish_reason: choice.finish_reason.as_deref().map(FinishReason::from_api),
        })
    }
}

#[async_trait]
impl LlmProvider for OpenAiCompatProvider {
    async fn info(&self) -> Result<ProviderInfo> {
        Ok(ProviderInfo {
            name: self.config.kind.to_string(),
            base_url: Some(self.config.base_url.clone()),
            default_model: self.config.model.clone(),
            supports_streaming: true,
        })
    }

    async fn health_check(&self) -> Result<bool> {
        match self.list_models().await {
            Ok(_) => Ok(true),
            Err(e) => {
                warn!(provider = %self.config.kind, "Health check failed: {}", e);
                Ok(false)
            }
        }
    }

    async fn complete(
        &self,
        messages: &[Message],
        options: &GenerationOptions,
    ) -> Result<Completion> {
        let request = self.build_request(messages, options, false);
        let model = request.model.to_string();
        let response = self.post(&request).await?;

        let text = response.text().await.map_err(transport_error)?;
        trace!("response: {}", text);
        let parsed: ChatResponse = serde_json::from_str(&text)
            .map_err(|e| AgentError::Provider(format!("Malformed completion response: {}", e)))?;

        let completion = Self::convert_completion(parsed, &model)?;
        debug!(
            provider = %self.config.kind,
            model = %completion.model,
            tokens = completion.usage.as_ref().map(|u| u.total_tokens),
            "Completion received"
        );
        Ok(completion)
    }

    async fn complete_stream(
        &self,
        messages: &[Message],
        options: &GenerationOptions,
    ) -> Result<CompletionStream> {
        let request = self.build_request(messages, options, true);
        let response = self.post(&request).await?;
        let body = response.bytes_stream().map(|r| r.map_err(transport_error));
        Ok(Box::pin(decode_chunks(body)))
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>> {
        let response = self
            .client
            .get(self.config.endpoint("models"))
            .bearer_auth(&self.config.api_key)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(status_error(status, &text));
        }

        let list: ModelList = response
            .json()
            .await
            .map_err(|e| AgentError::Provider(format!("Malformed model list: {}", e)))?;

        Ok(list
            .data
            .into_iter()
            .map(|m| ModelInfo {
                id: m.id,
                owned_by: m.owned_by,
            })
            .collect())
    }
}
