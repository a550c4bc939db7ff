//! HTTP/WebSocket Handlers

use axum::{
    extract::{State, WebSocketUpgrade, ws::{Message as WsMessage, WebSocket}},
    response::Response,
    Json,
};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use agent_core::{
    agent::{AgentCore, SimpleAgent, DEFAULT_SYSTEM_PROMPT},
    executor::{ParallelToolExecutor, TaskOutcome, ToolTask, DEFAULT_MAX_WORKERS},
    provider::ModelInfo,
    AgentBuilder, AgentKind, ToolCall, ToolResult, ToolSchema,
};
use agent_memory::{MemoryItem, MemoryKind, Metadata, NewMemory};

use crate::error::ApiError;
use crate::state::AppState;

// ============================================================================
// Request / Response Types
// ============================================================================

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub provider: String,
    pub provider_connected: bool,
    pub tools: usize,
}

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    /// Agent loop name; `simple` when omitted
    #[serde(default)]
    pub agent: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub max_steps: Option<usize>,
    /// Build the system prompt from memory, knowledge base and instructions
    #[serde(default)]
    pub use_context: bool,
    /// Record the exchange in memory once answered
    #[serde(default)]
    pub remember: bool,
}

#[derive(Debug, Serialize)]
pub struct ChatResponse {
    pub message: String,
    pub agent: AgentKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ExecuteToolRequest {
    pub name: String,
    /// Raw argument text, or a JSON object of named arguments
    #[serde(default)]
    pub input: Value,
}

#[derive(Debug, Deserialize)]
pub struct ParallelRequest {
    pub tasks: Vec<ToolTask>,
    #[serde(default)]
    pub max_workers: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct AddMemoryRequest {
    pub content: String,
    /// Classified from the content when omitted
    #[serde(default)]
    pub memory_type: Option<MemoryKind>,
    #[serde(default)]
    pub importance: Option<f32>,
    #[serde(default)]
    pub metadata: Metadata,
}

#[derive(Debug, Serialize)]
pub struct AddMemoryResponse {
    pub id: String,
}

#[derive(Debug, Deserialize)]
pub struct SearchMemoryRequest {
    pub query: String,
    #[serde(default)]
    pub memory_types: Vec<MemoryKind>,
    #[serde(default = "default_search_limit")]
    pub limit: usize,
    #[serde(default)]
    pub min_importance: f32,
}

fn default_search_limit() -> usize {
    5
}

// ============================================================================
// Handlers
// ============================================================================

/// Health check endpoint
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let provider_connected = state.provider.health_check().await.unwrap_or(false);
    let provider = match state.provider.info().await {
        Ok(info) => info.name,
        Err(_) => "unknown".into(),
    };

    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        provider,
        provider_connected,
        tools: state.tools.len(),
    })
}

pub async fn list_models(State(state): State<AppState>) -> Result<Json<Vec<ModelInfo>>, ApiError> {
    Ok(Json(state.provider.list_models().await?))
}

pub async fn list_tools(State(state): State<AppState>) -> Json<Vec<ToolSchema>> {
    Json(state.tools.schemas())
}

/// Run one agent turn (non-streaming)
pub async fn chat_handler(
    State(state): State<AppState>,
    Json(payload): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, ApiError> {
    if payload.message.trim().is_empty() {
        return Err(ApiError::Validation("message must not be empty".into()));
    }

    let kind: AgentKind = match payload.agent.as_deref() {
        Some(name) => name.parse()?,
        None => AgentKind::default(),
    };

    let mut builder = AgentBuilder::new()
        .provider(state.provider.clone())
        .tools(state.tools.clone())
        .settings(state.settings.clone());
    if let Some(model) = &payload.model {
        builder = builder.model(model.clone());
    }
    if let Some(max) = payload.max_steps {
        builder = builder.max_steps(max);
    }
    if payload.use_context {
        let prompt = state
            .context
            .build(&payload.message, &[], Some(DEFAULT_SYSTEM_PROMPT), Vec::new())
            .await;
        builder = builder.system_prompt(prompt);
    }
    let mut agent = builder.build(kind)?;

    let message = agent.run(&payload.message).await?;

    if payload.remember {
        if let Err(e) = state.memory_tool.auto_record_conversation(&payload.message, &message).await {
            tracing::warn!(error = %e, "Conversation not recorded");
        }
    }

    Ok(Json(ChatResponse {
        message,
        agent: kind,
        model: payload.model,
    }))
}

/// WebSocket streaming chat
pub async fn chat_stream_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_stream(socket, state))
}

fn stream_agent(state: &AppState, model: Option<&str>) -> SimpleAgent {
    let mut core = AgentCore::new("stream-agent", state.provider.clone()).with_settings(state.settings.clone());
    if let Some(model) = model {
        core = core.with_model(model);
    }
    SimpleAgent::from_core(core)
}

fn frame(value: &Value) -> WsMessage {
    WsMessage::Text(value.to_string().into())
}

fn error_frame(error: impl std::fmt::Display) -> WsMessage {
    frame(&serde_json::json!({"type": "error", "error": error.to_string()}))
}

/// One agent per connection so the conversation carries across messages;
/// switching models starts a fresh conversation
async fn handle_stream(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let mut session: Option<(Option<String>, SimpleAgent)> = None;

    while let Some(msg) = receiver.next().await {
        let msg = match msg {
            Ok(WsMessage::Text(text)) => text,
            Ok(WsMessage::Close(_)) => break,
            Err(e) => {
                tracing::error!("WebSocket error: {}", e);
                break;
            }
            _ => continue,
        };

        let request: ChatRequest = match serde_json::from_str(&msg) {
            Ok(r) => r,
            Err(e) => {
                if let Err(e) = sender.send(error_frame(e)).await {
                    tracing::debug!(error = %e, "WebSocket closed while reporting a bad request");
                    break;
                }
                continue;
            }
        };

        if session.as_ref().is_none_or(|(model, _)| *model != request.model) {
            session = Some((request.model.clone(), stream_agent(&state, request.model.as_deref())));
        }
        let Some((_, agent)) = session.as_mut() else {
            continue;
        };

        let mut failed = false;
        {
            let mut stream = agent.run_stream(&request.message);
            while let Some(result) = stream.next().await {
                let outgoing = match result {
                    Ok(delta) => frame(&serde_json::json!({"type": "chunk", "content": delta, "done": false})),
                    Err(e) => {
                        tracing::warn!(error = %e, "Streaming completion failed");
                        failed = true;
                        error_frame(e.user_message())
                    }
                };
                if sender.send(outgoing).await.is_err() {
                    return;
                }
                if failed {
                    break;
                }
            }
        }

        if !failed {
            let done = frame(&serde_json::json!({"type": "chunk", "content": "", "done": true}));
            if sender.send(done).await.is_err() {
                return;
            }
        }
    }
}

/// Execute one tool with raw text or structured arguments
pub async fn execute_tool(
    State(state): State<AppState>,
    Json(payload): Json<ExecuteToolRequest>,
) -> Result<Json<ToolResult>, ApiError> {
    match payload.input {
        Value::Object(map) => {
            let call = ToolCall::new(&payload.name, map.into_iter().collect()).with_generated_id();
            Ok(Json(state.tools.execute(&call).await?))
        }
        other => {
            let raw = match other {
                Value::String(s) => s,
                Value::Null => String::new(),
                value => value.to_string(),
            };
            let output = state.tools.execute_text(&payload.name, &raw).await;
            let result = match output.strip_prefix("Error: ") {
                Some(error) => ToolResult::failure(&payload.name, error),
                None => ToolResult::success(&payload.name, output),
            };
            Ok(Json(result))
        }
    }
}

/// Fan a batch of tool calls out to a bounded worker pool
pub async fn execute_parallel(
    State(state): State<AppState>,
    Json(payload): Json<ParallelRequest>,
) -> Json<Vec<TaskOutcome>> {
    let workers = payload.max_workers.unwrap_or(DEFAULT_MAX_WORKERS);
    let executor = ParallelToolExecutor::new(state.tools.clone(), workers);
    Json(executor.execute_parallel(payload.tasks).await)
}

pub async fn add_memory(
    State(state): State<AppState>,
    Json(payload): Json<AddMemoryRequest>,
) -> Result<Json<AddMemoryResponse>, ApiError> {
    if payload.content.trim().is_empty() {
        return Err(ApiError::Validation("content must not be empty".into()));
    }

    let mut memory = NewMemory::new(payload.content).metadata(payload.metadata);
    if let Some(kind) = payload.memory_type {
        memory = memory.of_kind(kind);
    }
    if let Some(importance) = payload.importance {
        memory = memory.importance(importance);
    }

    let id = state.memory.add_memory(memory).await?;
    Ok(Json(AddMemoryResponse { id }))
}

pub async fn search_memory(
    State(state): State<AppState>,
    Json(payload): Json<SearchMemoryRequest>,
) -> Result<Json<Vec<MemoryItem>>, ApiError> {
    let kinds = (!payload.memory_types.is_empty()).then_some(payload.memory_types.as_slice());
    let results = state
        .memory
        .retrieve_memories(&payload.query, kinds, payload.limit, payload.min_importance)
        .await?;
    Ok(Json(results))
}
