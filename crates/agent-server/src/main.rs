//! rust-agent HTTP Server
//!
//! Axum-based server exposing the agent loops, the tool registry and the
//! memory layers over REST and WebSocket endpoints.

mod error;
mod handlers;
mod state;

use std::sync::Arc;

use axum::{routing::{get, post}, Router};
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use agent_core::builtin::{CalculatorTool, DateTimeTool, TerminalTool};
use agent_core::{AgentSettings, ToolRegistry};
use agent_runtime::{McpClient, McpServerConfig};
use agent_memory::{
    ContextBuilder, ContextConfig, Embedder, MemoryConfig, MemoryKind, MemoryManager, MemoryTool,
    OpenAiEmbedder, QdrantConfig, QdrantStore, RagTool,
};

use crate::handlers::{
    add_memory, chat_handler, chat_stream_handler, execute_parallel, execute_tool, health_check,
    list_models, list_tools, search_memory,
};
use crate::state::AppState;

fn app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Health & info
        .route("/health", get(health_check))
        .route("/api/models", get(list_models))
        .route("/api/tools", get(list_tools))

        // Agent API
        .route("/api/chat", post(chat_handler))
        .route("/api/chat/stream", get(chat_stream_handler))

        // Tools
        .route("/api/tools/execute", post(execute_tool))
        .route("/api/tools/parallel", post(execute_parallel))

        // Memory
        .route("/api/memory", post(add_memory))
        .route("/api/memory/search", post(search_memory))

        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()).layer(cors))
        .with_state(state)
}

/// In-process layers, with episodic and semantic memory moved to Qdrant
/// when `QDRANT_URL` is set
fn build_memory(user_id: &str) -> MemoryManager {
    let config = MemoryConfig::default();
    let manager = MemoryManager::new(config.clone(), user_id);

    if std::env::var("QDRANT_URL").is_err() {
        tracing::info!("QDRANT_URL not set - memory is held in process");
        return manager;
    }

    let backend = QdrantConfig::from_env()
        .and_then(|qdrant| Ok((qdrant, OpenAiEmbedder::from_env()?)));
    let (qdrant, embedder) = match backend {
        Ok(parts) => parts,
        Err(e) => {
            tracing::warn!(error = %e, "Qdrant configured but unusable - memory is held in process");
            return manager;
        }
    };

    let embedder: Arc<dyn Embedder> = Arc::new(embedder);
    let mut manager = manager;
    for kind in [MemoryKind::Episodic, MemoryKind::Semantic] {
        match QdrantStore::new(kind, qdrant.clone(), embedder.clone(), &config) {
            Ok(store) => manager = manager.with_store(Arc::new(store)),
            Err(e) => tracing::warn!(kind = %kind, error = %e, "Qdrant store unavailable"),
        }
    }
    tracing::info!(url = %qdrant.url, collection = %qdrant.collection, "✓ Long-term memory backed by Qdrant");
    manager
}

fn build_tools(memory_tool: Arc<MemoryTool>, rag: Arc<RagTool>) -> ToolRegistry {
    let mut tools = ToolRegistry::new();

    // Core tools
    tools.register(DateTimeTool);
    tools.register(CalculatorTool);

    let workspace = std::env::var("AGENT_WORKSPACE").unwrap_or_else(|_| ".".into());
    match TerminalTool::new(&workspace) {
        Ok(terminal) => tools.register(terminal),
        Err(e) => tracing::warn!(workspace = %workspace, error = %e, "Terminal tool disabled"),
    }

    // Memory tools
    tools.register_shared(memory_tool);
    tools.register_shared(rag);

    tools
}

/// Register the tools of every server listed in `MCP_SERVERS`
/// (command lines separated by `;`)
async fn connect_mcp_servers(tools: &mut ToolRegistry) {
    let Ok(servers) = std::env::var("MCP_SERVERS") else {
        return;
    };
    for line in servers.split(';').map(str::trim).filter(|l| !l.is_empty()) {
        let connected = async {
            let config = McpServerConfig::from_command_line(line)?;
            let client = Arc::new(McpClient::spawn(&config).await?);
            client.register_tools(tools).await
        };
        if let Err(e) = connected.await {
            tracing::warn!(server = %line, error = %e, "MCP server unavailable");
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();
    let settings = AgentSettings::from_env()?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| format!("{},tower_http=debug", settings.log_filter())),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Initialize LLM provider
    let provider = agent_runtime::provider_from_env()?;

    match provider.health_check().await {
        Ok(true) => {
            tracing::info!("✓ Connected to LLM provider");
            if let Ok(models) = provider.list_models().await {
                for model in models {
                    tracing::info!("  Model: {}", model.id);
                }
            }
        }
        Ok(false) | Err(_) => {
            tracing::warn!("⚠ LLM provider not reachable - agent requests will fail");
            tracing::warn!("  Check LLM_BASE_URL / LLM_API_KEY in .env");
        }
    }

    // Memory and tools
    let user_id = std::env::var("MEMORY_USER_ID").unwrap_or_else(|_| "default_user".into());
    let memory = Arc::new(build_memory(&user_id));
    let memory_tool = Arc::new(MemoryTool::new(memory.clone()));
    let rag = Arc::new(RagTool::new(memory.clone(), provider.clone()));
    let context = ContextBuilder::new(ContextConfig::default())
        .with_memory(memory.clone())
        .with_rag(rag.clone());
    let mut tools = build_tools(memory_tool.clone(), rag);
    connect_mcp_servers(&mut tools).await;

    tracing::info!("Registered {} tools:", tools.len());
    for name in tools.names() {
        tracing::info!("  • {}", name);
    }

    let state = AppState {
        provider,
        tools: Arc::new(tools),
        memory,
        memory_tool,
        context: Arc::new(context),
        settings,
    };

    // Start server
    let addr = std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".into());
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("══════════════════════════════════════════════════");
    tracing::info!("🚀 rust-agent server running on http://{}", addr);
    tracing::info!("══════════════════════════════════════════════════");
    tracing::info!("");
    tracing::info!("Endpoints:");
    tracing::info!("  GET  /health              - Health check");
    tracing::info!("  GET  /api/models          - List available models");
    tracing::info!("  GET  /api/tools           - List registered tools");
    tracing::info!("  POST /api/chat            - Run an agent turn");
    tracing::info!("  GET  /api/chat/stream     - WebSocket streaming");
    tracing::info!("  POST /api/tools/execute   - Execute one tool");
    tracing::info!("  POST /api/tools/parallel  - Execute tools in parallel");
    tracing::info!("  POST /api/memory          - Store a memory");
    tracing::info!("  POST /api/memory/search   - Search memories");
    tracing::info!("");

    axum::serve(listener, app(state)).await?;

    Ok(())
}
