//! # agent-runtime
//!
//! Runtime providers for the agent framework.
//!
//! ## Providers
//!
//! Every supported backend speaks the OpenAI `/chat/completions` protocol,
//! so a single [`OpenAiCompatProvider`] covers OpenAI, DeepSeek, Qwen
//! (DashScope), ModelScope, Kimi, Zhipu, Ollama, vLLM and custom endpoints.
//! [`detect`] picks the backend and its credentials from the environment.
//!
//! ## MCP
//!
//! [`McpClient`] connects to Model Context Protocol servers over stdio and
//! registers their tools alongside the local ones.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use agent_runtime::provider_from_env;
//!
//! let provider = provider_from_env()?;
//! let agent = AgentBuilder::new()
//!     .provider(provider)
//!     .build(AgentKind::Simple)?;
//! ```

use std::sync::Arc;

pub mod detect;
pub mod mcp;
pub mod openai;

pub use detect::{detect_provider, resolve_config, ProviderConfig, ProviderKind, ProviderOverrides};
pub use mcp::{McpClient, McpServerConfig, McpTool};
pub use openai::OpenAiCompatProvider;

// Re-export core types for convenience
pub use agent_core::{
    Agent, AgentError, AgentKind, LlmProvider, Message, Result, Role, Tool, ToolRegistry,
};

/// Detect, configure and wrap the provider described by the environment
pub fn provider_from_env() -> Result<Arc<dyn LlmProvider>> {
    let provider = OpenAiCompatProvider::from_env()?;
    tracing::info!(
        provider = %provider.config().kind,
        model = %provider.config().model,
        "LLM provider configured"
    );
    Ok(Arc::new(provider))
}
