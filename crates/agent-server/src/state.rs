//! Application State

use std::sync::Arc;

use agent_core::{AgentSettings, LlmProvider, ToolRegistry};
use agent_memory::{ContextBuilder, MemoryManager, MemoryTool};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    /// LLM provider resolved from the environment
    pub provider: Arc<dyn LlmProvider>,

    /// Tool registry with all available tools
    pub tools: Arc<ToolRegistry>,

    /// Memory layers shared by the memory and RAG tools
    pub memory: Arc<MemoryManager>,

    /// Session-scoped memory tool, also registered in `tools`
    pub memory_tool: Arc<MemoryTool>,

    /// Prompt context assembled from memory and the knowledge base
    pub context: Arc<ContextBuilder>,

    /// Settings applied to every agent built per request
    pub settings: AgentSettings,
}
