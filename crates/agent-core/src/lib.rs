//! # agent-core
//!
//! Core agent logic with provider-agnostic LLM abstraction and extensible tool system.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         Agents                               │
//! │  simple · react · reflection · plan_solve · tool_aware       │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────────────┐   │
//! │  │  Parsers    │  │    Tools    │  │   LlmProvider       │   │
//! │  │  (action)   │──│   Registry  │──│   (Strategy)        │   │
//! │  └─────────────┘  └─────────────┘  └─────────────────────┘   │
//! │                   params · executor                           │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! The `LlmProvider` trait lets any OpenAI-compatible backend (OpenAI,
//! DeepSeek, Qwen, Ollama, vLLM, ...) drive the same agent loops.

pub mod action;
pub mod agent;
pub mod builtin;
pub mod config;
pub mod error;
pub mod executor;
pub mod message;
pub mod params;
pub mod provider;
pub mod tool;

#[cfg(test)]
pub(crate) mod testing;

pub use agent::{Agent, AgentBuilder, AgentCore, AgentKind};
pub use config::AgentSettings;
pub use error::{AgentError, Result};
pub use executor::{ParallelToolExecutor, TaskOutcome, TaskStatus, ToolTask};
pub use message::{Conversation, Message, Role};
pub use provider::{GenerationOptions, LlmProvider};
pub use tool::{Tool, ToolCall, ToolRegistry, ToolResult, ToolSchema};
