//! Error Types for Agent Memory

use agent_core::AgentError;
use thiserror::Error;

use crate::model::MemoryKind;

pub type Result<T> = std::result::Result<T, MemoryError>;

#[derive(Error, Debug)]
pub enum MemoryError {
    #[error("Memory not found: {0}")]
    NotFound(String),

    #[error("Unsupported memory type: {0}")]
    UnsupportedType(String),

    #[error("Memory type '{0}' is not enabled")]
    Disabled(MemoryKind),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Embedding error: {0}")]
    Embedding(String),

    #[error("Vector store error: {0}")]
    Backend(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<MemoryError> for AgentError {
    fn from(err: MemoryError) -> Self {
        match err {
            MemoryError::Config(msg) => AgentError::Config(msg),
            other => AgentError::Memory(other.to_string()),
        }
    }
}
