//! Text Embeddings
//!
//! Vectors for the Qdrant-backed stores come from an [`Embedder`]. The
//! bundled implementation calls any OpenAI-compatible `/embeddings` endpoint.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{MemoryError, Result};

pub const DEFAULT_EMBED_MODEL: &str = "text-embedding-3-small";
pub const DEFAULT_EMBED_DIMENSION: usize = 1536;

/// Embedding backend (Strategy pattern)
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Length of every vector this embedder returns
    fn dimension(&self) -> usize;

    /// Embed a batch, one vector per input in the same order
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    async fn embed_one(&self, text: &str) -> Result<Vec<f32>> {
        self.embed(&[text.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| MemoryError::Embedding("empty embedding response".into()))
    }
}

#[derive(Clone, Debug)]
pub struct EmbedderConfig {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub dimension: usize,
    pub timeout_secs: u64,
}

impl EmbedderConfig {
    /// `EMBED_*` variables, falling back to the chat provider's `LLM_*` ones
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |primary: &str, fallback: &str| {
            lookup(primary)
                .or_else(|| lookup(fallback))
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let base_url = get("EMBED_BASE_URL", "LLM_BASE_URL")
            .ok_or_else(|| MemoryError::Config("EMBED_BASE_URL or LLM_BASE_URL must be set".into()))?;
        let api_key = get("EMBED_API_KEY", "LLM_API_KEY")
            .ok_or_else(|| MemoryError::Config("EMBED_API_KEY or LLM_API_KEY must be set".into()))?;
        let model = lookup("EMBED_MODEL_NAME")
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_EMBED_MODEL.into());
        let dimension = match lookup("EMBED_DIMENSION") {
            Some(raw) => raw.trim().parse().map_err(|e| {
                MemoryError::Config(format!("EMBED_DIMENSION must be an integer, got '{}': {}", raw, e))
            })?,
            None => DEFAULT_EMBED_DIMENSION,
        };

        Ok(Self {
            base_url,
            api_key,
            model,
            dimension,
            timeout_secs: 30,
        })
    }
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    #[serde(default)]
    index: usize,
    embedding: Vec<f32>,
}

/// Embedder for OpenAI-compatible `/embeddings` endpoints
pub struct OpenAiEmbedder {
    client: Client,
    config: EmbedderConfig,
}

impl OpenAiEmbedder {
    pub fn new(config: EmbedderConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self { client, config })
    }

    pub fn from_env() -> Result<Self> {
        Self::new(EmbedderConfig::from_env()?)
    }

    fn endpoint(&self) -> String {
        format!("{}/embeddings", self.config.base_url.trim_end_matches('/'))
    }

    /// Restore input order; some servers return `data` unordered
    fn into_vectors(response: EmbeddingResponse, expected: usize) -> Result<Vec<Vec<f32>>> {
        let mut data = response.data;
        if data.len() != expected {
            return Err(MemoryError::Embedding(format!(
                "expected {} embeddings, got {}",
                expected,
                data.len()
            )));
        }
        data.sort_by_key(|d| d.index);
        Ok(data.into_iter().map(|d| d.embedding).collect())
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    fn dimension(&self) -> usize {
        self.config.dimension
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let response = self
            .client
            .post(self.endpoint())
            .bearer_auth(&self.config.api_key)
            .json(&EmbeddingRequest {
                model: &self.config.model,
                input: texts,
            })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(MemoryError::Embedding(format!("HTTP {}: {}", status.as_u16(), body.trim())));
        }

        let parsed: EmbeddingResponse = response.json().await?;
        debug!(model = %self.config.model, count = texts.len(), "Embedded texts");
        Self::into_vectors(parsed, texts.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_config_falls_back_to_llm_variables() {
        let config = EmbedderConfig::from_lookup(env(&[
            ("LLM_BASE_URL", "https://api.openai.com/v1"),
            ("LLM_API_KEY", "sk-llm"),
            ("EMBED_API_KEY", "sk-embed"),
        ]))
        .unwrap();
        assert_eq!(config.base_url, "https://api.openai.com/v1");
        assert_eq!(config.api_key, "sk-embed");
        assert_eq!(config.model, DEFAULT_EMBED_MODEL);
        assert_eq!(config.dimension, DEFAULT_EMBED_DIMENSION);
    }

    #[test]
    fn test_config_requires_endpoint() {
        assert!(matches!(
            EmbedderConfig::from_lookup(env(&[("LLM_API_KEY", "k")])),
            Err(MemoryError::Config(_))
        ));
    }

    #[test]
    fn test_vectors_are_reordered_by_index() {
        let response: EmbeddingResponse = serde_json::from_str(
            r#"{"data":[{"index":1,"embedding":[0.2]},{"index":0,"embedding":[0.1]}]}"#,
        )
        .unwrap();
        let vectors = OpenAiEmbedder::into_vectors(response, 2).unwrap();
        assert_eq!(vectors, vec![vec![0.1], vec![0.2]]);
    }

    #[test]
    fn test_count_mismatch_is_error() {
        let response: EmbeddingResponse = serde_json::from_str(r#"{"data":[]}"#).unwrap();
        assert!(OpenAiEmbedder::into_vectors(response, 1).is_err());
    }
}
