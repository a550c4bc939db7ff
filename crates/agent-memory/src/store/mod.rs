//! Memory Stores
//!
//! Storage backends for the memory layers. Every layer implements
//! [`MemoryStore`]; the manager only coordinates.

mod memory;
mod qdrant;
mod working;

pub use memory::InMemoryStore;
pub use qdrant::{Distance, QdrantConfig, QdrantStore};
pub use working::WorkingMemory;

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{MemoryError, Result};
use crate::model::{MemoryItem, MemoryKind, Metadata};

/// Parameters for a retrieval request
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetrieveQuery {
    /// Search text; empty matches everything
    pub query: String,
    pub limit: usize,
    #[serde(default)]
    pub min_importance: f32,
    /// Restrict to one user's memories
    #[serde(default)]
    pub user_id: Option<String>,
}

impl RetrieveQuery {
    pub fn new(query: impl Into<String>, limit: usize) -> Self {
        Self {
            query: query.into(),
            limit,
            min_importance: 0.0,
            user_id: None,
        }
    }

    pub fn min_importance(mut self, min: f32) -> Self {
        self.min_importance = min;
        self
    }

    pub fn for_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Importance and owner filters shared by every store
    pub fn admits(&self, item: &MemoryItem) -> bool {
        item.importance >= self.min_importance
            && self.user_id.as_deref().is_none_or(|u| u == item.user_id)
    }
}

/// Partial update applied to an existing memory
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MemoryUpdate {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub importance: Option<f32>,
    /// Merged into the existing metadata
    #[serde(default)]
    pub metadata: Option<Metadata>,
}

impl MemoryUpdate {
    pub fn is_empty(&self) -> bool {
        self.content.is_none() && self.importance.is_none() && self.metadata.is_none()
    }

    pub fn apply(&self, item: &mut MemoryItem) {
        if let Some(content) = &self.content {
            item.content.clone_from(content);
        }
        if let Some(importance) = self.importance {
            item.importance = importance.clamp(0.0, 1.0);
        }
        if let Some(metadata) = &self.metadata {
            item.metadata
                .extend(metadata.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
    }
}

/// How [`MemoryStore::forget`] picks victims
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForgetStrategy {
    /// Drop items whose importance is below the threshold
    #[default]
    ImportanceBased,
    /// Drop items older than the maximum age
    TimeBased,
    /// Drop the least important items until the store is back under capacity
    CapacityBased,
}

impl ForgetStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ForgetStrategy::ImportanceBased => "importance_based",
            ForgetStrategy::TimeBased => "time_based",
            ForgetStrategy::CapacityBased => "capacity_based",
        }
    }
}

impl fmt::Display for ForgetStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ForgetStrategy {
    type Err = MemoryError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "importance_based" | "importance" => Ok(ForgetStrategy::ImportanceBased),
            "time_based" | "time" => Ok(ForgetStrategy::TimeBased),
            "capacity_based" | "capacity" => Ok(ForgetStrategy::CapacityBased),
            other => Err(MemoryError::InvalidInput(format!(
                "unknown forget strategy '{}'; expected importance_based, time_based or capacity_based",
                other
            ))),
        }
    }
}

/// Per-store statistics
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StoreStats {
    pub memory_type: Option<MemoryKind>,
    pub count: usize,
    pub avg_importance: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capacity: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_tokens: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<usize>,
}

impl StoreStats {
    pub fn from_items<'a>(kind: MemoryKind, items: impl IntoIterator<Item = &'a MemoryItem>) -> Self {
        let (count, total) = items
            .into_iter()
            .fold((0usize, 0.0f32), |(n, sum), item| (n + 1, sum + item.importance));
        Self {
            memory_type: Some(kind),
            count,
            avg_importance: if count == 0 { 0.0 } else { total / count as f32 },
            ..Default::default()
        }
    }
}

/// Storage backend for one memory layer
#[async_trait]
pub trait MemoryStore: Send + Sync {
    /// Layer this store serves
    fn kind(&self) -> MemoryKind;

    /// Store an item, returning its ID
    async fn add(&self, item: MemoryItem) -> Result<String>;

    /// Most relevant items for a query, best first
    async fn retrieve(&self, query: &RetrieveQuery) -> Result<Vec<MemoryItem>>;

    /// Apply a partial update; `false` when the ID is unknown
    async fn update(&self, id: &str, update: &MemoryUpdate) -> Result<bool>;

    /// Delete an item; `false` when the ID is unknown
    async fn remove(&self, id: &str) -> Result<bool>;

    async fn contains(&self, id: &str) -> Result<bool>;

    async fn get(&self, id: &str) -> Result<Option<MemoryItem>>;

    async fn all(&self) -> Result<Vec<MemoryItem>>;

    /// Remove items according to `strategy`, returning how many were dropped
    async fn forget(&self, strategy: ForgetStrategy, threshold: f32, max_age_days: u32) -> Result<usize>;

    async fn clear(&self) -> Result<()>;

    async fn stats(&self) -> Result<StoreStats>;
}

/// Lowercased search terms of a query
pub(crate) fn query_terms(query: &str) -> Vec<String> {
    query
        .split(|c: char| c.is_whitespace() || (c.is_ascii_punctuation() && c != '_' && c != '-'))
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// Keyword relevance of `content` for `query`, from 0.0 to 1.0
///
/// An empty query is fully relevant. The whole query appearing verbatim
/// scores 1.0; otherwise the score is the fraction of query terms found.
pub(crate) fn keyword_relevance(query: &str, content: &str) -> f32 {
    let query = query.trim();
    if query.is_empty() {
        return 1.0;
    }

    let haystack = content.to_lowercase();
    if haystack.contains(&query.to_lowercase()) {
        return 1.0;
    }

    let terms = query_terms(query);
    if terms.is_empty() {
        return 0.0;
    }
    let hits = terms.iter().filter(|t| haystack.contains(t.as_str())).count();
    hits as f32 / terms.len() as f32
}

/// Index of the item to evict first: lowest importance, then oldest
pub(crate) fn eviction_candidate(items: &[MemoryItem]) -> Option<usize> {
    items
        .iter()
        .enumerate()
        .min_by(|(_, a), (_, b)| {
            a.importance
                .total_cmp(&b.importance)
                .then_with(|| a.cmp_by_time(b))
        })
        .map(|(i, _)| i)
}

/// Apply a forget strategy to a list in place, returning the number removed
pub(crate) fn forget_items(
    items: &mut Vec<MemoryItem>,
    strategy: ForgetStrategy,
    threshold: f32,
    max_age_days: u32,
    capacity: usize,
) -> usize {
    let before = items.len();
    match strategy {
        ForgetStrategy::ImportanceBased => items.retain(|m| m.importance >= threshold),
        ForgetStrategy::TimeBased => {
            let now = chrono::Utc::now();
            items.retain(|m| m.age_days(now) < i64::from(max_age_days));
        }
        ForgetStrategy::CapacityBased => {
            while items.len() > capacity {
                match eviction_candidate(items) {
                    Some(i) => {
                        items.remove(i);
                    }
                    None => break,
                }
            }
        }
    }
    before - items.len()
}
