//! In-process store for the long-term layers

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use super::{
    eviction_candidate, forget_items, keyword_relevance, ForgetStrategy, MemoryStore, MemoryUpdate,
    RetrieveQuery, StoreStats,
};
use crate::error::Result;
use crate::model::{MemoryConfig, MemoryItem, MemoryKind};

/// Weight of keyword relevance versus importance when ranking
const RELEVANCE_WEIGHT: f32 = 0.8;

/// Keyword-searchable store used for episodic, semantic and perceptual memory
///
/// Holds at most `max_capacity` items; adding beyond that evicts the least
/// important (oldest on ties).
pub struct InMemoryStore {
    kind: MemoryKind,
    capacity: usize,
    items: RwLock<Vec<MemoryItem>>,
}

impl InMemoryStore {
    pub fn new(kind: MemoryKind, config: &MemoryConfig) -> Self {
        Self {
            kind,
            capacity: config.max_capacity.max(1),
            items: RwLock::new(Vec::new()),
        }
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }
}

#[async_trait]
impl MemoryStore for InMemoryStore {
    fn kind(&self) -> MemoryKind {
        self.kind
    }

    async fn add(&self, mut item: MemoryItem) -> Result<String> {
        item.memory_type = self.kind;
        let id = item.id.clone();
        let mut items = self.items.write().await;

        if let Some(existing) = items.iter_mut().find(|m| m.id == id) {
            *existing = item;
            return Ok(id);
        }

        while items.len() >= self.capacity {
            let Some(victim) = eviction_candidate(&items) else { break };
            let evicted = items.remove(victim);
            debug!(kind = %self.kind, id = %evicted.id, "Evicted memory at capacity");
        }
        items.push(item);
        Ok(id)
    }

    async fn retrieve(&self, query: &RetrieveQuery) -> Result<Vec<MemoryItem>> {
        let items = self.items.read().await;
        let mut scored: Vec<(f32, &MemoryItem)> = items
            .iter()
            .filter(|m| query.admits(m))
            .filter_map(|m| {
                let relevance = keyword_relevance(&query.query, &m.content);
                (relevance > 0.0).then(|| {
                    (relevance * RELEVANCE_WEIGHT + m.importance * (1.0 - RELEVANCE_WEIGHT), m)
                })
            })
            .collect();

        scored.sort_by(|a, b| b.0.total_cmp(&a.0).then_with(|| b.1.cmp_by_time(a.1)));
        Ok(scored
            .into_iter()
            .take(query.limit)
            .map(|(_, m)| m.clone())
            .collect())
    }

    async fn update(&self, id: &str, update: &MemoryUpdate) -> Result<bool> {
        let mut items = self.items.write().await;
        match items.iter_mut().find(|m| m.id == id) {
            Some(item) => {
                update.apply(item);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn remove(&self, id: &str) -> Result<bool> {
        let mut items = self.items.write().await;
        let before = items.len();
        items.retain(|m| m.id != id);
        Ok(items.len() != before)
    }

    async fn contains(&self, id: &str) -> Result<bool> {
        Ok(self.items.read().await.iter().any(|m| m.id == id))
    }

    async fn get(&self, id: &str) -> Result<Option<MemoryItem>> {
        Ok(self.items.read().await.iter().find(|m| m.id == id).cloned())
    }

    async fn all(&self) -> Result<Vec<MemoryItem>> {
        Ok(self.items.read().await.clone())
    }

    async fn forget(&self, strategy: ForgetStrategy, threshold: f32, max_age_days: u32) -> Result<usize> {
        let mut items = self.items.write().await;
        Ok(forget_items(&mut items, strategy, threshold, max_age_days, self.capacity))
    }

    async fn clear(&self) -> Result<()> {
        self.items.write().await.clear();
        Ok(())
    }

    async fn stats(&self) -> Result<StoreStats> {
        let items = self.items.read().await;
        Ok(StoreStats {
            capacity: Some(self.capacity),
            ..StoreStats::from_items(self.kind, items.iter())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> InMemoryStore {
        InMemoryStore::new(MemoryKind::Semantic, &MemoryConfig::default())
    }

    fn item(content: &str, importance: f32) -> MemoryItem {
        MemoryItem::new(content, MemoryKind::Working, "u").with_importance(importance)
    }

    #[tokio::test]
    async fn test_add_forces_store_kind() {
        let store = store();
        let id = store.add(item("Rust has ownership", 0.5)).await.unwrap();
        let stored = store.get(&id).await.unwrap().unwrap();
        assert_eq!(stored.memory_type, MemoryKind::Semantic);
    }

    #[tokio::test]
    async fn test_retrieve_ranks_relevance_then_importance() {
        let store = store();
        store.add(item("rust ownership rules", 0.2)).await.unwrap();
        store.add(item("rust macros", 0.9)).await.unwrap();
        store.add(item("python typing", 1.0)).await.unwrap();

        let results = store.retrieve(&RetrieveQuery::new("rust ownership", 10)).await.unwrap();
        let contents: Vec<&str> = results.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["rust ownership rules", "rust macros"]);

        let everything = store.retrieve(&RetrieveQuery::new("", 2)).await.unwrap();
        assert_eq!(everything[0].content, "python typing");
        assert_eq!(everything.len(), 2);
    }

    #[tokio::test]
    async fn test_capacity_evicts_least_important() {
        let store = store().with_capacity(2);
        store.add(item("keep", 0.9)).await.unwrap();
        let weak = store.add(item("weak", 0.1)).await.unwrap();
        store.add(item("new", 0.5)).await.unwrap();

        assert!(!store.contains(&weak).await.unwrap());
        assert_eq!(store.stats().await.unwrap().count, 2);
    }

    #[tokio::test]
    async fn test_update_remove_forget() {
        let store = store();
        let id = store.add(item("draft", 0.5)).await.unwrap();
        store.add(item("noise", 0.05)).await.unwrap();

        let update = MemoryUpdate {
            content: Some("final".into()),
            ..Default::default()
        };
        assert!(store.update(&id, &update).await.unwrap());
        assert!(!store.update("missing", &update).await.unwrap());
        assert_eq!(store.get(&id).await.unwrap().unwrap().content, "final");

        assert_eq!(store.forget(ForgetStrategy::ImportanceBased, 0.1, 30).await.unwrap(), 1);
        assert!(store.remove(&id).await.unwrap());
        assert!(!store.remove(&id).await.unwrap());
        assert!(store.all().await.unwrap().is_empty());
    }
}
