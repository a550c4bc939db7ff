//! Working memory
//!
//! Short-lived context bounded three ways: item count, total tokens and age.
//! Expired items are purged lazily on every access.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use tokio::sync::RwLock;
use tracing::debug;

use super::{
    eviction_candidate, forget_items, keyword_relevance, ForgetStrategy, MemoryStore, MemoryUpdate,
    RetrieveQuery, StoreStats,
};
use crate::error::Result;
use crate::model::{MemoryConfig, MemoryItem, MemoryKind};

pub struct WorkingMemory {
    capacity: usize,
    max_tokens: usize,
    ttl: Duration,
    items: RwLock<Vec<MemoryItem>>,
}

impl WorkingMemory {
    pub fn new(config: &MemoryConfig) -> Self {
        Self {
            capacity: config.working_memory_capacity.max(1),
            max_tokens: config.working_memory_tokens,
            ttl: Duration::minutes(config.working_memory_ttl_minutes.max(1)),
            items: RwLock::new(Vec::new()),
        }
    }

    fn purge_expired(&self, items: &mut Vec<MemoryItem>) {
        let cutoff = Utc::now() - self.ttl;
        let before = items.len();
        items.retain(|m| m.timestamp > cutoff);
        if items.len() != before {
            debug!(expired = before - items.len(), "Purged expired working memories");
        }
    }

    fn total_tokens(items: &[MemoryItem]) -> usize {
        items.iter().map(MemoryItem::estimate_tokens).sum()
    }

    /// Share of the TTL still remaining, 1.0 for brand new items
    fn freshness(&self, item: &MemoryItem) -> f32 {
        let age = (Utc::now() - item.timestamp).num_seconds().max(0) as f32;
        let ttl = self.ttl.num_seconds().max(1) as f32;
        (1.0 - age / ttl).clamp(0.0, 1.0)
    }
}

#[async_trait]
impl MemoryStore for WorkingMemory {
    fn kind(&self) -> MemoryKind {
        MemoryKind::Working
    }

    async fn add(&self, mut item: MemoryItem) -> Result<String> {
        item.memory_type = MemoryKind::Working;
        let id = item.id.clone();
        let mut items = self.items.write().await;
        self.purge_expired(&mut items);
        items.retain(|m| m.id != id);
        items.push(item);

        // The item just added always survives, even when it alone exceeds the budget
        while items.len() > 1
            && (items.len() > self.capacity || Self::total_tokens(&items) > self.max_tokens)
        {
            let last = items.len() - 1;
            let Some(victim) = eviction_candidate(&items[..last]) else { break };
            let evicted = items.remove(victim);
            debug!(id = %evicted.id, "Evicted working memory");
        }
        Ok(id)
    }

    /// Ranked by relevance (60%), freshness (20%) and importance (20%)
    async fn retrieve(&self, query: &RetrieveQuery) -> Result<Vec<MemoryItem>> {
        let mut items = self.items.write().await;
        self.purge_expired(&mut items);

        let mut scored: Vec<(f32, &MemoryItem)> = items
            .iter()
            .filter(|m| query.admits(m))
            .filter_map(|m| {
                let relevance = keyword_relevance(&query.query, &m.content);
                (relevance > 0.0).then(|| {
                    (relevance * 0.6 + self.freshness(m) * 0.2 + m.importance * 0.2, m)
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
        self.purge_expired(&mut items);
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
        let mut items = self.items.write().await;
        self.purge_expired(&mut items);
        Ok(items.iter().any(|m| m.id == id))
    }

    async fn get(&self, id: &str) -> Result<Option<MemoryItem>> {
        let mut items = self.items.write().await;
        self.purge_expired(&mut items);
        Ok(items.iter().find(|m| m.id == id).cloned())
    }

    async fn all(&self) -> Result<Vec<MemoryItem>> {
        let mut items = self.items.write().await;
        self.purge_expired(&mut items);
        Ok(items.clone())
    }

    async fn forget(&self, strategy: ForgetStrategy, threshold: f32, max_age_days: u32) -> Result<usize> {
        let mut items = self.items.write().await;
        self.purge_expired(&mut items);
        Ok(forget_items(&mut items, strategy, threshold, max_age_days, self.capacity))
    }

    async fn clear(&self) -> Result<()> {
        self.items.write().await.clear();
        Ok(())
    }

    async fn stats(&self) -> Result<StoreStats> {
        let mut items = self.items.write().await;
        self.purge_expired(&mut items);
        Ok(StoreStats {
            capacity: Some(self.capacity),
            total_tokens: Some(Self::total_tokens(&items)),
            max_tokens: Some(self.max_tokens),
            ..StoreStats::from_items(MemoryKind::Working, items.iter())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(capacity: usize, tokens: usize) -> MemoryConfig {
        MemoryConfig {
            working_memory_capacity: capacity,
            working_memory_tokens: tokens,
            ..Default::default()
        }
    }

    fn item(content: &str, importance: f32) -> MemoryItem {
        MemoryItem::new(content, MemoryKind::Episodic, "u").with_importance(importance)
    }

    #[tokio::test]
    async fn test_expired_items_disappear() {
        let memory = WorkingMemory::new(&MemoryConfig::default());
        let stale = item("stale note", 0.9).with_timestamp(Utc::now() - Duration::minutes(121));
        let stale_id = memory.add(stale).await.unwrap();
        memory.add(item("fresh note", 0.5)).await.unwrap();

        assert!(!memory.contains(&stale_id).await.unwrap());
        let results = memory.retrieve(&RetrieveQuery::new("note", 5)).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].memory_type, MemoryKind::Working);
    }

    #[tokio::test]
    async fn test_capacity_keeps_newest_and_most_important() {
        let memory = WorkingMemory::new(&config(2, 2000));
        memory.add(item("a", 0.9)).await.unwrap();
        memory.add(item("b", 0.2)).await.unwrap();
        memory.add(item("c", 0.1)).await.unwrap();

        let mut contents: Vec<String> = memory.all().await.unwrap().into_iter().map(|m| m.content).collect();
        contents.sort();
        assert_eq!(contents, vec!["a", "c"]);
    }

    #[tokio::test]
    async fn test_token_budget() {
        let memory = WorkingMemory::new(&config(10, 3));
        memory.add(item("12345678", 0.5)).await.unwrap();
        memory.add(item("abcdefgh", 0.5)).await.unwrap();

        let stats = memory.stats().await.unwrap();
        assert_eq!(stats.count, 1);
        assert_eq!(stats.total_tokens, Some(2));
        assert_eq!(memory.all().await.unwrap()[0].content, "abcdefgh");

        // A single oversized item is still kept
        memory.add(item(&"x".repeat(100), 0.5)).await.unwrap();
        assert_eq!(memory.stats().await.unwrap().count, 1);
    }

    #[tokio::test]
    async fn test_fresher_items_rank_first() {
        let memory = WorkingMemory::new(&MemoryConfig::default());
        memory
            .add(item("deploy plan", 0.5).with_timestamp(Utc::now() - Duration::minutes(100)))
            .await
            .unwrap();
        memory.add(item("deploy checklist", 0.5)).await.unwrap();

        let results = memory.retrieve(&RetrieveQuery::new("deploy", 5)).await.unwrap();
        assert_eq!(results[0].content, "deploy checklist");
    }
}
