//! Memory Manager
//!
//! Single entry point over the memory layers. Storage and retrieval are
//! delegated to each layer's [`MemoryStore`]; the manager classifies new
//! content, estimates importance, fans queries out and moves memories
//! between layers.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{MemoryError, Result};
use crate::model::{MemoryConfig, MemoryItem, MemoryKind, Metadata};
use crate::store::{ForgetStrategy, InMemoryStore, MemoryStore, MemoryUpdate, RetrieveQuery, StoreStats, WorkingMemory};

const EPISODIC_KEYWORDS: &[&str] = &[
    "昨天", "今天", "明天", "上次", "记得", "发生", "经历",
    "yesterday", "today", "tomorrow", "last time", "remember", "happened", "experience",
];

const SEMANTIC_KEYWORDS: &[&str] = &[
    "定义", "概念", "规则", "知识", "原理", "方法",
    "definition", "concept", "rule", "knowledge", "principle", "method",
];

const IMPORTANT_KEYWORDS: &[&str] = &[
    "重要", "关键", "必须", "注意", "警告", "错误",
    "important", "critical", "must", "note", "warning", "error",
];

/// Options for [`MemoryManager::add_memory`]
#[derive(Clone, Debug)]
pub struct NewMemory {
    pub content: String,
    pub memory_type: MemoryKind,
    /// Estimated from the content when unset
    pub importance: Option<f32>,
    pub metadata: Metadata,
    /// Pick the layer from metadata and content instead of `memory_type`
    pub auto_classify: bool,
}

impl NewMemory {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            memory_type: MemoryKind::Working,
            importance: None,
            metadata: Metadata::new(),
            auto_classify: true,
        }
    }

    /// Store in exactly this layer
    pub fn of_kind(mut self, kind: MemoryKind) -> Self {
        self.memory_type = kind;
        self.auto_classify = false;
        self
    }

    pub fn importance(mut self, importance: f32) -> Self {
        self.importance = Some(importance);
        self
    }

    pub fn metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn meta(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct ManagerStats {
    pub user_id: String,
    pub enabled_types: Vec<MemoryKind>,
    pub total_memories: usize,
    pub memories_by_type: BTreeMap<MemoryKind, StoreStats>,
    pub config: MemoryConfig,
}

pub struct MemoryManager {
    config: MemoryConfig,
    user_id: String,
    stores: BTreeMap<MemoryKind, Arc<dyn MemoryStore>>,
}

impl MemoryManager {
    /// Working, episodic and semantic memory held in process
    pub fn new(config: MemoryConfig, user_id: impl Into<String>) -> Self {
        Self::with_kinds(config, user_id, &[MemoryKind::Working, MemoryKind::Episodic, MemoryKind::Semantic])
    }

    /// In-process stores for the given layers only
    pub fn with_kinds(config: MemoryConfig, user_id: impl Into<String>, kinds: &[MemoryKind]) -> Self {
        let mut stores: BTreeMap<MemoryKind, Arc<dyn MemoryStore>> = BTreeMap::new();
        for kind in kinds {
            let store: Arc<dyn MemoryStore> = match kind {
                MemoryKind::Working => Arc::new(WorkingMemory::new(&config)),
                other => Arc::new(InMemoryStore::new(*other, &config)),
            };
            stores.insert(*kind, store);
        }

        let manager = Self {
            config,
            user_id: user_id.into(),
            stores,
        };
        info!(user = %manager.user_id, kinds = ?manager.kinds(), "Memory manager initialised");
        manager
    }

    /// Swap in (or add) the backend for the store's layer
    pub fn with_store(mut self, store: Arc<dyn MemoryStore>) -> Self {
        self.stores.insert(store.kind(), store);
        self
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    pub fn kinds(&self) -> Vec<MemoryKind> {
        self.stores.keys().copied().collect()
    }

    pub fn store(&self, kind: MemoryKind) -> Option<&Arc<dyn MemoryStore>> {
        self.stores.get(&kind)
    }

    fn store_for(&self, kind: MemoryKind) -> Result<&Arc<dyn MemoryStore>> {
        self.stores.get(&kind).ok_or(MemoryError::Disabled(kind))
    }

    /// Layer for new content: metadata `type` wins, then keyword heuristics
    pub fn classify(content: &str, metadata: &Metadata) -> Result<MemoryKind> {
        if let Some(kind) = metadata.get("type").and_then(|v| v.as_str()).filter(|s| !s.is_empty()) {
            return kind.parse();
        }

        let lowered = content.to_lowercase();
        let mentions = |keywords: &[&str]| keywords.iter().any(|k| lowered.contains(k));
        if mentions(EPISODIC_KEYWORDS) {
            Ok(MemoryKind::Episodic)
        } else if mentions(SEMANTIC_KEYWORDS) {
            Ok(MemoryKind::Semantic)
        } else {
            Ok(MemoryKind::Working)
        }
    }

    /// Heuristic importance in `[0, 1]`
    ///
    /// Starts at 0.5; long content adds 0.1, urgent keywords add 0.2,
    /// and a metadata `priority` of `high` or `low` adds 0.3 or subtracts 0.2.
    pub fn estimate_importance(content: &str, metadata: &Metadata) -> f32 {
        let mut importance: f32 = 0.5;

        if content.chars().count() > 100 {
            importance += 0.1;
        }

        let lowered = content.to_lowercase();
        if IMPORTANT_KEYWORDS.iter().any(|k| lowered.contains(k)) {
            importance += 0.2;
        }

        match metadata.get("priority").and_then(|v| v.as_str()) {
            Some("high") => importance += 0.3,
            Some("low") => importance -= 0.2,
            _ => {}
        }

        importance.clamp(0.0, 1.0)
    }

    pub async fn add_memory(&self, memory: NewMemory) -> Result<String> {
        let kind = if memory.auto_classify {
            Self::classify(&memory.content, &memory.metadata)?
        } else {
            memory.memory_type
        };
        let store = self.store_for(kind)?;

        let importance = memory
            .importance
            .unwrap_or_else(|| Self::estimate_importance(&memory.content, &memory.metadata));

        let item = MemoryItem::new(memory.content, kind, &self.user_id)
            .with_importance(importance)
            .with_metadata(memory.metadata);

        let id = store.add(item).await?;
        debug!(kind = %kind, id = %id, "Memory added");
        Ok(id)
    }

    /// Search several layers and merge the hits by importance
    ///
    /// `limit` is split evenly across the layers searched. A layer that
    /// fails is logged and skipped.
    pub async fn retrieve_memories(
        &self,
        query: &str,
        kinds: Option<&[MemoryKind]>,
        limit: usize,
        min_importance: f32,
    ) -> Result<Vec<MemoryItem>> {
        let kinds: Vec<MemoryKind> = match kinds {
            Some(kinds) if !kinds.is_empty() => kinds.to_vec(),
            _ => self.kinds(),
        };
        let per_kind = (limit / kinds.len().max(1)).max(1);
        let request = RetrieveQuery::new(query, per_kind)
            .min_importance(min_importance)
            .for_user(&self.user_id);

        let mut results = Vec::new();
        for kind in kinds {
            let Some(store) = self.stores.get(&kind) else {
                continue;
            };
            match store.retrieve(&request).await {
                Ok(items) => results.extend(items),
                Err(e) => warn!(kind = %kind, error = %e, "Memory retrieval failed"),
            }
        }

        results.sort_by(|a, b| b.importance.total_cmp(&a.importance));
        results.truncate(limit);
        Ok(results)
    }

    async fn find_store(&self, id: &str) -> Result<Option<&Arc<dyn MemoryStore>>> {
        for store in self.stores.values() {
            if store.contains(id).await? {
                return Ok(Some(store));
            }
        }
        Ok(None)
    }

    pub async fn update_memory(&self, id: &str, update: &MemoryUpdate) -> Result<bool> {
        match self.find_store(id).await? {
            Some(store) => store.update(id, update).await,
            None => {
                warn!(id, "Memory to update not found");
                Ok(false)
            }
        }
    }

    pub async fn remove_memory(&self, id: &str) -> Result<bool> {
        match self.find_store(id).await? {
            Some(store) => store.remove(id).await,
            None => {
                warn!(id, "Memory to remove not found");
                Ok(false)
            }
        }
    }

    pub async fn get_memory(&self, id: &str) -> Result<Option<MemoryItem>> {
        match self.find_store(id).await? {
            Some(store) => store.get(id).await,
            None => Ok(None),
        }
    }

    /// Apply a forget strategy to every layer
    pub async fn forget_memories(&self, strategy: ForgetStrategy, threshold: f32, max_age_days: u32) -> Result<usize> {
        let mut total = 0;
        for store in self.stores.values() {
            total += store.forget(strategy, threshold, max_age_days).await?;
        }
        info!(strategy = %strategy, forgotten = total, "Forgot memories");
        Ok(total)
    }

    /// Move memories at or above `threshold` from one layer to another
    ///
    /// Moved items gain 10% importance, capped at 1.0.
    pub async fn consolidate_memories(&self, from: MemoryKind, to: MemoryKind, threshold: f32) -> Result<usize> {
        let (Some(source), Some(target)) = (self.stores.get(&from), self.stores.get(&to)) else {
            warn!(from = %from, to = %to, "Consolidation between disabled memory types");
            return Ok(0);
        };

        let candidates: Vec<MemoryItem> = source
            .all()
            .await?
            .into_iter()
            .filter(|m| m.importance >= threshold)
            .collect();

        let mut moved = 0;
        for mut item in candidates {
            if source.remove(&item.id).await? {
                item.memory_type = to;
                item.importance = (item.importance * 1.1).min(1.0);
                target.add(item).await?;
                moved += 1;
            }
        }

        info!(from = %from, to = %to, moved, "Consolidated memories");
        Ok(moved)
    }

    pub async fn stats(&self) -> Result<ManagerStats> {
        let mut memories_by_type = BTreeMap::new();
        let mut total_memories = 0;
        for (kind, store) in &self.stores {
            let stats = store.stats().await?;
            total_memories += stats.count;
            memories_by_type.insert(*kind, stats);
        }

        Ok(ManagerStats {
            user_id: self.user_id.clone(),
            enabled_types: self.kinds(),
            total_memories,
            memories_by_type,
            config: self.config.clone(),
        })
    }

    pub async fn clear_all(&self) -> Result<()> {
        for store in self.stores.values() {
            store.clear().await?;
        }
        info!(user = %self.user_id, "All memories cleared");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;

    fn manager() -> MemoryManager {
        MemoryManager::new(MemoryConfig::default(), "tester")
    }

    #[test]
    fn test_classification() {
        let none = Metadata::new();
        assert_eq!(MemoryManager::classify("Yesterday we shipped v2", &none).unwrap(), MemoryKind::Episodic);
        assert_eq!(MemoryManager::classify("我记得那次会议", &none).unwrap(), MemoryKind::Episodic);
        assert_eq!(MemoryManager::classify("The definition of a monad", &none).unwrap(), MemoryKind::Semantic);
        assert_eq!(MemoryManager::classify("buy milk", &none).unwrap(), MemoryKind::Working);

        let typed = Metadata::from([("type".to_string(), json!("semantic"))]);
        assert_eq!(MemoryManager::classify("yesterday", &typed).unwrap(), MemoryKind::Semantic);
        let bogus = Metadata::from([("type".to_string(), json!("dream"))]);
        assert!(MemoryManager::classify("x", &bogus).is_err());
    }

    #[test]
    fn test_importance_heuristic() {
        let none = Metadata::new();
        assert!((MemoryManager::estimate_importance("hello", &none) - 0.5).abs() < 1e-6);
        assert!((MemoryManager::estimate_importance("This is IMPORTANT", &none) - 0.7).abs() < 1e-6);
        assert!((MemoryManager::estimate_importance(&"a".repeat(101), &none) - 0.6).abs() < 1e-6);

        let high = Metadata::from([("priority".to_string(), json!("high"))]);
        assert_eq!(MemoryManager::estimate_importance("警告: 必须注意", &high), 1.0);
        let low = Metadata::from([("priority".to_string(), json!("low"))]);
        assert!((MemoryManager::estimate_importance("hello", &low) - 0.3).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_add_and_retrieve_across_layers() {
        let manager = manager();
        manager.add_memory(NewMemory::new("Yesterday I learned Rust traits")).await.unwrap();
        manager.add_memory(NewMemory::new("Rust trait definition: shared behaviour")).await.unwrap();
        manager
            .add_memory(NewMemory::new("Rust scratch note").of_kind(MemoryKind::Working).importance(0.9))
            .await
            .unwrap();

        let results = manager.retrieve_memories("rust", None, 10, 0.0).await.unwrap();
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].content, "Rust scratch note");
        assert!(results.iter().all(|m| m.user_id == "tester"));

        let only_semantic = manager
            .retrieve_memories("rust", Some(&[MemoryKind::Semantic]), 10, 0.0)
            .await
            .unwrap();
        assert_eq!(only_semantic.len(), 1);
        assert_eq!(only_semantic[0].memory_type, MemoryKind::Semantic);
    }

    #[tokio::test]
    async fn test_disabled_layer_is_rejected() {
        let manager = manager();
        let err = manager
            .add_memory(NewMemory::new("photo of a cat").of_kind(MemoryKind::Perceptual))
            .await
            .unwrap_err();
        assert!(matches!(err, MemoryError::Disabled(MemoryKind::Perceptual)));
    }

    #[tokio::test]
    async fn test_update_remove_by_id() {
        let manager = manager();
        let id = manager
            .add_memory(NewMemory::new("draft").of_kind(MemoryKind::Episodic))
            .await
            .unwrap();

        let update = MemoryUpdate {
            importance: Some(0.95),
            ..Default::default()
        };
        assert!(manager.update_memory(&id, &update).await.unwrap());
        assert_eq!(manager.get_memory(&id).await.unwrap().unwrap().importance, 0.95);
        assert!(!manager.update_memory("missing", &update).await.unwrap());

        assert!(manager.remove_memory(&id).await.unwrap());
        assert!(!manager.remove_memory(&id).await.unwrap());
    }

    #[tokio::test]
    async fn test_consolidation_moves_and_boosts() {
        let manager = manager();
        let keep = manager
            .add_memory(NewMemory::new("minor").of_kind(MemoryKind::Working).importance(0.3))
            .await
            .unwrap();
        let moved = manager
            .add_memory(NewMemory::new("deadline is Friday").of_kind(MemoryKind::Working).importance(0.95))
            .await
            .unwrap();

        let count = manager
            .consolidate_memories(MemoryKind::Working, MemoryKind::Episodic, 0.7)
            .await
            .unwrap();
        assert_eq!(count, 1);

        let item = manager.store(MemoryKind::Episodic).unwrap().get(&moved).await.unwrap().unwrap();
        assert_eq!(item.importance, 1.0);
        assert_eq!(item.memory_type, MemoryKind::Episodic);
        assert!(manager.store(MemoryKind::Working).unwrap().contains(&keep).await.unwrap());

        assert_eq!(
            manager
                .consolidate_memories(MemoryKind::Working, MemoryKind::Perceptual, 0.0)
                .await
                .unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn test_forget_stats_and_clear() {
        let manager = manager();
        manager
            .add_memory(NewMemory::new("noise").of_kind(MemoryKind::Episodic).importance(0.05))
            .await
            .unwrap();
        manager
            .add_memory(NewMemory::new("signal").of_kind(MemoryKind::Semantic).importance(0.8))
            .await
            .unwrap();

        assert_eq!(manager.forget_memories(ForgetStrategy::ImportanceBased, 0.1, 30).await.unwrap(), 1);

        let stats = manager.stats().await.unwrap();
        assert_eq!(stats.total_memories, 1);
        assert_eq!(stats.enabled_types.len(), 3);
        assert_eq!(stats.memories_by_type[&MemoryKind::Semantic].count, 1);

        manager.clear_all().await.unwrap();
        assert_eq!(manager.stats().await.unwrap().total_memories, 0);
    }

    struct BrokenStore;

    #[async_trait]
    impl MemoryStore for BrokenStore {
        fn kind(&self) -> MemoryKind {
            MemoryKind::Semantic
        }
        async fn add(&self, _: MemoryItem) -> Result<String> {
            Err(MemoryError::Backend("down".into()))
        }
        async fn retrieve(&self, _: &RetrieveQuery) -> Result<Vec<MemoryItem>> {
            Err(MemoryError::Backend("down".into()))
        }
        async fn update(&self, _: &str, _: &MemoryUpdate) -> Result<bool> {
            Ok(false)
        }
        async fn remove(&self, _: &str) -> Result<bool> {
            Ok(false)
        }
        async fn contains(&self, _: &str) -> Result<bool> {
            Ok(false)
        }
        async fn get(&self, _: &str) -> Result<Option<MemoryItem>> {
            Ok(None)
        }
        async fn all(&self) -> Result<Vec<MemoryItem>> {
            Ok(Vec::new())
        }
        async fn forget(&self, _: ForgetStrategy, _: f32, _: u32) -> Result<usize> {
            Ok(0)
        }
        async fn clear(&self) -> Result<()> {
            Ok(())
        }
        async fn stats(&self) -> Result<StoreStats> {
            Ok(StoreStats::default())
        }
    }

    #[tokio::test]
    async fn test_failing_store_is_skipped_on_retrieve() {
        let manager = manager().with_store(Arc::new(BrokenStore));
        manager
            .add_memory(NewMemory::new("rust tip").of_kind(MemoryKind::Episodic))
            .await
            .unwrap();

        let results = manager.retrieve_memories("rust", None, 9, 0.0).await.unwrap();
        assert_eq!(results.len(), 1);
    }
}
