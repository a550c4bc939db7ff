//! Memory Data Model

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::MemoryError;

/// Free-form metadata attached to a memory
pub type Metadata = HashMap<String, serde_json::Value>;

/// Which layer a memory lives in
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryKind {
    /// Short-lived scratch context with TTL and token budget
    Working,
    /// Events and experiences
    Episodic,
    /// Facts, concepts and rules
    Semantic,
    /// Observations from other modalities (image, audio, ...)
    Perceptual,
}

impl MemoryKind {
    pub const ALL: [MemoryKind; 4] = [
        MemoryKind::Working,
        MemoryKind::Episodic,
        MemoryKind::Semantic,
        MemoryKind::Perceptual,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryKind::Working => "working",
            MemoryKind::Episodic => "episodic",
            MemoryKind::Semantic => "semantic",
            MemoryKind::Perceptual => "perceptual",
        }
    }

    /// Label used when presenting memories to users
    pub fn label(&self) -> &'static str {
        match self {
            MemoryKind::Working => "Working memory",
            MemoryKind::Episodic => "Episodic memory",
            MemoryKind::Semantic => "Semantic memory",
            MemoryKind::Perceptual => "Perceptual memory",
        }
    }
}

impl fmt::Display for MemoryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MemoryKind {
    type Err = MemoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "working" => Ok(MemoryKind::Working),
            "episodic" => Ok(MemoryKind::Episodic),
            "semantic" => Ok(MemoryKind::Semantic),
            "perceptual" => Ok(MemoryKind::Perceptual),
            other => Err(MemoryError::UnsupportedType(other.to_string())),
        }
    }
}

/// A single remembered piece of content
///
/// Two items are equal when their IDs match; use [`MemoryItem::cmp_by_time`]
/// to order them chronologically.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MemoryItem {
    pub id: String,
    pub content: String,
    pub memory_type: MemoryKind,
    pub user_id: String,
    pub timestamp: DateTime<Utc>,

    /// 0.0 (trivial) to 1.0 (critical)
    #[serde(default = "default_importance")]
    pub importance: f32,

    #[serde(default)]
    pub metadata: Metadata,
}

fn default_importance() -> f32 { 0.5 }

impl MemoryItem {
    /// New item with a fresh UUID and the current time
    pub fn new(content: impl Into<String>, memory_type: MemoryKind, user_id: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            content: content.into(),
            memory_type,
            user_id: user_id.into(),
            timestamp: Utc::now(),
            importance: default_importance(),
            metadata: Metadata::new(),
        }
    }

    pub fn with_importance(mut self, importance: f32) -> Self {
        self.importance = importance.clamp(0.0, 1.0);
        self
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn cmp_by_time(&self, other: &Self) -> Ordering {
        self.timestamp.cmp(&other.timestamp)
    }

    pub fn is_newer_than(&self, other: &Self) -> bool {
        self.timestamp > other.timestamp
    }

    /// Age in whole days relative to `now`
    pub fn age_days(&self, now: DateTime<Utc>) -> i64 {
        (now - self.timestamp).num_days()
    }

    /// Rough token count used for working-memory budgets
    pub fn estimate_tokens(&self) -> usize {
        self.content.chars().count().div_ceil(4)
    }

    /// First `max_chars` characters, with an ellipsis when cut
    pub fn preview(&self, max_chars: usize) -> String {
        if self.content.chars().count() > max_chars {
            let head: String = self.content.chars().take(max_chars).collect();
            format!("{}...", head)
        } else {
            self.content.clone()
        }
    }
}

impl PartialEq for MemoryItem {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for MemoryItem {}

/// Capacity and decay settings shared by all memory stores
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Items a long-term store keeps before evicting the least important
    #[serde(default = "default_max_capacity")]
    pub max_capacity: usize,

    /// Items below this importance are first to go
    #[serde(default = "default_importance_threshold")]
    pub importance_threshold: f32,

    #[serde(default = "default_decay_factor")]
    pub decay_factor: f32,

    #[serde(default = "default_working_capacity")]
    pub working_memory_capacity: usize,

    #[serde(default = "default_working_tokens")]
    pub working_memory_tokens: usize,

    #[serde(default = "default_working_ttl")]
    pub working_memory_ttl_minutes: i64,
}

fn default_max_capacity() -> usize { 100 }
fn default_importance_threshold() -> f32 { 0.1 }
fn default_decay_factor() -> f32 { 0.95 }
fn default_working_capacity() -> usize { 10 }
fn default_working_tokens() -> usize { 2000 }
fn default_working_ttl() -> i64 { 120 }

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_capacity: default_max_capacity(),
            importance_threshold: default_importance_threshold(),
            decay_factor: default_decay_factor(),
            working_memory_capacity: default_working_capacity(),
            working_memory_tokens: default_working_tokens(),
            working_memory_ttl_minutes: default_working_ttl(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_kind_parsing() {
        assert_eq!("Episodic".parse::<MemoryKind>().unwrap(), MemoryKind::Episodic);
        assert!(matches!(
            "dream".parse::<MemoryKind>(),
            Err(MemoryError::UnsupportedType(t)) if t == "dream"
        ));
        for kind in MemoryKind::ALL {
            assert_eq!(kind.to_string().parse::<MemoryKind>().unwrap(), kind);
        }
    }

    #[test]
    fn test_equality_is_by_id() {
        let a = MemoryItem::new("one", MemoryKind::Working, "u");
        let mut b = a.clone();
        b.content = "changed".into();
        assert_eq!(a, b);
        assert_ne!(a, MemoryItem::new("one", MemoryKind::Working, "u"));
    }

    #[test]
    fn test_time_ordering() {
        let now = Utc::now();
        let old = MemoryItem::new("old", MemoryKind::Episodic, "u").with_timestamp(now - Duration::days(3));
        let new = MemoryItem::new("new", MemoryKind::Episodic, "u").with_timestamp(now);
        assert_eq!(old.cmp_by_time(&new), Ordering::Less);
        assert!(new.is_newer_than(&old));
        assert_eq!(old.age_days(now), 3);
    }

    #[test]
    fn test_importance_is_clamped_and_preview_cut() {
        let item = MemoryItem::new("abcdef", MemoryKind::Semantic, "u").with_importance(1.7);
        assert_eq!(item.importance, 1.0);
        assert_eq!(item.preview(3), "abc...");
        assert_eq!(item.preview(10), "abcdef");
        assert_eq!(item.estimate_tokens(), 2);
    }

    #[test]
    fn test_config_defaults() {
        let config: MemoryConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, MemoryConfig::default());
        assert_eq!(config.max_capacity, 100);
        assert_eq!(config.working_memory_ttl_minutes, 120);
    }
}
