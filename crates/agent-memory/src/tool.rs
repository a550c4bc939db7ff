//! Memory Tool
//!
//! Exposes the [`MemoryManager`] to agents as a single `memory` tool whose
//! `action` argument selects the operation.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use agent_core::error::Result as AgentResult;
use agent_core::tool::{ParameterSchema, Tool, ToolCall, ToolResult, ToolSchema};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use tracing::debug;

use crate::error::{MemoryError, Result};
use crate::manager::{MemoryManager, NewMemory};
use crate::model::{MemoryKind, Metadata};
use crate::store::{ForgetStrategy, MemoryUpdate};

const NAME: &str = "memory";

const ACTIONS: &[&str] = &[
    "add", "search", "summary", "stats", "update", "remove", "forget", "consolidate", "clear_all",
];

/// Replies longer than this many characters are kept as episodes
const EPISODE_MIN_REPLY_CHARS: usize = 100;

/// User phrases that mark a turn worth keeping as an episode
const EPISODE_CUES: &[&str] = &["important", "remember"];

pub struct MemoryTool {
    manager: Arc<MemoryManager>,
    session_id: String,
    turns: AtomicUsize,
}

impl MemoryTool {
    pub fn new(manager: Arc<MemoryManager>) -> Self {
        Self {
            manager,
            session_id: format!("session_{}", Utc::now().format("%Y%m%d_%H%M%S")),
            turns: AtomicUsize::new(0),
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = session_id.into();
        self
    }

    pub fn manager(&self) -> &Arc<MemoryManager> {
        &self.manager
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Conversation turns recorded in this session
    pub fn turns(&self) -> usize {
        self.turns.load(Ordering::Relaxed)
    }

    /// Metadata every memory written through this tool carries
    fn session_metadata(&self, mut metadata: Metadata) -> Metadata {
        metadata.insert("session_id".into(), json!(self.session_id));
        metadata.insert("timestamp".into(), json!(Utc::now().to_rfc3339()));
        metadata
    }

    /// Record one exchange in working memory, plus an episode when the
    /// reply is long or the user flagged it. Returns the new memory IDs.
    pub async fn auto_record_conversation(&self, user_input: &str, agent_response: &str) -> Result<Vec<String>> {
        let turn = self.turns.fetch_add(1, Ordering::Relaxed) + 1;
        let record = |content: String, kind: MemoryKind, importance: f32, entry: &str| {
            let mut metadata = Metadata::new();
            metadata.insert("type".into(), json!(entry));
            metadata.insert("conversation_turn".into(), json!(turn));
            NewMemory::new(content)
                .of_kind(kind)
                .importance(importance)
                .metadata(self.session_metadata(metadata))
        };

        let mut ids = vec![
            self.manager
                .add_memory(record(format!("User: {}", user_input), MemoryKind::Working, 0.6, "user_input"))
                .await?,
            self.manager
                .add_memory(record(format!("Assistant: {}", agent_response), MemoryKind::Working, 0.7, "agent_response"))
                .await?,
        ];

        let lowered = user_input.to_lowercase();
        if agent_response.chars().count() > EPISODE_MIN_REPLY_CHARS
            || EPISODE_CUES.iter().any(|cue| lowered.contains(cue))
        {
            let episode = format!("Conversation - User: {}\nAssistant: {}", user_input, agent_response);
            ids.push(
                self.manager
                    .add_memory(record(episode, MemoryKind::Episodic, 0.8, "interaction"))
                    .await?,
            );
        }

        debug!(session = %self.session_id, turn, memories = ids.len(), "Conversation recorded");
        Ok(ids)
    }

    /// Relevant memories formatted for a prompt; empty when nothing matches
    pub async fn get_context_for_query(&self, query: &str, limit: usize) -> Result<String> {
        let results = self.manager.retrieve_memories(query, None, limit, 0.3).await?;
        if results.is_empty() {
            return Ok(String::new());
        }

        let mut lines = vec!["Relevant memories:".to_string()];
        lines.extend(results.iter().map(|m| format!("- {}", m.content)));
        Ok(lines.join("\n"))
    }

    /// Store a fact in semantic memory
    pub async fn add_knowledge(&self, content: &str, importance: f32) -> Result<String> {
        let mut metadata = Metadata::new();
        metadata.insert("knowledge_type".into(), json!("factual"));
        metadata.insert("source".into(), json!("manual"));

        let memory = NewMemory::new(content)
            .of_kind(MemoryKind::Semantic)
            .importance(importance)
            .metadata(self.session_metadata(metadata));
        self.manager.add_memory(memory).await
    }

    /// Drop this session's working memories and restart the turn count
    pub async fn clear_session(&self) -> Result<usize> {
        self.turns.store(0, Ordering::Relaxed);
        let Some(store) = self.manager.store(MemoryKind::Working) else {
            return Ok(0);
        };

        let mut removed = 0;
        for item in store.all().await? {
            let in_session = item
                .metadata
                .get("session_id")
                .and_then(Value::as_str)
                .is_some_and(|id| id == self.session_id);
            if in_session && store.remove(&item.id).await? {
                removed += 1;
            }
        }

        debug!(session = %self.session_id, removed, "Session cleared");
        Ok(removed)
    }

    async fn dispatch(&self, action: &str, call: &ToolCall) -> Result<String> {
        match action {
            "add" => self.add(call).await,
            "search" => self.search(call).await,
            "summary" => self.summary(call).await,
            "stats" => self.stats().await,
            "update" => self.update(call).await,
            "remove" => self.remove(call).await,
            "forget" => self.forget(call).await,
            "consolidate" => self.consolidate(call).await,
            "clear_all" => {
                self.manager.clear_all().await?;
                Ok("All memories cleared".into())
            }
            other => Err(MemoryError::InvalidInput(format!(
                "unsupported action '{}'; expected one of: {}",
                other,
                ACTIONS.join(", ")
            ))),
        }
    }

    async fn add(&self, call: &ToolCall) -> Result<String> {
        let content = required(call, "content")?;
        let kind = kind_arg(call, "memory_type")?.unwrap_or(MemoryKind::Working);

        let metadata = self.session_metadata(match call.arguments.get("metadata") {
            Some(Value::Object(map)) => map.clone().into_iter().collect(),
            _ => Metadata::new(),
        });

        let mut memory = NewMemory::new(content).of_kind(kind).metadata(metadata);
        if let Some(importance) = f32_arg(call, "importance") {
            memory = memory.importance(importance);
        }

        let id = self.manager.add_memory(memory).await?;
        Ok(format!("Memory added (ID: {})", id))
    }

    async fn search(&self, call: &ToolCall) -> Result<String> {
        let query = call.str_arg("query").unwrap_or_default();
        let limit = usize_arg(call, "limit").unwrap_or(5);
        let min_importance = f32_arg(call, "min_importance").unwrap_or(0.0);
        let kinds = kind_arg(call, "memory_type")?.map(|k| vec![k]);

        let results = self
            .manager
            .retrieve_memories(query, kinds.as_deref(), limit, min_importance)
            .await?;

        if results.is_empty() {
            return Ok(format!("No memories found for '{}'", query));
        }

        let lines: Vec<String> = results
            .iter()
            .enumerate()
            .map(|(i, m)| {
                format!(
                    "{}. [{}] {} (importance: {:.2})",
                    i + 1,
                    m.memory_type.label(),
                    m.preview(500),
                    m.importance
                )
            })
            .collect();
        Ok(format!("Found {} memories:\n{}", results.len(), lines.join("\n")))
    }

    async fn summary(&self, call: &ToolCall) -> Result<String> {
        let limit = usize_arg(call, "limit").unwrap_or(10);
        let stats = self.manager.stats().await?;

        let mut out = vec![
            "Memory summary".to_string(),
            format!("Total memories: {}", stats.total_memories),
        ];
        for (kind, s) in &stats.memories_by_type {
            out.push(format!(
                "- {}: {} (avg importance {:.2})",
                kind.label(),
                s.count,
                s.avg_importance
            ));
        }

        let important = self.manager.retrieve_memories("", None, limit, 0.0).await?;
        if !important.is_empty() {
            out.push("Most important:".into());
            for (i, m) in important.iter().enumerate() {
                out.push(format!("{}. [{}] {} ({:.2})", i + 1, m.memory_type, m.preview(100), m.importance));
            }
        }
        Ok(out.join("\n"))
    }

    async fn stats(&self) -> Result<String> {
        let stats = self.manager.stats().await?;
        let mut out = vec![
            format!("User: {}", stats.user_id),
            format!("Session: {}", self.session_id),
            format!("Conversation turns: {}", self.turns()),
            format!("Total memories: {}", stats.total_memories),
        ];
        for (kind, s) in &stats.memories_by_type {
            let mut line = format!("- {}: {} items", kind, s.count);
            if let Some(capacity) = s.capacity {
                line.push_str(&format!(" / capacity {}", capacity));
            }
            if let (Some(tokens), Some(max)) = (s.total_tokens, s.max_tokens) {
                line.push_str(&format!(", {} / {} tokens", tokens, max));
            }
            out.push(line);
        }
        Ok(out.join("\n"))
    }

    async fn update(&self, call: &ToolCall) -> Result<String> {
        let id = required(call, "memory_id")?;
        let update = MemoryUpdate {
            content: call.str_arg("content").map(str::to_string),
            importance: f32_arg(call, "importance"),
            metadata: match call.arguments.get("metadata") {
                Some(Value::Object(map)) => Some(map.clone().into_iter().collect()),
                _ => None,
            },
        };
        if update.is_empty() {
            return Err(MemoryError::InvalidInput("nothing to update".into()));
        }

        if self.manager.update_memory(id, &update).await? {
            Ok(format!("Memory updated (ID: {})", id))
        } else {
            Ok(format!("Memory not found (ID: {})", id))
        }
    }

    async fn remove(&self, call: &ToolCall) -> Result<String> {
        let id = required(call, "memory_id")?;
        if self.manager.remove_memory(id).await? {
            Ok(format!("Memory removed (ID: {})", id))
        } else {
            Ok(format!("Memory not found (ID: {})", id))
        }
    }

    async fn forget(&self, call: &ToolCall) -> Result<String> {
        let strategy: ForgetStrategy = match call.str_arg("strategy") {
            Some(s) => s.parse()?,
            None => ForgetStrategy::default(),
        };
        let threshold = f32_arg(call, "threshold").unwrap_or(0.1);
        let max_age_days = usize_arg(call, "max_age_days")
            .and_then(|d| u32::try_from(d).ok())
            .unwrap_or(30);

        let count = self.manager.forget_memories(strategy, threshold, max_age_days).await?;
        Ok(format!("Forgot {} memories (strategy: {})", count, strategy))
    }

    async fn consolidate(&self, call: &ToolCall) -> Result<String> {
        let from = kind_arg(call, "from_type")?.unwrap_or(MemoryKind::Working);
        let to = kind_arg(call, "to_type")?.unwrap_or(MemoryKind::Episodic);
        let threshold = f32_arg(call, "importance_threshold").unwrap_or(0.7);

        let count = self.manager.consolidate_memories(from, to, threshold).await?;
        Ok(format!("Consolidated {} memories from {} to {}", count, from, to))
    }
}

fn required<'a>(call: &'a ToolCall, key: &str) -> Result<&'a str> {
    call.str_arg(key)
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| MemoryError::InvalidInput(format!("'{}' is required", key)))
}

fn kind_arg(call: &ToolCall, key: &str) -> Result<Option<MemoryKind>> {
    call.str_arg(key)
        .filter(|s| !s.trim().is_empty())
        .map(str::parse)
        .transpose()
}

/// Numbers may arrive as JSON numbers or as strings
fn f32_arg(call: &ToolCall, key: &str) -> Option<f32> {
    match call.arguments.get(key)? {
        Value::Number(n) => n.as_f64().map(|v| v as f32),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn usize_arg(call: &ToolCall, key: &str) -> Option<usize> {
    match call.arguments.get(key)? {
        Value::Number(n) => n.as_u64().and_then(|v| usize::try_from(v).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[async_trait]
impl Tool for MemoryTool {
    fn schema(&self) -> ToolSchema {
        let kinds: Vec<Value> = MemoryKind::ALL.iter().map(|k| json!(k.as_str())).collect();
        ToolSchema {
            name: NAME.into(),
            description: "Store and recall memories across working, episodic, semantic and perceptual \
                          layers. Actions: add, search, summary, stats, update, remove, forget, \
                          consolidate, clear_all"
                .into(),
            parameters: vec![
                ParameterSchema::required("action", "string", "Operation to perform")
                    .with_enum(ACTIONS.iter().map(|a| json!(a)).collect()),
                ParameterSchema::optional("content", "string", "Memory content (add, update)"),
                ParameterSchema::optional("query", "string", "Search text (search)"),
                ParameterSchema::optional("memory_type", "string", "Memory layer")
                    .with_enum(kinds.clone()),
                ParameterSchema::optional("importance", "number", "Importance from 0.0 to 1.0"),
                ParameterSchema::optional("limit", "integer", "Maximum results").with_default(json!(5)),
                ParameterSchema::optional("memory_id", "string", "Target memory (update, remove)"),
                ParameterSchema::optional("strategy", "string", "Forget strategy").with_enum(vec![
                    json!("importance_based"),
                    json!("time_based"),
                    json!("capacity_based"),
                ]),
                ParameterSchema::optional("threshold", "number", "Importance cutoff for forgetting")
                    .with_default(json!(0.1)),
                ParameterSchema::optional("max_age_days", "integer", "Age cutoff for forgetting")
                    .with_default(json!(30)),
                ParameterSchema::optional("from_type", "string", "Source layer (consolidate)")
                    .with_enum(kinds.clone()),
                ParameterSchema::optional("to_type", "string", "Target layer (consolidate)")
                    .with_enum(kinds),
                ParameterSchema::optional("importance_threshold", "number", "Minimum importance to consolidate")
                    .with_default(json!(0.7)),
            ],
            category: Some("memory".into()),
            has_side_effects: true,
        }
    }

    async fn execute(&self, call: &ToolCall) -> AgentResult<ToolResult> {
        let action = call.str_arg("action").unwrap_or_default().trim().to_lowercase();
        debug!(action = %action, "Memory tool call");

        match self.dispatch(&action, call).await {
            Ok(output) => Ok(ToolResult::success(NAME, output)),
            Err(e) => Ok(ToolResult::failure(NAME, format!("Memory {} failed: {}", action, e))),
        }
    }
}
