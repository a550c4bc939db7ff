//! Context Builder
//!
//! Assembles the prompt context for one agent turn in four passes:
//!
//! 1. gather candidate packets from system instructions, important memories,
//!    related memories, the knowledge base and recent conversation
//! 2. select packets by relevance and recency inside a token budget, with
//!    maximal marginal relevance keeping near-duplicates out
//! 3. lay the selection out in labelled sections
//! 4. cut trailing lines when the result still exceeds the budget
//!
//! Sources that fail are logged and skipped; building never fails.

use std::collections::HashSet;
use std::sync::Arc;

use agent_core::message::Message;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::manager::MemoryManager;
use crate::model::{MemoryItem, MemoryKind, Metadata};
use crate::rag::{format_context, RagTool};

/// Share of the packet score given to relevance; recency gets the rest
const RELEVANCE_WEIGHT: f32 = 0.7;

/// Recency decays to 1/e after this many seconds
const RECENCY_TAU_SECS: f32 = 3600.0;

/// Memories at or above this importance count as task state
const TASK_STATE_MIN_IMPORTANCE: f32 = 0.7;

const OUTPUT_SECTION: &str = "[Output]\n\
     Answer in this format:\n\
     1. Conclusion (short and direct)\n\
     2. Supporting evidence and its source\n\
     3. Risks and assumptions, if any\n\
     4. Suggested next steps, if applicable";

/// Where a packet came from; decides its section
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PacketKind {
    /// Always kept while it fits, regardless of score
    Instructions,
    TaskState,
    RelatedMemory,
    KnowledgeBase,
    ToolResult,
    History,
}

impl PacketKind {
    fn is_evidence(self) -> bool {
        matches!(
            self,
            PacketKind::RelatedMemory | PacketKind::KnowledgeBase | PacketKind::ToolResult
        )
    }
}

/// One candidate piece of context
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ContextPacket {
    pub content: String,
    pub kind: PacketKind,
    pub timestamp: DateTime<Utc>,
    pub token_count: usize,
    /// Share of query terms found in the content, set during selection
    pub relevance_score: f32,
    #[serde(default)]
    pub metadata: Metadata,
}

impl ContextPacket {
    pub fn new(kind: PacketKind, content: impl Into<String>) -> Self {
        let content = content.into();
        Self {
            token_count: count_tokens(&content),
            content,
            kind,
            timestamp: Utc::now(),
            relevance_score: 0.0,
            metadata: Metadata::new(),
        }
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Rough token count at four characters per token
pub fn count_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ContextConfig {
    /// Context window to plan for
    pub max_tokens: usize,
    /// Share of `max_tokens` left for the reply
    pub reserve_ratio: f32,
    /// Packets below this relevance are dropped (instructions excepted)
    pub min_relevance: f32,
    pub enable_mmr: bool,
    /// 1.0 ranks purely by score, 0.0 purely by novelty
    pub mmr_lambda: f32,
    pub enable_compression: bool,
    /// Most recent messages included from the conversation
    pub history_window: usize,
    /// Hits requested from each memory or knowledge-base search
    pub retrieval_limit: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_tokens: 8000,
            reserve_ratio: 0.15,
            min_relevance: 0.0,
            enable_mmr: true,
            mmr_lambda: 0.7,
            enable_compression: true,
            history_window: 10,
            retrieval_limit: 5,
        }
    }
}

impl ContextConfig {
    /// Budget left after the reply reserve
    pub fn available_tokens(&self) -> usize {
        let share = 1.0 - f64::from(self.reserve_ratio.clamp(0.0, 1.0));
        (self.max_tokens as f64 * share) as usize
    }
}

#[derive(Clone, Default)]
pub struct ContextBuilder {
    memory: Option<Arc<MemoryManager>>,
    rag: Option<Arc<RagTool>>,
    config: ContextConfig,
}

impl ContextBuilder {
    pub fn new(config: ContextConfig) -> Self {
        Self {
            memory: None,
            rag: None,
            config,
        }
    }

    pub fn with_memory(mut self, memory: Arc<MemoryManager>) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn with_rag(mut self, rag: Arc<RagTool>) -> Self {
        self.rag = Some(rag);
        self
    }

    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    /// Build the structured context for `user_query`
    pub async fn build(
        &self,
        user_query: &str,
        history: &[Message],
        system_instructions: Option<&str>,
        additional: Vec<ContextPacket>,
    ) -> String {
        let packets = self.gather(user_query, history, system_instructions, additional).await;
        let gathered = packets.len();
        let selected = self.select(packets, user_query, Utc::now());
        debug!(gathered, selected = selected.len(), "Context packets selected");
        self.compress(structure(&selected, user_query))
    }

    async fn gather(
        &self,
        user_query: &str,
        history: &[Message],
        system_instructions: Option<&str>,
        additional: Vec<ContextPacket>,
    ) -> Vec<ContextPacket> {
        let mut packets = Vec::new();
        let limit = self.config.retrieval_limit;

        if let Some(instructions) = system_instructions.filter(|s| !s.trim().is_empty()) {
            packets.push(ContextPacket::new(PacketKind::Instructions, instructions));
        }

        if let Some(memory) = &self.memory {
            match memory
                .retrieve_memories("", None, limit, TASK_STATE_MIN_IMPORTANCE)
                .await
            {
                Ok(items) => packets.extend(memory_packet(PacketKind::TaskState, &items)),
                Err(e) => warn!(error = %e, "Task state retrieval failed"),
            }

            let related = [MemoryKind::Semantic, MemoryKind::Episodic];
            match memory.retrieve_memories(user_query, Some(&related), limit, 0.0).await {
                Ok(items) => packets.extend(memory_packet(PacketKind::RelatedMemory, &items)),
                Err(e) => warn!(error = %e, "Related memory retrieval failed"),
            }
        }

        if let Some(rag) = &self.rag {
            match rag.search(user_query, limit).await {
                Ok(hits) if !hits.is_empty() => packets.push(
                    ContextPacket::new(PacketKind::KnowledgeBase, format_context(&hits))
                        .with_timestamp(newest(&hits)),
                ),
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Knowledge base retrieval failed"),
            }
        }

        let recent = &history[history.len().saturating_sub(self.config.history_window)..];
        if let Some(last) = recent.last() {
            let text = recent
                .iter()
                .map(|m| format!("[{}] {}", m.role, m.content))
                .collect::<Vec<_>>()
                .join("\n");
            packets.push(ContextPacket::new(PacketKind::History, text).with_timestamp(last.timestamp));
        }

        packets.extend(additional);
        packets
    }

    /// Instructions first, then the best-scoring packets that fit the budget
    fn select(&self, packets: Vec<ContextPacket>, user_query: &str, now: DateTime<Utc>) -> Vec<ContextPacket> {
        let budget = self.config.available_tokens();
        let query = terms(user_query);
        let mut used = 0;
        let mut selected = Vec::new();
        let mut candidates = Vec::new();

        for mut packet in packets {
            let words = terms(&packet.content);
            packet.relevance_score = overlap(&query, &words);

            if packet.kind == PacketKind::Instructions {
                if used + packet.token_count <= budget {
                    used += packet.token_count;
                    selected.push(packet);
                }
                continue;
            }
            if packet.relevance_score < self.config.min_relevance {
                continue;
            }

            let score = RELEVANCE_WEIGHT * packet.relevance_score
                + (1.0 - RELEVANCE_WEIGHT) * recency(packet.timestamp, now);
            candidates.push((score, packet, words));
        }
        candidates.sort_by(|a, b| b.0.total_cmp(&a.0));

        let lambda = self.config.mmr_lambda.clamp(0.0, 1.0);
        let mut chosen: Vec<HashSet<String>> = Vec::new();
        while !candidates.is_empty() {
            let index = if self.config.enable_mmr {
                mmr_pick(&candidates, &chosen, lambda)
            } else {
                0
            };
            let (_, packet, words) = candidates.remove(index);
            if used + packet.token_count > budget {
                continue;
            }
            used += packet.token_count;
            chosen.push(words);
            selected.push(packet);
        }

        selected
    }

    /// Keep whole lines from the top while they fit the budget
    fn compress(&self, context: String) -> String {
        let budget = self.config.available_tokens();
        let total = count_tokens(&context);
        if !self.config.enable_compression || total <= budget {
            return context;
        }

        warn!(tokens = total, budget, "Context over budget, truncating");
        let mut used = 0;
        let mut kept = Vec::new();
        for line in context.lines() {
            let cost = count_tokens(line);
            if used + cost > budget {
                break;
            }
            used += cost;
            kept.push(line);
        }
        kept.join("\n")
    }
}

/// Index of the candidate with the best score after subtracting its
/// similarity to what is already chosen; the first one wins ties
fn mmr_pick(candidates: &[(f32, ContextPacket, HashSet<String>)], chosen: &[HashSet<String>], lambda: f32) -> usize {
    candidates
        .iter()
        .enumerate()
        .map(|(i, (score, _, words))| {
            let redundancy = chosen
                .iter()
                .map(|other| jaccard(words, other))
                .fold(0.0, f32::max);
            (i, lambda * score - (1.0 - lambda) * redundancy)
        })
        .min_by(|a, b| b.1.total_cmp(&a.1))
        .map_or(0, |(i, _)| i)
}

fn memory_packet(kind: PacketKind, items: &[MemoryItem]) -> Option<ContextPacket> {
    if items.is_empty() {
        return None;
    }
    let text = items
        .iter()
        .map(|m| format!("- [{}] {} (importance: {:.2})", m.memory_type.label(), m.content, m.importance))
        .collect::<Vec<_>>()
        .join("\n");
    Some(ContextPacket::new(kind, text).with_timestamp(newest(items)))
}

fn newest(items: &[MemoryItem]) -> DateTime<Utc> {
    items.iter().map(|m| m.timestamp).max().unwrap_or_else(Utc::now)
}

fn structure(selected: &[ContextPacket], user_query: &str) -> String {
    let joined = |keep: fn(PacketKind) -> bool, separator: &str| {
        selected
            .iter()
            .filter(|p| keep(p.kind))
            .map(|p| p.content.as_str())
            .collect::<Vec<_>>()
            .join(separator)
    };

    let mut sections = Vec::new();

    let instructions = joined(|k| k == PacketKind::Instructions, "\n");
    if !instructions.is_empty() {
        sections.push(format!("[Role & Policies]\n{}", instructions));
    }

    sections.push(format!("[Task]\nUser question: {}", user_query));

    let state = joined(|k| k == PacketKind::TaskState, "\n");
    if !state.is_empty() {
        sections.push(format!("[State]\nKey progress and open issues:\n{}", state));
    }

    let evidence = joined(PacketKind::is_evidence, "\n\n");
    if !evidence.is_empty() {
        sections.push(format!("[Evidence]\nFacts and references:\n{}", evidence));
    }

    let history = joined(|k| k == PacketKind::History, "\n");
    if !history.is_empty() {
        sections.push(format!("[Context]\nConversation history:\n{}", history));
    }

    sections.push(OUTPUT_SECTION.to_string());
    sections.join("\n\n")
}

fn terms(text: &str) -> HashSet<String> {
    text.split_whitespace()
        .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()).to_lowercase())
        .filter(|w| !w.is_empty())
        .collect()
}

/// Share of `query` terms present in `content`
fn overlap(query: &HashSet<String>, content: &HashSet<String>) -> f32 {
    if query.is_empty() {
        return 0.0;
    }
    query.intersection(content).count() as f32 / query.len() as f32
}

fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f32 {
    let union = a.union(b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(b).count() as f32 / union as f32
}

fn recency(timestamp: DateTime<Utc>, now: DateTime<Utc>) -> f32 {
    let age = (now - timestamp).num_seconds().max(0) as f32;
    (-age / RECENCY_TAU_SECS).exp()
}
