//! Retrieval-Augmented Generation Tool
//!
//! Documents are split into chunks, stored as semantic memories tagged with
//! their source, and retrieved as context for answering questions.

use std::sync::Arc;

use agent_core::error::Result as AgentResult;
use agent_core::message::Message;
use agent_core::provider::{GenerationOptions, LlmProvider};
use agent_core::tool::{ParameterSchema, Tool, ToolCall, ToolResult, ToolSchema};
use async_trait::async_trait;
use serde_json::{json, Value};
use text_splitter::{MarkdownSplitter, TextSplitter};
use tracing::{debug, info};

use crate::error::{MemoryError, Result};
use crate::manager::{MemoryManager, NewMemory};
use crate::model::{MemoryItem, MemoryKind};

const NAME: &str = "rag";

pub const DEFAULT_CHUNK_SIZE: usize = 800;

pub const NO_CONTEXT_REPLY: &str =
    "I could not find any relevant information in the knowledge base to answer this question.";

const ANSWER_PROMPT: &str = "Answer the question using only the context below. \
     If the context is not sufficient, say so. Cite context entries by their number.";

pub struct RagTool {
    manager: Arc<MemoryManager>,
    provider: Arc<dyn LlmProvider>,
    options: GenerationOptions,
    chunk_size: usize,
}

impl RagTool {
    pub fn new(manager: Arc<MemoryManager>, provider: Arc<dyn LlmProvider>) -> Self {
        Self {
            manager,
            provider,
            options: GenerationOptions::default(),
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn with_options(mut self, options: GenerationOptions) -> Self {
        self.options = options;
        self
    }

    /// Chunk boundaries follow headings and paragraphs for markdown input
    pub fn chunk(&self, text: &str, markdown: bool) -> Vec<String> {
        let chunks: Vec<&str> = if markdown {
            MarkdownSplitter::new(self.chunk_size).chunks(text).collect()
        } else {
            TextSplitter::new(self.chunk_size).chunks(text).collect()
        };
        chunks
            .into_iter()
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(str::to_string)
            .collect()
    }

    /// Store a document, returning the number of chunks written
    pub async fn add_text(&self, text: &str, source: &str, markdown: bool) -> Result<usize> {
        if text.trim().is_empty() {
            return Err(MemoryError::InvalidInput("text must not be empty".into()));
        }

        let chunks = self.chunk(text, markdown);
        let total = chunks.len();
        for (index, chunk) in chunks.into_iter().enumerate() {
            let memory = NewMemory::new(chunk)
                .of_kind(MemoryKind::Semantic)
                .importance(0.5)
                .meta("source", json!(source))
                .meta("chunk_index", json!(index))
                .meta("chunk_count", json!(total));
            self.manager.add_memory(memory).await?;
        }

        info!(source, chunks = total, "Indexed document");
        Ok(total)
    }

    pub async fn search(&self, query: &str, limit: usize) -> Result<Vec<MemoryItem>> {
        self.manager
            .retrieve_memories(query, Some(&[MemoryKind::Semantic]), limit, 0.0)
            .await
    }

    /// Answer a question from retrieved context
    pub async fn ask(&self, question: &str, limit: usize) -> AgentResult<String> {
        let hits = self.search(question, limit).await?;
        if hits.is_empty() {
            debug!(question, "No context for question");
            return Ok(NO_CONTEXT_REPLY.to_string());
        }

        let context = format_context(&hits);
        let messages = vec![
            Message::system(ANSWER_PROMPT),
            Message::user(format!("Context:\n{}\n\nQuestion: {}", context, question)),
        ];
        let completion = self.provider.complete(&messages, &self.options).await?;
        Ok(completion.content.trim().to_string())
    }
}

fn source_of(item: &MemoryItem) -> &str {
    item.metadata
        .get("source")
        .and_then(Value::as_str)
        .unwrap_or("unknown")
}

pub(crate) fn format_context(items: &[MemoryItem]) -> String {
    items
        .iter()
        .enumerate()
        .map(|(i, m)| format!("[{}] ({}) {}", i + 1, source_of(m), m.content))
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn limit_arg(call: &ToolCall) -> usize {
    match call.arguments.get("limit") {
        Some(Value::Number(n)) => n.as_u64().and_then(|v| usize::try_from(v).ok()).unwrap_or(5),
        Some(Value::String(s)) => s.trim().parse().unwrap_or(5),
        _ => 5,
    }
}

#[async_trait]
impl Tool for RagTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: NAME.into(),
            description: "Knowledge base. Actions: add_text (index a document), search (find \
                          passages), ask (answer a question from indexed documents)"
                .into(),
            parameters: vec![
                ParameterSchema::required("action", "string", "Operation to perform")
                    .with_enum(vec![json!("add_text"), json!("search"), json!("ask")]),
                ParameterSchema::optional("text", "string", "Document text (add_text)"),
                ParameterSchema::optional("source", "string", "Document name (add_text)")
                    .with_default(json!("user_input")),
                ParameterSchema::optional("markdown", "boolean", "Split on markdown structure")
                    .with_default(json!(false)),
                ParameterSchema::optional("query", "string", "Search text or question (search, ask)"),
                ParameterSchema::optional("limit", "integer", "Maximum passages").with_default(json!(5)),
            ],
            category: Some("memory".into()),
            has_side_effects: true,
        }
    }

    async fn execute(&self, call: &ToolCall) -> AgentResult<ToolResult> {
        let action = call.str_arg("action").unwrap_or_default().trim().to_lowercase();
        let query = call
            .str_arg("query")
            .or_else(|| call.str_arg("question"))
            .unwrap_or_default();
        let limit = limit_arg(call);

        let outcome: AgentResult<String> = match action.as_str() {
            "add_text" => {
                let text = call.str_arg("text").unwrap_or_default();
                let source = call.str_arg("source").unwrap_or("user_input");
                let markdown = call
                    .arguments
                    .get("markdown")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                self.add_text(text, source, markdown)
                    .await
                    .map(|n| format!("Indexed '{}' as {} chunks", source, n))
                    .map_err(Into::into)
            }
            "search" => self
                .search(query, limit)
                .await
                .map(|hits| {
                    if hits.is_empty() {
                        format!("No passages found for '{}'", query)
                    } else {
                        format_context(&hits)
                    }
                })
                .map_err(Into::into),
            "ask" if query.trim().is_empty() => Ok("Please provide a question".into()),
            "ask" => self.ask(query, limit).await,
            other => Ok(format!("Unsupported action '{}'; expected add_text, search or ask", other)),
        };

        match outcome {
            Ok(output) => Ok(ToolResult::success(NAME, output)),
            Err(e) => Ok(ToolResult::failure(NAME, format!("RAG {} failed: {}", action, e))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::MemoryConfig;
    use agent_core::provider::{Completion, CompletionStream, ModelInfo, ProviderInfo};
    use agent_core::AgentError;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Echoes a fixed answer and records the prompts it was given
    struct FixedProvider {
        answer: String,
        prompts: Mutex<Vec<String>>,
    }

    impl FixedProvider {
        fn new(answer: &str) -> Arc<Self> {
            Arc::new(Self {
                answer: answer.into(),
                prompts: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl LlmProvider for FixedProvider {
        async fn info(&self) -> AgentResult<ProviderInfo> {
            Ok(ProviderInfo {
                name: "fixed".into(),
                base_url: None,
                default_model: "fixed".into(),
                supports_streaming: false,
            })
        }

        async fn health_check(&self) -> AgentResult<bool> {
            Ok(true)
        }

        async fn complete(&self, messages: &[Message], _: &GenerationOptions) -> AgentResult<Completion> {
            if let Some(last) = messages.last() {
                self.prompts.lock().unwrap().push(last.content.clone());
            }
            Ok(Completion {
                content: self.answer.clone(),
                model: "fixed".into(),
                usage: None,
                finish_reason: None,
            })
        }

        async fn complete_stream(&self, _: &[Message], _: &GenerationOptions) -> AgentResult<CompletionStream> {
            Err(AgentError::Provider("streaming unsupported".into()))
        }

        async fn list_models(&self) -> AgentResult<Vec<ModelInfo>> {
            Ok(Vec::new())
        }
    }

    fn rag(provider: Arc<FixedProvider>) -> RagTool {
        let manager = Arc::new(MemoryManager::new(MemoryConfig::default(), "tester"));
        RagTool::new(manager, provider).with_chunk_size(60)
    }

    fn call(args: Value) -> ToolCall {
        let arguments: HashMap<String, Value> = match args {
            Value::Object(map) => map.into_iter().collect(),
            _ => HashMap::new(),
        };
        ToolCall::new(NAME, arguments)
    }

    const DOC: &str = "Ferris is the unofficial mascot of Rust.\n\n\
                       Cargo is the Rust package manager and build tool.\n\n\
                       Clippy is a collection of lints for Rust code.";

    #[test]
    fn test_chunks_respect_size() {
        let tool = rag(FixedProvider::new(""));
        let chunks = tool.chunk(DOC, false);
        assert!(chunks.len() >= 3);
        assert!(chunks.iter().all(|c| c.chars().count() <= 60));

        let md = tool.chunk("# Title\n\nIntro text.\n\n## Section\n\nBody text here.", true);
        assert!(!md.is_empty());
        assert!(md.iter().all(|c| c.chars().count() <= 60));
    }

    #[tokio::test]
    async fn test_add_text_tags_source() {
        let tool = rag(FixedProvider::new(""));
        let count = tool.add_text(DOC, "rust-notes", false).await.unwrap();
        assert!(count >= 3);

        let hits = tool.search("cargo", 5).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(source_of(&hits[0]), "rust-notes");
        assert_eq!(hits[0].memory_type, MemoryKind::Semantic);

        assert!(tool.add_text("   ", "empty", false).await.is_err());
    }

    #[tokio::test]
    async fn test_ask_uses_retrieved_context() {
        let provider = FixedProvider::new("Cargo builds Rust projects.");
        let tool = rag(provider.clone());
        tool.add_text(DOC, "rust-notes", false).await.unwrap();

        let answer = tool.ask("cargo", 3).await.unwrap();
        assert_eq!(answer, "Cargo builds Rust projects.");

        let prompts = provider.prompts.lock().unwrap().clone();
        assert_eq!(prompts.len(), 1);
        assert!(prompts[0].contains("[1] (rust-notes) Cargo is the Rust package manager"));
        assert!(prompts[0].ends_with("Question: cargo"));
    }

    #[tokio::test]
    async fn test_ask_without_context_skips_llm() {
        let provider = FixedProvider::new("should not be used");
        let tool = rag(provider.clone());

        let answer = tool.ask("quantum chromodynamics", 3).await.unwrap();
        assert_eq!(answer, NO_CONTEXT_REPLY);
        assert!(provider.prompts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_tool_actions() {
        let tool = rag(FixedProvider::new("answer"));

        let added = tool
            .execute(&call(json!({"action": "add_text", "text": DOC, "source": "notes"})))
            .await
            .unwrap();
        assert!(added.success);
        assert!(added.output.starts_with("Indexed 'notes' as"));

        let search = tool
            .execute(&call(json!({"action": "search", "query": "clippy"})))
            .await
            .unwrap();
        assert!(search.output.contains("Clippy is a collection"));

        let ask = tool
            .execute(&call(json!({"action": "ask", "query": "clippy"})))
            .await
            .unwrap();
        assert_eq!(ask.output, "answer");

        let empty = tool
            .execute(&call(json!({"action": "add_text", "text": ""})))
            .await
            .unwrap();
        assert!(!empty.success);
    }
}
