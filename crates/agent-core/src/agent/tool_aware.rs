//! Chat agent with inline tool calls
//!
//! The model may embed `[TOOL_CALL:tool_name:parameters]` anywhere in its
//! reply. Each marker is executed, the results are sent back as a user
//! message, and the model is asked again, up to a fixed number of rounds.
//! In streaming mode the markers are cut out of the text before it reaches
//! the caller.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use super::{Agent, AgentCore, TextStream};
use crate::action::{parse_tool_markers, strip_tool_markers, MarkerCall, TOOL_CALL_MARKER};
use crate::error::Result;
use crate::message::Message;
use crate::params::{self, Arguments};
use crate::provider::LlmProvider;
use crate::tool::{ToolCall, ToolRegistry};

/// What happened during one tool call
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub agent_name: String,
    pub tool_name: String,
    pub raw_parameters: String,
    pub parsed_parameters: Arguments,
    pub result: String,
}

/// Callback notified after every tool call
pub type ToolCallListener = Arc<dyn Fn(&ToolCallRecord) + Send + Sync>;

pub struct ToolAwareAgent {
    core: AgentCore,
    tools: Arc<ToolRegistry>,
    max_tool_iterations: usize,
    listener: Option<ToolCallListener>,
}

impl ToolAwareAgent {
    pub fn new(name: impl Into<String>, provider: Arc<dyn LlmProvider>, tools: Arc<ToolRegistry>) -> Self {
        Self::from_core(AgentCore::new(name, provider), tools)
    }

    pub fn from_core(core: AgentCore, tools: Arc<ToolRegistry>) -> Self {
        Self {
            core,
            tools,
            max_tool_iterations: 3,
            listener: None,
        }
    }

    pub fn with_max_tool_iterations(mut self, max: usize) -> Self {
        self.max_tool_iterations = max;
        self
    }

    pub fn with_listener(mut self, listener: ToolCallListener) -> Self {
        self.listener = Some(listener);
        self
    }

    fn system_prompt(&self) -> String {
        let mut prompt = self.core.system_prompt().to_string();
        if self.tools.is_empty() {
            return prompt;
        }

        prompt.push_str("\n\n## Available tools\n");
        prompt.push_str(&self.tools.describe());
        prompt.push_str(
            "\n\n## Calling tools\n\
             When a tool would help, write a marker in your reply:\n\
             `[TOOL_CALL:tool_name:parameters]`\n\
             Parameters may be plain text, key=value pairs separated by commas, or a JSON object.\n\
             Examples:\n\
             - [TOOL_CALL:calculate:2 + 3 * 4]\n\
             - [TOOL_CALL:memory:action=search,query=user preferences]\n\
             Tool results will be sent back to you; then give your final answer.",
        );
        prompt
    }

    /// Execute one marker and notify the listener
    async fn call_tool(&self, tool_name: &str, raw: &str) -> String {
        let (parsed, result) = match self.tools.get(tool_name) {
            None => (
                Arguments::new(),
                format!("Error: tool '{}' not found", tool_name),
            ),
            Some(tool) => match params::prepare(raw, &tool.schema()) {
                Err(e) => (Arguments::new(), format!("Error: tool call failed: {}", e)),
                Ok(arguments) => {
                    let call = ToolCall::new(tool_name, arguments.clone()).with_generated_id();
                    let outcome = match tool.validate(&call) {
                        Ok(()) => tool.execute(&call).await,
                        Err(e) => Err(e),
                    };
                    let result = match outcome {
                        Ok(result) => format!("Tool {} result:\n{}", tool_name, result.to_observation()),
                        Err(e) => format!("Error: tool call failed: {}", e),
                    };
                    (arguments, result)
                }
            },
        };

        debug!(agent = %self.core.name(), tool = %tool_name, "Tool call finished");
        if let Some(listener) = &self.listener {
            let record = ToolCallRecord {
                agent_name: self.core.name().to_string(),
                tool_name: tool_name.to_string(),
                raw_parameters: raw.to_string(),
                parsed_parameters: parsed,
                result: result.clone(),
            };
            if catch_unwind(AssertUnwindSafe(|| listener(&record))).is_err() {
                error!(agent = %self.core.name(), tool = %tool_name, "Tool call listener panicked");
            }
        }

        result
    }
}

impl ToolAwareAgent {
    /// Stream the reply while markers are executed between rounds.
    ///
    /// Only the text around `[TOOL_CALL:...]` markers is yielded; a chunk
    /// ending in what could be the start of a marker is held back until the
    /// next chunk decides it. The final round's text is recorded as the turn.
    pub fn run_stream<'a>(&'a mut self, input: &'a str) -> TextStream<'a> {
        Box::pin(async_stream::try_stream! {
            let mut messages = self.core.chat_messages(&self.system_prompt(), input);
            let mut answer = None;

            for round in 0..self.max_tool_iterations {
                let mut upstream = self
                    .core
                    .provider()
                    .complete_stream(&messages, &self.core.options())
                    .await?;

                let mut splitter = MarkerSplitter::default();
                let mut text = String::new();
                while let Some(chunk) = upstream.next().await {
                    let chunk = chunk?;
                    if let Some(segment) = splitter.push(&chunk.delta) {
                        text.push_str(&segment);
                        yield segment;
                    }
                    if chunk.done {
                        break;
                    }
                }
                if let Some(segment) = splitter.finish() {
                    text.push_str(&segment);
                    yield segment;
                }

                if splitter.markers.is_empty() {
                    answer = Some(text);
                    break;
                }

                info!(agent = %self.core.name(), round, calls = splitter.markers.len(), "Executing streamed tool calls");
                messages.push(Message::assistant(text.trim()));

                let mut results = Vec::with_capacity(splitter.markers.len());
                for call in &splitter.markers {
                    results.push(self.call_tool(&call.tool_name, &call.parameters).await);
                }
                messages.push(tool_results_message(&results));
            }

            let answer = match answer {
                Some(answer) => answer,
                None => {
                    warn!(agent = %self.core.name(), "Tool budget spent, asking for a final answer");
                    let fallback = strip_tool_markers(&self.core.complete(&messages).await?);
                    yield fallback.clone();
                    fallback
                }
            };

            self.core.record_turn(input, &answer);
        })
    }
}

fn tool_results_message(results: &[String]) -> Message {
    Message::user(format!(
        "Tool results:\n{}\n\nPlease give a complete answer based on these results.",
        results.join("\n\n")
    ))
}

/// Separates streamed text from complete tool-call markers
#[derive(Debug, Default)]
struct MarkerSplitter {
    pending: String,
    markers: Vec<MarkerCall>,
}

impl MarkerSplitter {
    /// Add a chunk; returns the text that is now safe to show
    fn push(&mut self, chunk: &str) -> Option<String> {
        self.pending.push_str(chunk);
        self.drain(false)
    }

    /// Flush everything left, including an unterminated marker
    fn finish(&mut self) -> Option<String> {
        self.drain(true)
    }

    fn drain(&mut self, final_pass: bool) -> Option<String> {
        let mut text = String::new();
        loop {
            match self.pending.find(TOOL_CALL_MARKER) {
                Some(0) => {
                    let Some(call) = parse_tool_markers(&self.pending).into_iter().next() else {
                        break;
                    };
                    self.pending.drain(..call.original.len());
                    self.markers.push(call);
                }
                Some(start) => text.extend(self.pending.drain(..start)),
                None => {
                    let held = if final_pass { 0 } else { partial_marker_len(&self.pending) };
                    let cut = self.pending.len() - held;
                    text.extend(self.pending.drain(..cut));
                    break;
                }
            }
        }
        if final_pass {
            text.push_str(&std::mem::take(&mut self.pending));
        }
        (!text.is_empty()).then_some(text)
    }
}

/// Length of the longest suffix of `text` that opens a marker
fn partial_marker_len(text: &str) -> usize {
    (1..TOOL_CALL_MARKER.len())
        .rev()
        .find(|&n| text.ends_with(&TOOL_CALL_MARKER[..n]))
        .unwrap_or(0)
}

#[async_trait]
impl Agent for ToolAwareAgent {
    fn name(&self) -> &str {
        self.core.name()
    }

    async fn run(&mut self, input: &str) -> Result<String> {
        let mut messages = self.core.chat_messages(&self.system_prompt(), input);
        let mut answer = None;

        for round in 0..self.max_tool_iterations {
            let reply = self.core.complete(&messages).await?;
            let calls = parse_tool_markers(&reply);
            if calls.is_empty() {
                answer = Some(reply);
                break;
            }

            info!(agent = %self.core.name(), round, calls = calls.len(), "Executing tool calls");
            messages.push(Message::assistant(strip_tool_markers(&reply)));

            let mut results = Vec::with_capacity(calls.len());
            for call in &calls {
                results.push(self.call_tool(&call.tool_name, &call.parameters).await);
            }
            messages.push(tool_results_message(&results));
        }

        let answer = match answer {
            Some(answer) => answer,
            None => {
                warn!(agent = %self.core.name(), "Tool budget spent, asking for a final answer");
                strip_tool_markers(&self.core.complete(&messages).await?)
            }
        };

        self.core.record_turn(input, &answer);
        Ok(answer)
    }

    fn history(&self) -> &[Message] {
        self.core.history()
    }

    fn clear_history(&mut self) {
        self.core.clear_history();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtin::CalculatorTool;
    use crate::message::Role;
    use crate::testing::ScriptedProvider;
    use std::sync::Mutex;

    fn tools() -> Arc<ToolRegistry> {
        let mut registry = ToolRegistry::new();
        registry.register(CalculatorTool);
        Arc::new(registry)
    }

    #[tokio::test]
    async fn test_executes_markers_and_feeds_results_back() {
        let provider = Arc::new(ScriptedProvider::new([
            "Let me compute. [TOOL_CALL:calculate:expression=2 + 3 * 4]",
            "The result is 14.",
        ]));
        let records = Arc::new(Mutex::new(Vec::<ToolCallRecord>::new()));
        let sink = Arc::clone(&records);

        let mut agent = ToolAwareAgent::new("helper", provider.clone(), tools())
            .with_listener(Arc::new(move |record: &ToolCallRecord| sink.lock().unwrap().push(record.clone())));

        assert_eq!(agent.run("2 + 3 * 4?").await.unwrap(), "The result is 14.");

        let requests = provider.requests();
        assert!(requests[0][0].content.contains("[TOOL_CALL:tool_name:parameters]"));
        assert!(requests[0][0].content.contains("- calculate: "));
        let second = &requests[1];
        assert_eq!(second[second.len() - 2].role, Role::Assistant);
        assert_eq!(second[second.len() - 2].content, "Let me compute.");
        assert!(second.last().unwrap().content.contains("Tool calculate result:\n14"));

        let records = records.lock().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].agent_name, "helper");
        assert_eq!(records[0].raw_parameters, "expression=2 + 3 * 4");
        assert_eq!(records[0].parsed_parameters["expression"], "2 + 3 * 4");
    }

    #[tokio::test]
    async fn test_budget_spent_falls_back_to_plain_answer() {
        let provider = Arc::new(ScriptedProvider::new([
            "[TOOL_CALL:calculate:1+1]",
            "[TOOL_CALL:calculate:2+2]",
            "Final: 4 [TOOL_CALL:calculate:3+3]",
        ]));
        let mut agent = ToolAwareAgent::new("helper", provider.clone(), tools()).with_max_tool_iterations(2);

        assert_eq!(agent.run("q").await.unwrap(), "Final: 4");
        assert_eq!(provider.calls(), 3);
    }

    fn broken_listener(_: &ToolCallRecord) {
        panic!("listener bug");
    }

    #[tokio::test]
    async fn test_unknown_tool_and_panicking_listener() {
        let provider = Arc::new(ScriptedProvider::new(["[TOOL_CALL:weather:Paris]", "No weather tool."]));
        let mut agent = ToolAwareAgent::new("helper", provider.clone(), tools())
            .with_listener(Arc::new(broken_listener));

        assert_eq!(agent.run("weather?").await.unwrap(), "No weather tool.");
        let last = provider.requests()[1].last().unwrap().content.clone();
        assert!(last.contains("Error: tool 'weather' not found"));
    }

    #[test]
    fn test_splitter_holds_back_partial_markers() {
        let mut splitter = MarkerSplitter::default();
        assert_eq!(splitter.push("answer [TOO").as_deref(), Some("answer "));
        assert_eq!(splitter.push("L_CALL:calculate:1+1").as_deref(), None);
        assert_eq!(splitter.push("] done").as_deref(), Some(" done"));
        assert_eq!(splitter.markers.len(), 1);
        assert_eq!(splitter.markers[0].parameters, "1+1");

        assert_eq!(splitter.push("price [").as_deref(), Some("price "));
        assert_eq!(splitter.push("5]").as_deref(), Some("[5]"));

        assert_eq!(splitter.push("tail [TOOL_CALL:calc").as_deref(), Some("tail "));
        assert_eq!(splitter.finish().as_deref(), Some("[TOOL_CALL:calc"));
        assert_eq!(splitter.markers.len(), 1);
    }

    #[test]
    fn test_partial_marker_len() {
        assert_eq!(partial_marker_len("abc ["), 1);
        assert_eq!(partial_marker_len("abc [TOOL_CA"), 8);
        assert_eq!(partial_marker_len("abc"), 0);
        assert_eq!(partial_marker_len("naïve"), 0);
    }

    #[tokio::test]
    async fn test_stream_hides_markers_and_runs_tools() {
        use futures::TryStreamExt;

        let provider = Arc::new(ScriptedProvider::new([
            "Let me compute. [TOOL_CALL:calculate:expression=2 + 3 * 4] one moment",
            "The result is 14.",
        ]));
        let records = Arc::new(Mutex::new(Vec::<ToolCallRecord>::new()));
        let sink = Arc::clone(&records);
        let mut agent = ToolAwareAgent::new("helper", provider.clone(), tools())
            .with_listener(Arc::new(move |record: &ToolCallRecord| sink.lock().unwrap().push(record.clone())));

        let chunks: Vec<String> = agent.run_stream("2 + 3 * 4?").try_collect().await.unwrap();
        assert!(chunks.iter().all(|chunk| !chunk.contains("TOOL_CALL")));
        assert_eq!(chunks.concat(), "Let me compute.  one momentThe result is 14.");

        assert_eq!(records.lock().unwrap().len(), 1);
        let second = &provider.requests()[1];
        assert_eq!(second[second.len() - 2].content, "Let me compute.  one moment");
        assert!(second.last().unwrap().content.contains("Tool calculate result:\n14"));

        assert_eq!(agent.history().len(), 2);
        assert_eq!(agent.history()[1].content, "The result is 14.");
    }

    #[tokio::test]
    async fn test_stream_budget_spent_yields_fallback() {
        use futures::TryStreamExt;

        let provider = Arc::new(ScriptedProvider::new([
            "[TOOL_CALL:calculate:1+1]",
            "Final: 2 [TOOL_CALL:calculate:3+3]",
        ]));
        let mut agent = ToolAwareAgent::new("helper", provider.clone(), tools()).with_max_tool_iterations(1);

        let chunks: Vec<String> = agent.run_stream("q").try_collect().await.unwrap();
        assert_eq!(chunks, vec!["Final: 2"]);
        assert_eq!(provider.calls(), 2);
        assert_eq!(agent.history()[1].content, "Final: 2");
    }

    #[tokio::test]
    async fn test_without_tools_prompt_is_plain() {
        let provider = Arc::new(ScriptedProvider::new(["hello"]));
        let mut agent = ToolAwareAgent::new("helper", provider.clone(), Arc::new(ToolRegistry::new()));

        agent.run("hi").await.unwrap();
        assert!(!provider.requests()[0][0].content.contains("TOOL_CALL"));
    }
}
