//! ReAct loop
//!
//! The agent observes, thinks, acts (via tools), and repeats until the model
//! answers with `Finish[...]` or the step budget runs out. The scratchpad of
//! `Action:` / `Observation:` lines is re-sent with every step.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::{Agent, AgentCore};
use crate::action::{parse_react_output, ReactStep};
use crate::error::Result;
use crate::message::Message;
use crate::provider::LlmProvider;
use crate::tool::ToolRegistry;

/// Prompt template; `{tools}`, `{question}` and `{history}` are substituted
pub const DEFAULT_REACT_PROMPT: &str = r#"You are an AI assistant that can reason and act. Analyse the problem, call the available tools to gather information, and then give an accurate final answer.

## Available tools
{tools}

## Response format
Every reply must contain exactly one thought and one action:

**Thought:** your analysis of what to do next

**Action:** one of
- a tool call: tool_name[input]
- the final answer: Finish[your answer]

## Examples
- To evaluate 2+2 with the calculate tool, write: calculate[2+2]
- When you are done, write: Finish[This is my final answer]

## Rules
1. Always include both "Thought:" and "Action:".
2. Only call tools listed above.
3. If a tool result is incomplete, keep using tools.
4. Use Finish only when you have enough information to answer.

## Task
**Question:** {question}

## History
{history}

Continue with your next thought and action:"#;

/// Reply when the step budget is exhausted
pub const GIVE_UP_MESSAGE: &str = "Sorry, I could not complete this task within the step limit.";

pub struct ReActAgent {
    core: AgentCore,
    tools: Arc<ToolRegistry>,
    max_steps: usize,
    prompt_template: String,
    scratchpad: Vec<String>,
}

impl ReActAgent {
    pub fn new(name: impl Into<String>, provider: Arc<dyn LlmProvider>, tools: Arc<ToolRegistry>) -> Self {
        Self::from_core(AgentCore::new(name, provider), tools)
    }

    pub fn from_core(core: AgentCore, tools: Arc<ToolRegistry>) -> Self {
        Self {
            core,
            tools,
            max_steps: 5,
            prompt_template: DEFAULT_REACT_PROMPT.into(),
            scratchpad: Vec::new(),
        }
    }

    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps.max(1);
        self
    }

    /// Replace the prompt template
    pub fn with_prompt_template(mut self, template: impl Into<String>) -> Self {
        self.prompt_template = template.into();
        self
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    /// `Action:` / `Observation:` lines of the last run
    pub fn scratchpad(&self) -> &[String] {
        &self.scratchpad
    }

    fn build_prompt(&self, question: &str) -> String {
        self.prompt_template
            .replace("{tools}", &self.tools.describe())
            .replace("{question}", question)
            .replace("{history}", &self.scratchpad.join("\n"))
    }

    fn finish(&mut self, input: &str, answer: String) -> String {
        self.core.record_turn(input, &answer);
        answer
    }
}

#[async_trait]
impl Agent for ReActAgent {
    fn name(&self) -> &str {
        self.core.name()
    }

    async fn run(&mut self, input: &str) -> Result<String> {
        self.scratchpad.clear();
        info!(agent = %self.core.name(), question = %input, "ReAct run started");

        for step in 1..=self.max_steps {
            let prompt = self.build_prompt(input);
            let reply = self.core.prompt(prompt).await?;

            if reply.trim().is_empty() {
                warn!(agent = %self.core.name(), step, "Empty completion, stopping");
                break;
            }

            let (thought, action) = parse_react_output(&reply);
            if let Some(thought) = &thought {
                debug!(step, thought = %thought, "Thought");
            }

            let Some(action) = action else {
                warn!(agent = %self.core.name(), step, "No action in completion, stopping");
                break;
            };

            match ReactStep::from_action(&action) {
                ReactStep::Finish(answer) => {
                    info!(agent = %self.core.name(), step, "ReAct run finished");
                    return Ok(self.finish(input, answer));
                }
                ReactStep::Call(call) => {
                    debug!(step, tool = %call.name, input = %call.argument, "Action");
                    let observation = self.tools.execute_text(&call.name, &call.argument).await;
                    debug!(step, observation = %observation, "Observation");
                    self.scratchpad.push(format!("Action: {}", action));
                    self.scratchpad.push(format!("Observation: {}", observation));
                }
                ReactStep::Invalid(text) => {
                    debug!(step, action = %text, "Unparseable action");
                    self.scratchpad.push(format!(
                        "Observation: Invalid action format '{}'. Use tool_name[input] or Finish[answer].",
                        text
                    ));
                }
            }
        }

        warn!(agent = %self.core.name(), max_steps = self.max_steps, "ReAct run gave up");
        Ok(self.finish(input, GIVE_UP_MESSAGE.to_string()))
    }

    fn history(&self) -> &[Message] {
        self.core.history()
    }

    fn clear_history(&mut self) {
        self.core.clear_history();
        self.scratchpad.clear();
    }
}
