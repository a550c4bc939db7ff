//! Agents
//!
//! Every agent wraps an [`AgentCore`] (provider, prompt, settings, history)
//! and implements one control loop on top of it:
//!
//! | kind         | loop                                                  |
//! |--------------|-------------------------------------------------------|
//! | `simple`     | one completion per turn, optional streaming           |
//! | `react`      | Thought / Action / Observation until `Finish[...]`    |
//! | `reflection` | draft, critique, refine                               |
//! | `plan_solve` | plan a list of steps, then answer them one by one     |
//! | `tool_aware` | chat with inline `[TOOL_CALL:name:params]` markers    |

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::AgentSettings;
use crate::error::{AgentError, Result};
use crate::message::{Conversation, Message};
use crate::provider::{GenerationOptions, LlmProvider};
use crate::tool::ToolRegistry;

mod plan_solve;
mod react;
mod reflection;
mod simple;
mod tool_aware;

pub use plan_solve::{Executor, PlanAndSolveAgent, Planner, DEFAULT_EXECUTOR_PROMPT, DEFAULT_PLANNER_PROMPT};
pub use react::{ReActAgent, DEFAULT_REACT_PROMPT};
pub use reflection::{
    ReflectionAgent, ReflectionPrompts, Trajectory, TrajectoryEntry, TrajectoryKind,
};
pub use simple::{SimpleAgent, TextStream};
pub use tool_aware::{ToolAwareAgent, ToolCallListener, ToolCallRecord};

/// System prompt used when none is supplied
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful AI assistant. Answer accurately and concisely.";

/// Common interface for all agents
#[async_trait]
pub trait Agent: Send + Sync {
    /// Agent name, used in logs and tool-call records
    fn name(&self) -> &str;

    /// Handle one user input
    async fn run(&mut self, input: &str) -> Result<String>;

    /// Completed turns
    fn history(&self) -> &[Message];

    /// Forget completed turns
    fn clear_history(&mut self);

    /// Like [`Agent::run`], but failures come back as a readable reply
    async fn respond(&mut self, input: &str) -> String {
        match self.run(input).await {
            Ok(reply) => reply,
            Err(e) => {
                tracing::error!(agent = %self.name(), error = %e, "Agent run failed");
                e.user_message()
            }
        }
    }
}

/// State shared by every agent
pub struct AgentCore {
    name: String,
    provider: Arc<dyn LlmProvider>,
    system_prompt: String,
    settings: AgentSettings,
    model: Option<String>,
    history: Conversation,
}

impl AgentCore {
    pub fn new(name: impl Into<String>, provider: Arc<dyn LlmProvider>) -> Self {
        let settings = AgentSettings::default();
        Self {
            name: name.into(),
            provider,
            system_prompt: DEFAULT_SYSTEM_PROMPT.into(),
            history: Conversation::with_limit(settings.max_history_length),
            settings,
            model: None,
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    /// Apply settings; resizes the history limit
    pub fn with_settings(mut self, settings: AgentSettings) -> Self {
        let mut history = Conversation::with_limit(settings.max_history_length);
        for message in self.history.messages() {
            history.push(message.clone());
        }
        self.history = history;
        self.settings = settings;
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn provider(&self) -> &Arc<dyn LlmProvider> {
        &self.provider
    }

    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    pub fn settings(&self) -> &AgentSettings {
        &self.settings
    }

    /// Generation options for this agent's requests
    pub fn options(&self) -> GenerationOptions {
        let options = GenerationOptions::from_settings(&self.settings);
        match &self.model {
            Some(model) => options.with_model(model.clone()),
            None => options,
        }
    }

    /// System prompt, prior turns and the new user input
    pub fn chat_messages(&self, system_prompt: &str, input: &str) -> Vec<Message> {
        let mut messages = Vec::with_capacity(self.history.len() + 2);
        messages.push(Message::system(system_prompt));
        messages.extend(self.history.messages().iter().cloned());
        messages.push(Message::user(input));
        messages
    }

    /// One completion; returns the generated text
    pub async fn complete(&self, messages: &[Message]) -> Result<String> {
        tracing::debug!(agent = %self.name, messages = messages.len(), "Requesting completion");
        let completion = self.provider.complete(messages, &self.options()).await?;
        if completion.truncated() {
            tracing::warn!(agent = %self.name, "Completion truncated by token limit");
        }
        Ok(completion.content)
    }

    /// One completion for a standalone prompt sent as a user message
    pub async fn prompt(&self, prompt: impl Into<String>) -> Result<String> {
        self.complete(&[Message::user(prompt)]).await
    }

    /// Append a finished user/assistant exchange
    pub fn record_turn(&mut self, input: &str, reply: &str) {
        self.history.push(Message::user(input));
        self.history.push(Message::assistant(reply));
    }

    pub fn history(&self) -> &[Message] {
        self.history.messages()
    }

    pub fn clear_history(&mut self) {
        self.history.clear();
    }
}

/// The agent loops selectable by name
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    #[default]
    Simple,
    React,
    Reflection,
    PlanSolve,
    ToolAware,
}

impl AgentKind {
    pub const ALL: [AgentKind; 5] = [
        AgentKind::Simple,
        AgentKind::React,
        AgentKind::Reflection,
        AgentKind::PlanSolve,
        AgentKind::ToolAware,
    ];
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AgentKind::Simple => "simple",
            AgentKind::React => "react",
            AgentKind::Reflection => "reflection",
            AgentKind::PlanSolve => "plan_solve",
            AgentKind::ToolAware => "tool_aware",
        };
        f.write_str(name)
    }
}

impl FromStr for AgentKind {
    type Err = AgentError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "simple" => Ok(AgentKind::Simple),
            "react" => Ok(AgentKind::React),
            "reflection" => Ok(AgentKind::Reflection),
            "plan_solve" | "plan_and_solve" | "plan" => Ok(AgentKind::PlanSolve),
            "tool_aware" | "tools" => Ok(AgentKind::ToolAware),
            other => Err(AgentError::Config(format!("Unknown agent kind: {}", other))),
        }
    }
}

/// Builder producing any [`AgentKind`] behind `Box<dyn Agent>`
pub struct AgentBuilder {
    name: Option<String>,
    provider: Option<Arc<dyn LlmProvider>>,
    tools: Arc<ToolRegistry>,
    system_prompt: Option<String>,
    settings: AgentSettings,
    model: Option<String>,
    max_steps: Option<usize>,
}

impl Default for AgentBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentBuilder {
    pub fn new() -> Self {
        Self {
            name: None,
            provider: None,
            tools: Arc::new(ToolRegistry::new()),
            system_prompt: None,
            settings: AgentSettings::default(),
            model: None,
            max_steps: None,
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn provider(mut self, provider: Arc<dyn LlmProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn tools(mut self, tools: Arc<ToolRegistry>) -> Self {
        self.tools = tools;
        self
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn settings(mut self, settings: AgentSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Step budget for ReAct, iteration budget for reflection and tool-aware agents
    pub fn max_steps(mut self, max: usize) -> Self {
        self.max_steps = Some(max);
        self
    }

    fn core(&self, kind: AgentKind, provider: Arc<dyn LlmProvider>) -> AgentCore {
        let name = self.name.clone().unwrap_or_else(|| format!("{}-agent", kind));
        let mut core = AgentCore::new(name, provider).with_settings(self.settings.clone());
        if let Some(prompt) = &self.system_prompt {
            core = core.with_system_prompt(prompt.clone());
        }
        if let Some(model) = &self.model {
            core = core.with_model(model.clone());
        }
        core
    }

    pub fn build(self, kind: AgentKind) -> Result<Box<dyn Agent>> {
        let provider = self
            .provider
            .clone()
            .ok_or_else(|| AgentError::Config("Provider is required".into()))?;
        let core = self.core(kind, provider);
        let tools = Arc::clone(&self.tools);

        let agent: Box<dyn Agent> = match kind {
            AgentKind::Simple => Box::new(SimpleAgent::from_core(core)),
            AgentKind::React => {
                let mut agent = ReActAgent::from_core(core, tools);
                if let Some(max) = self.max_steps {
                    agent = agent.with_max_steps(max);
                }
                Box::new(agent)
            }
            AgentKind::Reflection => {
                let mut agent = ReflectionAgent::from_core(core);
                if let Some(max) = self.max_steps {
                    agent = agent.with_max_iterations(max);
                }
                Box::new(agent)
            }
            AgentKind::PlanSolve => Box::new(PlanAndSolveAgent::from_core(core)),
            AgentKind::ToolAware => {
                let mut agent = ToolAwareAgent::from_core(core, tools);
                if let Some(max) = self.max_steps {
                    agent = agent.with_max_tool_iterations(max);
                }
                Box::new(agent)
            }
        };

        tracing::debug!(kind = %kind, agent = %agent.name(), "Built agent");
        Ok(agent)
    }
}
