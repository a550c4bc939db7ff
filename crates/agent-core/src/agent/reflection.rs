//! Self-critique loop: draft, review, refine

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{Agent, AgentCore};
use crate::error::Result;
use crate::message::Message;
use crate::provider::LlmProvider;

const DEFAULT_INITIAL_PROMPT: &str = r#"Complete the following task as well as you can.

# Task
{task}

Give a complete and accurate answer."#;

const DEFAULT_REFLECT_PROMPT: &str = r#"You are a meticulous reviewer. Examine the answer below for mistakes, gaps and unclear parts.

# Task
{task}

# Answer
{content}

List concrete problems and how to fix them. If the answer needs no changes, reply with exactly "No improvement needed"."#;

const DEFAULT_REFINE_PROMPT: &str = r#"Improve your previous answer using the reviewer's feedback.

# Task
{task}

# Previous answer
{last_attempt}

# Feedback
{feedback}

Output only the improved answer."#;

/// Feedback phrases meaning the draft is final
const NO_IMPROVEMENT_MARKERS: &[&str] = &["no improvement needed", "无需改进"];

/// Prompt templates used by [`ReflectionAgent`]
///
/// `initial` takes `{task}`; `reflect` takes `{task}` and `{content}`;
/// `refine` takes `{task}`, `{last_attempt}` and `{feedback}`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReflectionPrompts {
    pub initial: String,
    pub reflect: String,
    pub refine: String,
}

impl Default for ReflectionPrompts {
    fn default() -> Self {
        Self {
            initial: DEFAULT_INITIAL_PROMPT.into(),
            reflect: DEFAULT_REFLECT_PROMPT.into(),
            refine: DEFAULT_REFINE_PROMPT.into(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrajectoryKind {
    Attempt,
    Reflection,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TrajectoryEntry {
    pub kind: TrajectoryKind,
    pub content: String,
}

/// Drafts and critiques produced during one run
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Trajectory {
    entries: Vec<TrajectoryEntry>,
}

impl Trajectory {
    pub fn push(&mut self, kind: TrajectoryKind, content: impl Into<String>) {
        self.entries.push(TrajectoryEntry {
            kind,
            content: content.into(),
        });
    }

    pub fn entries(&self) -> &[TrajectoryEntry] {
        &self.entries
    }

    pub fn last_attempt(&self) -> Option<&str> {
        self.entries
            .iter()
            .rev()
            .find(|e| e.kind == TrajectoryKind::Attempt)
            .map(|e| e.content.as_str())
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Human-readable dump
    pub fn to_text(&self) -> String {
        self.entries
            .iter()
            .map(|e| match e.kind {
                TrajectoryKind::Attempt => format!("--- Attempt ---\n{}", e.content),
                TrajectoryKind::Reflection => format!("--- Feedback ---\n{}", e.content),
            })
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

pub struct ReflectionAgent {
    core: AgentCore,
    prompts: ReflectionPrompts,
    max_iterations: usize,
    trajectory: Trajectory,
}

impl ReflectionAgent {
    pub fn new(name: impl Into<String>, provider: Arc<dyn LlmProvider>) -> Self {
        Self::from_core(AgentCore::new(name, provider))
    }

    pub fn from_core(core: AgentCore) -> Self {
        Self {
            core,
            prompts: ReflectionPrompts::default(),
            max_iterations: 3,
            trajectory: Trajectory::default(),
        }
    }

    pub fn with_max_iterations(mut self, max: usize) -> Self {
        self.max_iterations = max;
        self
    }

    pub fn with_prompts(mut self, prompts: ReflectionPrompts) -> Self {
        self.prompts = prompts;
        self
    }

    pub fn trajectory(&self) -> &Trajectory {
        &self.trajectory
    }

    fn is_final(feedback: &str) -> bool {
        let lowered = feedback.to_lowercase();
        NO_IMPROVEMENT_MARKERS.iter().any(|m| lowered.contains(m))
    }
}

#[async_trait]
impl Agent for ReflectionAgent {
    fn name(&self) -> &str {
        self.core.name()
    }

    async fn run(&mut self, input: &str) -> Result<String> {
        self.trajectory.clear();
        info!(agent = %self.core.name(), "Reflection run started");

        let draft = self
            .core
            .prompt(self.prompts.initial.replace("{task}", input))
            .await?;
        self.trajectory.push(TrajectoryKind::Attempt, draft.clone());
        let mut current = draft;

        for round in 1..=self.max_iterations {
            let feedback = self
                .core
                .prompt(
                    self.prompts
                        .reflect
                        .replace("{task}", input)
                        .replace("{content}", &current),
                )
                .await?;
            self.trajectory.push(TrajectoryKind::Reflection, feedback.clone());

            if Self::is_final(&feedback) {
                debug!(round, "Reviewer found nothing to improve");
                break;
            }

            current = self
                .core
                .prompt(
                    self.prompts
                        .refine
                        .replace("{task}", input)
                        .replace("{last_attempt}", &current)
                        .replace("{feedback}", &feedback),
                )
                .await?;
            self.trajectory.push(TrajectoryKind::Attempt, current.clone());
            debug!(round, "Refined answer");
        }

        self.core.record_turn(input, &current);
        Ok(current)
    }

    fn history(&self) -> &[Message] {
        self.core.history()
    }

    fn clear_history(&mut self) {
        self.core.clear_history();
        self.trajectory.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedProvider;

    #[tokio::test]
    async fn test_refines_until_budget() {
        let provider = Arc::new(ScriptedProvider::new([
            "draft", "too short", "better", "add an example", "best",
        ]));
        let mut agent = ReflectionAgent::new("critic", provider.clone()).with_max_iterations(2);

        assert_eq!(agent.run("explain ownership").await.unwrap(), "best");
        assert_eq!(provider.calls(), 5);
        assert_eq!(agent.trajectory().entries().len(), 5);
        assert_eq!(agent.trajectory().last_attempt(), Some("best"));

        let prompts = provider.prompts();
        assert!(prompts[1].contains("draft"));
        assert!(prompts[2].contains("too short"));
    }

    #[tokio::test]
    async fn test_stops_when_no_improvement_needed() {
        let provider = Arc::new(ScriptedProvider::new(["solid answer", "No improvement needed."]));
        let mut agent = ReflectionAgent::new("critic", provider.clone());

        assert_eq!(agent.run("task").await.unwrap(), "solid answer");
        assert_eq!(provider.calls(), 2);
        assert!(agent.trajectory().to_text().contains("--- Feedback ---"));
    }

    #[tokio::test]
    async fn test_custom_prompts() {
        let provider = Arc::new(ScriptedProvider::new(["a", "无需改进"]));
        let mut agent = ReflectionAgent::new("critic", provider.clone()).with_prompts(ReflectionPrompts {
            initial: "DO {task}".into(),
            ..Default::default()
        });

        agent.run("it").await.unwrap();
        assert_eq!(provider.prompts()[0], "DO it");
    }
}
