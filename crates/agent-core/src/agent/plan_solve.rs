//! Plan-and-solve: split a question into steps, then answer them in order

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::{Agent, AgentCore};
use crate::action::parse_plan;
use crate::error::Result;
use crate::message::Message;
use crate::provider::{GenerationOptions, LlmProvider};

/// Planner template; `{question}` is substituted
pub const DEFAULT_PLANNER_PROMPT: &str = r#"You are an expert planner. Break the user's problem down into a plan of simple, self-contained steps in logical order.
Your output must be a Python list in which every element is a string describing one sub-task.

Question: {question}

Output the plan strictly in this format:
```python
["step 1", "step 2", "step 3", ...]
```"#;

/// Executor template; `{question}`, `{plan}`, `{history}` and `{current_step}` are substituted
pub const DEFAULT_EXECUTOR_PROMPT: &str = r#"You are an expert at carrying out plans. Solve the problem strictly step by step following the plan.
You receive the original question, the full plan, and the steps completed so far with their results.
Focus only on the current step and output only its answer, without extra explanation.

# Original question
{question}

# Full plan
{plan}

# Completed steps and results
{history}

# Current step
{current_step}

Answer only the current step:"#;

/// Reply when no usable plan could be produced
pub const NO_PLAN_MESSAGE: &str = "Could not produce a valid plan; the task was stopped.";

/// Produces the step list for a question
pub struct Planner {
    provider: Arc<dyn LlmProvider>,
    template: String,
}

impl Planner {
    pub fn new(provider: Arc<dyn LlmProvider>) -> Self {
        Self {
            provider,
            template: DEFAULT_PLANNER_PROMPT.into(),
        }
    }

    pub fn with_template(mut self, template: impl Into<String>) -> Self {
        self.template = template.into();
        self
    }

    pub async fn plan(&self, question: &str, options: &GenerationOptions) -> Result<Vec<String>> {
        let prompt = self.template.replace("{question}", question);
        let reply = self.provider.complete(&[Message::user(prompt)], options).await?;

        let steps = parse_plan(&reply.content);
        if steps.is_empty() {
            warn!(reply = %reply.content, "Planner reply contained no plan");
        } else {
            debug!(steps = steps.len(), "Plan generated");
        }
        Ok(steps)
    }
}

/// Answers plan steps one at a time
pub struct Executor {
    provider: Arc<dyn LlmProvider>,
    template: String,
}

impl Executor {
    pub fn new(provider: Arc<dyn LlmProvider>) -> Self {
        Self {
            provider,
            template: DEFAULT_EXECUTOR_PROMPT.into(),
        }
    }

    pub fn with_template(mut self, template: impl Into<String>) -> Self {
        self.template = template.into();
        self
    }

    /// Run every step; a failing step records its error text as the result
    /// and execution moves on. Returns the last step's result.
    pub async fn execute(&self, question: &str, plan: &[String], options: &GenerationOptions) -> String {
        let rendered_plan = plan
            .iter()
            .enumerate()
            .map(|(i, step)| format!("{}. {}", i + 1, step))
            .collect::<Vec<_>>()
            .join("\n");

        let mut history = String::new();
        let mut last = String::new();

        for (i, step) in plan.iter().enumerate() {
            let index = i + 1;
            debug!(step = index, total = plan.len(), task = %step, "Executing step");

            let prompt = self
                .template
                .replace("{question}", question)
                .replace("{plan}", &rendered_plan)
                .replace("{history}", if history.is_empty() { "none" } else { &history })
                .replace("{current_step}", step);

            let result = match self.provider.complete(&[Message::user(prompt)], options).await {
                Ok(completion) => completion.content,
                Err(e) => {
                    warn!(step = index, error = %e, "Step failed");
                    format!("Error: {}", e)
                }
            };

            history.push_str(&format!("Step {}: {}\nResult: {}\n\n", index, step, result));
            last = result;
        }

        last
    }
}

pub struct PlanAndSolveAgent {
    core: AgentCore,
    planner: Planner,
    executor: Executor,
}

impl PlanAndSolveAgent {
    pub fn new(name: impl Into<String>, provider: Arc<dyn LlmProvider>) -> Self {
        Self::from_core(AgentCore::new(name, provider))
    }

    pub fn from_core(core: AgentCore) -> Self {
        let provider = Arc::clone(core.provider());
        Self {
            planner: Planner::new(Arc::clone(&provider)),
            executor: Executor::new(provider),
            core,
        }
    }

    pub fn with_planner_prompt(mut self, template: impl Into<String>) -> Self {
        self.planner = self.planner.with_template(template);
        self
    }

    pub fn with_executor_prompt(mut self, template: impl Into<String>) -> Self {
        self.executor = self.executor.with_template(template);
        self
    }
}

#[async_trait]
impl Agent for PlanAndSolveAgent {
    fn name(&self) -> &str {
        self.core.name()
    }

    async fn run(&mut self, input: &str) -> Result<String> {
        info!(agent = %self.core.name(), "Plan-and-solve run started");
        let options = self.core.options();

        let plan = self.planner.plan(input, &options).await?;
        if plan.is_empty() {
            self.core.record_turn(input, NO_PLAN_MESSAGE);
            return Ok(NO_PLAN_MESSAGE.to_string());
        }

        let answer = self.executor.execute(input, &plan, &options).await;
        info!(agent = %self.core.name(), steps = plan.len(), "Plan executed");
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
