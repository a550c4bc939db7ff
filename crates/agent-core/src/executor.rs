//! Parallel tool execution
//!
//! Fans a batch of tool invocations out over a bounded number of tokio
//! tasks and collects every outcome. A failing or panicking tool only
//! affects its own entry.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::tool::ToolRegistry;

/// Default number of tools allowed to run at once
pub const DEFAULT_MAX_WORKERS: usize = 4;

/// One tool invocation in a batch
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolTask {
    pub tool_name: String,
    #[serde(default, alias = "input_data")]
    pub input: String,
}

impl ToolTask {
    pub fn new(tool_name: impl Into<String>, input: impl Into<String>) -> Self {
        Self {
            tool_name: tool_name.into(),
            input: input.into(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Success,
    Error,
}

/// Result of one task; `task_id` is its index in the submitted batch
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub task_id: usize,
    pub tool_name: String,
    pub input: String,
    pub result: String,
    pub status: TaskStatus,
}

/// Runs tool tasks concurrently against a shared registry
#[derive(Clone)]
pub struct ParallelToolExecutor {
    registry: Arc<ToolRegistry>,
    max_workers: usize,
}

impl ParallelToolExecutor {
    pub fn new(registry: Arc<ToolRegistry>, max_workers: usize) -> Self {
        Self {
            registry,
            max_workers: max_workers.max(1),
        }
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Execute every task and wait for all of them; output keeps input order
    pub async fn execute_parallel(&self, tasks: Vec<ToolTask>) -> Vec<TaskOutcome> {
        info!(tasks = tasks.len(), workers = self.max_workers, "Executing tools in parallel");
        let permits = Arc::new(Semaphore::new(self.max_workers));

        let mut handles = Vec::with_capacity(tasks.len());
        for (task_id, task) in tasks.into_iter().enumerate() {
            if task.tool_name.trim().is_empty() {
                debug!(task_id, "Skipping task without tool name");
                continue;
            }

            let registry = Arc::clone(&self.registry);
            let permits = Arc::clone(&permits);
            let tool_name = task.tool_name.clone();
            let input = task.input.clone();

            let handle = tokio::spawn(async move {
                let _permit = permits.acquire_owned().await.ok();
                registry.execute_text(&tool_name, &input).await
            });
            handles.push((task_id, task, handle));
        }

        let mut outcomes = Vec::with_capacity(handles.len());
        for (task_id, task, handle) in handles {
            let (result, status) = match handle.await {
                Ok(result) if result.starts_with("Error") => (result, TaskStatus::Error),
                Ok(result) => (result, TaskStatus::Success),
                Err(e) => {
                    warn!(task_id, tool = %task.tool_name, error = %e, "Tool task aborted");
                    (
                        format!("Error: tool '{}' aborted: {}", task.tool_name, e),
                        TaskStatus::Error,
                    )
                }
            };

            debug!(task_id, tool = %task.tool_name, ?status, "Tool task finished");
            outcomes.push(TaskOutcome {
                task_id,
                tool_name: task.tool_name,
                input: task.input,
                result,
                status,
            });
        }

        let succeeded = outcomes.iter().filter(|o| o.status == TaskStatus::Success).count();
        info!(succeeded, total = outcomes.len(), "Parallel execution finished");
        outcomes
    }

    /// Run one tool over many inputs
    pub async fn execute_batch(&self, tool_name: &str, inputs: Vec<String>) -> Vec<TaskOutcome> {
        let tasks = inputs
            .into_iter()
            .map(|input| ToolTask::new(tool_name, input))
            .collect();
        self.execute_parallel(tasks).await
    }
}

/// One-shot helper around [`ParallelToolExecutor::execute_parallel`]
pub async fn run_parallel_tools(
    registry: Arc<ToolRegistry>,
    tasks: Vec<ToolTask>,
    max_workers: usize,
) -> Vec<TaskOutcome> {
    ParallelToolExecutor::new(registry, max_workers)
        .execute_parallel(tasks)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtin::CalculatorTool;
    use crate::error::Result;
    use crate::tool::{ParameterSchema, Tool, ToolCall, ToolResult, ToolSchema};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct Panicky;

    #[async_trait]
    impl Tool for Panicky {
        fn schema(&self) -> ToolSchema {
            ToolSchema {
                name: "panicky".into(),
                description: "always panics".into(),
                parameters: vec![ParameterSchema::optional("input", "string", "ignored")],
                category: None,
                has_side_effects: false,
            }
        }

        async fn execute(&self, _call: &ToolCall) -> Result<ToolResult> {
            panic!("boom");
        }
    }

    struct Gauge {
        running: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Tool for Gauge {
        fn schema(&self) -> ToolSchema {
            ToolSchema {
                name: "gauge".into(),
                description: "tracks concurrency".into(),
                parameters: vec![],
                category: None,
                has_side_effects: false,
            }
        }

        async fn execute(&self, _call: &ToolCall) -> Result<ToolResult> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            Ok(ToolResult::success("gauge", "ok"))
        }
    }

    fn registry() -> Arc<ToolRegistry> {
        let mut registry = ToolRegistry::new();
        registry.register(CalculatorTool);
        registry.register(Panicky);
        Arc::new(registry)
    }

    #[tokio::test]
    async fn test_results_keep_order_and_isolate_failures() {
        let executor = ParallelToolExecutor::new(registry(), 2);
        let outcomes = executor
            .execute_parallel(vec![
                ToolTask::new("calculate", "2 + 2"),
                ToolTask::new("panicky", "x"),
                ToolTask::new("", "skipped"),
                ToolTask::new("missing", "x"),
                ToolTask::new("calculate", "3 * 4"),
            ])
            .await;

        assert_eq!(outcomes.len(), 4);
        assert_eq!(outcomes[0].task_id, 0);
        assert_eq!(outcomes[0].result, "4");
        assert_eq!(outcomes[0].status, TaskStatus::Success);

        assert_eq!(outcomes[1].status, TaskStatus::Error);
        assert_eq!(outcomes[2].task_id, 3);
        assert_eq!(outcomes[2].status, TaskStatus::Error);

        assert_eq!(outcomes[3].task_id, 4);
        assert_eq!(outcomes[3].result, "12");
    }

    #[tokio::test]
    async fn test_worker_bound_is_respected() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut registry = ToolRegistry::new();
        registry.register(Gauge {
            running: Arc::clone(&running),
            peak: Arc::clone(&peak),
        });

        let executor = ParallelToolExecutor::new(Arc::new(registry), 2);
        let inputs = (0..6).map(|i| i.to_string()).collect();
        let outcomes = executor.execute_batch("gauge", inputs).await;

        assert_eq!(outcomes.len(), 6);
        assert!(outcomes.iter().all(|o| o.status == TaskStatus::Success));
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[test]
    fn test_zero_workers_clamped() {
        assert_eq!(ParallelToolExecutor::new(registry(), 0).max_workers(), 1);
    }
}
