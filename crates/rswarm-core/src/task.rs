//! User-supplied work: the `Task` trait, weighting, and selection.

use std::sync::Arc;

use async_trait::async_trait;
use rand::Rng;

use crate::user::UserContext;

/// An error returned by [`Task::execute`].
///
/// Never propagates past [`crate::user::UserWorker`] — it is converted into
/// a stats failure entry and logged, not surfaced to the runner.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("{0}")]
    Failed(String),
}

impl TaskError {
    pub fn failed(msg: impl Into<String>) -> Self {
        TaskError::Failed(msg.into())
    }
}

/// A unit of work a simulated user repeatedly performs.
///
/// Implementations are expected to call [`UserContext::report_success`] or
/// [`UserContext::report_failure`] themselves with their own timing (an HTTP
/// request's duration, say). If `execute` returns `Err` without having
/// reported an outcome, the calling [`crate::user::UserWorker`] reports a
/// failure on the task's behalf using elapsed wall time.
#[async_trait]
pub trait Task: Send + Sync {
    fn name(&self) -> &str;

    async fn execute(&self, ctx: &UserContext) -> Result<(), TaskError>;
}

/// A [`Task`] paired with its selection weight.
#[derive(Clone)]
pub struct WeightedTask {
    pub task: Arc<dyn Task>,
    pub weight: u32,
}

impl WeightedTask {
    pub fn new(task: Arc<dyn Task>, weight: u32) -> Self {
        Self { task, weight }
    }
}

/// Weighted random selection among a fixed set of registered tasks.
///
/// Builds a cumulative-weight array once at construction; `pick` draws a
/// uniform integer and binary-searches it via `partition_point`, giving
/// O(log n) selection without re-walking the task list per pick.
pub struct TaskSelector {
    tasks: Vec<Arc<dyn Task>>,
    cumulative_weights: Vec<u64>,
    total_weight: u64,
}

impl TaskSelector {
    /// Panics if `tasks` is empty — a worker with no task to run is a
    /// configuration error the embedder must catch before starting.
    pub fn new(tasks: Vec<WeightedTask>) -> Self {
        assert!(!tasks.is_empty(), "TaskSelector requires at least one task");

        let mut cumulative = Vec::with_capacity(tasks.len());
        let mut running = 0u64;
        let mut picked = Vec::with_capacity(tasks.len());
        for wt in &tasks {
            if wt.weight == 0 {
                continue;
            }
            running += wt.weight as u64;
            cumulative.push(running);
            picked.push(Arc::clone(&wt.task));
        }

        if picked.is_empty() {
            // Every task had weight 0: fall back to uniform selection over
            // all registered tasks.
            for wt in &tasks {
                running += 1;
                cumulative.push(running);
                picked.push(Arc::clone(&wt.task));
            }
        }

        Self {
            tasks: picked,
            cumulative_weights: cumulative,
            total_weight: running,
        }
    }

    /// Draw one task according to its registered weight.
    pub fn pick(&self) -> Arc<dyn Task> {
        let draw = rand::thread_rng().gen_range(0..self.total_weight);
        let idx = self.cumulative_weights.partition_point(|&cum| cum <= draw);
        Arc::clone(&self.tasks[idx.min(self.tasks.len() - 1)])
    }
}
