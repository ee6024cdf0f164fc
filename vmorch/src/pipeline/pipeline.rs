//! Ordered pipeline executor.

use std::time::Instant;

use vmorch_shared::errors::VmorchResult;

use super::metrics::{PipelineMetrics, StageMetrics, TaskMetrics};
use super::stage::Stage;
use super::task::BoxedTask;

pub struct ExecutionPlan<Ctx> {
    stages: Vec<Stage<BoxedTask<Ctx>>>,
}

impl<Ctx> ExecutionPlan<Ctx> {
    /// Build a plan. Empty stages are dropped.
    pub fn new(stages: Vec<Stage<BoxedTask<Ctx>>>) -> Self {
        Self {
            stages: stages.into_iter().filter(|s| !s.is_empty()).collect(),
        }
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name).collect()
    }

    pub fn task_count(&self) -> usize {
        self.stages.iter().map(|s| s.tasks.len()).sum()
    }
}

pub struct PipelineExecutor;

impl PipelineExecutor {
    /// Run every task of every stage in order.
    ///
    /// Halts on the first failing task and returns its error. Tasks after
    /// the failing one are never started.
    pub async fn execute<Ctx>(plan: ExecutionPlan<Ctx>, ctx: Ctx) -> VmorchResult<PipelineMetrics>
    where
        Ctx: Clone,
    {
        let total_start = Instant::now();
        let mut stage_metrics = Vec::new();

        for (index, stage) in plan.stages.into_iter().enumerate() {
            let stage_start = Instant::now();
            let mut task_metrics = Vec::with_capacity(stage.tasks.len());

            tracing::trace!(stage = stage.name, tasks = stage.tasks.len(), "Entering stage");

            for task in stage.tasks {
                let name = task.name().to_string();
                let task_start = Instant::now();
                task.run(ctx.clone()).await?;
                task_metrics.push(TaskMetrics {
                    name,
                    duration_ms: task_start.elapsed().as_millis(),
                });
            }

            stage_metrics.push(StageMetrics {
                index,
                name: stage.name,
                duration_ms: stage_start.elapsed().as_millis(),
                tasks: task_metrics,
            });
        }

        Ok(PipelineMetrics {
            total_duration_ms: total_start.elapsed().as_millis(),
            stages: stage_metrics,
        })
    }
}
