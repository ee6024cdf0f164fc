//! Task trait for pipeline execution.

use async_trait::async_trait;
use vmorch_shared::errors::VmorchResult;

/// A unit of work inside a pipeline stage.
///
/// Tasks run with a shared context, which is cloned per task.
#[async_trait]
pub trait PipelineTask<Ctx>: Send + Sync {
    async fn run(self: Box<Self>, ctx: Ctx) -> VmorchResult<()>;

    /// Human-readable task name for logging and metrics.
    fn name(&self) -> &str;
}

pub type BoxedTask<Ctx> = Box<dyn PipelineTask<Ctx>>;
