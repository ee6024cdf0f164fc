//! Staged task execution.
//!
//! ```text
//! ExecutionPlan → Stages → Tasks
//! ```
//!
//! Stages and tasks run strictly in order. The first failing task aborts
//! the remainder of the plan.

mod metrics;
#[allow(clippy::module_inception)]
mod pipeline;
mod stage;
mod task;

pub use metrics::{PipelineMetrics, StageMetrics, TaskMetrics};
pub use pipeline::{ExecutionPlan, PipelineExecutor};
pub use stage::Stage;
pub use task::{BoxedTask, PipelineTask};
