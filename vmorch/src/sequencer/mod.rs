//! Device configuration sequencing.
//!
//! ```text
//! boot    boot-source, drive(rootfs), drive(<id>)...
//! machine machine-config
//! devices balloon, faascale-mem
//! network network(<iface>)...
//! ```
//!
//! Every step is sent exactly once, in order. The first failure halts the
//! sequence; steps already applied stay applied and are never retried.

mod step;

pub use step::{ConfigurationStep, MANDATORY_STEPS, START_STEP, STOP_STEP, StepKind, plan_steps};

use std::time::Instant;

use async_trait::async_trait;
use vmorch_shared::errors::{VmorchError, VmorchResult};
use vmorch_shared::lifecycle::InstancePhase;

use crate::lifecycle::SharedState;
use crate::pipeline::{BoxedTask, ExecutionPlan, PipelineExecutor, PipelineMetrics, PipelineTask, Stage};
use crate::spec::InstanceSpec;
use crate::vmm::{ControlClient, ControlResponse};

/// Context handed to every step task.
#[derive(Clone)]
pub struct SequencerCtx {
    pub instance_id: String,
    pub client: ControlClient,
    pub state: SharedState,
}

struct ApplyStepTask {
    step: ConfigurationStep,
}

#[async_trait]
impl PipelineTask<SequencerCtx> for ApplyStepTask {
    async fn run(self: Box<Self>, ctx: SequencerCtx) -> VmorchResult<()> {
        send_step(&ctx, &self.step).await.map(|_| ())
    }

    fn name(&self) -> &str {
        &self.step.name
    }
}

/// Send one step and record its outcome in the step log.
pub(crate) async fn send_step(
    ctx: &SequencerCtx,
    step: &ConfigurationStep,
) -> VmorchResult<ControlResponse> {
    ctx.state.lock().check_step(step)?;

    tracing::debug!(instance_id = %ctx.instance_id, step = %step, "Sending configuration step");

    let started = Instant::now();
    let result = ctx
        .client
        .send(step.method.clone(), &step.resource, Some(&step.payload))
        .await;

    ctx.state.lock().record_step(
        step,
        result.as_ref().map(|r| r.status),
        started.elapsed(),
    );

    result.map_err(|cause| {
        tracing::warn!(
            instance_id = %ctx.instance_id,
            step = %step.name,
            error = %cause,
            "Configuration step failed"
        );
        VmorchError::Sequencer {
            step: step.name.clone(),
            cause,
        }
    })
}

fn stage_name(rank: u8) -> &'static str {
    match rank {
        0 => "boot",
        1 => "machine",
        2 => "devices",
        3 => "network",
        _ => "other",
    }
}

/// Group planned steps into one stage per rank, preserving plan order.
fn execution_plan(steps: Vec<ConfigurationStep>) -> ExecutionPlan<SequencerCtx> {
    let mut stages: Vec<Stage<BoxedTask<SequencerCtx>>> = Vec::new();
    let mut current: Option<u8> = None;

    for step in steps {
        let rank = step.kind.rank();
        if current != Some(rank) {
            stages.push(Stage::new(stage_name(rank), Vec::new()));
            current = Some(rank);
        }
        if let Some(stage) = stages.last_mut() {
            stage.tasks.push(Box::new(ApplyStepTask { step }));
        }
    }

    ExecutionPlan::new(stages)
}

/// Drives the configuration steps of one instance.
#[derive(Clone)]
pub struct Sequencer {
    ctx: SequencerCtx,
}

impl Sequencer {
    pub fn new(ctx: SequencerCtx) -> Self {
        Self { ctx }
    }

    /// Apply every configuration step of `spec`, excluding `start`.
    ///
    /// Requires the instance to be `Configuring`.
    pub async fn apply(&self, spec: &InstanceSpec) -> VmorchResult<PipelineMetrics> {
        let phase = self.ctx.state.lock().phase();
        if phase != InstancePhase::Configuring {
            return Err(VmorchError::InvalidState(format!(
                "cannot apply configuration while {}",
                phase
            )));
        }

        let steps = plan_steps(spec)?;
        let plan = execution_plan(steps);

        tracing::debug!(
            instance_id = %self.ctx.instance_id,
            stages = ?plan.stage_names(),
            steps = plan.task_count(),
            "Applying configuration"
        );

        let metrics = PipelineExecutor::execute(plan, self.ctx.clone()).await?;

        tracing::info!(
            instance_id = %self.ctx.instance_id,
            duration_ms = metrics.total_duration_ms,
            "Configuration applied"
        );
        Ok(metrics)
    }

    /// Issue the start action. The instance must be `Ready`.
    pub async fn start(&self) -> VmorchResult<()> {
        send_step(&self.ctx, &ConfigurationStep::start()?).await?;
        Ok(())
    }

    /// Send a post-boot update step. The instance must be `Running`.
    pub async fn update(&self, step: &ConfigurationStep) -> VmorchResult<()> {
        send_step(&self.ctx, step).await?;
        Ok(())
    }

    pub fn client(&self) -> &ControlClient {
        &self.ctx.client
    }
}
