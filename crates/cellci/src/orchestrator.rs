//! Matrix fan-out: one task per cell, bounded by a semaphore.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use cellci_core::cell_span;
use conda_env_manager::generate_environment_hash;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn, Instrument};

use crate::config::PipelineConfig;
use crate::matrix::BuildMatrix;
use crate::pipeline::{CellContext, CellPipeline, CellServices};
use crate::plan::CellPlan;
use crate::report::{CellOutcome, MatrixReport};
use crate::stage::StageConfig;
use crate::trigger::Trigger;

/// One cell ready to run.
#[derive(Debug, Clone)]
pub struct CellJob {
    pub ctx: CellContext,
    pub stages: Vec<StageConfig>,
}

impl CellJob {
    /// Plan every cell of `matrix`.
    ///
    /// `base_path` is the inherited `PATH` the activated environment is
    /// prepended to.
    pub fn plan_all(
        config: &PipelineConfig,
        matrix: &BuildMatrix,
        workspace: &Path,
        trigger: &Trigger,
        base_path: &str,
    ) -> anyhow::Result<Vec<Self>> {
        matrix
            .cells()
            .iter()
            .map(|cell| {
                let plan = CellPlan::build(config, cell, workspace, base_path)
                    .with_context(|| format!("failed to plan cell {}", cell.id()))?;
                let env_hash = generate_environment_hash(
                    plan.environment.spec(),
                    &config.environment.installer_url,
                    workspace,
                )
                .with_context(|| format!("failed to hash environment of {}", cell.id()))?;
                Ok(Self {
                    ctx: CellContext::from_plan(config, &plan, workspace, trigger, &env_hash.hash),
                    stages: plan.stages,
                })
            })
            .collect()
    }
}

/// Runs cells in parallel. Cells share nothing but the services.
pub struct MatrixRunner {
    services: CellServices,
    max_parallel: usize,
    keep_environments: bool,
}

impl MatrixRunner {
    pub fn new(services: CellServices, max_parallel: usize) -> Self {
        Self {
            services,
            max_parallel: max_parallel.max(1),
            keep_environments: false,
        }
    }

    /// Leave cell roots on disk after the run.
    pub fn keep_environments(mut self, keep: bool) -> Self {
        self.keep_environments = keep;
        self
    }

    /// Run every job and collect the outcomes in job order.
    ///
    /// A cell that cannot be recorded becomes [`CellOutcome::Errored`]; it
    /// never stops the other cells.
    pub async fn run(&self, jobs: Vec<CellJob>) -> MatrixReport {
        let start = Instant::now();
        let semaphore = Arc::new(Semaphore::new(self.max_parallel));
        let ids: Vec<String> = jobs.iter().map(|j| j.ctx.cell.id()).collect();
        info!(cells = jobs.len(), max_parallel = self.max_parallel, "Running matrix");

        let mut join_set = JoinSet::new();
        for (idx, job) in jobs.into_iter().enumerate() {
            let services = self.services.clone();
            let semaphore = Arc::clone(&semaphore);
            let keep = self.keep_environments;
            let span = cell_span(&job.ctx.cell.id());

            join_set.spawn(
                async move {
                    let _permit = semaphore.acquire_owned().await.ok();
                    let cell_id = job.ctx.cell.id();
                    let outcome = match CellPipeline::run(&services, &job.ctx, job.stages).await {
                        Ok(result) => CellOutcome::Finished(result),
                        Err(e) => {
                            warn!(error = %format!("{e:#}"), "Cell could not be recorded");
                            CellOutcome::Errored {
                                cell_id,
                                error: format!("{e:#}"),
                            }
                        }
                    };
                    if !keep {
                        if let Err(e) = job.ctx.environment.discard().await {
                            warn!(error = %e, "Failed to remove cell environment");
                        }
                    }
                    (idx, outcome)
                }
                .instrument(span),
            );
        }

        let mut slots: Vec<Option<CellOutcome>> = vec![None; ids.len()];
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((idx, outcome)) => slots[idx] = Some(outcome),
                Err(e) => warn!(error = %e, "Cell task join error"),
            }
        }

        let cells = slots
            .into_iter()
            .zip(ids)
            .map(|(slot, cell_id)| {
                slot.unwrap_or_else(|| CellOutcome::Errored {
                    cell_id,
                    error: "cell task did not complete".to_string(),
                })
            })
            .collect();

        MatrixReport {
            cells,
            duration_ms: start.elapsed().as_millis() as u64,
        }
    }
}
