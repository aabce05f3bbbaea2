//! Per-cell pipeline execution and run recording.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use cellci_core::domain::run::{Event, EventKind};
use cellci_core::{
    emit_coverage_upload_failed, emit_publish_outcome, emit_stage_finished,
    evaluate_publish_gate, CellRunRecorder, PublishCandidate, PublishRule, PublishRuleSet,
    PublishVerdict, RedactionRule, Redactor,
};
use cellci_state::{ContentDigest, RunLedger, RunMetadata, RunSummary};
use conda_env_manager::{CondaEnvironment, InstallerSource};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use crate::config::{CoverageConfig, PipelineConfig, PublishConfig};
use crate::coverage::{CoverageJob, CoverageReport, CoverageSink};
use crate::credential::{resolve_deploy_token, resolve_optional, SecretSource};
use crate::error::PublishError;
use crate::matrix::MatrixCell;
use crate::plan::CellPlan;
use crate::publish::{discover_artifacts, DistArtifact, PackageIndex, UploadOutcome};
use crate::runner::{CellRunner, ProcessEnv, StageResult};
use crate::spec::CellSpec;
use crate::stage::{Phase, StageAction, StageConfig};
use crate::trigger::Trigger;

/// External collaborators of a cell. Cheap to clone; shared by every cell.
#[derive(Clone)]
pub struct CellServices {
    pub ledger: Arc<dyn RunLedger>,
    pub installer: Arc<dyn InstallerSource>,
    pub coverage: Arc<dyn CoverageSink>,
    pub index: Arc<dyn PackageIndex>,
    pub secrets: Arc<dyn SecretSource>,
}

/// Everything one cell run reads. Owned, so a cell can move into its task.
#[derive(Debug, Clone)]
pub struct CellContext {
    pub cell: MatrixCell,
    pub package: String,
    /// Project name the built artifacts must carry.
    pub distribution: String,
    pub workspace: PathBuf,
    pub trigger: Trigger,
    /// Environment hash (conda spec + dependency files) for the run identity.
    pub env_hash: String,
    pub environment: CondaEnvironment,
    pub process_env: ProcessEnv,
    pub coverage: CoverageConfig,
    pub publish: PublishConfig,
}

impl CellContext {
    pub fn from_plan(
        config: &PipelineConfig,
        plan: &CellPlan,
        workspace: &Path,
        trigger: &Trigger,
        env_hash: &str,
    ) -> Self {
        Self {
            cell: plan.cell.clone(),
            package: config.package.name.clone(),
            distribution: config.package.distribution_name().to_string(),
            workspace: workspace.to_path_buf(),
            trigger: trigger.clone(),
            env_hash: env_hash.to_string(),
            environment: plan.environment.clone(),
            process_env: plan.process_env.clone(),
            coverage: config.coverage.clone(),
            publish: config.publish.clone(),
        }
    }
}

/// What the deploy phase did.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PublishStatus {
    /// Publishing is switched off in the config.
    Disabled,
    /// The gate kept the cell from publishing.
    GateClosed { reasons: String },
    /// Every artifact is on the index.
    Published {
        uploaded: Vec<String>,
        already_present: Vec<String>,
    },
    /// The publish stage failed. The cell's test verdict is unaffected.
    Failed { error: String },
}

impl PublishStatus {
    /// Short form for tables.
    pub fn summary(&self) -> String {
        match self {
            PublishStatus::Disabled => "disabled".to_string(),
            PublishStatus::GateClosed { .. } => "skipped".to_string(),
            PublishStatus::Published {
                uploaded,
                already_present,
            } => format!(
                "published ({} new, {} existing)",
                uploaded.len(),
                already_present.len()
            ),
            PublishStatus::Failed { .. } => "FAILED".to_string(),
        }
    }
}

/// Result of one cell.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CellResult {
    /// Ledger run id.
    pub run_id: String,

    pub cell_id: String,

    /// Every fatal stage passed.
    pub success: bool,

    pub stages: Vec<StageResult>,

    /// Package coverage, when measured.
    pub coverage_percent: Option<f64>,

    pub coverage_uploaded: bool,

    pub publish: PublishStatus,

    pub duration_ms: u64,

    /// Digest of the cell spec the run is keyed by.
    pub spec_digest: String,
}

impl CellResult {
    /// Number of stages that passed.
    pub fn passed_count(&self) -> usize {
        self.stages.iter().filter(|s| s.passed()).count()
    }

    /// Number of stages that failed (skipped stages are not counted).
    pub fn failed_count(&self) -> usize {
        self.stages.iter().filter(|s| s.failed()).count()
    }

    pub fn skipped_count(&self) -> usize {
        self.stages.iter().filter(|s| s.skipped).count()
    }
}

/// Ledger writer with the run's sequence counter.
struct Journal {
    recorder: CellRunRecorder,
    seq: u64,
}

impl Journal {
    async fn record(&mut self, kind: EventKind, payload: serde_json::Value) -> anyhow::Result<()> {
        let event = Event::new(self.seq, kind, payload);
        self.recorder
            .record(&event)
            .await
            .context("failed to append run event")?;
        self.seq += 1;
        Ok(())
    }

    fn total_events(&self) -> u64 {
        self.seq - 1
    }
}

/// Mutable state of one running cell.
struct CellExecution<'a> {
    services: &'a CellServices,
    ctx: &'a CellContext,
    journal: Journal,
    redactor: Redactor,
    fatal_failure: bool,
    coverage_percent: Option<f64>,
    coverage_uploaded: bool,
    publish: PublishStatus,
}

/// Per-cell pipeline.
pub struct CellPipeline;

impl CellPipeline {
    /// Run the stages of one cell and record every event into the ledger.
    ///
    /// Each stage produces `stage_started` and then `stage_succeeded` or
    /// `stage_failed`, or a single `stage_skipped`. After a fatal failure
    /// every remaining stage is skipped. The deploy stage always records
    /// `publish_gate_evaluated` unless publishing is disabled.
    ///
    /// The run completes when every fatal stage passed and fails otherwise;
    /// coverage and publish failures do not fail it.
    pub async fn run(
        services: &CellServices,
        ctx: &CellContext,
        stages: Vec<StageConfig>,
    ) -> anyhow::Result<CellResult> {
        let start = Instant::now();
        let cell_id = ctx.cell.id();

        let stage_names: Vec<String> = stages.iter().map(|s| s.name.clone()).collect();
        let spec = CellSpec::new(
            ctx.workspace.clone(),
            &stage_names,
            ctx.trigger.sha.clone().unwrap_or_default(),
            cell_id.clone(),
            ctx.env_hash.clone(),
        );
        let spec_digest: ContentDigest = spec.digest();

        let metadata = RunMetadata {
            git_sha: ctx.trigger.sha.clone(),
            label: ctx.cell.label(&ctx.package),
            tags: json!({
                "cell": &cell_id,
                "arch": ctx.cell.arch.as_str(),
                "python": ctx.cell.python.as_str(),
                "branch": &ctx.trigger.branch,
                "event": ctx.trigger.event.as_str(),
                "stages": &stage_names,
                "workspace": ctx.workspace.to_string_lossy(),
                "env_hash": &ctx.env_hash,
            }),
        };

        let recorder = CellRunRecorder::start(services.ledger.clone(), &spec_digest, metadata)
            .await
            .context("failed to start ledger run")?;
        let run_id = recorder.run_id().to_string();
        info!(run_id = %run_id, "Starting cell");

        let redactor = Redactor::new()
            .with_rule(RedactionRule::env_var(&ctx.publish.token_env))?
            .with_rule(RedactionRule::env_var(&ctx.coverage.repo_token_env))?;

        let mut exec = CellExecution {
            services,
            ctx,
            journal: Journal { recorder, seq: 1 },
            redactor,
            fatal_failure: false,
            coverage_percent: None,
            coverage_uploaded: false,
            publish: PublishStatus::Disabled,
        };

        exec.journal
            .record(
                EventKind::CellStarted,
                json!({
                    "cell": &cell_id,
                    "branch": &ctx.trigger.branch,
                    "event": ctx.trigger.event.as_str(),
                }),
            )
            .await?;

        let mut stage_results = Vec::with_capacity(stages.len());
        for config in &stages {
            let result = exec.run_stage(config, &run_id).await?;
            stage_results.push(result);
        }

        let success = !exec.fatal_failure;
        let kind = if success {
            EventKind::CellCompleted
        } else {
            EventKind::CellFailed
        };
        exec.journal
            .record(
                kind,
                json!({
                    "coverage_percent": exec.coverage_percent,
                    "publish": exec.publish.summary(),
                }),
            )
            .await?;

        let duration_ms = start.elapsed().as_millis() as u64;
        let summary = RunSummary {
            total_events: exec.journal.total_events(),
            duration_ms,
            success,
        };
        let finished = if success {
            exec.journal.recorder.finish_ok(summary).await
        } else {
            exec.journal.recorder.finish_err(summary).await
        };
        if let Err(e) = finished {
            cellci_core::emit_run_finalize_error(&run_id, &e);
            return Err(e).context("failed to finalize ledger run");
        }

        if success {
            info!(run_id = %run_id, "Cell passed");
        } else {
            warn!(run_id = %run_id, "Cell failed");
        }

        Ok(CellResult {
            run_id,
            cell_id,
            success,
            stages: stage_results,
            coverage_percent: exec.coverage_percent,
            coverage_uploaded: exec.coverage_uploaded,
            publish: exec.publish,
            duration_ms,
            spec_digest: spec_digest.to_string(),
        })
    }
}

impl CellExecution<'_> {
    async fn skip(&mut self, config: &StageConfig, reason: &str) -> anyhow::Result<StageResult> {
        info!(stage = %config.name, reason = %reason, "Skipping stage");
        self.journal
            .record(
                EventKind::StageSkipped {
                    stage: config.name.clone(),
                },
                json!({ "phase": config.phase.name(), "reason": reason }),
            )
            .await?;
        Ok(StageResult::skipped(&config.name, config.phase))
    }

    async fn run_stage(&mut self, config: &StageConfig, run_id: &str) -> anyhow::Result<StageResult> {
        if !config.enabled {
            return self.skip(config, "disabled").await;
        }

        if let StageAction::Publish { .. } = config.action {
            let verdict = self.evaluate_gate(None).await?;
            if !verdict.passed {
                let reasons = verdict.reasons();
                self.publish = PublishStatus::GateClosed {
                    reasons: reasons.clone(),
                };
                return self.skip(config, &reasons).await;
            }
        } else if self.fatal_failure {
            return self.skip(config, "a prior fatal stage failed").await;
        }

        info!(stage = %config.name, phase = config.phase.name(), "Executing stage");
        self.journal
            .record(
                EventKind::StageStarted {
                    stage: config.name.clone(),
                },
                json!({
                    "phase": config.phase.name(),
                    "action": self.redactor.scrub(&config.action.describe()),
                    "timeout_secs": config.timeout_secs,
                }),
            )
            .await?;

        let started = Instant::now();
        let result = match &config.action {
            StageAction::Prepare { .. } => match self.ctx.environment.prepare().await {
                Ok(()) => StageResult::ok(
                    &config.name,
                    config.phase,
                    format!("prepared {}", self.ctx.environment.root().display()),
                    elapsed_ms(started),
                ),
                Err(e) => self.stage_error(config, &e, started),
            },
            StageAction::FetchInstaller { url, dest } => {
                match self.services.installer.fetch(url, dest).await {
                    Ok(bytes) => StageResult::ok(
                        &config.name,
                        config.phase,
                        format!("downloaded {bytes} bytes to {}", dest.display()),
                        elapsed_ms(started),
                    ),
                    Err(e) => self.stage_error(config, &e, started),
                }
            }
            StageAction::Command { command } => {
                self.run_command(&config.name, config.phase, command, config.timeout_secs, started)
                    .await
            }
            StageAction::Coverage { report, upload } => {
                self.run_coverage(config, report, *upload, run_id, started)
                    .await?
            }
            StageAction::Publish {
                build_command,
                dist_dir,
            } => {
                self.run_publish(config, build_command, dist_dir, started)
                    .await?
            }
        };

        self.finish_stage(config, &result).await?;
        Ok(result)
    }

    fn stage_error(
        &self,
        config: &StageConfig,
        error: &dyn std::fmt::Display,
        started: Instant,
    ) -> StageResult {
        StageResult::error(
            &config.name,
            config.phase,
            self.redactor.scrub(&error.to_string()),
            elapsed_ms(started),
        )
    }

    async fn run_command(
        &self,
        name: &str,
        phase: Phase,
        command: &[String],
        timeout_secs: u64,
        started: Instant,
    ) -> StageResult {
        match CellRunner::execute_command(
            name,
            phase,
            command,
            timeout_secs,
            &self.ctx.process_env,
            &self.redactor,
        )
        .await
        {
            Ok(result) => result,
            Err(e) => StageResult::error(
                name,
                phase,
                self.redactor.scrub(&e.to_string()),
                elapsed_ms(started),
            ),
        }
    }

    async fn finish_stage(&mut self, config: &StageConfig, result: &StageResult) -> anyhow::Result<()> {
        let fatal = config.is_fatal();
        let payload = json!({
            "phase": config.phase.name(),
            "exit_code": result.exit_code,
            "stdout": &result.stdout,
            "stderr": &result.stderr,
            "duration_ms": result.duration_ms,
            "fatal": fatal,
        });
        emit_stage_finished(
            &config.name,
            result.exit_code,
            result.duration_ms,
            result.passed(),
        );

        if result.passed() {
            self.journal
                .record(
                    EventKind::StageSucceeded {
                        stage: config.name.clone(),
                    },
                    payload,
                )
                .await
        } else {
            if fatal {
                self.fatal_failure = true;
            }
            self.journal
                .record(
                    EventKind::StageFailed {
                        stage: config.name.clone(),
                    },
                    payload,
                )
                .await
        }
    }

    /// Evaluate the publish gate and record the verdict.
    async fn evaluate_gate(&mut self, version: Option<&str>) -> anyhow::Result<PublishVerdict> {
        let publish = &self.ctx.publish;
        let mut rule_set = PublishRuleSet::standard(&publish.branch);
        for rule in &mut rule_set.rules {
            if let PublishRule::EventAllowed { events } = rule {
                *events = publish.events.clone();
            }
        }

        let candidate = PublishCandidate {
            branch: self.ctx.trigger.branch.clone(),
            event: self.ctx.trigger.event.as_str().to_string(),
            prior_stages_passed: !self.fatal_failure,
            version: version.map(str::to_string),
        };
        let verdict = evaluate_publish_gate(&rule_set, &candidate);

        self.journal
            .record(
                EventKind::PublishGateEvaluated,
                json!({
                    "passed": verdict.passed,
                    "branch": &candidate.branch,
                    "event": &candidate.event,
                    "version": &candidate.version,
                    "violations": verdict
                        .violations
                        .iter()
                        .map(|v| v.reason.as_str())
                        .collect::<Vec<_>>(),
                }),
            )
            .await?;
        Ok(verdict)
    }

    async fn run_coverage(
        &mut self,
        config: &StageConfig,
        report_path: &Path,
        upload: bool,
        run_id: &str,
        started: Instant,
    ) -> anyhow::Result<StageResult> {
        let mut report = match CoverageReport::load(
            report_path,
            &self.ctx.package,
            Some(&self.ctx.workspace),
        ) {
            Ok(report) => report,
            Err(e) => return Ok(self.stage_error(config, &e, started)),
        };

        let percent = report.percent();
        self.coverage_percent = Some(percent);
        info!(percent = percent, files = report.files.len(), "Coverage measured");
        self.journal
            .record(
                EventKind::CoverageMeasured,
                json!({
                    "percent": percent,
                    "files": report.files.len(),
                    "statements": report.statements(),
                }),
            )
            .await?;

        let mut stdout = format!("{} coverage: {:.2}%", report.package, percent);
        if !upload {
            return Ok(StageResult::ok(
                &config.name,
                config.phase,
                stdout,
                elapsed_ms(started),
            ));
        }

        let repo_token = resolve_optional(self.services.secrets.as_ref(), &self.ctx.coverage.repo_token_env);
        if let Some(token) = &repo_token {
            self.redactor.register_secret(token.expose_secret());
        }
        let job = CoverageJob {
            service_name: self.ctx.coverage.service_name.clone(),
            service_job_id: run_id.to_string(),
            flag_name: self.ctx.cell.id(),
            git_sha: self.ctx.trigger.sha.clone(),
            branch: self.ctx.trigger.branch.clone(),
            repo_token,
        };

        let uploaded = match report.attach_sources(&self.ctx.workspace) {
            Ok(()) => self.services.coverage.upload(&report, &job).await,
            Err(e) => Err(e),
        };
        match uploaded {
            Ok(()) => {
                self.coverage_uploaded = true;
                self.journal
                    .record(EventKind::CoverageUploaded, json!({ "percent": percent }))
                    .await?;
                stdout.push_str("\nuploaded");
                Ok(StageResult::ok(
                    &config.name,
                    config.phase,
                    stdout,
                    elapsed_ms(started),
                ))
            }
            Err(e) => {
                let error = self.redactor.scrub(&e.to_string());
                emit_coverage_upload_failed(&error);
                self.journal
                    .record(EventKind::CoverageUploadFailed, json!({ "error": &error }))
                    .await?;
                let mut result = StageResult::error(
                    &config.name,
                    config.phase,
                    error,
                    elapsed_ms(started),
                );
                result.stdout = stdout;
                Ok(result)
            }
        }
    }

    async fn run_publish(
        &mut self,
        config: &StageConfig,
        build_command: &[String],
        dist_dir: &Path,
        started: Instant,
    ) -> anyhow::Result<StageResult> {
        let build = self
            .run_command(
                &config.name,
                config.phase,
                build_command,
                config.timeout_secs,
                started,
            )
            .await;
        if !build.passed() {
            self.publish = PublishStatus::Failed {
                error: format!("distribution build exited with code {}", build.exit_code),
            };
            return Ok(build);
        }

        let artifacts = match self.checked_artifacts(dist_dir) {
            Ok(artifacts) => artifacts,
            Err(e) => return Ok(self.publish_failed(config, build, &e, started)),
        };

        let versions: BTreeSet<&str> = artifacts.iter().map(|a| a.version.as_str()).collect();
        for version in versions {
            let verdict = self.evaluate_gate(Some(version)).await?;
            if !verdict.passed {
                let error = format!("version {version} not publishable: {}", verdict.reasons());
                return Ok(self.publish_failed(config, build, &error, started));
            }
        }

        let token = match resolve_deploy_token(
            self.services.secrets.as_ref(),
            &self.ctx.publish.token_env,
            &self.ctx.publish.username,
        ) {
            Ok(token) => token,
            Err(e) => return Ok(self.publish_failed(config, build, &e, started)),
        };
        self.redactor.register_secret(token.secret.expose_secret());

        let mut uploaded = Vec::new();
        let mut already_present = Vec::new();
        for artifact in &artifacts {
            match self.services.index.upload(artifact, &token).await {
                Ok(outcome) => {
                    emit_publish_outcome(&artifact.filename, outcome.as_str());
                    let payload = json!({
                        "version": &artifact.version,
                        "sha256": &artifact.sha256,
                        "size": artifact.size,
                    });
                    match outcome {
                        UploadOutcome::Uploaded => {
                            self.journal
                                .record(
                                    EventKind::ArtifactPublished {
                                        filename: artifact.filename.clone(),
                                    },
                                    payload,
                                )
                                .await?;
                            uploaded.push(artifact.filename.clone());
                        }
                        UploadOutcome::AlreadyExists => {
                            self.journal
                                .record(
                                    EventKind::ArtifactAlreadyExists {
                                        filename: artifact.filename.clone(),
                                    },
                                    payload,
                                )
                                .await?;
                            already_present.push(artifact.filename.clone());
                        }
                    }
                }
                Err(e) => {
                    emit_publish_outcome(&artifact.filename, "failed");
                    let error = format!("{}: {}", artifact.filename, e);
                    return Ok(self.publish_failed(config, build, &error, started));
                }
            }
        }

        let mut stdout = build.stdout;
        for filename in &uploaded {
            stdout.push_str(&format!("\nuploaded {filename}"));
        }
        for filename in &already_present {
            stdout.push_str(&format!("\nalready on index: {filename}"));
        }
        self.publish = PublishStatus::Published {
            uploaded,
            already_present,
        };
        Ok(StageResult::ok(
            &config.name,
            config.phase,
            stdout,
            elapsed_ms(started),
        ))
    }

    /// Discover the built artifacts and refuse any that belong to another
    /// project.
    fn checked_artifacts(&self, dist_dir: &Path) -> Result<Vec<DistArtifact>, PublishError> {
        let artifacts = discover_artifacts(dist_dir)?;
        let expected = normalize_project_name(&self.ctx.distribution);
        for artifact in &artifacts {
            if normalize_project_name(&artifact.name) != expected {
                return Err(PublishError::InvalidArtifact(format!(
                    "{} does not belong to {}",
                    artifact.filename, self.ctx.distribution
                )));
            }
        }
        Ok(artifacts)
    }

    fn publish_failed(
        &mut self,
        config: &StageConfig,
        build: StageResult,
        error: &dyn std::fmt::Display,
        started: Instant,
    ) -> StageResult {
        let error = self.redactor.scrub(&error.to_string());
        warn!(stage = %config.name, error = %error, "Publish failed");
        self.publish = PublishStatus::Failed {
            error: error.clone(),
        };
        let mut result = StageResult::error(&config.name, config.phase, error, elapsed_ms(started));
        result.stdout = build.stdout;
        result
    }
}

/// PEP 503 comparison form: case-insensitive, `-` `_` `.` equivalent.
fn normalize_project_name(name: &str) -> String {
    name.to_ascii_lowercase().replace(['-', '.'], "_")
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(stages: Vec<StageResult>) -> CellResult {
        CellResult {
            run_id: "run123".to_string(),
            cell_id: "amd64-3.7".to_string(),
            success: true,
            stages,
            coverage_percent: Some(80.0),
            coverage_uploaded: true,
            publish: PublishStatus::Disabled,
            duration_ms: 300,
            spec_digest: "abc123".to_string(),
        }
    }

    #[test]
    fn test_cell_result_counts() {
        let result = result(vec![
            StageResult::ok("prepare", Phase::Setup, String::new(), 1),
            StageResult::ok("pytest", Phase::Script, String::new(), 200),
            StageResult::error("coverage", Phase::AfterSuccess, "down".to_string(), 3),
            StageResult::skipped("publish", Phase::Deploy),
        ]);
        assert_eq!(result.passed_count(), 2);
        assert_eq!(result.failed_count(), 1);
        assert_eq!(result.skipped_count(), 1);
    }

    #[test]
    fn project_names_normalize() {
        assert_eq!(normalize_project_name("Weather"), "weather");
        assert_eq!(
            normalize_project_name("my-weather.tools"),
            normalize_project_name("my_weather_tools")
        );
    }

    #[test]
    fn publish_status_summary() {
        let status = PublishStatus::Published {
            uploaded: vec!["weather-1.0.tar.gz".to_string()],
            already_present: Vec::new(),
        };
        assert_eq!(status.summary(), "published (1 new, 0 existing)");
        assert_eq!(
            PublishStatus::GateClosed {
                reasons: "branch".to_string()
            }
            .summary(),
            "skipped"
        );
    }
}
