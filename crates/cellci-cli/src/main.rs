//! cellci - matrix build, test and publish pipeline CLI
//!
//! ## Commands
//!
//! - `run`: run every matrix cell and publish from the release branch
//! - `plan`: print each cell's stages without running them
//! - `matrix`: list the matrix cells
//! - `history`: list recorded cell runs
//! - `show`: print a recorded run's events
//! - `gate`: re-evaluate a recorded run from its events

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use cellci::{
    open_ledger, BuildMatrix, CellJob, CellOutcome, CellPlan, CellServices, CiGate,
    EnvSecretSource, HttpCoverageSink, HttpPackageIndex, MatrixReport, MatrixRunner,
    PipelineConfig, PublishStatus, Trigger, TriggerOverrides, DEFAULT_CONFIG_FILE,
};
use cellci_core::{RedactionRule, Redactor};
use cellci_state::{RunId, RunLedger};
use clap::{Parser, Subcommand};
use conda_env_manager::HttpInstallerSource;
use tracing::{info, Level};

#[derive(Parser)]
#[command(name = "cellci")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Matrix build, test and publish pipeline for Python packages", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Pipeline config, relative to the workspace
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Workspace (the package checkout)
    #[arg(short, long, global = true, default_value = ".")]
    workspace: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the matrix
    Run {
        /// Branch (default: CELLCI_BRANCH, then git)
        #[arg(long)]
        branch: Option<String>,

        /// Trigger event: push, cron, tag, pull_request, manual
        #[arg(long)]
        event: Option<String>,

        /// Tag being built
        #[arg(long)]
        tag: Option<String>,

        /// Commit SHA (default: CELLCI_SHA, then git)
        #[arg(long)]
        sha: Option<String>,

        /// Only run these cells (e.g. amd64-3.7); repeatable
        #[arg(long = "cell")]
        cells: Vec<String>,

        /// Cells running at once (default: from config)
        #[arg(long)]
        max_parallel: Option<usize>,

        /// Write the matrix report as JSON
        #[arg(long)]
        report: Option<PathBuf>,
    },

    /// Print every cell's stages without running them
    Plan {
        /// Only these cells; repeatable
        #[arg(long = "cell")]
        cells: Vec<String>,
    },

    /// List matrix cells
    Matrix,

    /// List recorded cell runs (newest first)
    History {
        /// Maximum number of runs to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Print a recorded run and its events
    Show {
        /// Run ID
        run_id: String,
    },

    /// Evaluate the event gate for a recorded run
    Gate {
        /// Run ID
        run_id: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let workspace = std::fs::canonicalize(&cli.workspace)
        .with_context(|| format!("workspace not found: {}", cli.workspace.display()))?;
    let config = load_config(&workspace, &cli.config)?;
    let redactor = Redactor::new()
        .with_rule(RedactionRule::env_var(&config.publish.token_env))?
        .with_rule(RedactionRule::env_var(&config.coverage.repo_token_env))?;
    cellci_core::init_tracing(cli.json, level, redactor);

    match cli.command {
        Commands::Run {
            branch,
            event,
            tag,
            sha,
            cells,
            max_parallel,
            report,
        } => {
            let overrides = TriggerOverrides {
                event,
                branch,
                tag,
                sha,
            };
            cmd_run(
                &config,
                &workspace,
                overrides,
                &cells,
                max_parallel,
                report.as_deref(),
            )
            .await
        }
        Commands::Plan { cells } => cmd_plan(&config, &workspace, &cells),
        Commands::Matrix => cmd_matrix(&config),
        Commands::History { limit } => {
            let ledger = open_ledger(&config.ledger, &workspace).await?;
            cmd_history(ledger.as_ref(), limit).await
        }
        Commands::Show { run_id } => {
            let ledger = open_ledger(&config.ledger, &workspace).await?;
            cmd_show(ledger.as_ref(), &run_id).await
        }
        Commands::Gate { run_id } => {
            let ledger = open_ledger(&config.ledger, &workspace).await?;
            cmd_gate(ledger.as_ref(), &run_id).await
        }
    }
}

/// Load and validate the config. A missing file means the defaults.
fn load_config(workspace: &Path, config: &Path) -> Result<PipelineConfig> {
    let path = if config.is_absolute() {
        config.to_path_buf()
    } else {
        workspace.join(config)
    };
    let config = PipelineConfig::load_or_default(&path)?;
    config.validate()?;
    Ok(config)
}

fn select_matrix(config: &PipelineConfig, cells: &[String]) -> Result<BuildMatrix> {
    config
        .build_matrix()?
        .filter(cells)
        .map_err(anyhow::Error::msg)
}

/// Run the matrix and record every cell
async fn cmd_run(
    config: &PipelineConfig,
    workspace: &Path,
    overrides: TriggerOverrides,
    cells: &[String],
    max_parallel: Option<usize>,
    report_path: Option<&Path>,
) -> Result<()> {
    let matrix = select_matrix(config, cells)?;
    let trigger = Trigger::resolve(overrides, workspace)?;

    println!("Running {} for workspace: {}", config.package.name, workspace.display());
    println!(
        "Trigger: {} on {} ({})",
        trigger.event,
        trigger.branch,
        trigger.sha.as_deref().unwrap_or("unknown sha")
    );
    println!(
        "Cells: {}",
        matrix
            .cells()
            .iter()
            .map(|c| c.id())
            .collect::<Vec<_>>()
            .join(", ")
    );
    println!();

    let base_path = std::env::var("PATH").unwrap_or_default();
    let jobs = CellJob::plan_all(config, &matrix, workspace, &trigger, &base_path)?;

    let services = CellServices {
        ledger: open_ledger(&config.ledger, workspace).await?,
        installer: Arc::new(HttpInstallerSource::new()?),
        coverage: Arc::new(HttpCoverageSink::new(&config.coverage.endpoint)?),
        index: Arc::new(HttpPackageIndex::new(&config.publish.repository_url)?),
        secrets: Arc::new(EnvSecretSource),
    };
    let parallel = max_parallel.unwrap_or_else(|| config.max_parallel(matrix.len()));
    let report = MatrixRunner::new(services, parallel)
        .keep_environments(config.environment.keep_environments)
        .run(jobs)
        .await;

    print_report(&report);

    if let Some(path) = report_path {
        let json = serde_json::to_string_pretty(&report)?;
        std::fs::write(path, json)
            .with_context(|| format!("failed to write report {}", path.display()))?;
        info!(path = %path.display(), "Report written");
    }

    if report.success() {
        println!("\n✓ All cells passed!");
        Ok(())
    } else {
        anyhow::bail!("CI checks failed: {}", report.failed_cells().join(", "))
    }
}

fn print_report(report: &MatrixReport) {
    for outcome in &report.cells {
        match outcome {
            CellOutcome::Finished(result) => {
                let status = if result.success { "✓" } else { "✗" };
                println!("{} {} (run {})", status, result.cell_id, result.run_id);
                for stage in &result.stages {
                    let mark = if stage.skipped {
                        "-"
                    } else if stage.passed() {
                        "✓"
                    } else {
                        "✗"
                    };
                    println!(
                        "    {} {} ({}ms, exit code: {})",
                        mark, stage.stage_name, stage.duration_ms, stage.exit_code
                    );
                }
                if let PublishStatus::Failed { error } | PublishStatus::GateClosed { reasons: error } =
                    &result.publish
                {
                    println!("    publish: {}", error);
                }
            }
            CellOutcome::Errored { cell_id, error } => {
                println!("✗ {} ({})", cell_id, error);
            }
        }
    }
    println!();
    print!("{}", report.render_table());
}

/// Print each cell's stages
fn cmd_plan(config: &PipelineConfig, workspace: &Path, cells: &[String]) -> Result<()> {
    let matrix = select_matrix(config, cells)?;
    let base_path = std::env::var("PATH").unwrap_or_default();
    for cell in matrix.cells() {
        let plan = CellPlan::build(config, cell, workspace, &base_path)?;
        println!("{}  [{}]", cell.label(&config.package.name), plan.environment.root().display());
        for stage in &plan.stages {
            let disabled = if stage.enabled { "" } else { " (disabled)" };
            println!(
                "  {:<14} {:<20} {}{}",
                stage.phase.name(),
                stage.name,
                stage.action.describe(),
                disabled
            );
        }
        println!();
    }
    Ok(())
}

fn cmd_matrix(config: &PipelineConfig) -> Result<()> {
    let matrix = config.build_matrix()?;
    for cell in matrix.cells() {
        println!("{:<12} {}", cell.id(), cell.label(&config.package.name));
    }
    println!("\n{} cell(s)", matrix.len());
    Ok(())
}

async fn cmd_history(ledger: &dyn RunLedger, limit: usize) -> Result<()> {
    let runs = ledger.list_runs(None).await?;
    if runs.is_empty() {
        println!("No recorded runs.");
        return Ok(());
    }
    for run in runs.iter().take(limit) {
        let duration = run
            .summary
            .as_ref()
            .map(|s| format!("{}ms", s.duration_ms))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{}  {:<9} {:<28} {:>9}  {}",
            run.run_id,
            run.status.as_str(),
            run.metadata.label,
            duration,
            run.created_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    Ok(())
}

async fn cmd_show(ledger: &dyn RunLedger, run_id: &str) -> Result<()> {
    let id = RunId(run_id.to_string());
    let run = ledger
        .get_run(&id)
        .await
        .with_context(|| format!("run not found: {}", run_id))?;
    let events = ledger.get_events(&id).await?;

    println!("Run: {}", run.run_id);
    println!("Cell: {}", run.metadata.label);
    println!("Status: {}", run.status.as_str());
    println!("Git SHA: {}", run.metadata.git_sha.as_deref().unwrap_or("unknown"));
    println!("Spec digest: {}", run.spec_digest);
    println!();
    for event in &events {
        let stage = event.payload["stage"].as_str().unwrap_or("");
        println!("  [{}] {} {}", event.seq, event.kind, stage);
    }
    println!("\n{} event(s)", events.len());
    Ok(())
}

async fn cmd_gate(ledger: &dyn RunLedger, run_id: &str) -> Result<()> {
    let events = ledger
        .get_events(&RunId(run_id.to_string()))
        .await
        .with_context(|| format!("failed to read events of run {}", run_id))?;
    let verdict = CiGate::evaluate(&events);
    println!("Gate: {}", if verdict.passed { "✓ PASSED" } else { "✗ FAILED" });

    if !verdict.violations.is_empty() {
        println!("Violations:");
        for violation in &verdict.violations {
            println!("  - {}", violation);
        }
    }

    if verdict.passed {
        Ok(())
    } else {
        anyhow::bail!("{}", verdict.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cellci_state::fakes::MemoryRunLedger;
    use cellci_state::{ContentDigest, RunEvent, RunMetadata};

    #[test]
    fn parses_run_flags() {
        let cli = Cli::try_parse_from([
            "cellci",
            "--json",
            "run",
            "--branch",
            "master",
            "--cell",
            "amd64-3.7",
            "--cell",
            "arm64-3.6",
            "--max-parallel",
            "2",
        ])
        .unwrap();
        assert!(cli.json);
        assert_eq!(cli.config, PathBuf::from("cellci.toml"));
        match cli.command {
            Commands::Run {
                branch,
                cells,
                max_parallel,
                ..
            } => {
                assert_eq!(branch.as_deref(), Some("master"));
                assert_eq!(cells, vec!["amd64-3.7", "arm64-3.6"]);
                assert_eq!(max_parallel, Some(2));
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn missing_config_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(dir.path(), Path::new("cellci.toml")).unwrap();
        assert_eq!(config.package.name, "weather");
    }

    #[test]
    fn invalid_config_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("cellci.toml"),
            "[matrix]\narchitectures = [\"sparc\"]\n",
        )
        .unwrap();
        let err = load_config(dir.path(), Path::new("cellci.toml")).unwrap_err();
        assert!(err.to_string().contains("sparc"));
    }

    #[test]
    fn unknown_cell_filter_is_error() {
        let config = PipelineConfig::default();
        assert!(select_matrix(&config, &["amd64-2.7".to_string()]).is_err());
        assert_eq!(select_matrix(&config, &[]).unwrap().len(), 4);
    }

    #[tokio::test]
    async fn gate_command_follows_events() {
        let ledger = MemoryRunLedger::new();
        assert!(ledger.is_empty());
        let run_id = ledger
            .create_run(
                &ContentDigest::from_bytes(b"cell"),
                RunMetadata {
                    git_sha: None,
                    label: "weather@amd64-py3.7".to_string(),
                    tags: serde_json::json!({}),
                },
            )
            .await
            .unwrap();
        ledger
            .append_event(
                &run_id,
                RunEvent {
                    seq: 1,
                    kind: "stage_failed".to_string(),
                    payload: serde_json::json!({ "stage": "pytest", "exit_code": 1, "fatal": true }),
                    timestamp: chrono::Utc::now(),
                },
            )
            .await
            .unwrap();

        assert!(cmd_gate(&ledger, &run_id.0).await.is_err());
        assert!(cmd_show(&ledger, &run_id.0).await.is_ok());
        assert!(cmd_history(&ledger, 5).await.is_ok());
    }
}
