//! Per-cell stage lists and process environments built from the config.

use std::path::{Path, PathBuf};

use conda_env_manager::{installer_url, CondaEnvironment, InstallerArch};

use crate::config::PipelineConfig;
use crate::matrix::MatrixCell;
use crate::runner::ProcessEnv;
use crate::stage::{Phase, StageAction, StageConfig};

/// File name of the coverage.py JSON report inside the cell root.
pub const COVERAGE_REPORT_FILE: &str = "coverage.json";

/// Everything needed to run one cell.
#[derive(Debug, Clone)]
pub struct CellPlan {
    pub cell: MatrixCell,
    pub environment: CondaEnvironment,
    pub stages: Vec<StageConfig>,
    pub process_env: ProcessEnv,
}

impl CellPlan {
    /// Plan `cell` for `workspace`. `base_path` is the `PATH` the
    /// activated environment is prepended to.
    pub fn build(
        config: &PipelineConfig,
        cell: &MatrixCell,
        workspace: &Path,
        base_path: &str,
    ) -> anyhow::Result<Self> {
        let root = config.work_dir(workspace).join(cell.id());
        let environment = CondaEnvironment::new(root, config.conda_spec(&cell.python))?;
        let stages = cell_stages(config, cell, &environment)?;
        let process_env = ProcessEnv {
            cwd: workspace.to_path_buf(),
            vars: cell_env_vars(cell, &environment, workspace, base_path),
            removed: vec![
                config.publish.token_env.clone(),
                config.coverage.repo_token_env.clone(),
            ],
        };
        Ok(Self {
            cell: cell.clone(),
            environment,
            stages,
            process_env,
        })
    }

    pub fn stage_names(&self) -> Vec<String> {
        self.stages.iter().map(|s| s.name.clone()).collect()
    }

    pub fn coverage_report(&self) -> PathBuf {
        self.environment.root().join(COVERAGE_REPORT_FILE)
    }
}

/// Ordered stages for one cell: setup, install, script, after-success,
/// deploy.
pub fn cell_stages(
    config: &PipelineConfig,
    cell: &MatrixCell,
    env: &CondaEnvironment,
) -> anyhow::Result<Vec<StageConfig>> {
    let install_timeout = config.environment.timeout_secs;
    let arch = InstallerArch::from_matrix_arch(cell.arch.as_str())?;
    let url = installer_url(&config.environment.installer_url, arch)?;
    let python = env.python_path().to_string_lossy().into_owned();
    let report = env.root().join(COVERAGE_REPORT_FILE);

    let mut stages = vec![
        StageConfig::new(
            "prepare",
            Phase::Setup,
            StageAction::Prepare {
                root: env.root().to_path_buf(),
            },
            0,
        ),
        StageConfig::new(
            "fetch-installer",
            Phase::Install,
            StageAction::FetchInstaller {
                url,
                dest: env.installer_path(),
            },
            install_timeout,
        ),
    ];

    stages.extend(
        env.provisioning_commands()
            .into_iter()
            .map(|cmd| StageConfig::from_env_command(cmd, install_timeout)),
    );

    let mut pytest = vec![
        python.clone(),
        "-m".to_string(),
        "pytest".to_string(),
        format!("--cov={}", config.package.name),
        "--cov-branch".to_string(),
        format!("--cov-report=json:{}", report.display()),
    ];
    pytest.extend(config.test.extra_args.iter().cloned());
    pytest.push(config.test_path().to_string());
    stages.push(StageConfig::custom(
        "pytest".to_string(),
        Phase::Script,
        pytest,
        config.test_timeout_secs(),
    ));

    stages.push(StageConfig::new(
        "coverage",
        Phase::AfterSuccess,
        StageAction::Coverage {
            report,
            upload: config.coverage.upload,
        },
        0,
    ));

    let dist_dir = env.root().join("dist");
    let build_dir = env.root().join("build");
    let build_command = config
        .publish
        .build_command
        .iter()
        .map(|arg| {
            arg.replace("{python}", &python)
                .replace("{dist_dir}", &dist_dir.to_string_lossy())
                .replace("{build_dir}", &build_dir.to_string_lossy())
        })
        .collect();
    let publish = StageConfig::new(
        "publish",
        Phase::Deploy,
        StageAction::Publish {
            build_command,
            dist_dir,
        },
        config.publish.timeout_secs,
    );
    stages.push(if config.publish.enabled {
        publish
    } else {
        publish.disabled()
    });

    Ok(stages)
}

/// Process environment shared by every stage of a cell.
///
/// - `PYTHONPATH`: workspace prepended to any inherited value
/// - `CELLCI_ARCH`, `CELLCI_PYTHON_VERSION`: the matrix selectors
/// - `COVERAGE_FILE`: per-cell coverage data file so parallel cells sharing
///   one workspace do not overwrite each other
/// - conda activation (`PATH`, `CONDA_PREFIX`, `CONDA_DEFAULT_ENV`, `CONDARC`)
pub fn cell_env_vars(
    cell: &MatrixCell,
    env: &CondaEnvironment,
    workspace: &Path,
    base_path: &str,
) -> Vec<(String, String)> {
    let mut python_path = workspace.to_string_lossy().into_owned();
    if let Ok(existing) = std::env::var("PYTHONPATH") {
        if !existing.is_empty() {
            python_path = format!("{python_path}:{existing}");
        }
    }

    let mut vars = vec![
        ("PYTHONPATH".to_string(), python_path),
        ("CELLCI_ARCH".to_string(), cell.arch.to_string()),
        (
            "CELLCI_PYTHON_VERSION".to_string(),
            cell.python.to_string(),
        ),
        (
            "COVERAGE_FILE".to_string(),
            env.root().join(".coverage").to_string_lossy().into_owned(),
        ),
    ];
    vars.extend(env.activation_vars(base_path));
    vars
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matrix::Architecture;

    fn cell(arch: Architecture, py: &str) -> MatrixCell {
        MatrixCell::new(arch, py.parse().unwrap())
    }

    #[test]
    fn stage_order_follows_phases() {
        let config = PipelineConfig::default();
        let plan = CellPlan::build(
            &config,
            &cell(Architecture::Amd64, "3.7"),
            Path::new("/ws"),
            "/usr/bin",
        )
        .unwrap();
        let phases: Vec<Phase> = plan.stages.iter().map(|s| s.phase).collect();
        let mut sorted = phases.clone();
        sorted.sort();
        assert_eq!(phases, sorted);
        assert_eq!(
            plan.stage_names(),
            vec![
                "prepare",
                "fetch-installer",
                "conda-bootstrap",
                "conda-config",
                "conda-create",
                "conda-install-deps",
                "pip-install-tools",
                "pip-install-package",
                "pytest",
                "coverage",
                "publish",
            ]
        );
    }

    #[test]
    fn installer_url_matches_arch() {
        let config = PipelineConfig::default();
        let plan = CellPlan::build(
            &config,
            &cell(Architecture::Arm64, "3.6"),
            Path::new("/ws"),
            "",
        )
        .unwrap();
        match &plan.stages[1].action {
            StageAction::FetchInstaller { url, .. } => assert!(url.contains("aarch64")),
            other => panic!("unexpected action {other:?}"),
        }
    }

    #[test]
    fn pytest_scoped_to_package() {
        let config = PipelineConfig::default();
        let plan = CellPlan::build(
            &config,
            &cell(Architecture::Amd64, "3.7"),
            Path::new("/ws"),
            "",
        )
        .unwrap();
        let pytest = plan.stages.iter().find(|s| s.name == "pytest").unwrap();
        match &pytest.action {
            StageAction::Command { command } => {
                assert!(command.contains(&"--cov=weather".to_string()));
                assert_eq!(command.last().unwrap(), "weather");
                assert!(command[0].ends_with("envs/test-environment/bin/python"));
            }
            other => panic!("unexpected action {other:?}"),
        }
    }

    #[test]
    fn cells_get_separate_roots() {
        let config = PipelineConfig::default();
        let a = CellPlan::build(&config, &cell(Architecture::Amd64, "3.6"), Path::new("/ws"), "")
            .unwrap();
        let b = CellPlan::build(&config, &cell(Architecture::Amd64, "3.7"), Path::new("/ws"), "")
            .unwrap();
        assert_ne!(a.environment.root(), b.environment.root());
        assert_ne!(a.coverage_report(), b.coverage_report());
    }

    #[test]
    fn env_vars_carry_selectors() {
        let config = PipelineConfig::default();
        let plan = CellPlan::build(
            &config,
            &cell(Architecture::Arm64, "3.6"),
            Path::new("/ws"),
            "/bin",
        )
        .unwrap();
        let get = |k: &str| {
            plan.process_env
                .vars
                .iter()
                .find(|(name, _)| name == k)
                .map(|(_, v)| v.clone())
                .unwrap()
        };
        assert_eq!(get("CELLCI_ARCH"), "arm64");
        assert_eq!(get("CELLCI_PYTHON_VERSION"), "3.6");
        assert!(get("PYTHONPATH").starts_with("/ws"));
        assert!(get("PATH").ends_with(":/bin"));
        assert_eq!(get("CONDA_DEFAULT_ENV"), "test-environment");
    }

    #[test]
    fn secret_variables_withheld_from_stages() {
        let config = PipelineConfig::default();
        let plan = CellPlan::build(&config, &cell(Architecture::Amd64, "3.7"), Path::new("/ws"), "")
            .unwrap();
        assert!(plan.process_env.removed.contains(&"PYPI_TOKEN".to_string()));
        assert!(plan
            .process_env
            .removed
            .contains(&"COVERALLS_REPO_TOKEN".to_string()));
    }

    #[test]
    fn build_command_placeholders_substituted() {
        let config = PipelineConfig::default();
        let plan = CellPlan::build(&config, &cell(Architecture::Amd64, "3.7"), Path::new("/ws"), "")
            .unwrap();
        match &plan.stages.last().unwrap().action {
            StageAction::Publish {
                build_command,
                dist_dir,
            } => {
                assert!(!build_command.iter().any(|a| a.contains('{')));
                assert!(build_command.contains(&dist_dir.to_string_lossy().into_owned()));
            }
            other => panic!("unexpected action {other:?}"),
        }
    }

    #[test]
    fn sdist_metadata_is_built_outside_the_shared_workspace() {
        let config = PipelineConfig::default();
        let build_for = |arch, py| {
            let plan = CellPlan::build(&config, &cell(arch, py), Path::new("/ws"), "").unwrap();
            let root = plan.environment.root().to_path_buf();
            match plan.stages.last().unwrap().action.clone() {
                StageAction::Publish { build_command, .. } => (root, build_command),
                other => panic!("unexpected action {other:?}"),
            }
        };
        let (root_a, cmd_a) = build_for(Architecture::Amd64, "3.7");
        let (_, cmd_b) = build_for(Architecture::Arm64, "3.7");

        let egg_base = |cmd: &[String]| {
            let at = cmd.iter().position(|a| a == "--egg-base").unwrap();
            cmd[at + 1].clone()
        };
        assert_eq!(egg_base(&cmd_a), root_a.join("build").to_string_lossy());
        assert_ne!(egg_base(&cmd_a), egg_base(&cmd_b));
        assert!(!egg_base(&cmd_a).starts_with("/ws/build"));
    }

    #[test]
    fn publish_disabled_in_config() {
        let mut config = PipelineConfig::default();
        config.publish.enabled = false;
        let plan = CellPlan::build(&config, &cell(Architecture::Amd64, "3.7"), Path::new("/ws"), "")
            .unwrap();
        assert!(!plan.stages.last().unwrap().enabled);
    }
}
