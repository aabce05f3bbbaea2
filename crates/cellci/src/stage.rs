//! Pipeline phases and stage definitions.

use std::path::PathBuf;

use conda_env_manager::EnvCommand;
use serde::{Deserialize, Serialize};

/// Lifecycle phase a stage belongs to, in execution order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Export working-directory and matrix variables.
    Setup,
    /// Bootstrap conda, create the environment, install everything.
    Install,
    /// Run the test suite with coverage.
    Script,
    /// Coverage reporting; runs only when every fatal stage passed.
    AfterSuccess,
    /// Conditional publication.
    Deploy,
}

impl Phase {
    pub fn name(&self) -> &'static str {
        match self {
            Phase::Setup => "setup",
            Phase::Install => "install",
            Phase::Script => "script",
            Phase::AfterSuccess => "after_success",
            Phase::Deploy => "deploy",
        }
    }

    /// Whether a failure here aborts the cell.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Phase::Setup | Phase::Install | Phase::Script)
    }
}

/// What a stage does.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum StageAction {
    /// Create the cell root directory.
    Prepare { root: PathBuf },

    /// Run a process (first element is the executable).
    Command { command: Vec<String> },

    /// Download the conda bootstrap installer.
    FetchInstaller { url: String, dest: PathBuf },

    /// Parse the coverage report, scope it, and optionally upload it.
    Coverage { report: PathBuf, upload: bool },

    /// Build the distribution into `dist_dir` and upload every artifact.
    Publish {
        build_command: Vec<String>,
        dist_dir: PathBuf,
    },
}

impl StageAction {
    /// One-line description for plans.
    pub fn describe(&self) -> String {
        match self {
            StageAction::Prepare { root } => format!("mkdir -p {}", root.display()),
            StageAction::Command { command } => command.join(" "),
            StageAction::FetchInstaller { url, dest } => {
                format!("download {} -> {}", url, dest.display())
            }
            StageAction::Coverage { report, upload } => {
                if *upload {
                    format!("measure + upload {}", report.display())
                } else {
                    format!("measure {}", report.display())
                }
            }
            StageAction::Publish {
                build_command,
                dist_dir,
            } => format!(
                "{} && upload {}/*",
                build_command.join(" "),
                dist_dir.display()
            ),
        }
    }
}

/// Configuration for a single stage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StageConfig {
    /// Human-readable stage name.
    pub name: String,

    pub phase: Phase,

    pub action: StageAction,

    /// Timeout in seconds (0 = none).
    pub timeout_secs: u64,

    /// Whether this stage is enabled.
    pub enabled: bool,
}

impl StageConfig {
    pub fn new(name: impl Into<String>, phase: Phase, action: StageAction, timeout_secs: u64) -> Self {
        Self {
            name: name.into(),
            phase,
            action,
            timeout_secs,
            enabled: true,
        }
    }

    /// A plain command stage.
    pub fn custom(name: String, phase: Phase, command: Vec<String>, timeout_secs: u64) -> Self {
        Self::new(name, phase, StageAction::Command { command }, timeout_secs)
    }

    /// A provisioning command rendered by the environment manager.
    pub fn from_env_command(cmd: EnvCommand, timeout_secs: u64) -> Self {
        let mut command = vec![cmd.program];
        command.extend(cmd.args);
        Self::new(cmd.label, Phase::Install, StageAction::Command { command }, timeout_secs)
    }

    /// Failure of this stage aborts the cell.
    pub fn is_fatal(&self) -> bool {
        self.phase.is_fatal()
    }

    /// Disable this stage.
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}
