//! Per-cell conda environments
//!
//! A [`CondaEnvironment`] owns one prefix directory: the bootstrap conda
//! installation lives at `<root>/conda`, the named environment under
//! `<root>/conda/envs/<name>`. It does not run anything itself; it renders
//! the ordered provisioning commands and the activation variables that the
//! pipeline's stage runner executes with.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::EnvError;
use crate::Result;

/// How the target package is installed into the environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallMode {
    /// `pip install .`
    #[default]
    Standard,
    /// `pip install -e .`
    Editable,
}

/// What goes into a cell's environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CondaSpec {
    pub env_name: String,
    /// Interpreter version selector, `MAJOR.MINOR`.
    pub python_version: String,
    /// Channels searched for `conda_packages`, in priority order.
    pub channels: Vec<String>,
    pub conda_packages: Vec<String>,
    /// Test tooling installed with pip (coverage uploader, pytest plugin).
    pub pip_packages: Vec<String>,
    pub install_mode: InstallMode,
}

impl CondaSpec {
    /// Check the interpreter selector is `MAJOR.MINOR` with numeric parts.
    pub fn validate(&self) -> Result<()> {
        validate_python_version(&self.python_version)
    }
}

/// Accepts `3.7`, `3.10`; rejects `3`, `3.7.1`, `py3.7`.
pub fn validate_python_version(version: &str) -> Result<()> {
    let parts: Vec<&str> = version.split('.').collect();
    let ok = parts.len() == 2
        && parts
            .iter()
            .all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()));
    if ok {
        Ok(())
    } else {
        Err(EnvError::InvalidPythonVersion(version.to_string()))
    }
}

/// A single provisioning step, ready to execute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvCommand {
    /// Stage name used in logs and the run ledger.
    pub label: String,
    pub program: String,
    pub args: Vec<String>,
}

impl EnvCommand {
    fn new(label: &str, program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            label: label.to_string(),
            program: program.into(),
            args,
        }
    }

    /// Shell-like rendering for plans and logs.
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// A conda environment rooted in a per-cell directory.
#[derive(Debug, Clone)]
pub struct CondaEnvironment {
    root: PathBuf,
    spec: CondaSpec,
}

impl CondaEnvironment {
    pub fn new(root: impl Into<PathBuf>, spec: CondaSpec) -> Result<Self> {
        spec.validate()?;
        Ok(Self {
            root: root.into(),
            spec,
        })
    }

    pub fn spec(&self) -> &CondaSpec {
        &self.spec
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Where the downloaded installer script is written.
    pub fn installer_path(&self) -> PathBuf {
        self.root.join("miniconda.sh")
    }

    /// Base conda installation prefix.
    pub fn conda_prefix(&self) -> PathBuf {
        self.root.join("conda")
    }

    /// Conda configuration file of this cell. Never the user's `~/.condarc`.
    pub fn condarc_path(&self) -> PathBuf {
        self.root.join(".condarc")
    }

    /// Prefix of the named environment.
    pub fn env_prefix(&self) -> PathBuf {
        self.conda_prefix().join("envs").join(&self.spec.env_name)
    }

    fn conda_bin(&self) -> String {
        self.conda_prefix()
            .join("bin")
            .join("conda")
            .to_string_lossy()
            .into_owned()
    }

    /// Interpreter inside the named environment.
    pub fn python_path(&self) -> PathBuf {
        self.env_prefix().join("bin").join("python")
    }

    fn env_python(&self) -> String {
        self.python_path().to_string_lossy().into_owned()
    }

    /// `bash <installer> -b -p <prefix>`
    pub fn bootstrap_command(&self) -> EnvCommand {
        EnvCommand::new(
            "conda-bootstrap",
            "bash",
            vec![
                self.installer_path().to_string_lossy().into_owned(),
                "-b".to_string(),
                "-p".to_string(),
                self.conda_prefix().to_string_lossy().into_owned(),
            ],
        )
    }

    /// Non-interactive conda: always answer yes, no prompt decoration.
    /// Written to the cell's own condarc.
    pub fn configure_command(&self) -> EnvCommand {
        let mut args = vec![
            "config".to_string(),
            "--file".to_string(),
            self.condarc_path().to_string_lossy().into_owned(),
        ];
        args.extend(
            ["--set", "always_yes", "yes", "--set", "changeps1", "no"]
                .iter()
                .map(|s| s.to_string()),
        );
        EnvCommand::new("conda-config", self.conda_bin(), args)
    }

    /// `conda create -q -n <env> python=<version>`
    pub fn create_command(&self) -> EnvCommand {
        EnvCommand::new(
            "conda-create",
            self.conda_bin(),
            vec![
                "create".to_string(),
                "-q".to_string(),
                "-n".to_string(),
                self.spec.env_name.clone(),
                format!("python={}", self.spec.python_version),
            ],
        )
    }

    /// `conda install -q -n <env> -c <channel>... <packages>`, or `None`
    /// when there is nothing to install from conda.
    pub fn install_dependencies_command(&self) -> Option<EnvCommand> {
        if self.spec.conda_packages.is_empty() {
            return None;
        }
        let mut args = vec![
            "install".to_string(),
            "-q".to_string(),
            "-n".to_string(),
            self.spec.env_name.clone(),
        ];
        for channel in &self.spec.channels {
            args.push("-c".to_string());
            args.push(channel.clone());
        }
        args.extend(self.spec.conda_packages.iter().cloned());
        Some(EnvCommand::new("conda-install-deps", self.conda_bin(), args))
    }

    /// `python -m pip install <tools>`, or `None` when no tools are listed.
    pub fn install_tools_command(&self) -> Option<EnvCommand> {
        if self.spec.pip_packages.is_empty() {
            return None;
        }
        let mut args = vec!["-m".to_string(), "pip".to_string(), "install".to_string()];
        args.extend(self.spec.pip_packages.iter().cloned());
        Some(EnvCommand::new("pip-install-tools", self.env_python(), args))
    }

    /// Install the package from the working directory.
    pub fn install_package_command(&self) -> EnvCommand {
        let mut args = vec!["-m".to_string(), "pip".to_string(), "install".to_string()];
        if self.spec.install_mode == InstallMode::Editable {
            args.push("-e".to_string());
        }
        args.push(".".to_string());
        EnvCommand::new("pip-install-package", self.env_python(), args)
    }

    /// Every command that runs after the installer is downloaded, in order.
    pub fn provisioning_commands(&self) -> Vec<EnvCommand> {
        let mut commands = vec![
            self.bootstrap_command(),
            self.configure_command(),
            self.create_command(),
        ];
        commands.extend(self.install_dependencies_command());
        commands.extend(self.install_tools_command());
        commands.push(self.install_package_command());
        commands
    }

    /// Variables that activate the environment for child processes:
    /// `PATH` (environment bin, then conda bin, then `base_path`),
    /// `CONDA_PREFIX`, `CONDA_DEFAULT_ENV` and `CONDARC` (the cell's config).
    pub fn activation_vars(&self, base_path: &str) -> Vec<(String, String)> {
        let env_bin = self.env_prefix().join("bin");
        let conda_bin = self.conda_prefix().join("bin");
        let mut path = format!("{}:{}", env_bin.display(), conda_bin.display());
        if !base_path.is_empty() {
            path.push(':');
            path.push_str(base_path);
        }
        vec![
            ("PATH".to_string(), path),
            (
                "CONDA_PREFIX".to_string(),
                self.env_prefix().to_string_lossy().into_owned(),
            ),
            ("CONDA_DEFAULT_ENV".to_string(), self.spec.env_name.clone()),
            (
                "CONDARC".to_string(),
                self.condarc_path().to_string_lossy().into_owned(),
            ),
        ]
    }

    /// Create the root directory.
    pub async fn prepare(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.root).await?;
        debug!(root = %self.root.display(), "Environment root prepared");
        Ok(())
    }

    /// Remove the whole root. A root that is already gone is not an error.
    pub async fn discard(&self) -> Result<()> {
        match tokio::fs::remove_dir_all(&self.root).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => {
                warn!(root = %self.root.display(), error = %e, "Failed to discard environment");
                Err(e.into())
            }
        }
    }
}
