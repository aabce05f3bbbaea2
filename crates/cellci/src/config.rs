//! Pipeline configuration (`cellci.toml`).
//!
//! Every field has a default matching the reference `weather` pipeline, so
//! an empty file (or no file at all) describes it. Secrets never appear
//! here; only the names of the environment variables that hold them.

use std::path::{Path, PathBuf};

use conda_env_manager::{CondaSpec, InstallMode, DEFAULT_INSTALLER_URL};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::matrix::{Architecture, BuildMatrix, PythonVersion};

/// Default config file name, looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "cellci.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PipelineConfig {
    pub package: PackageConfig,
    pub matrix: MatrixConfig,
    pub environment: EnvironmentConfig,
    pub test: TestConfig,
    pub coverage: CoverageConfig,
    pub publish: PublishConfig,
    pub ledger: LedgerSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PackageConfig {
    /// Importable package name; also the coverage scope directory.
    pub name: String,
    /// Distribution (project) name on the index, when it differs from `name`.
    pub distribution: Option<String>,
}

impl Default for PackageConfig {
    fn default() -> Self {
        Self {
            name: "weather".to_string(),
            distribution: None,
        }
    }
}

impl PackageConfig {
    /// Project name artifacts must carry to be published.
    pub fn distribution_name(&self) -> &str {
        self.distribution.as_deref().unwrap_or(&self.name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MatrixConfig {
    pub architectures: Vec<String>,
    pub python_versions: Vec<String>,
    /// Maximum concurrently running cells; 0 means one slot per cell.
    ///
    /// Cells share the workspace as their working directory. Coverage data,
    /// sdist metadata and dist output go to per-cell paths, but a standard
    /// `pip install .` still builds in-tree; set this to 1 for packages whose
    /// build backend writes `build/` into the source tree.
    pub max_parallel: usize,
}

impl Default for MatrixConfig {
    fn default() -> Self {
        Self {
            architectures: vec!["amd64".to_string(), "arm64".to_string()],
            python_versions: vec!["3.6".to_string(), "3.7".to_string()],
            max_parallel: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EnvironmentConfig {
    /// Version-pinned installer URL with an `{arch}` placeholder.
    pub installer_url: String,
    pub env_name: String,
    pub channels: Vec<String>,
    pub conda_packages: Vec<String>,
    pub pip_packages: Vec<String>,
    pub install_mode: InstallMode,
    /// Per-cell roots are created below this directory (relative to the
    /// workspace unless absolute).
    pub work_dir: PathBuf,
    /// Keep cell environments after the run instead of discarding them.
    pub keep_environments: bool,
    pub timeout_secs: u64,
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            installer_url: DEFAULT_INSTALLER_URL.to_string(),
            env_name: "test-environment".to_string(),
            channels: vec!["statkraft".to_string()],
            conda_packages: vec!["shyft".to_string()],
            pip_packages: vec!["coveralls".to_string(), "pytest-cov".to_string()],
            install_mode: InstallMode::Standard,
            work_dir: PathBuf::from(".cellci/cells"),
            keep_environments: false,
            timeout_secs: 1800,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TestConfig {
    /// Test path handed to pytest; defaults to the package directory.
    pub path: Option<String>,
    pub extra_args: Vec<String>,
    /// 0 falls back to the environment timeout.
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CoverageConfig {
    /// Upload to the aggregation service (measurement always happens).
    pub upload: bool,
    pub endpoint: String,
    pub service_name: String,
    pub repo_token_env: String,
}

impl Default for CoverageConfig {
    fn default() -> Self {
        Self {
            upload: true,
            endpoint: "https://coveralls.io/api/v1/jobs".to_string(),
            service_name: "cellci".to_string(),
            repo_token_env: "COVERALLS_REPO_TOKEN".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PublishConfig {
    pub enabled: bool,
    /// The only branch that publishes.
    pub branch: String,
    /// Trigger events that may publish.
    pub events: Vec<String>,
    pub repository_url: String,
    pub username: String,
    pub token_env: String,
    /// Distribution build; `{python}`, `{dist_dir}` and `{build_dir}` (the
    /// cell's own build directory) are substituted.
    pub build_command: Vec<String>,
    pub timeout_secs: u64,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            branch: "master".to_string(),
            events: cellci_core::publish_gate::DEFAULT_PUBLISH_EVENTS
                .iter()
                .map(|e| e.to_string())
                .collect(),
            repository_url: "https://upload.pypi.org/legacy/".to_string(),
            username: "__token__".to_string(),
            token_env: "PYPI_TOKEN".to_string(),
            build_command: [
                "{python}",
                "setup.py",
                "egg_info",
                "--egg-base",
                "{build_dir}",
                "sdist",
                "--dist-dir",
                "{dist_dir}",
            ]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            timeout_secs: 600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LedgerSettings {
    /// Explicit SurrealDB URL (`mem://`, `ws://...`); overrides `SURREALDB_*`.
    pub url: Option<String>,
    /// Local database directory used when nothing else is configured.
    pub dir: PathBuf,
}

impl Default for LedgerSettings {
    fn default() -> Self {
        Self {
            url: None,
            dir: PathBuf::from(".cellci/db"),
        }
    }
}

impl PipelineConfig {
    /// Parse TOML text.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Read and parse a config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text)
    }

    /// Load `path` if it exists, otherwise the defaults.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            Self::load(path)
        } else {
            tracing::debug!(path = %path.display(), "No config file, using defaults");
            Ok(Self::default())
        }
    }

    /// Check every field; all problems are reported together.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        if self.package.name.trim().is_empty() {
            errors.push("package.name: must not be empty".to_string());
        }
        if self.matrix.architectures.is_empty() {
            errors.push("matrix.architectures: must not be empty".to_string());
        }
        if self.matrix.python_versions.is_empty() {
            errors.push("matrix.python_versions: must not be empty".to_string());
        }
        for arch in &self.matrix.architectures {
            if let Err(e) = arch.parse::<Architecture>() {
                errors.push(format!("matrix.architectures: {e}"));
            }
        }
        for version in &self.matrix.python_versions {
            if let Err(e) = version.parse::<PythonVersion>() {
                errors.push(format!("matrix.python_versions: {e}"));
            }
        }
        if !self.environment.installer_url.contains("{arch}") {
            errors.push("environment.installer_url: missing {arch} placeholder".to_string());
        }
        if self.environment.env_name.trim().is_empty() {
            errors.push("environment.env_name: must not be empty".to_string());
        }
        if self.publish.enabled {
            if self.publish.branch.trim().is_empty() {
                errors.push("publish.branch: must not be empty".to_string());
            }
            if self.publish.build_command.is_empty() {
                errors.push("publish.build_command: must not be empty".to_string());
            }
            if self.publish.token_env.trim().is_empty() {
                errors.push("publish.token_env: must not be empty".to_string());
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(errors))
        }
    }

    /// Expand the matrix axes. Call after [`validate`](Self::validate).
    pub fn build_matrix(&self) -> Result<BuildMatrix, ConfigError> {
        let archs = self
            .matrix
            .architectures
            .iter()
            .map(|a| a.parse::<Architecture>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| ConfigError::Invalid(vec![e]))?;
        let pythons = self
            .matrix
            .python_versions
            .iter()
            .map(|v| v.parse::<PythonVersion>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| ConfigError::Invalid(vec![e]))?;
        Ok(BuildMatrix::expand(&archs, &pythons))
    }

    /// Conda spec for one interpreter version.
    pub fn conda_spec(&self, python: &PythonVersion) -> CondaSpec {
        CondaSpec {
            env_name: self.environment.env_name.clone(),
            python_version: python.to_string(),
            channels: self.environment.channels.clone(),
            conda_packages: self.environment.conda_packages.clone(),
            pip_packages: self.environment.pip_packages.clone(),
            install_mode: self.environment.install_mode,
        }
    }

    /// Test path, defaulting to the package directory.
    pub fn test_path(&self) -> &str {
        self.test.path.as_deref().unwrap_or(&self.package.name)
    }

    pub fn test_timeout_secs(&self) -> u64 {
        if self.test.timeout_secs == 0 {
            self.environment.timeout_secs
        } else {
            self.test.timeout_secs
        }
    }

    /// Root directory for cell environments.
    pub fn work_dir(&self, workspace: &Path) -> PathBuf {
        if self.environment.work_dir.is_absolute() {
            self.environment.work_dir.clone()
        } else {
            workspace.join(&self.environment.work_dir)
        }
    }

    pub fn max_parallel(&self, cells: usize) -> usize {
        if self.matrix.max_parallel == 0 {
            cells.max(1)
        } else {
            self.matrix.max_parallel
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_describe_reference_pipeline() {
        let config = PipelineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.package.name, "weather");
        assert_eq!(config.build_matrix().unwrap().len(), 4);
        assert_eq!(config.publish.branch, "master");
        assert_eq!(config.environment.install_mode, InstallMode::Standard);
        assert_eq!(config.test_path(), "weather");
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let config = PipelineConfig::from_toml(
            r#"
            [package]
            name = "mypkg"

            [matrix]
            python_versions = ["3.7"]

            [environment]
            install_mode = "editable"
            "#,
        )
        .unwrap();
        assert_eq!(config.package.name, "mypkg");
        assert_eq!(config.matrix.architectures.len(), 2);
        assert_eq!(config.build_matrix().unwrap().len(), 2);
        assert_eq!(config.environment.install_mode, InstallMode::Editable);
        assert_eq!(config.environment.channels, vec!["statkraft"]);
    }

    #[test]
    fn distribution_defaults_to_package_name() {
        let config = PipelineConfig::default();
        assert_eq!(config.package.distribution_name(), "weather");

        let config = PipelineConfig::from_toml(
            "[package]\nname = \"weather\"\ndistribution = \"my_weather\"",
        )
        .unwrap();
        assert_eq!(config.package.distribution_name(), "my_weather");
        assert_eq!(config.test_path(), "weather");
    }

    #[test]
    fn weather_demo_config_parses() {
        let config =
            PipelineConfig::from_toml(include_str!("../../../demos/weather/cellci.toml")).unwrap();
        config.validate().unwrap();
        assert_eq!(config.package.distribution_name(), "my_weather");
        assert_eq!(config.build_matrix().unwrap().len(), 4);
        assert_eq!(config.environment.channels, vec!["statkraft"]);
    }

    #[test]
    fn validate_collects_all_errors() {
        let mut config = PipelineConfig::default();
        config.package.name = "".to_string();
        config.matrix.architectures = vec!["sparc".to_string()];
        config.matrix.python_versions = vec!["3.7.1".to_string()];
        let err = config.validate().unwrap_err();
        match err {
            ConfigError::Invalid(errors) => assert_eq!(errors.len(), 3),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn empty_matrix_rejected() {
        let mut config = PipelineConfig::default();
        config.matrix.python_versions.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn unknown_field_type_is_parse_error() {
        let err = PipelineConfig::from_toml("[matrix]\nmax_parallel = \"lots\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn load_or_default_without_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = PipelineConfig::load_or_default(&dir.path().join("cellci.toml")).unwrap();
        assert_eq!(config, PipelineConfig::default());
    }

    #[test]
    fn max_parallel_zero_means_all_cells() {
        let config = PipelineConfig::default();
        assert_eq!(config.max_parallel(4), 4);
        assert_eq!(config.max_parallel(0), 1);
    }
}
