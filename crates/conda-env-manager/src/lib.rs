//! conda-env-manager: per-cell conda provisioning for cellci
//!
//! Downloads a version-pinned bootstrap installer, renders the commands
//! that install conda, create the pinned interpreter environment and install
//! the package with its dependencies, and hashes the inputs so runs can be
//! compared.

pub mod bootstrap;
pub mod environment;
pub mod error;
pub mod hash;

pub use bootstrap::{
    installer_url, HttpInstallerSource, InstallerArch, InstallerSource, DEFAULT_INSTALLER_URL,
};
pub use environment::{
    validate_python_version, CondaEnvironment, CondaSpec, EnvCommand, InstallMode,
};
pub use error::EnvError;
pub use hash::{generate_environment_hash, EnvironmentHash, HashSource};

/// Result type for conda-env-manager operations
pub type Result<T> = std::result::Result<T, EnvError>;

/// Check whether `conda` is on PATH.
pub fn is_conda_available() -> bool {
    std::process::Command::new("conda")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}
