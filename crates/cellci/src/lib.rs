//! cellci - matrix build, test and publish pipeline
//!
//! Runs a Python package through a matrix of architectures and interpreter
//! versions:
//! - Provisions an isolated conda environment per cell
//! - Runs the test suite with coverage scoped to the package
//! - Uploads coverage, and publishes from the release branch when every
//!   fatal stage passed
//! - Records every cell as a run in the ledger

pub mod config;
pub mod coverage;
pub mod credential;
pub mod error;
pub mod fakes;
pub mod gate;
pub mod ledger;
pub mod matrix;
pub mod orchestrator;
pub mod pipeline;
pub mod plan;
pub mod publish;
pub mod report;
pub mod runner;
pub mod spec;
pub mod stage;
pub mod trigger;

// Re-export key types
pub use config::{PipelineConfig, DEFAULT_CONFIG_FILE};
pub use coverage::{CoverageReport, CoverageSink, HttpCoverageSink};
pub use credential::{DeployToken, EnvSecretSource, SecretSource, SecretString};
pub use error::{ConfigError, CoverageError, CredentialError, PublishError};
pub use gate::{CiGate, GateVerdict};
pub use ledger::open_ledger;
pub use matrix::{Architecture, BuildMatrix, MatrixCell, PythonVersion};
pub use orchestrator::{CellJob, MatrixRunner};
pub use pipeline::{CellContext, CellPipeline, CellResult, CellServices, PublishStatus};
pub use plan::CellPlan;
pub use publish::{DistArtifact, HttpPackageIndex, PackageIndex, UploadOutcome};
pub use report::{CellOutcome, MatrixReport};
pub use runner::{CellRunner, ProcessEnv, StageResult};
pub use spec::CellSpec;
pub use stage::{Phase, StageAction, StageConfig};
pub use trigger::{Trigger, TriggerEvent, TriggerOverrides};
