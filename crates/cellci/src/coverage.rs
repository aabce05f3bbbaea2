//! Coverage measurement and upload.
//!
//! The test stage writes a coverage.py JSON report. It is parsed here,
//! scoped to files under the package directory (tests and vendored code
//! elsewhere in the tree do not count), and handed to a [`CoverageSink`].

use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};

use crate::credential::SecretString;
use crate::error::CoverageError;

// ---------------------------------------------------------------------------
// coverage.py JSON report
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawReport {
    files: BTreeMap<String, RawFile>,
}

#[derive(Debug, Deserialize)]
struct RawFile {
    #[serde(default)]
    executed_lines: Vec<u32>,
    #[serde(default)]
    missing_lines: Vec<u32>,
    summary: RawSummary,
}

#[derive(Debug, Deserialize)]
struct RawSummary {
    covered_lines: u64,
    num_statements: u64,
    #[serde(default)]
    num_branches: u64,
    #[serde(default)]
    covered_branches: u64,
}

/// Coverage of one source file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileCoverage {
    /// Path relative to the workspace, `/`-separated.
    pub path: String,
    pub statements: u64,
    pub covered_statements: u64,
    pub branches: u64,
    pub covered_branches: u64,
    pub executed_lines: Vec<u32>,
    pub missing_lines: Vec<u32>,
    /// Hex MD5 of the source file, once read from the workspace.
    #[serde(default)]
    pub source_digest: Option<String>,
    /// Number of lines in the source file (0 until read).
    #[serde(default)]
    pub source_lines: u32,
}

/// Coverage scoped to one package.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoverageReport {
    pub package: String,
    pub files: Vec<FileCoverage>,
}

impl CoverageReport {
    /// Parse coverage.py JSON and keep only files under `<package>/`.
    ///
    /// Absolute paths below `workspace` are made relative first.
    pub fn from_json(
        text: &str,
        package: &str,
        workspace: Option<&Path>,
    ) -> Result<Self, CoverageError> {
        let raw: RawReport = serde_json::from_str(text)?;
        let prefix = format!("{}/", package.trim_end_matches('/'));

        let files = raw
            .files
            .into_iter()
            .filter_map(|(path, file)| {
                let path = normalize_path(&path, workspace);
                path.starts_with(&prefix).then(|| FileCoverage {
                    path,
                    statements: file.summary.num_statements,
                    covered_statements: file.summary.covered_lines,
                    branches: file.summary.num_branches,
                    covered_branches: file.summary.covered_branches,
                    executed_lines: file.executed_lines,
                    missing_lines: file.missing_lines,
                    source_digest: None,
                    source_lines: 0,
                })
            })
            .collect();

        Ok(Self {
            package: package.to_string(),
            files,
        })
    }

    /// Read and parse a report file.
    pub fn load(path: &Path, package: &str, workspace: Option<&Path>) -> Result<Self, CoverageError> {
        let text = std::fs::read_to_string(path).map_err(|source| CoverageError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&text, package, workspace)
    }

    /// Read every covered file below `workspace` and record its MD5 and
    /// line count.
    pub fn attach_sources(&mut self, workspace: &Path) -> Result<(), CoverageError> {
        for file in &mut self.files {
            let path = workspace.join(&file.path);
            let source = std::fs::read(&path).map_err(|source| CoverageError::Source {
                path: path.clone(),
                source,
            })?;
            file.source_digest = Some(hex::encode(Md5::digest(&source)));
            file.source_lines = source.split(|b| *b == b'\n').count() as u32
                - u32::from(source.ends_with(b"\n"));
        }
        Ok(())
    }

    pub fn statements(&self) -> u64 {
        self.files.iter().map(|f| f.statements).sum()
    }

    /// Percentage in `[0, 100]`, counting statements and branches the way
    /// coverage.py does. Nothing measurable counts as fully covered.
    pub fn percent(&self) -> f64 {
        let total: u64 = self.files.iter().map(|f| f.statements + f.branches).sum();
        let covered: u64 = self
            .files
            .iter()
            .map(|f| f.covered_statements.min(f.statements) + f.covered_branches.min(f.branches))
            .sum();
        if total == 0 {
            return 100.0;
        }
        (covered as f64 / total as f64 * 100.0).clamp(0.0, 100.0)
    }
}

fn normalize_path(path: &str, workspace: Option<&Path>) -> String {
    let mut p = path.replace('\\', "/");
    if let Some(ws) = workspace {
        let ws = ws.to_string_lossy().replace('\\', "/");
        let ws = ws.trim_end_matches('/');
        if !ws.is_empty() {
            if let Some(rest) = p.strip_prefix(ws) {
                p = rest.trim_start_matches('/').to_string();
            }
        }
    }
    while let Some(rest) = p.strip_prefix("./") {
        p = rest.to_string();
    }
    p
}

// ---------------------------------------------------------------------------
// Upload
// ---------------------------------------------------------------------------

/// Identity of the upload job.
#[derive(Debug, Clone)]
pub struct CoverageJob {
    pub service_name: String,
    /// Ledger run id of the cell.
    pub service_job_id: String,
    /// Cell id, so parallel cells are distinguishable.
    pub flag_name: String,
    pub git_sha: Option<String>,
    pub branch: String,
    pub repo_token: Option<SecretString>,
}

/// Coverage aggregation service.
#[async_trait]
pub trait CoverageSink: Send + Sync {
    async fn upload(&self, report: &CoverageReport, job: &CoverageJob)
        -> Result<(), CoverageError>;
}

/// Coveralls-compatible HTTP sink (`POST <endpoint>` with a `json_file` part).
pub struct HttpCoverageSink {
    endpoint: String,
    http_client: reqwest::Client,
}

impl HttpCoverageSink {
    pub fn new(endpoint: &str) -> Result<Self, CoverageError> {
        let http_client = reqwest::Client::builder()
            .user_agent(concat!("cellci/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            endpoint: endpoint.to_string(),
            http_client,
        })
    }
}

/// Build the job document: one entry per file with its source digest and a
/// per-line array (`1` executed, `0` missed, `null` not a statement).
///
/// Every file needs a digest; call [`CoverageReport::attach_sources`] first.
pub fn coveralls_payload(
    report: &CoverageReport,
    job: &CoverageJob,
) -> Result<serde_json::Value, CoverageError> {
    let mut source_files = Vec::with_capacity(report.files.len());
    for file in &report.files {
        let digest = file
            .source_digest
            .as_deref()
            .ok_or_else(|| CoverageError::MissingDigest {
                path: file.path.clone(),
            })?;
        let last = file
            .executed_lines
            .iter()
            .chain(file.missing_lines.iter())
            .copied()
            .max()
            .unwrap_or(0)
            .max(file.source_lines) as usize;
        let mut lines: Vec<Option<u32>> = vec![None; last];
        for &l in &file.missing_lines {
            if l > 0 {
                lines[l as usize - 1] = Some(0);
            }
        }
        for &l in &file.executed_lines {
            if l > 0 {
                lines[l as usize - 1] = Some(1);
            }
        }
        source_files.push(json!({
            "name": file.path,
            "source_digest": digest,
            "coverage": lines,
        }));
    }

    let mut payload = json!({
        "service_name": job.service_name,
        "service_job_id": job.service_job_id,
        "flag_name": job.flag_name,
        "source_files": source_files,
        "git": {
            "head": { "id": job.git_sha.clone().unwrap_or_default() },
            "branch": job.branch,
        },
    });
    if let Some(token) = &job.repo_token {
        payload["repo_token"] = json!(token.expose_secret());
    }
    Ok(payload)
}

#[async_trait]
impl CoverageSink for HttpCoverageSink {
    async fn upload(
        &self,
        report: &CoverageReport,
        job: &CoverageJob,
    ) -> Result<(), CoverageError> {
        let body = serde_json::to_vec(&coveralls_payload(report, job)?)?;
        let part = reqwest::multipart::Part::bytes(body)
            .file_name("coverage.json")
            .mime_str("application/json")?;
        let form = reqwest::multipart::Form::new().part("json_file", part);

        debug!(endpoint = %self.endpoint, files = report.files.len(), "Uploading coverage");
        let response = self
            .http_client
            .post(&self.endpoint)
            .multipart(form)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(CoverageError::Rejected {
                status: status.as_u16(),
                message: message.chars().take(200).collect(),
            });
        }
        info!(percent = report.percent(), "Coverage uploaded");
        Ok(())
    }
}
