//! Stage process execution.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Instant;

use cellci_core::Redactor;
use serde::{Deserialize, Serialize};
use tokio::process::Command;

use crate::stage::Phase;

/// Captured output is cut to this many trailing bytes per stream.
pub const OUTPUT_TAIL_BYTES: usize = 16 * 1024;

/// Result of a stage execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageResult {
    /// Stage name.
    pub stage_name: String,

    pub phase: Phase,

    /// Exit code (0 = success, -1 = did not run to completion).
    pub exit_code: i32,

    /// Captured stdout, redacted.
    pub stdout: String,

    /// Captured stderr, redacted.
    pub stderr: String,

    /// Duration in milliseconds.
    pub duration_ms: u64,

    /// Whether execution succeeded.
    pub success: bool,

    /// The stage never ran.
    pub skipped: bool,
}

impl StageResult {
    /// Whether this stage passed (exit code 0).
    pub fn passed(&self) -> bool {
        self.success && self.exit_code == 0 && !self.skipped
    }

    pub fn failed(&self) -> bool {
        !self.skipped && !self.passed()
    }

    /// An in-process stage that finished normally.
    pub fn ok(stage_name: &str, phase: Phase, stdout: String, duration_ms: u64) -> Self {
        Self {
            stage_name: stage_name.to_string(),
            phase,
            exit_code: 0,
            stdout,
            stderr: String::new(),
            duration_ms,
            success: true,
            skipped: false,
        }
    }

    /// A stage that could not run to completion (spawn error, timeout,
    /// in-process failure). `error` must already be redacted.
    pub fn error(stage_name: &str, phase: Phase, error: String, duration_ms: u64) -> Self {
        Self {
            stage_name: stage_name.to_string(),
            phase,
            exit_code: -1,
            stdout: String::new(),
            stderr: error,
            duration_ms,
            success: false,
            skipped: false,
        }
    }

    pub fn skipped(stage_name: &str, phase: Phase) -> Self {
        Self {
            stage_name: stage_name.to_string(),
            phase,
            exit_code: 0,
            stdout: String::new(),
            stderr: String::new(),
            duration_ms: 0,
            success: false,
            skipped: true,
        }
    }
}

/// Working directory and environment for every process in a cell.
#[derive(Debug, Clone, Default)]
pub struct ProcessEnv {
    pub cwd: PathBuf,
    pub vars: Vec<(String, String)>,
    /// Inherited variables withheld from children (secret holders).
    pub removed: Vec<String>,
}

/// Runs stage commands.
pub struct CellRunner;

impl CellRunner {
    /// Execute `command` and capture its output.
    ///
    /// Both streams are redacted and tail-truncated before they are returned.
    /// A timeout kills the child.
    pub async fn execute_command(
        stage_name: &str,
        phase: Phase,
        command: &[String],
        timeout_secs: u64,
        env: &ProcessEnv,
        redactor: &Redactor,
    ) -> anyhow::Result<StageResult> {
        let start = Instant::now();

        let Some((exe, args)) = command.split_first() else {
            anyhow::bail!("Stage {} has empty command", stage_name);
        };

        let mut cmd = Command::new(exe);
        cmd.args(args)
            .envs(env.vars.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for name in &env.removed {
            cmd.env_remove(name);
        }
        if !env.cwd.as_os_str().is_empty() {
            cmd.current_dir(&env.cwd);
        }
        let child = cmd.spawn()?;

        let output = if timeout_secs > 0 {
            tokio::time::timeout(
                std::time::Duration::from_secs(timeout_secs),
                child.wait_with_output(),
            )
            .await
            .map_err(|_| {
                anyhow::anyhow!(
                    "Stage {} timed out after {} seconds",
                    stage_name,
                    timeout_secs
                )
            })??
        } else {
            child.wait_with_output().await?
        };

        let duration_ms = start.elapsed().as_millis() as u64;
        let exit_code = output.status.code().unwrap_or(-1);
        let stdout = tail(&redactor.scrub(&String::from_utf8_lossy(&output.stdout)));
        let stderr = tail(&redactor.scrub(&String::from_utf8_lossy(&output.stderr)));

        Ok(StageResult {
            stage_name: stage_name.to_string(),
            phase,
            exit_code,
            stdout,
            stderr,
            duration_ms,
            success: output.status.success(),
            skipped: false,
        })
    }
}

/// Keep the last [`OUTPUT_TAIL_BYTES`] of `text`, on a char boundary.
fn tail(text: &str) -> String {
    if text.len() <= OUTPUT_TAIL_BYTES {
        return text.to_string();
    }
    let mut cut = text.len() - OUTPUT_TAIL_BYTES;
    while !text.is_char_boundary(cut) {
        cut += 1;
    }
    format!("...{}", &text[cut..])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cmd(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_stage_result_passed() {
        let result = StageResult::ok("pytest", Phase::Script, String::new(), 100);
        assert!(result.passed());
        assert!(!result.failed());
    }

    #[test]
    fn test_stage_result_failed() {
        let result = StageResult::error("pytest", Phase::Script, "boom".to_string(), 100);
        assert!(!result.passed());
        assert!(result.failed());
    }

    #[test]
    fn skipped_is_neither_passed_nor_failed() {
        let result = StageResult::skipped("publish", Phase::Deploy);
        assert!(!result.passed());
        assert!(!result.failed());
    }

    #[test]
    fn tail_keeps_end() {
        let long = "a".repeat(OUTPUT_TAIL_BYTES) + "END";
        let t = tail(&long);
        assert!(t.starts_with("..."));
        assert!(t.ends_with("END"));
    }

    #[tokio::test]
    async fn test_execute_simple_command() {
        let result = CellRunner::execute_command(
            "echo_test",
            Phase::Script,
            &cmd(&["echo", "hello"]),
            60,
            &ProcessEnv::default(),
            &Redactor::new(),
        )
        .await
        .expect("execute failed");
        assert!(result.success);
        assert_eq!(result.exit_code, 0);
        assert!(result.stdout.contains("hello"));
    }

    #[tokio::test]
    async fn test_execute_failing_command() {
        let result = CellRunner::execute_command(
            "false_test",
            Phase::Script,
            &cmd(&["false"]),
            60,
            &ProcessEnv::default(),
            &Redactor::new(),
        )
        .await
        .expect("execute failed");
        assert!(!result.success);
        assert_ne!(result.exit_code, 0);
    }

    #[tokio::test]
    async fn env_and_cwd_are_applied() {
        let dir = tempfile::tempdir().unwrap();
        let env = ProcessEnv {
            cwd: dir.path().to_path_buf(),
            vars: vec![("CELLCI_PYTHON_VERSION".to_string(), "3.7".to_string())],
            removed: vec!["HOME".to_string()],
        };
        let result = CellRunner::execute_command(
            "env",
            Phase::Setup,
            &cmd(&["sh", "-c", "echo $CELLCI_PYTHON_VERSION; echo home=${HOME:-none}; pwd -P"]),
            60,
            &env,
            &Redactor::new(),
        )
        .await
        .unwrap();
        assert!(result.stdout.contains("3.7"));
        assert!(result.stdout.contains("home=none"));
        let cwd = dir.path().canonicalize().unwrap();
        assert!(result.stdout.contains(cwd.to_str().unwrap()));
    }

    #[tokio::test]
    async fn output_is_redacted() {
        let mut redactor = Redactor::new();
        redactor.register_secret("hunter2hunter2");
        let result = CellRunner::execute_command(
            "leak",
            Phase::Script,
            &cmd(&["sh", "-c", "echo token=hunter2hunter2; echo hunter2hunter2 >&2"]),
            60,
            &ProcessEnv::default(),
            &redactor,
        )
        .await
        .unwrap();
        assert!(!result.stdout.contains("hunter2hunter2"));
        assert!(!result.stderr.contains("hunter2hunter2"));
    }

    #[tokio::test]
    async fn timeout_is_an_error() {
        let result = CellRunner::execute_command(
            "sleepy",
            Phase::Script,
            &cmd(&["sleep", "5"]),
            1,
            &ProcessEnv::default(),
            &Redactor::new(),
        )
        .await;
        let err = result.unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn empty_command_rejected() {
        let result = CellRunner::execute_command(
            "empty",
            Phase::Script,
            &[],
            60,
            &ProcessEnv::default(),
            &Redactor::new(),
        )
        .await;
        assert!(result.is_err());
    }
}
