//! Git integration utilities for capturing the triggering commit and branch.

use std::path::Path;
use std::process::Command;

use crate::domain::error::{CellciError, Result};

fn git_output(repo_dir: &Path, args: &[&str]) -> Result<String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(repo_dir)
        .output()
        .map_err(|e| CellciError::GitError(format!("failed to run git: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(CellciError::GitError(format!(
            "git {} failed: {}",
            args.join(" "),
            stderr.trim()
        )));
    }

    let value = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if value.is_empty() {
        return Err(CellciError::GitError(format!(
            "git {} returned empty output",
            args.join(" ")
        )));
    }
    Ok(value)
}

/// Capture the HEAD commit SHA (`git rev-parse HEAD`).
pub fn capture_head_sha(repo_dir: &Path) -> Result<String> {
    git_output(repo_dir, &["rev-parse", "HEAD"])
}

/// Current branch name. A detached HEAD is reported as an error, since a
/// detached checkout can never be the release branch.
pub fn current_branch(repo_dir: &Path) -> Result<String> {
    let branch = git_output(repo_dir, &["rev-parse", "--abbrev-ref", "HEAD"])?;
    if branch == "HEAD" {
        return Err(CellciError::GitError("HEAD is detached".to_string()));
    }
    Ok(branch)
}

/// Check whether a directory is inside a git work tree.
pub fn is_git_repo(dir: &Path) -> bool {
    Command::new("git")
        .args(["rev-parse", "--is-inside-work-tree"])
        .current_dir(dir)
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command as StdCommand;

    fn run_git(repo_dir: &Path, args: &[&str]) {
        let output = StdCommand::new("git")
            .args(args)
            .current_dir(repo_dir)
            .output()
            .unwrap();
        assert!(
            output.status.success(),
            "git {:?} failed: {}",
            args,
            String::from_utf8_lossy(&output.stderr)
        );
    }

    fn make_git_repo() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        run_git(dir.path(), &["init"]);
        run_git(dir.path(), &["config", "user.name", "test-user"]);
        run_git(dir.path(), &["config", "user.email", "test@example.com"]);
        run_git(dir.path(), &["checkout", "-b", "master"]);
        run_git(dir.path(), &["commit", "--allow-empty", "-m", "initial"]);
        dir
    }

    #[test]
    fn capture_head_sha_returns_40_hex_chars() {
        let repo = make_git_repo();
        let sha = capture_head_sha(repo.path()).unwrap();
        assert_eq!(sha.len(), 40, "SHA should be 40 hex chars, got: {sha}");
        assert!(sha.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn current_branch_reports_checked_out_branch() {
        let repo = make_git_repo();
        assert_eq!(current_branch(repo.path()).unwrap(), "master");
        run_git(repo.path(), &["checkout", "-b", "feature/x"]);
        assert_eq!(current_branch(repo.path()).unwrap(), "feature/x");
    }

    #[test]
    fn current_branch_rejects_detached_head() {
        let repo = make_git_repo();
        let sha = capture_head_sha(repo.path()).unwrap();
        run_git(repo.path(), &["checkout", "--detach", &sha]);
        assert!(current_branch(repo.path()).is_err());
    }

    #[test]
    fn capture_head_sha_fails_outside_repo() {
        let dir = tempfile::tempdir().unwrap();
        assert!(capture_head_sha(dir.path()).is_err());
    }

    #[test]
    fn is_git_repo_false_for_non_repo() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!is_git_repo(dir.path()));
    }
}
