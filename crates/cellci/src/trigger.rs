//! What started the run: event kind, branch, tag and commit.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Trigger event kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerEvent {
    Push,
    Cron,
    Tag,
    PullRequest,
    Manual,
}

impl TriggerEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerEvent::Push => "push",
            TriggerEvent::Cron => "cron",
            TriggerEvent::Tag => "tag",
            TriggerEvent::PullRequest => "pull_request",
            TriggerEvent::Manual => "manual",
        }
    }
}

impl fmt::Display for TriggerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TriggerEvent {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "push" => Ok(TriggerEvent::Push),
            "cron" | "schedule" => Ok(TriggerEvent::Cron),
            "tag" => Ok(TriggerEvent::Tag),
            "pull_request" | "pr" => Ok(TriggerEvent::PullRequest),
            "manual" | "api" => Ok(TriggerEvent::Manual),
            other => Err(format!("unknown trigger event '{other}'")),
        }
    }
}

/// Resolved trigger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trigger {
    pub event: TriggerEvent,
    pub branch: String,
    pub tag: Option<String>,
    pub sha: Option<String>,
}

/// Values given explicitly on the command line.
#[derive(Debug, Clone, Default)]
pub struct TriggerOverrides {
    pub event: Option<String>,
    pub branch: Option<String>,
    pub tag: Option<String>,
    pub sha: Option<String>,
}

/// Branch recorded when nothing names one (never the release branch).
pub const UNKNOWN_BRANCH: &str = "unknown";

impl Trigger {
    /// Resolve from overrides, then `CELLCI_*` process environment, then git.
    pub fn resolve(overrides: TriggerOverrides, workspace: &Path) -> anyhow::Result<Self> {
        Self::resolve_with(overrides, workspace, |name| std::env::var(name).ok())
    }

    /// [`resolve`](Self::resolve) with an explicit environment lookup.
    pub fn resolve_with<F>(
        overrides: TriggerOverrides,
        workspace: &Path,
        env: F,
    ) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let pick = |given: Option<String>, var: &str| {
            given.or_else(|| env(var)).filter(|v| !v.trim().is_empty())
        };

        let event = match pick(overrides.event, "CELLCI_EVENT") {
            Some(e) => e.parse::<TriggerEvent>().map_err(anyhow::Error::msg)?,
            None => TriggerEvent::Push,
        };

        let tag = pick(overrides.tag, "CELLCI_TAG");
        let in_repo = cellci_core::is_git_repo(workspace);

        let branch = match pick(overrides.branch, "CELLCI_BRANCH") {
            Some(b) => b,
            None if !in_repo => {
                warn!("Workspace is not a git checkout and no branch given; publishing disabled");
                UNKNOWN_BRANCH.to_string()
            }
            None => match cellci_core::current_branch(workspace) {
                Ok(b) => b,
                Err(e) => {
                    warn!(error = %e, "Could not determine branch; publishing disabled");
                    UNKNOWN_BRANCH.to_string()
                }
            },
        };

        let sha = pick(overrides.sha, "CELLCI_SHA")
            .or_else(|| in_repo.then(|| cellci_core::capture_head_sha(workspace).ok()).flatten());

        Ok(Self {
            event,
            branch,
            tag,
            sha,
        })
    }
}
