//! Run ledger selection.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use cellci_state::{LedgerConfig, RunLedger, SurrealRunLedger};
use tracing::debug;

use crate::config::LedgerSettings;

/// Where the ledger for `workspace` lives: `[ledger].url` if set, otherwise
/// `SURREALDB_*`, otherwise `[ledger].dir` under the workspace.
pub fn ledger_config(settings: &LedgerSettings, workspace: &Path) -> LedgerConfig {
    if let Some(url) = settings.url.as_deref().filter(|u| !u.trim().is_empty()) {
        return if url == "mem://" {
            LedgerConfig::Memory
        } else {
            LedgerConfig::Url(url.to_string())
        };
    }
    let dir = if settings.dir.is_absolute() {
        settings.dir.clone()
    } else {
        workspace.join(&settings.dir)
    };
    LedgerConfig::from_env(&dir)
}

/// Connect to the ledger for `workspace`.
pub async fn open_ledger(
    settings: &LedgerSettings,
    workspace: &Path,
) -> anyhow::Result<Arc<dyn RunLedger>> {
    let config = ledger_config(settings, workspace);
    match &config {
        LedgerConfig::Cloud { endpoint, .. } => debug!(endpoint = %endpoint, "Opening ledger"),
        LedgerConfig::Url(url) => debug!(url = %url, "Opening ledger"),
        LedgerConfig::Local(dir) => debug!(dir = %dir.display(), "Opening ledger"),
        LedgerConfig::Memory => debug!("Opening in-memory ledger"),
    }
    let ledger = SurrealRunLedger::connect(&config)
        .await
        .context("failed to open run ledger")?;
    Ok(Arc::new(ledger))
}
