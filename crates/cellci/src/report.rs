//! Matrix-wide outcome.

use serde::{Deserialize, Serialize};

use crate::pipeline::{CellResult, PublishStatus};

/// Outcome of one cell: a finished run, or an error that kept the run from
/// being recorded at all (ledger unavailable, task panic).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CellOutcome {
    Finished(CellResult),
    Errored { cell_id: String, error: String },
}

impl CellOutcome {
    pub fn cell_id(&self) -> &str {
        match self {
            CellOutcome::Finished(result) => &result.cell_id,
            CellOutcome::Errored { cell_id, .. } => cell_id,
        }
    }

    pub fn success(&self) -> bool {
        matches!(self, CellOutcome::Finished(result) if result.success)
    }

    pub fn result(&self) -> Option<&CellResult> {
        match self {
            CellOutcome::Finished(result) => Some(result),
            CellOutcome::Errored { .. } => None,
        }
    }
}

/// Per-cell outcomes in matrix order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MatrixReport {
    pub cells: Vec<CellOutcome>,
    pub duration_ms: u64,
}

impl MatrixReport {
    /// Every cell's fatal stages passed.
    pub fn success(&self) -> bool {
        !self.cells.is_empty() && self.cells.iter().all(CellOutcome::success)
    }

    pub fn failed_cells(&self) -> Vec<&str> {
        self.cells
            .iter()
            .filter(|c| !c.success())
            .map(CellOutcome::cell_id)
            .collect()
    }

    /// Cells whose publish stage failed (reported, not fatal).
    pub fn publish_failures(&self) -> Vec<&str> {
        self.cells
            .iter()
            .filter_map(CellOutcome::result)
            .filter(|r| matches!(r.publish, PublishStatus::Failed { .. }))
            .map(|r| r.cell_id.as_str())
            .collect()
    }

    pub fn get(&self, cell_id: &str) -> Option<&CellOutcome> {
        self.cells.iter().find(|c| c.cell_id() == cell_id)
    }

    /// Fixed-width table, one row per cell.
    pub fn render_table(&self) -> String {
        let mut out = format!(
            "{:<12} {:<6} {:>7} {:>9} {:>9}  {}\n",
            "CELL", "STATUS", "STAGES", "COVERAGE", "TIME", "PUBLISH"
        );
        for cell in &self.cells {
            match cell {
                CellOutcome::Finished(r) => {
                    let coverage = r
                        .coverage_percent
                        .map(|p| format!("{p:.2}%"))
                        .unwrap_or_else(|| "-".to_string());
                    out.push_str(&format!(
                        "{:<12} {:<6} {:>7} {:>9} {:>8}s  {}\n",
                        r.cell_id,
                        if r.success { "ok" } else { "FAIL" },
                        format!("{}/{}", r.passed_count(), r.stages.len()),
                        coverage,
                        format!("{:.1}", r.duration_ms as f64 / 1000.0),
                        r.publish.summary(),
                    ));
                }
                CellOutcome::Errored { cell_id, error } => {
                    out.push_str(&format!(
                        "{:<12} {:<6} {:>7} {:>9} {:>9}  {}\n",
                        cell_id, "ERROR", "-", "-", "-", error
                    ));
                }
            }
        }
        out
    }
}
