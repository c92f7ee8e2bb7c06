//! Per-batch loss records and their serialization
//!
//! The CSV artifact has one header row and one row per batch, in the order
//! the batches were evaluated:
//!
//! ```text
//! batch_index,orig_loss,reconstr_loss,zero_loss
//! 0,2.3517,2.4102,7.9120
//! 1,2.2981,2.3630,7.8644
//! ```

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::error;

/// Column order of the CSV artifact
pub const CSV_HEADER: &str = "batch_index,orig_loss,reconstr_loss,zero_loss";

/// The three losses of one batch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LossRecord {
    pub batch_index: usize,
    pub orig_loss: f64,
    pub reconstr_loss: f64,
    pub zero_loss: f64,
}

/// Append-only, ordered collection of [`LossRecord`]s.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResultTable {
    records: Vec<LossRecord>,
}

impl ResultTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a record after all previously appended ones.
    pub fn append(&mut self, record: LossRecord) {
        self.records.push(record);
    }

    pub fn records(&self) -> &[LossRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Mean of one column, `None` for an empty table.
    pub fn mean_by(&self, column: impl Fn(&LossRecord) -> f64) -> Option<f64> {
        column_mean(&self.records, column)
    }

    /// Render the table as CSV text (header plus one line per record).
    pub fn to_csv_string(&self) -> String {
        let mut out = String::with_capacity(CSV_HEADER.len() + 1 + self.records.len() * 48);
        out.push_str(CSV_HEADER);
        out.push('\n');
        for r in &self.records {
            // Writing to a String cannot fail
            let _ = writeln!(
                out,
                "{},{},{},{}",
                r.batch_index, r.orig_loss, r.reconstr_loss, r.zero_loss
            );
        }
        out
    }

    /// Write the CSV artifact, creating parent directories as needed.
    pub fn write_csv(&self, path: &Path) -> Result<()> {
        create_parent(path)?;
        std::fs::write(path, self.to_csv_string())
            .with_context(|| format!("Failed to write {}", path.display()))
    }

    /// Write the same rows as a pretty-printed JSON array.
    /// Write the CSV for a finished or aborted run and hand back its outcome.
    ///
    /// When the run failed, a write failure is logged and the run's own error
    /// is returned.
    pub fn save_run<T>(&self, path: &Path, outcome: Result<T>) -> Result<T> {
        let written = self.write_csv(path);
        match outcome {
            Ok(value) => written.map(|()| value),
            Err(e) => {
                if let Err(write_err) = written {
                    error!("Could not save partial results: {write_err:#}");
                }
                Err(e)
            }
        }
    }

    pub fn write_json(&self, path: &Path) -> Result<()> {
        create_parent(path)?;
        let json = serde_json::to_string_pretty(&self.records)?;
        std::fs::write(path, json).with_context(|| format!("Failed to write {}", path.display()))
    }
}

/// Mean of one column over `records`, `None` when there are none.
pub fn column_mean(records: &[LossRecord], column: impl Fn(&LossRecord) -> f64) -> Option<f64> {
    if records.is_empty() {
        return None;
    }
    let total: f64 = records.iter().map(column).sum();
    Some(total / records.len() as f64)
}

/// `{output_dir}/{run_id}_batch_losses.csv`
pub fn csv_path(output_dir: &Path, run_id: &str) -> PathBuf {
    output_dir.join(format!("{run_id}_batch_losses.csv"))
}

/// `{output_dir}/{run_id}_batch_losses.json`
pub fn json_path(output_dir: &Path, run_id: &str) -> PathBuf {
    output_dir.join(format!("{run_id}_batch_losses.json"))
}

fn create_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    Ok(())
}
