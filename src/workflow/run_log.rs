//! Run-Log Matrix
//!
//! Step × sample success table. Drives which samples are dispatched to the
//! next step and is rendered as the final status report.

use serde::{Deserialize, Serialize};

use super::model::RAW_FLAG;
use crate::error::{PipelineError, Result};

/// One row of the run log: a step flag and one entry per sample.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct RunLogRow {
    pub flag: String,
    pub passed: Vec<bool>,
}

impl RunLogRow {
    /// Number of samples that passed this row.
    pub fn success_count(&self) -> usize {
        self.passed.iter().filter(|&&p| p).count()
    }

    /// True when no sample passed.
    pub fn all_failed(&self) -> bool {
        self.passed.iter().all(|p| !p)
    }
}

/// Append-only run log. Row 0 is always `raw` with every sample passing.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct RunLog {
    rows: Vec<RunLogRow>,
}

impl RunLog {
    /// Creates the log with its `raw` row.
    pub fn new(sample_count: usize) -> Self {
        Self {
            rows: vec![RunLogRow {
                flag: RAW_FLAG.to_string(),
                passed: vec![true; sample_count],
            }],
        }
    }

    /// Appends a row for a step.
    ///
    /// # Panics
    ///
    /// Panics in debug builds when the row width does not match the sample count.
    pub fn push(&mut self, flag: impl Into<String>, passed: Vec<bool>) {
        debug_assert_eq!(passed.len(), self.sample_count());
        self.rows.push(RunLogRow {
            flag: flag.into(),
            passed,
        });
    }

    /// Appends an all-true row, used for steps skipped on resume.
    pub fn push_all_passed(&mut self, flag: impl Into<String>) {
        let passed = vec![true; self.sample_count()];
        self.push(flag, passed);
    }

    pub fn rows(&self) -> &[RunLogRow] {
        &self.rows
    }

    pub fn last(&self) -> &RunLogRow {
        // Row 0 is created in `new` or checked by `validate`, and rows are never removed
        &self.rows[self.rows.len() - 1]
    }

    /// Whether a sample passed the most recent step.
    pub fn passed_last(&self, index: usize) -> bool {
        self.last().passed.get(index).copied().unwrap_or(false)
    }

    pub fn sample_count(&self) -> usize {
        self.rows[0].passed.len()
    }

    /// Number of rows, including the `raw` row.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Never true: the `raw` row always exists.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Checks a deserialized log: the first row is `raw` and every row
    /// has one entry per sample.
    pub fn validate(&self, sample_count: usize) -> Result<()> {
        let first = self
            .rows
            .first()
            .ok_or_else(|| PipelineError::Config("Run log has no rows".to_string()))?;
        if first.flag != RAW_FLAG {
            return Err(PipelineError::Config(format!(
                "Run log starts with '{}' instead of '{}'",
                first.flag, RAW_FLAG
            )));
        }

        if let Some(row) = self.rows.iter().find(|r| r.passed.len() != sample_count) {
            return Err(PipelineError::Config(format!(
                "Run log row '{}' has {} entries for {} samples",
                row.flag,
                row.passed.len(),
                sample_count
            )));
        }
        Ok(())
    }

    /// Finds the row of a step flag.
    pub fn row(&self, flag: &str) -> Option<&RunLogRow> {
        self.rows.iter().find(|r| r.flag == flag)
    }
}
