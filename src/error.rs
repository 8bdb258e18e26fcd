//! Pipeline Error Types
//!
//! A single error enum shared by the controller, the workers and the
//! scheduler adapters.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors raised by the pipeline engine.
///
/// Per-sample failures are not errors: they are recorded in the run log
/// and only surface in the final status table.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to (de)serialize run context: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Failed to parse pipeline YAML: {0}. Check the file format.")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid configuration:\n{0}")]
    Config(String),

    #[error("Input file role '{0}' does not exist")]
    UnknownInputRole(String),

    #[error("Step '{0}' is not part of this pipeline")]
    UnknownStep(String),

    #[error("Sample index {index} out of range ({count} samples)")]
    SampleOutOfRange { index: usize, count: usize },

    #[error("Step '{step}' failed for sample '{sample}': {reason}")]
    StepFailed {
        step: String,
        sample: String,
        reason: String,
    },

    #[error("Scheduler error: {0}")]
    Scheduler(String),

    #[error("Every sample failed step '{flag}' - stopping the pipeline")]
    AllSamplesFailed { flag: String },

    #[error("Timed out after {waited:?} waiting for batch '{batch_id}'")]
    WaitTimeout { batch_id: String, waited: Duration },

    #[error("Cancelled while waiting for batch '{0}'")]
    Cancelled(String),

    #[error("Run aborted: {0}")]
    Aborted(String),
}

impl PipelineError {
    /// Wraps an I/O error together with the path it happened on.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_mentions_path() {
        let err = PipelineError::io(
            "/data/results/main.log",
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        );
        let msg = err.to_string();
        assert!(msg.contains("/data/results/main.log"));
        assert!(msg.contains("gone"));
    }

    #[test]
    fn test_all_failed_names_flag() {
        let err = PipelineError::AllSamplesFailed {
            flag: "align_fastq_files".to_string(),
        };
        assert!(err.to_string().contains("align_fastq_files"));
    }
}
