//! Aggregate Run Log
//!
//! Free-text log at `results/main.log`. Two kinds of lines are read back:
//! `<flag> successful!` (the step is complete for every sample and may be
//! skipped on resume) and `<flag>: error in samples <names>`.
//!
//! Every line carries a `[timestamp] ` prefix which the reader strips
//! before comparing whole lines.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Local;
use log::info;

use crate::error::{PipelineError, Result};

const SUCCESS_SUFFIX: &str = " successful!";
const ERROR_MARKER: &str = "error in samples ";
const SEPARATOR: &str = "++++++++++++++++++++++++++++";

/// Append-only aggregate log of a run.
#[derive(Debug, Clone)]
pub struct MainLog {
    path: PathBuf,
}

impl MainLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends a message and mirrors it to the application log.
    pub fn write(&self, message: &str) -> Result<()> {
        info!("{}", message);
        self.append_line(message)
    }

    /// Records that every sample completed a step.
    pub fn record_success(&self, flag: &str) -> Result<()> {
        self.write(&format!("{}{}", flag, SUCCESS_SUFFIX))
    }

    /// Records the samples that did not complete a step.
    pub fn record_failures(&self, flag: &str, stubs: &[&str]) -> Result<()> {
        self.write(&format!("{}: {}{}", flag, ERROR_MARKER, stubs.join(";")))
    }

    /// Closes the section of a dispatched step.
    pub fn separator(&self) -> Result<()> {
        self.append_line(SEPARATOR)
    }

    /// True if the log records `flag` as successful exactly once.
    ///
    /// A missing log means nothing has finished yet.
    pub fn is_step_finished(&self, flag: &str) -> bool {
        let Ok(content) = fs::read_to_string(&self.path) else {
            return false;
        };

        let sentinel = format!("{}{}", flag, SUCCESS_SUFFIX);
        content
            .lines()
            .map(strip_timestamp)
            .filter(|line| *line == sentinel)
            .count()
            == 1
    }

    fn append_line(&self, message: &str) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| PipelineError::io(parent, e))?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| PipelineError::io(&self.path, e))?;

        let stamp = Local::now().format("%Y-%m-%d %H:%M:%S");
        writeln!(file, "[{}] {}", stamp, message).map_err(|e| PipelineError::io(&self.path, e))
    }
}

/// Removes the `[timestamp] ` prefix of a log line.
fn strip_timestamp(line: &str) -> &str {
    let line = line.trim();
    line.strip_prefix('[')
        .and_then(|rest| rest.split_once("] "))
        .map(|(_, message)| message.trim())
        .unwrap_or(line)
}
