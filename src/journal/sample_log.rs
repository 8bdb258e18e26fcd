//! Per-Sample Durable Log
//!
//! Append-only text log, one per sample, at `results/log/<stub>.log`.
//! Workers write:
//!
//! ```text
//! STARTING trim_raw_files
//! ENDING trim_raw_files | /data/run1/results/trim/A.fastq
//!
//! ```
//!
//! An ENDING line is the only proof that a step finished for the sample.
//! Lines are parsed into [`LogEvent`]s and folded into a [`SampleHistory`];
//! nothing here searches for substrings.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use log::debug;

use crate::error::{PipelineError, Result};
use crate::workflow::RunPaths;

const STARTING: &str = "STARTING";
const ENDING: &str = "ENDING";

/// One parsed line of a durable log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogEvent {
    Started { flag: String },
    Ended { flag: String, payload: String },
    /// Free text (skip notices, warnings written by workers)
    Note(String),
}

impl LogEvent {
    /// Parses a log line; blank lines yield `None`.
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }

        if let Some(rest) = strip_marker(line, ENDING) {
            if let Some((flag, payload)) = rest.split_once('|') {
                let flag = flag.trim();
                if !flag.is_empty() {
                    return Some(Self::Ended {
                        flag: flag.to_string(),
                        payload: payload.trim().to_string(),
                    });
                }
            }
        } else if let Some(rest) = strip_marker(line, STARTING) {
            let flag = rest.trim_end_matches('|').trim();
            if !flag.is_empty() {
                return Some(Self::Started {
                    flag: flag.to_string(),
                });
            }
        }

        Some(Self::Note(line.to_string()))
    }

    /// Renders the event as log text, including the trailing newline(s).
    pub fn render(&self) -> String {
        match self {
            Self::Started { flag } => format!("{} {}\n", STARTING, flag),
            Self::Ended { flag, payload } => format!("{} {} | {}\n\n", ENDING, flag, payload),
            Self::Note(text) => format!("{}\n", text),
        }
    }
}

/// Returns the text after `marker ` if the line starts with it.
fn strip_marker<'a>(line: &'a str, marker: &str) -> Option<&'a str> {
    line.strip_prefix(marker)
        .filter(|rest| rest.starts_with(char::is_whitespace))
}

/// Folded markers of one flag.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlagHistory {
    pub starts: usize,
    pub endings: Vec<String>,
}

/// Current state of a sample, folded from its log events.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SampleHistory {
    flags: HashMap<String, FlagHistory>,
}

impl SampleHistory {
    /// Folds events into per-flag state.
    pub fn fold<I: IntoIterator<Item = LogEvent>>(events: I) -> Self {
        let mut history = Self::default();
        for event in events {
            match event {
                LogEvent::Started { flag } => {
                    history.flags.entry(flag).or_default().starts += 1;
                }
                LogEvent::Ended { flag, payload } => {
                    history.flags.entry(flag).or_default().endings.push(payload);
                }
                LogEvent::Note(_) => {}
            }
        }
        history
    }

    /// Parses and folds log text.
    pub fn from_text(text: &str) -> Self {
        Self::fold(text.lines().filter_map(LogEvent::parse))
    }

    /// True if any ENDING marker exists for the flag.
    pub fn has_ending(&self, flag: &str) -> bool {
        self.flags.get(flag).is_some_and(|h| !h.endings.is_empty())
    }

    /// True if the flag was started at least once.
    pub fn was_started(&self, flag: &str) -> bool {
        self.flags.get(flag).is_some_and(|h| h.starts > 0)
    }

    /// Payload of the unique ENDING marker of a flag.
    ///
    /// Returns `None` when there is no marker or more than one.
    pub fn completion(&self, flag: &str) -> Option<&str> {
        match self.flags.get(flag).map(|h| h.endings.as_slice()) {
            Some([payload]) => Some(payload.as_str()),
            _ => None,
        }
    }

    pub fn flag(&self, flag: &str) -> Option<&FlagHistory> {
        self.flags.get(flag)
    }
}

/// Handle on the durable log of one sample.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleLog {
    path: PathBuf,
}

impl SampleLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Log of a sample within a run layout.
    pub fn for_sample(paths: &RunPaths, stub: &str) -> Self {
        Self::new(paths.sample_log(stub))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Creates the log (and its directory) if it does not exist yet.
    pub fn ensure_exists(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| PipelineError::io(parent, e))?;
        }
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| PipelineError::io(&self.path, e))?;
        Ok(())
    }

    /// Reads the log.
    ///
    /// A missing or unreadable log yields an empty history: early failures
    /// must look like "not finished", never like an error.
    pub fn read(&self) -> SampleHistory {
        match fs::read_to_string(&self.path) {
            Ok(text) => SampleHistory::from_text(&text),
            Err(e) => {
                debug!("Treating log {} as empty: {}", self.path.display(), e);
                SampleHistory::default()
            }
        }
    }

    pub fn append_started(&self, flag: &str) -> Result<()> {
        self.append(&LogEvent::Started {
            flag: flag.to_string(),
        })
    }

    pub fn append_ended(&self, flag: &str, payload: &str) -> Result<()> {
        self.append(&LogEvent::Ended {
            flag: flag.to_string(),
            payload: payload.to_string(),
        })
    }

    pub fn append_note(&self, text: &str) -> Result<()> {
        self.append(&LogEvent::Note(text.to_string()))
    }

    fn append(&self, event: &LogEvent) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.exists()) {
            fs::create_dir_all(parent).map_err(|e| PipelineError::io(parent, e))?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| PipelineError::io(&self.path, e))?;
        file.write_all(event.render().as_bytes())
            .map_err(|e| PipelineError::io(&self.path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_parse_markers() {
        assert_eq!(
            LogEvent::parse("STARTING trim_raw_files"),
            Some(LogEvent::Started {
                flag: "trim_raw_files".to_string()
            })
        );
        assert_eq!(
            LogEvent::parse("ENDING trim_raw_files | a.fastq;b.fastq"),
            Some(LogEvent::Ended {
                flag: "trim_raw_files".to_string(),
                payload: "a.fastq;b.fastq".to_string()
            })
        );
        assert_eq!(
            LogEvent::parse("ENDING fastqc_raw_files | "),
            Some(LogEvent::Ended {
                flag: "fastqc_raw_files".to_string(),
                payload: String::new()
            })
        );
        assert_eq!(LogEvent::parse("   "), None);
    }

    #[test]
    fn test_parse_notes() {
        assert!(matches!(
            LogEvent::parse("trim_raw_files module already run on this file .. SKIPPING"),
            Some(LogEvent::Note(_))
        ));
        // ENDING without payload separator is not a completion marker
        assert!(matches!(
            LogEvent::parse("ENDING trim_raw_files"),
            Some(LogEvent::Note(_))
        ));
        // Marker must be a whole word
        assert!(matches!(
            LogEvent::parse("ENDINGtrim | x"),
            Some(LogEvent::Note(_))
        ));
    }

    #[test]
    fn test_render_parse_ending_keeps_blank_line() {
        let event = LogEvent::Ended {
            flag: "align_fastq_files".to_string(),
            payload: "/w/a.bam".to_string(),
        };
        assert_eq!(event.render(), "ENDING align_fastq_files | /w/a.bam\n\n");
        assert_eq!(LogEvent::parse(event.render().trim()), Some(event));
    }

    #[test]
    fn test_history_flags_are_not_prefix_matched() {
        let history = SampleHistory::from_text(
            "STARTING realign_fastq_files\nENDING realign_fastq_files | x.bam\n\n",
        );
        assert!(history.has_ending("realign_fastq_files"));
        assert!(!history.has_ending("align_fastq_files"));
        assert!(!history.was_started("align_fastq_files"));
    }

    #[test]
    fn test_completion_requires_unique_ending() {
        let once = SampleHistory::from_text("ENDING s_raw_files | a\n");
        assert_eq!(once.completion("s_raw_files"), Some("a"));

        let twice = SampleHistory::from_text("ENDING s_raw_files | a\nENDING s_raw_files | b\n");
        assert!(twice.has_ending("s_raw_files"));
        assert_eq!(twice.completion("s_raw_files"), None);
    }

    #[test]
    fn test_started_without_ending() {
        let history = SampleHistory::from_text("STARTING trim_raw_files\n");
        assert!(history.was_started("trim_raw_files"));
        assert!(!history.has_ending("trim_raw_files"));
        assert_eq!(history.flag("trim_raw_files").unwrap().starts, 1);
    }

    #[test]
    fn test_missing_log_reads_empty() {
        let log = SampleLog::new("/nonexistent/results/log/A.log");
        assert_eq!(log.read(), SampleHistory::default());
    }

    #[test]
    fn test_corrupt_log_reads_empty() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("A.log");
        fs::write(&path, [0xffu8, 0xfe, 0x00, 0x41]).unwrap();

        let log = SampleLog::new(&path);
        assert!(!log.read().has_ending("trim_raw_files"));
    }

    #[test]
    fn test_append_and_read_back() {
        let temp_dir = tempdir().unwrap();
        let paths = RunPaths::new(temp_dir.path());
        let log = SampleLog::for_sample(&paths, "A");

        log.ensure_exists().unwrap();
        assert!(log.path().exists());

        log.append_started("trim_raw_files").unwrap();
        log.append_ended("trim_raw_files", "a.fastq;b.fastq").unwrap();
        log.append_note("some note").unwrap();

        let text = fs::read_to_string(log.path()).unwrap();
        assert_eq!(
            text,
            "STARTING trim_raw_files\nENDING trim_raw_files | a.fastq;b.fastq\n\nsome note\n"
        );

        let history = log.read();
        assert_eq!(history.completion("trim_raw_files"), Some("a.fastq;b.fastq"));
    }

    #[test]
    fn test_ensure_exists_does_not_truncate() {
        let temp_dir = tempdir().unwrap();
        let log = SampleLog::new(temp_dir.path().join("log/A.log"));
        log.ensure_exists().unwrap();
        log.append_started("x_raw_files").unwrap();
        log.ensure_exists().unwrap();

        assert!(log.read().was_started("x_raw_files"));
    }
}
