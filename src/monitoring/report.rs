//! Run Reports
//!
//! Renders the run-log matrix once a run ends, whether it succeeded or
//! halted:
//! - a pass/fail table on the terminal
//! - `report/run_log.tsv`
//! - `deliverables/sample_info.txt`, the sample sheet restricted to the
//!   samples that passed the last step

use std::fs;
use std::path::{Path, PathBuf};

use colored::Colorize;
use log::info;

use crate::error::{PipelineError, Result};
use crate::workflow::{PipelineConfig, RunContext};

const PASS: &str = "✔";
const FAIL: &str = "✘";

/// Files written by [`write_reports`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportFiles {
    pub run_log: PathBuf,
    pub sample_info: PathBuf,
}

/// Renders the run log as a colored table, one row per step.
pub fn status_table(context: &RunContext) -> String {
    let stubs = context.stubs();
    let flag_width = context
        .run_log()
        .rows()
        .iter()
        .map(|r| r.flag.len())
        .max()
        .unwrap_or(0)
        .max("step".len());
    let widths: Vec<usize> = stubs.iter().map(|s| s.chars().count().max(1)).collect();

    let mut output = format!("{:flag_width$}", "step".bold());
    for (stub, width) in stubs.iter().zip(&widths) {
        output.push_str(&format!("  {:width$}", stub.bold(), width = *width));
    }
    output.push('\n');

    for row in context.run_log().rows() {
        output.push_str(&format!("{:flag_width$}", row.flag));
        for (passed, width) in row.passed.iter().zip(&widths) {
            let cell = if *passed {
                PASS.green()
            } else {
                FAIL.red()
            };
            output.push_str(&format!("  {:width$}", cell, width = *width));
        }
        output.push('\n');
    }

    output
}

/// Renders the run log as tab-separated text with a `1`/`0` per sample.
pub fn run_log_tsv(context: &RunContext) -> String {
    let mut output = String::from("step");
    for stub in context.stubs() {
        output.push('\t');
        output.push_str(stub);
    }
    output.push('\n');

    for row in context.run_log().rows() {
        output.push_str(&row.flag);
        for passed in &row.passed {
            output.push_str(if *passed { "\t1" } else { "\t0" });
        }
        output.push('\n');
    }

    output
}

/// Sample sheet lines of the samples that passed the last step.
///
/// The header line is kept; blank lines are dropped the same way the sheet
/// parser drops them.
pub fn sample_info(context: &RunContext, sheet: &str, header: bool) -> String {
    let mut output = String::new();
    let mut lines = sheet.lines();

    if header {
        if let Some(line) = lines.next() {
            output.push_str(line);
            output.push('\n');
        }
    }

    let samples = lines.filter(|line| !line.trim().is_empty());
    for (index, line) in samples.enumerate() {
        if context.run_log().passed_last(index) {
            output.push_str(line);
            output.push('\n');
        }
    }

    output
}

/// Writes the report files and prints the status table.
pub fn write_reports(context: &RunContext, config: &PipelineConfig) -> Result<ReportFiles> {
    let paths = context.paths();

    let run_log = paths.report_dir().join("run_log.tsv");
    write_file(&run_log, &run_log_tsv(context))?;

    let sheet = fs::read_to_string(&config.samples).map_err(|e| PipelineError::io(&config.samples, e))?;
    let sample_info_path = paths.deliverables_dir().join("sample_info.txt");
    write_file(
        &sample_info_path,
        &sample_info(context, &sheet, config.sample_header),
    )?;

    println!();
    println!("{}", status_table(context));
    info!("Run log written to {}", run_log.display());

    Ok(ReportFiles {
        run_log,
        sample_info: sample_info_path,
    })
}

fn write_file(path: &Path, content: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| PipelineError::io(parent, e))?;
    }
    fs::write(path, content).map_err(|e| PipelineError::io(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::{Sample, SamplePaths, Step};
    use tempfile::tempdir;

    fn context(dir: &Path) -> (RunContext, PipelineConfig) {
        let sheet = dir.join("samples.txt");
        fs::write(&sheet, "file\tname\n/raw/a.fq\tA\n\n/raw/b.fq\tB\n/raw/c.fq\tC\n").unwrap();

        let mut config = PipelineConfig::new(dir, &sheet)
            .with_step(Step::new("trim", "raw_files").with_output("fastq_files"));
        config.sample_header = true;

        let samples = ["A", "B", "C"]
            .iter()
            .map(|s| Sample::new(*s, SamplePaths::single(format!("/raw/{}.fq", s))))
            .collect();
        let mut ctx = RunContext::new(&config, samples);
        ctx.run_log_mut().push("trim_raw_files", vec![true, false, true]);
        (ctx, config)
    }

    #[test]
    fn test_run_log_tsv() {
        let temp_dir = tempdir().unwrap();
        let (ctx, _) = context(temp_dir.path());

        assert_eq!(
            run_log_tsv(&ctx),
            "step\tA\tB\tC\nraw\t1\t1\t1\ntrim_raw_files\t1\t0\t1\n"
        );
    }

    #[test]
    fn test_sample_info_keeps_passing_samples() {
        let temp_dir = tempdir().unwrap();
        let (ctx, config) = context(temp_dir.path());
        let sheet = fs::read_to_string(&config.samples).unwrap();

        assert_eq!(
            sample_info(&ctx, &sheet, true),
            "file\tname\n/raw/a.fq\tA\n/raw/c.fq\tC\n"
        );
    }

    #[test]
    fn test_status_table_lists_every_row() {
        let temp_dir = tempdir().unwrap();
        let (ctx, _) = context(temp_dir.path());

        colored::control::set_override(false);
        let table = status_table(&ctx);
        let lines: Vec<&str> = table.lines().collect();

        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("step"));
        assert!(lines[2].starts_with("trim_raw_files"));
        assert_eq!(lines[2].matches(FAIL).count(), 1);
        assert_eq!(lines[1].matches(PASS).count(), 3);
    }

    #[test]
    fn test_write_reports() {
        let temp_dir = tempdir().unwrap();
        let (ctx, config) = context(temp_dir.path());

        let files = write_reports(&ctx, &config).unwrap();
        assert_eq!(files.run_log, temp_dir.path().join("report/run_log.tsv"));
        assert!(files.run_log.exists());
        assert!(fs::read_to_string(files.sample_info)
            .unwrap()
            .contains("/raw/c.fq\tC"));
    }
}
