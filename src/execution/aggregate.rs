//! Outcome Aggregation
//!
//! After a batch is done, the durable log of every sample decides whether
//! the sample passed the step. The result becomes a new run-log row, the
//! output role is updated from the ENDING payloads and a summary line is
//! written to the aggregate log.

use log::warn;

use crate::error::{PipelineError, Result};
use crate::journal::{MainLog, SampleLog};
use crate::workflow::{RunContext, SamplePaths};

/// Per-step result of an aggregation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepSummary {
    pub flag: String,
    /// Samples with a unique ENDING marker
    pub passed: usize,
    /// Names of the samples without one
    pub failed: Vec<String>,
}

impl StepSummary {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Collects the outcome of `flag` for every sample.
///
/// Every sample without a unique ENDING marker fails and has its output
/// slot cleared. When no sample passed, the failure is recorded and
/// [`PipelineError::AllSamplesFailed`] is returned after the row was
/// appended.
pub fn aggregate(
    context: &mut RunContext,
    main_log: &MainLog,
    flag: &str,
    output_role: Option<&str>,
) -> Result<StepSummary> {
    let mut passed = Vec::with_capacity(context.sample_count());
    let mut failed = Vec::new();

    for index in 0..context.sample_count() {
        let stub = context.sample(index)?.stub.clone();
        let history = SampleLog::for_sample(context.paths(), &stub).read();

        match history.completion(flag) {
            Some(payload) => {
                if let Some(role) = output_role {
                    let mut slot = context.slot(role, index).cloned().unwrap_or_default();
                    slot.apply_payload(payload);
                    context.set_slot(role, index, slot)?;
                }
                passed.push(true);
            }
            None => {
                if history.has_ending(flag) {
                    warn!("{}: more than one ENDING marker for {}", stub, flag);
                }
                if let Some(role) = output_role {
                    context.set_slot(role, index, SamplePaths::unavailable())?;
                }
                passed.push(false);
                failed.push(stub);
            }
        }
    }

    let passed_count = passed.iter().filter(|&&p| p).count();
    context.run_log_mut().push(flag, passed);

    let names: Vec<&str> = failed.iter().map(String::as_str).collect();
    if passed_count == 0 {
        main_log.record_failures(flag, &names)?;
        return Err(PipelineError::AllSamplesFailed {
            flag: flag.to_string(),
        });
    }

    if failed.is_empty() {
        main_log.record_success(flag)?;
    } else {
        main_log.record_failures(flag, &names)?;
    }

    Ok(StepSummary {
        flag: flag.to_string(),
        passed: passed_count,
        failed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::{PipelineConfig, Sample, Step, RAW_ROLE};
    use std::fs;
    use tempfile::tempdir;

    fn context(dir: &std::path::Path) -> RunContext {
        let config = PipelineConfig::new(dir, dir.join("samples.txt"))
            .with_step(Step::new("trim", RAW_ROLE).with_output("fastq_files"));
        let samples = ["A", "B", "C"]
            .iter()
            .map(|s| Sample::new(*s, SamplePaths::single(format!("/raw/{}.fq", s))))
            .collect();
        let mut ctx = RunContext::new(&config, samples);
        ctx.register_io(RAW_ROLE, Some("fastq_files"), false).unwrap();
        ctx
    }

    fn end(ctx: &RunContext, stub: &str, payload: &str) {
        SampleLog::for_sample(ctx.paths(), stub)
            .append_ended("trim_raw_files", payload)
            .unwrap();
    }

    #[test]
    fn test_all_samples_pass() {
        let temp_dir = tempdir().unwrap();
        let mut ctx = context(temp_dir.path());
        let main_log = MainLog::new(ctx.paths().main_log());
        for stub in ["A", "B", "C"] {
            end(&ctx, stub, &format!("/w/{}.fq", stub));
        }

        let summary = aggregate(&mut ctx, &main_log, "trim_raw_files", Some("fastq_files")).unwrap();

        assert!(summary.is_success());
        assert_eq!(summary.passed, 3);
        assert_eq!(ctx.slot("fastq_files", 2).unwrap().primary, "/w/C.fq");
        assert!(main_log.is_step_finished("trim_raw_files"));
    }

    #[test]
    fn test_failure_is_isolated() {
        let temp_dir = tempdir().unwrap();
        let mut ctx = context(temp_dir.path());
        let main_log = MainLog::new(ctx.paths().main_log());
        end(&ctx, "A", "/w/A.fq");
        SampleLog::for_sample(ctx.paths(), "B")
            .append_started("trim_raw_files")
            .unwrap();
        end(&ctx, "C", "/w/C.fq");

        let summary = aggregate(&mut ctx, &main_log, "trim_raw_files", Some("fastq_files")).unwrap();

        assert_eq!(summary.failed, vec!["B".to_string()]);
        assert_eq!(ctx.run_log().last().passed, vec![true, false, true]);
        assert_eq!(ctx.slot("fastq_files", 1).unwrap().primary, "");
        assert!(!main_log.is_step_finished("trim_raw_files"));
        assert!(fs::read_to_string(main_log.path())
            .unwrap()
            .contains("trim_raw_files: error in samples B\n"));
    }

    #[test]
    fn test_all_samples_fail() {
        let temp_dir = tempdir().unwrap();
        let mut ctx = context(temp_dir.path());
        let main_log = MainLog::new(ctx.paths().main_log());

        let result = aggregate(&mut ctx, &main_log, "trim_raw_files", Some("fastq_files"));

        assert!(matches!(
            result,
            Err(PipelineError::AllSamplesFailed { flag }) if flag == "trim_raw_files"
        ));
        assert_eq!(ctx.run_log().len(), 2);
        assert!(ctx.run_log().last().all_failed());
        let text = fs::read_to_string(main_log.path()).unwrap();
        assert!(text.contains("trim_raw_files: error in samples A;B;C"));
    }

    #[test]
    fn test_payload_fills_both_slots() {
        let temp_dir = tempdir().unwrap();
        let mut ctx = context(temp_dir.path());
        let main_log = MainLog::new(ctx.paths().main_log());
        for stub in ["A", "B", "C"] {
            end(&ctx, stub, "a.fastq;b.fastq");
        }

        aggregate(&mut ctx, &main_log, "trim_raw_files", Some("fastq_files")).unwrap();

        let slot = ctx.slot("fastq_files", 0).unwrap();
        assert_eq!(slot.primary, "a.fastq");
        assert_eq!(slot.secondary.as_deref(), Some("b.fastq"));
    }

    #[test]
    fn test_duplicate_ending_fails_sample() {
        let temp_dir = tempdir().unwrap();
        let mut ctx = context(temp_dir.path());
        let main_log = MainLog::new(ctx.paths().main_log());
        end(&ctx, "A", "/w/A.fq");
        end(&ctx, "A", "/w/A2.fq");
        end(&ctx, "B", "/w/B.fq");
        end(&ctx, "C", "/w/C.fq");

        let summary = aggregate(&mut ctx, &main_log, "trim_raw_files", Some("fastq_files")).unwrap();
        assert_eq!(summary.failed, vec!["A".to_string()]);
    }

    #[test]
    fn test_step_without_output_role() {
        let temp_dir = tempdir().unwrap();
        let mut ctx = context(temp_dir.path());
        let main_log = MainLog::new(ctx.paths().main_log());
        for stub in ["A", "B", "C"] {
            SampleLog::for_sample(ctx.paths(), stub)
                .append_ended("fastqc_raw_files", "")
                .unwrap();
        }

        let summary = aggregate(&mut ctx, &main_log, "fastqc_raw_files", None).unwrap();
        assert_eq!(summary.passed, 3);
        assert!(main_log.is_step_finished("fastqc_raw_files"));
    }
}
