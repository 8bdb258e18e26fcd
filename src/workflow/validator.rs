//! Pipeline Validation
//!
//! Checks a pipeline definition before anything is dispatched:
//! - Step field validation
//! - Unique resume flags
//! - Input roles produced by an earlier step (or the raw files)
//! - Strategy settings

use std::collections::HashSet;

use log::{debug, info, warn};

use super::model::{Invocation, PipelineConfig, Step, Strategy, RAW_ROLE};
use crate::error::{PipelineError, Result};

/// Longest job name the SGE queue listing shows without truncation.
pub const SCHEDULER_NAME_WIDTH: usize = 10;

/// Digits appended to the job prefix when generating batch ids.
pub const BATCH_ID_DIGITS: usize = 6;

/// Validation error types for user-friendly error messages.
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationError {
    EmptyPipeline,
    EmptyStepName,
    InvalidStepName(String),
    EmptyInputRole(String),
    DuplicateFlag(String),
    MissingInvocation(String),
    AmbiguousInvocation(String),
    OutputsWithoutCommand(String),
    TooManyOutputs(String),
    UnknownInputRole { step: String, role: String },
    ZeroLocalCores,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyPipeline => write!(f, "Pipeline has no steps"),
            Self::EmptyStepName => write!(f, "Step has empty or whitespace-only name"),
            Self::InvalidStepName(name) => write!(
                f,
                "Step name '{}' must not contain path separators or whitespace",
                name
            ),
            Self::EmptyInputRole(step) => write!(f, "Step '{}' has no input role", step),
            Self::DuplicateFlag(flag) => write!(
                f,
                "Step flag '{}' appears twice (same step name reading the same role)",
                flag
            ),
            Self::MissingInvocation(step) => {
                write!(f, "Step '{}' needs either a program or a command", step)
            }
            Self::AmbiguousInvocation(step) => {
                write!(f, "Step '{}' sets both program and command", step)
            }
            Self::OutputsWithoutCommand(step) => write!(
                f,
                "Step '{}': outputs can only be declared for command steps",
                step
            ),
            Self::TooManyOutputs(step) => {
                write!(f, "Step '{}' declares more than two outputs", step)
            }
            Self::UnknownInputRole { step, role } => write!(
                f,
                "Step '{}' reads role '{}' which no earlier step produces",
                step, role
            ),
            Self::ZeroLocalCores => write!(f, "local_cores must be at least 1"),
        }
    }
}

/// Validates a single step's fields.
fn validate_step(step: &Step) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if step.name.trim().is_empty() {
        errors.push(ValidationError::EmptyStepName);
        return errors; // Can't validate further without a name
    }

    if step.name.contains(['/', '\\']) || step.name.contains(char::is_whitespace) {
        errors.push(ValidationError::InvalidStepName(step.name.clone()));
    }

    if step.input.trim().is_empty() {
        errors.push(ValidationError::EmptyInputRole(step.name.clone()));
    }

    match step.invocation() {
        Some(Invocation::Program(program)) => {
            if !step.outputs.is_empty() {
                errors.push(ValidationError::OutputsWithoutCommand(step.name.clone()));
            }
            if !program.exists() {
                warn!(
                    "Step '{}': program {} does not exist on this machine",
                    step.name,
                    program.display()
                );
            }
        }
        Some(Invocation::Command(command)) => {
            if step.outputs.len() > 2 {
                errors.push(ValidationError::TooManyOutputs(step.name.clone()));
            }
            if command.contains("{output}") && step.outputs.is_empty() {
                warn!(
                    "Step '{}': command uses {{output}} but no outputs declared",
                    step.name
                );
            }
        }
        None if step.program.is_some() => {
            errors.push(ValidationError::AmbiguousInvocation(step.name.clone()));
        }
        None => errors.push(ValidationError::MissingInvocation(step.name.clone())),
    }

    if step.output_role().is_none() && !step.outputs.is_empty() {
        warn!(
            "Step '{}' reports outputs but has no output role; they will not be propagated",
            step.name
        );
    }

    errors
}

/// Validates the entire pipeline definition.
///
/// Performs the following checks:
/// 1. Pipeline is not empty
/// 2. All steps have valid fields
/// 3. No two steps share a flag
/// 4. Every input role is the raw role or written by an earlier step
/// 5. Strategy settings are usable
pub fn validate_pipeline(config: &PipelineConfig) -> Result<()> {
    info!("Validating pipeline with {} steps", config.steps.len());

    let errors = collect_errors(config);
    if !errors.is_empty() {
        let error_messages: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
        return Err(PipelineError::Config(error_messages.join("\n")));
    }

    warn_about_resources(config);
    Ok(())
}

/// Returns every validation error of a pipeline.
pub fn collect_errors(config: &PipelineConfig) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if config.steps.is_empty() {
        errors.push(ValidationError::EmptyPipeline);
        return errors;
    }

    let mut flags = HashSet::new();
    let mut known_roles: HashSet<&str> = HashSet::from([RAW_ROLE]);

    for step in &config.steps {
        errors.extend(validate_step(step));

        if !flags.insert(step.flag()) {
            errors.push(ValidationError::DuplicateFlag(step.flag()));
        }

        let role = step.input.trim();
        if !role.is_empty() && !known_roles.contains(role) {
            errors.push(ValidationError::UnknownInputRole {
                step: step.name.clone(),
                role: role.to_string(),
            });
        }

        if let Some(output) = step.output_role() {
            known_roles.insert(output);
        }
        debug!("Step '{}' validated (flag {})", step.name, step.flag());
    }

    if config.local_cores == 0 {
        errors.push(ValidationError::ZeroLocalCores);
    }

    errors
}

/// Logs settings that are legal but probably not what the user wants.
fn warn_about_resources(config: &PipelineConfig) {
    match config.strategy {
        Strategy::Local => {
            let available = num_cpus::get();
            if config.local_cores > available {
                warn!(
                    "local_cores is {} but this machine only has {} CPUs",
                    config.local_cores, available
                );
            }
        }
        Strategy::Cluster => {
            let name_len = config.cluster.job_prefix.len() + BATCH_ID_DIGITS;
            if name_len > SCHEDULER_NAME_WIDTH {
                warn!(
                    "Job prefix '{}' gives {}-character job names; the queue listing \
                     truncates names to {} characters and batches may never be seen finishing",
                    config.cluster.job_prefix, name_len, SCHEDULER_NAME_WIDTH
                );
            }
            if config.cluster.poll_interval_secs == 0 {
                warn!("poll_interval_secs is 0; the scheduler will be polled continuously");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> PipelineConfig {
        PipelineConfig::new("/data/run1", "/data/run1/samples.txt")
    }

    #[test]
    fn test_valid_linear_pipeline() {
        let config = base_config()
            .with_step(Step::new("fastqc", "raw_files").with_program("/bin/true"))
            .with_step(
                Step::new("trim", "raw_files")
                    .with_output("fastq_files")
                    .with_command("cp {input} {output}")
                    .with_outputs(vec!["{step_dir}/{sample}.fq".to_string()]),
            )
            .with_step(Step::new("fastqc", "fastq_files").with_program("/bin/true"));

        assert!(validate_pipeline(&config).is_ok());
    }

    #[test]
    fn test_empty_pipeline() {
        let errors = collect_errors(&base_config());
        assert_eq!(errors, vec![ValidationError::EmptyPipeline]);
    }

    #[test]
    fn test_duplicate_flag() {
        let config = base_config()
            .with_step(Step::new("fastqc", "raw_files").with_program("/bin/true"))
            .with_step(Step::new("fastqc", "raw_files").with_program("/bin/true"));

        let errors = collect_errors(&config);
        assert!(errors.contains(&ValidationError::DuplicateFlag(
            "fastqc_raw_files".to_string()
        )));
    }

    #[test]
    fn test_input_role_must_be_produced_earlier() {
        let config = base_config()
            .with_step(Step::new("align", "fastq_files").with_program("/bin/true"))
            .with_step(
                Step::new("trim", "raw_files")
                    .with_output("fastq_files")
                    .with_program("/bin/true"),
            );

        let errors = collect_errors(&config);
        assert_eq!(
            errors,
            vec![ValidationError::UnknownInputRole {
                step: "align".to_string(),
                role: "fastq_files".to_string(),
            }]
        );
    }

    #[test]
    fn test_invocation_errors() {
        let config = base_config()
            .with_step(Step::new("none", "raw_files"))
            .with_step(
                Step::new("both", "raw_files")
                    .with_program("/bin/true")
                    .with_command("true"),
            );

        let errors = collect_errors(&config);
        assert!(errors.contains(&ValidationError::MissingInvocation("none".to_string())));
        assert!(errors.contains(&ValidationError::AmbiguousInvocation("both".to_string())));
    }

    #[test]
    fn test_outputs_rules() {
        let three = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let config = base_config()
            .with_step(
                Step::new("wrapped", "raw_files")
                    .with_program("/bin/true")
                    .with_outputs(vec!["a".to_string()]),
            )
            .with_step(
                Step::new("many", "raw_files")
                    .with_command("true")
                    .with_outputs(three),
            );

        let errors = collect_errors(&config);
        assert!(errors.contains(&ValidationError::OutputsWithoutCommand("wrapped".to_string())));
        assert!(errors.contains(&ValidationError::TooManyOutputs("many".to_string())));
    }

    #[test]
    fn test_invalid_step_name() {
        let config =
            base_config().with_step(Step::new("bad/name", "raw_files").with_program("/bin/true"));
        let errors = collect_errors(&config);
        assert!(errors.contains(&ValidationError::InvalidStepName("bad/name".to_string())));
    }

    #[test]
    fn test_zero_local_cores() {
        let mut config =
            base_config().with_step(Step::new("fastqc", "raw_files").with_program("/bin/true"));
        config.local_cores = 0;

        let result = validate_pipeline(&config);
        match result {
            Err(PipelineError::Config(msg)) => assert!(msg.contains("local_cores")),
            other => panic!("expected config error, got {:?}", other),
        }
    }

    #[test]
    fn test_error_display() {
        let err = ValidationError::UnknownInputRole {
            step: "align".to_string(),
            role: "fastq_files".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Step 'align' reads role 'fastq_files' which no earlier step produces"
        );
    }
}
