//! Built-in Command Worker
//!
//! Runs the `command` template of a step for one sample:
//! - Placeholder substitution
//! - Script generation
//! - Output directory creation
//! - Output verification
//!
//! The expanded `outputs` become the ENDING payload of the sample.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;

use log::{debug, error, warn};

use super::worker::{WorkerArgs, WorkerSession, WorkerStart};
use crate::error::{PipelineError, Result};
use crate::workflow::Step;

/// Values substituted into command and output templates.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Placeholders {
    pub input: String,
    pub input2: String,
    pub output: String,
    pub output2: String,
    pub sample: String,
    pub step_dir: String,
    pub cores: String,
}

impl Placeholders {
    /// Placeholders of a worker session; outputs are filled in later.
    pub fn for_session(session: &WorkerSession) -> Self {
        let input = session.input();
        Self {
            input: input.primary.clone(),
            input2: input.secondary.clone().unwrap_or_default(),
            output: String::new(),
            output2: String::new(),
            sample: session.stub().to_string(),
            step_dir: session.step_dir().display().to_string(),
            cores: session.cores().to_string(),
        }
    }

    /// Replaces every known placeholder in `template`.
    pub fn expand(&self, template: &str) -> String {
        template
            .replace("{input2}", &self.input2)
            .replace("{input}", &self.input)
            .replace("{output2}", &self.output2)
            .replace("{output}", &self.output)
            .replace("{sample}", &self.sample)
            .replace("{step_dir}", &self.step_dir)
            .replace("{cores}", &self.cores)
    }
}

/// Splits `--step <flag>` from the worker arguments of `exec`.
pub fn parse_exec_arguments(args: &[String]) -> Result<(String, WorkerArgs)> {
    let mut flag = None;
    let mut rest = Vec::new();
    let mut args = args.iter();

    while let Some(arg) = args.next() {
        if arg == "--step" {
            let value = args
                .next()
                .ok_or_else(|| PipelineError::Config("--step requires a step flag".to_string()))?;
            flag = Some(value.clone());
        } else {
            rest.push(arg.clone());
        }
    }

    let flag = flag.ok_or_else(|| PipelineError::Config("exec requires --step <FLAG>".to_string()))?;
    Ok((flag, WorkerArgs::parse(rest)?))
}

/// Runs the built-in worker for one sample of the step `flag`.
///
/// A failing command leaves no ENDING marker, so the sample fails at
/// aggregation.
pub fn run_command_worker(flag: &str, args: &WorkerArgs) -> Result<()> {
    let session = match WorkerSession::begin(args)? {
        WorkerStart::Ready(session) => session,
        WorkerStart::AlreadyDone => return Ok(()),
    };

    if session.flag() != flag {
        return Err(PipelineError::Config(format!(
            "Worker started for '{}' but the run is at '{}'",
            flag,
            session.flag()
        )));
    }

    let step = session.step_definition()?.clone();
    let outputs = execute_command_step(&session, &step).map_err(|e| {
        error!("{}: {}", session.stub(), e);
        e
    })?;

    session.finish(&outputs)
}

/// Executes the command of `step` for the session's sample.
///
/// # Returns
///
/// * `Ok(outputs)` - Command succeeded and every output exists
/// * `Err` - Command failed or an output is missing
pub fn execute_command_step(session: &WorkerSession, step: &Step) -> Result<Vec<String>> {
    let template = step.command.as_deref().ok_or_else(|| {
        PipelineError::Config(format!("Step '{}' has no command template", step.name))
    })?;
    let step_dir = session.step_dir();
    fs::create_dir_all(&step_dir).map_err(|e| PipelineError::io(&step_dir, e))?;

    let mut placeholders = Placeholders::for_session(session);
    let outputs = resolve_outputs(&step.outputs, &placeholders, &step_dir);
    placeholders.output = outputs.first().cloned().unwrap_or_default();
    placeholders.output2 = outputs.get(1).cloned().unwrap_or_default();

    ensure_output_directories(&outputs)?;

    let command_text = placeholders.expand(template);
    let script_path = create_execution_script(&step_dir, session.stub(), &command_text)?;

    let output = Command::new("bash")
        .arg(&script_path)
        .current_dir(&step_dir)
        .output()
        .map_err(|e| PipelineError::io(&script_path, e))?;

    if let Err(e) = fs::remove_file(&script_path) {
        warn!("Failed to clean up script {}: {}", script_path.display(), e);
    }

    let failure = |reason: String| PipelineError::StepFailed {
        step: step.name.clone(),
        sample: session.stub().to_string(),
        reason,
    };

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let stdout = String::from_utf8_lossy(&output.stdout);

        error!(
            "Step '{}' failed on {} with exit code: {:?}",
            step.name,
            session.stub(),
            output.status.code()
        );
        if !stderr.trim().is_empty() {
            error!("stderr:\n{}", stderr);
        }
        if !stdout.trim().is_empty() {
            debug!("stdout:\n{}", stdout);
        }

        return Err(failure(format!("exit code {:?}", output.status.code())));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    if !stdout.trim().is_empty() {
        debug!("Step '{}' output:\n{}", step.name, stdout);
    }

    if let Some(missing) = outputs.iter().find(|o| !Path::new(o).exists()) {
        return Err(failure(format!("output '{}' was not created", missing)));
    }

    Ok(outputs)
}

/// Expands output templates; relative paths live in the step directory.
fn resolve_outputs(templates: &[String], placeholders: &Placeholders, step_dir: &Path) -> Vec<String> {
    templates
        .iter()
        .map(|t| placeholders.expand(t.trim()))
        .filter(|o| !o.is_empty())
        .map(|o| {
            let path = PathBuf::from(&o);
            if path.is_absolute() {
                o
            } else {
                step_dir.join(path).display().to_string()
            }
        })
        .collect()
}

/// Creates parent directories for output files.
fn ensure_output_directories(outputs: &[String]) -> Result<()> {
    for output in outputs {
        if let Some(parent) = Path::new(output).parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent).map_err(|e| PipelineError::io(parent, e))?;
                debug!("Created directory: {}", parent.display());
            }
        }
    }
    Ok(())
}

/// Writes the bash script of one sample into the step directory.
fn create_execution_script(step_dir: &Path, stub: &str, command_text: &str) -> Result<PathBuf> {
    let script_path = step_dir.join(format!("{}.sh", stub));
    let mut file = File::create(&script_path).map_err(|e| PipelineError::io(&script_path, e))?;

    let content = format!("#!/bin/bash\nset -e\n{}\n", command_text);
    file.write_all(content.as_bytes())
        .map_err(|e| PipelineError::io(&script_path, e))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&script_path, fs::Permissions::from_mode(0o755))
            .map_err(|e| PipelineError::io(&script_path, e))?;
    }

    Ok(script_path)
}
