//! Worker-Side Protocol
//!
//! A worker is started once per sample as
//! `<program> -i <index> -n <cores> -d <context.json>`. It restores the
//! persisted run context, checks the sample's durable log and brackets its
//! work with `STARTING` / `ENDING` markers. The ENDING marker and its payload
//! are the only thing the controller reads back.

use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};

use crate::error::{PipelineError, Result};
use crate::journal::SampleLog;
use crate::workflow::{ActiveStep, RunContext, SamplePaths, Step};

/// Command-line arguments shared by every worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerArgs {
    /// Position of the sample in the sheet
    pub index: usize,
    /// Cores granted to this worker (`$NSLOTS` on the cluster)
    pub cores: String,
    /// Persisted run context
    pub context: PathBuf,
}

impl WorkerArgs {
    pub fn new(index: usize, cores: impl Into<String>, context: impl Into<PathBuf>) -> Self {
        Self {
            index,
            cores: cores.into(),
            context: context.into(),
        }
    }

    /// Renders the arguments as `-i <index> -n <cores> -d <context>`.
    pub fn to_args(&self) -> Vec<String> {
        vec![
            "-i".to_string(),
            self.index.to_string(),
            "-n".to_string(),
            self.cores.clone(),
            "-d".to_string(),
            self.context.display().to_string(),
        ]
    }

    /// Parses `-i`, `-n` and `-d`. Unknown arguments are rejected.
    pub fn parse<I, S>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut index = None;
        let mut cores = None;
        let mut context = None;

        let mut args = args.into_iter().map(Into::into);
        while let Some(arg) = args.next() {
            let value = args
                .next()
                .ok_or_else(|| PipelineError::Config(format!("Missing value for {}", arg)))?;

            match arg.as_str() {
                "-i" => {
                    let parsed = value.parse::<usize>().map_err(|_| {
                        PipelineError::Config(format!("Invalid sample index '{}'", value))
                    })?;
                    index = Some(parsed);
                }
                "-n" => cores = Some(value),
                "-d" => context = Some(PathBuf::from(value)),
                other => {
                    return Err(PipelineError::Config(format!(
                        "Unknown worker argument '{}'",
                        other
                    )))
                }
            }
        }

        match (index, context) {
            (Some(index), Some(context)) => Ok(Self {
                index,
                cores: cores.unwrap_or_else(|| "1".to_string()),
                context,
            }),
            _ => Err(PipelineError::Config(
                "Usage: -i <index> -n <cores> -d <context.json>".to_string(),
            )),
        }
    }
}

/// Result of starting a worker.
#[derive(Debug)]
pub enum WorkerStart {
    /// The sample has work to do for the active step
    Ready(WorkerSession),
    /// The step already ended for this sample; nothing was started
    AlreadyDone,
}

/// One running worker: the sample it works on and its durable log.
#[derive(Debug)]
pub struct WorkerSession {
    context: RunContext,
    step: ActiveStep,
    index: usize,
    cores: String,
    log: SampleLog,
    resumed: bool,
}

impl WorkerSession {
    /// Restores the persisted context and opens the sample's log.
    pub fn begin(args: &WorkerArgs) -> Result<WorkerStart> {
        let context = RunContext::restore(&args.context)?;
        Self::from_context(context, args.index, &args.cores)
    }

    /// Starts a worker for sample `index` of an already loaded context.
    ///
    /// Writes a SKIPPING note when the step already ended for the sample,
    /// otherwise appends the STARTING marker.
    pub fn from_context(context: RunContext, index: usize, cores: &str) -> Result<WorkerStart> {
        let step = context
            .current()
            .cloned()
            .ok_or_else(|| PipelineError::Config("Run context has no active step".to_string()))?;
        let stub = context.sample(index)?.stub.clone();
        let log = SampleLog::for_sample(context.paths(), &stub);

        let mut resumed = false;
        if !context.clean_run {
            let history = log.read();
            if history.has_ending(&step.flag) {
                log.append_note(&format!(
                    "{} module already run on this file .. SKIPPING",
                    step.flag
                ))?;
                info!("{}: {} already finished, skipping", stub, step.flag);
                return Ok(WorkerStart::AlreadyDone);
            }
            resumed = history.was_started(&step.flag);
        }

        log.append_started(&step.flag)?;
        if resumed {
            info!("{}: resuming interrupted {}", stub, step.flag);
        }

        Ok(WorkerStart::Ready(Self {
            context,
            step,
            index,
            cores: cores.to_string(),
            log,
            resumed,
        }))
    }

    pub fn context(&self) -> &RunContext {
        &self.context
    }

    pub fn step(&self) -> &ActiveStep {
        &self.step
    }

    pub fn flag(&self) -> &str {
        &self.step.flag
    }

    /// Pipeline definition of the active step.
    pub fn step_definition(&self) -> Result<&Step> {
        self.context.step_by_flag(&self.step.flag)
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn stub(&self) -> &str {
        // Index was validated in `from_context`
        self.context
            .samples()
            .get(self.index)
            .map(|s| s.stub.as_str())
            .unwrap_or_default()
    }

    pub fn cores(&self) -> &str {
        &self.cores
    }

    /// True if an earlier attempt started this step without ending it.
    pub fn is_resumed(&self) -> bool {
        self.resumed
    }

    /// Input file(s) of this sample for the active step.
    pub fn input(&self) -> SamplePaths {
        self.context
            .slot(&self.step.input_role, self.index)
            .cloned()
            .unwrap_or_default()
    }

    /// Working directory of the active step.
    pub fn step_dir(&self) -> PathBuf {
        self.context.paths().step_dir(&self.step.name)
    }

    pub fn log(&self) -> &SampleLog {
        &self.log
    }

    /// Records the successful end of the step.
    ///
    /// `outputs` (at most two paths) become the ENDING payload. Input files
    /// are removed first when both the run and the step ask for it.
    pub fn finish(self, outputs: &[String]) -> Result<()> {
        if self.removes_input() {
            self.remove_inputs(outputs)?;
        }

        self.log.append_ended(&self.step.flag, &outputs.join(";"))?;
        info!("{}: {} finished", self.stub(), self.step.flag);
        Ok(())
    }

    fn removes_input(&self) -> bool {
        self.context.remove_intermediate
            && self.step.output_role.is_some()
            && self
                .step_definition()
                .map(|step| step.remove_input)
                .unwrap_or(false)
    }

    fn remove_inputs(&self, outputs: &[String]) -> Result<()> {
        for file in self.input().files() {
            if outputs.iter().any(|o| o == file) {
                continue;
            }

            if self.context.is_raw_file(file) {
                self.log.append_note(
                    "WARNING: A module tried to delete a raw file. SKIPPING the removal",
                )?;
                warn!("Refusing to delete raw file {}", file);
                continue;
            }

            match fs::remove_file(Path::new(file)) {
                Ok(()) => debug!("Removed intermediate file {}", file),
                Err(e) => warn!("Failed to remove intermediate file {}: {}", file, e),
            }
        }
        Ok(())
    }
}
