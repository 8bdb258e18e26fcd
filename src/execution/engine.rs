//! Pipeline Execution Engine
//!
//! Runs the steps of a pipeline in order. For every step the engine:
//! - registers the file roles the step reads and writes
//! - skips it when the aggregate log records it as finished, rebuilding
//!   its outputs from the durable logs
//! - otherwise persists the run context, dispatches one task per eligible
//!   sample, waits for the batch and aggregates the outcome
//!
//! The controller is single-threaded; parallelism across samples only
//! comes from the cluster scheduler.

use std::fs;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{info, warn};

use super::aggregate::{aggregate, StepSummary};
use super::dispatch::{Batch, ClusterDispatcher, Dispatcher, LocalDispatcher, Task, WorkerCommand};
use super::resume::ResumeController;
use super::scheduler::{SgeScheduler, CURRENT_USER};
use super::waiter::CompletionWaiter;
use crate::error::{PipelineError, Result};
use crate::journal::{MainLog, SampleLog};
use crate::monitoring::{write_reports, EventType, ExecutionTimeline};
use crate::workflow::model::Invocation;
use crate::workflow::{load_sample_sheet, PipelineConfig, ResourceHints, RunContext, RunPaths, Step, Strategy};
use crate::APP_NAME;

/// What happened to a step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// Finished in an earlier run; outputs were restored from the logs
    Skipped { flag: String },
    /// Dispatched and aggregated
    Completed(StepSummary),
}

/// Result of a run that reached the end of the pipeline.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub context: RunContext,
    pub outcomes: Vec<StepOutcome>,
    pub elapsed: Duration,
}

/// Pipeline execution engine.
///
/// # Example
///
/// ```rust,no_run
/// use seqflow::execution::Engine;
/// use seqflow::load_pipeline;
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let config = load_pipeline("pipeline.yaml")?;
///     let mut engine = Engine::new(config);
///     engine.set_assume_yes(true);
///
///     let summary = engine.run()?;
///     println!("{} steps", summary.outcomes.len());
///     Ok(())
/// }
/// ```
pub struct Engine {
    config: PipelineConfig,
    dispatcher: Box<dyn Dispatcher>,
    worker_exe: PathBuf,
    assume_yes: bool,
    cancel: Arc<AtomicBool>,
    timeline: ExecutionTimeline,
}

impl Engine {
    /// Creates an engine using the dispatcher of the configured strategy.
    pub fn new(config: PipelineConfig) -> Self {
        let dispatcher: Box<dyn Dispatcher> = match config.strategy {
            Strategy::Local => Box::new(LocalDispatcher::new(config.local_cores)),
            Strategy::Cluster => Box::new(ClusterDispatcher::new(
                SgeScheduler::new(config.cluster.clone()),
                CompletionWaiter::new(config.cluster.poll_interval(), config.cluster.timeout()),
                CURRENT_USER.as_str(),
                config.cluster.job_prefix.as_str(),
            )),
        };
        Self::with_dispatcher(config, dispatcher)
    }

    /// Creates an engine with a custom dispatcher.
    pub fn with_dispatcher(config: PipelineConfig, dispatcher: Box<dyn Dispatcher>) -> Self {
        let worker_exe = std::env::current_exe().unwrap_or_else(|_| PathBuf::from(APP_NAME));
        Self {
            config,
            dispatcher,
            worker_exe,
            assume_yes: false,
            cancel: Arc::new(AtomicBool::new(false)),
            timeline: ExecutionTimeline::new(),
        }
    }

    /// Sets the executable started for steps using the built-in worker.
    pub fn set_worker_exe(&mut self, exe: impl Into<PathBuf>) {
        self.worker_exe = exe.into();
    }

    /// Skips the confirmation before a clean run deletes old results.
    pub fn set_assume_yes(&mut self, assume_yes: bool) {
        self.assume_yes = assume_yes;
    }

    /// Flag that ends the current wait with [`PipelineError::Cancelled`].
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn timeline(&self) -> &ExecutionTimeline {
        &self.timeline
    }

    /// Executes the pipeline.
    ///
    /// Reports are written whether the run completes or halts. The final run
    /// context is persisted in both cases.
    ///
    /// # Returns
    ///
    /// * `Ok(summary)` - Every step was skipped or had at least one passing sample
    /// * `Err` - Configuration error, all samples failed a step, or the wait ended
    pub fn run(&mut self) -> Result<RunSummary> {
        let start_time = Instant::now();
        self.config.resolve_paths()?;
        let mut context = self.prepare()?;

        let main_log = MainLog::new(context.paths().main_log());
        let resume = ResumeController::for_context(&context);
        main_log.write(&format!(
            "Starting pipeline on {} samples ({} steps)",
            context.sample_count(),
            self.config.steps.len()
        ))?;

        let steps = self.config.steps.clone();
        let mut outcomes = Vec::with_capacity(steps.len());
        let mut halted = None;

        for step in &steps {
            match self.run_step(&mut context, &main_log, &resume, step) {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => {
                    halted = Some(e);
                    break;
                }
            }
        }

        context.persist()?;
        write_reports(&context, &self.config)?;
        println!("{}", self.timeline.summary());

        if let Some(e) = halted {
            main_log.write(&format!("Pipeline halted: {}", e))?;
            return Err(e);
        }

        main_log.write("Pipeline finished")?;
        Ok(RunSummary {
            context,
            outcomes,
            elapsed: start_time.elapsed(),
        })
    }

    /// Resets a clean run and builds the run context.
    fn prepare(&self) -> Result<RunContext> {
        let paths = self.config.paths();

        if self.config.clean_run {
            self.reset_results(&paths)?;
        }

        for dir in [
            paths.results_dir(),
            paths.log_dir(),
            paths.report_dir(),
            paths.deliverables_dir(),
        ] {
            fs::create_dir_all(&dir).map_err(|e| PipelineError::io(&dir, e))?;
        }

        let samples = load_sample_sheet(&self.config)?;
        let context = RunContext::new(&self.config, samples);

        for stub in context.stubs() {
            SampleLog::for_sample(context.paths(), stub).ensure_exists()?;
        }

        info!(
            "Prepared run in {} ({} samples)",
            paths.root().display(),
            context.sample_count()
        );
        Ok(context)
    }

    /// Deletes the results, report and deliverables of earlier runs.
    fn reset_results(&self, paths: &RunPaths) -> Result<()> {
        let existing: Vec<PathBuf> = [
            paths.results_dir(),
            paths.report_dir(),
            paths.deliverables_dir(),
        ]
        .into_iter()
        .filter(|dir| dir.exists())
        .collect();

        if existing.is_empty() {
            return Ok(());
        }

        if self.config.ask_before_deleting && !self.assume_yes {
            let stdin = io::stdin();
            if !confirm_deletion(&existing, &mut stdin.lock(), &mut io::stdout())? {
                return Err(PipelineError::Aborted(
                    "previous results were kept".to_string(),
                ));
            }
        }

        for dir in existing {
            info!("Removing {}", dir.display());
            fs::remove_dir_all(&dir).map_err(|e| PipelineError::io(&dir, e))?;
        }
        Ok(())
    }

    fn run_step(
        &mut self,
        context: &mut RunContext,
        main_log: &MainLog,
        resume: &ResumeController,
        step: &Step,
    ) -> Result<StepOutcome> {
        context.register_io(&step.input, step.output_role(), step.seed_from_input)?;

        let resources = ResourceHints {
            cores: step.core_request(&self.config.cluster).to_string(),
            memory: step.memory_request(&self.config.cluster),
        };
        let flag = context.begin_step(step, resources.clone());

        if resume.is_step_finished(&flag) {
            main_log.write(&format!(
                "Skipping {} since it was already successfully finished.",
                flag
            ))?;
            let missing = resume.restore_outputs(context, &flag, step.output_role())?;
            if missing > 0 {
                warn!("{} sample(s) have no recorded output for {}", missing, flag);
            }
            self.timeline.add_event(&flag, EventType::Skipped);
            return Ok(StepOutcome::Skipped { flag });
        }

        main_log.write(&format!("Starting {}", flag))?;
        self.timeline.add_event(&flag, EventType::Started);

        let worker = match step.invocation() {
            Some(Invocation::Program(program)) => WorkerCommand::program(program),
            Some(Invocation::Command(_)) => WorkerCommand::builtin(&self.worker_exe, &flag),
            None => {
                return Err(PipelineError::Config(format!(
                    "Step '{}' needs exactly one of program or command",
                    step.name
                )))
            }
        };

        let paths = context.paths().clone();
        let step_dir = paths.step_dir(&step.name);
        fs::create_dir_all(&step_dir).map_err(|e| PipelineError::io(&step_dir, e))?;
        let context_file = context.persist()?;

        let tasks = eligible_tasks(context, resume, &flag);
        if tasks.is_empty() {
            info!("No sample left to run for {}", flag);
        } else {
            let batch = Batch {
                flag: flag.clone(),
                step_name: step.name.clone(),
                step_dir,
                qsub_dir: paths.qsub_dir(),
                context_file,
                worker,
                resources,
                tasks,
            };
            let waited = self
                .dispatcher
                .dispatch(&batch)
                .and_then(|handle| self.dispatcher.wait(&handle, &self.cancel));
            if let Err(e) = waited {
                self.timeline.add_event(&flag, EventType::Failed);
                return Err(e);
            }
        }

        let aggregated = aggregate(context, main_log, &flag, step.output_role());
        main_log.separator()?;

        match aggregated {
            Ok(summary) => {
                self.timeline.add_event(&flag, EventType::Completed);
                Ok(StepOutcome::Completed(summary))
            }
            Err(e) => {
                self.timeline.add_event(&flag, EventType::Failed);
                Err(e)
            }
        }
    }
}

/// Samples that passed the previous step and have no ENDING marker yet.
fn eligible_tasks(context: &RunContext, resume: &ResumeController, flag: &str) -> Vec<Task> {
    context
        .samples()
        .iter()
        .enumerate()
        .filter(|(index, _)| context.run_log().passed_last(*index))
        .filter(|(_, sample)| {
            let finished = resume.is_sample_finished(context.paths(), &sample.stub, flag);
            if finished {
                info!("{}: {} already finished, not resubmitted", sample.stub, flag);
            }
            !finished
        })
        .map(|(index, sample)| Task {
            index,
            stub: sample.stub.clone(),
        })
        .collect()
}

/// Asks the operator before results are deleted. Only `y`/`yes` confirms.
fn confirm_deletion<R: BufRead, W: Write>(dirs: &[PathBuf], input: &mut R, output: &mut W) -> Result<bool> {
    let stdout = Path::new("<stdout>");
    writeln!(output, "A clean run deletes:").map_err(|e| PipelineError::io(stdout, e))?;
    for dir in dirs {
        writeln!(output, "  {}", dir.display()).map_err(|e| PipelineError::io(stdout, e))?;
    }
    write!(output, "Continue? [y/N] ").map_err(|e| PipelineError::io(stdout, e))?;
    output.flush().map_err(|e| PipelineError::io(stdout, e))?;

    let mut answer = String::new();
    input
        .read_line(&mut answer)
        .map_err(|e| PipelineError::io("<stdin>", e))?;
    Ok(matches!(answer.trim().to_lowercase().as_str(), "y" | "yes"))
}
