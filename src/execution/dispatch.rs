//! Step Dispatch
//!
//! Turns a step into one task per eligible sample and hands the tasks to
//! an execution strategy:
//!
//! - [`LocalDispatcher`] runs the workers one after another on this machine.
//! - [`ClusterDispatcher`] submits one job per sample through a
//!   [`SchedulerAdapter`] and polls the queue until the batch is gone.

use std::fs::{self, File};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::atomic::AtomicBool;

use chrono::Local;
use log::{debug, info, warn};

use super::scheduler::{JobRequest, SchedulerAdapter};
use super::waiter::CompletionWaiter;
use super::worker::WorkerArgs;
use crate::error::{PipelineError, Result};
use crate::workflow::validator::BATCH_ID_DIGITS;
use crate::workflow::ResourceHints;

/// Cores argument of cluster jobs, expanded by the scheduler at runtime.
pub const CLUSTER_CORES: &str = "$NSLOTS";

/// Executable started for every task, with the arguments that precede the
/// worker arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    pub program: PathBuf,
    pub leading_args: Vec<String>,
}

impl WorkerCommand {
    /// An external per-sample wrapper.
    pub fn program(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            leading_args: Vec::new(),
        }
    }

    /// The built-in command worker (`<exe> exec --step <flag>`).
    pub fn builtin(exe: impl Into<PathBuf>, flag: &str) -> Self {
        Self {
            program: exe.into(),
            leading_args: vec!["exec".to_string(), "--step".to_string(), flag.to_string()],
        }
    }

    /// Full argument list for one sample.
    pub fn args_for(&self, worker: &WorkerArgs) -> Vec<String> {
        let mut args = self.leading_args.clone();
        args.extend(worker.to_args());
        args
    }

    /// Shell command line for one sample, as written into job scripts.
    pub fn command_line(&self, worker: &WorkerArgs) -> String {
        std::iter::once(self.program.display().to_string())
            .chain(self.args_for(worker))
            .map(|arg| shell_quote(&arg))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Quotes an argument unless it only holds shell-safe characters.
///
/// `$` stays unquoted so scheduler variables such as `$NSLOTS` expand.
fn shell_quote(arg: &str) -> String {
    let safe = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_-./=:,+@%$".contains(c));
    if safe {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

/// One sample of a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub index: usize,
    pub stub: String,
}

/// Everything needed to start the workers of one step.
#[derive(Debug, Clone)]
pub struct Batch {
    pub flag: String,
    pub step_name: String,
    /// Working directory of the step
    pub step_dir: PathBuf,
    /// Directory for job scripts and job logs
    pub qsub_dir: PathBuf,
    /// Persisted run context handed to every worker
    pub context_file: PathBuf,
    pub worker: WorkerCommand,
    pub resources: ResourceHints,
    pub tasks: Vec<Task>,
}

/// Handle on a dispatched batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchHandle {
    /// Every worker already ran to completion
    Local { executed: usize },
    /// Jobs were handed to the scheduler under a shared name
    Cluster {
        batch_id: String,
        qsub_dir: PathBuf,
        submitted: usize,
    },
}

/// Execution strategy for per-sample tasks.
pub trait Dispatcher {
    /// Starts the workers of a batch.
    fn dispatch(&mut self, batch: &Batch) -> Result<BatchHandle>;

    /// Blocks until every worker of the batch is done.
    fn wait(&mut self, handle: &BatchHandle, cancel: &AtomicBool) -> Result<()>;
}

/// Runs workers sequentially as child processes.
#[derive(Debug, Clone)]
pub struct LocalDispatcher {
    cores: usize,
}

impl LocalDispatcher {
    pub fn new(cores: usize) -> Self {
        Self {
            cores: cores.max(1),
        }
    }

    fn run_task(&self, batch: &Batch, task: &Task) -> Result<bool> {
        let out_path = batch.step_dir.join(format!("{}.out", task.stub));
        let out = File::create(&out_path).map_err(|e| PipelineError::io(&out_path, e))?;
        let err = out.try_clone().map_err(|e| PipelineError::io(&out_path, e))?;

        let args = batch.worker.args_for(&WorkerArgs::new(
            task.index,
            self.cores.to_string(),
            &batch.context_file,
        ));
        debug!(
            "Running {} {}",
            batch.worker.program.display(),
            args.join(" ")
        );

        let status = Command::new(&batch.worker.program)
            .args(&args)
            .current_dir(&batch.step_dir)
            .stdout(Stdio::from(out))
            .stderr(Stdio::from(err))
            .status()
            .map_err(|e| PipelineError::io(&batch.worker.program, e))?;

        if !status.success() {
            warn!(
                "Worker for sample {} exited with {:?} (see {})",
                task.stub,
                status.code(),
                out_path.display()
            );
        }
        Ok(status.success())
    }
}

impl Dispatcher for LocalDispatcher {
    fn dispatch(&mut self, batch: &Batch) -> Result<BatchHandle> {
        fs::create_dir_all(&batch.step_dir).map_err(|e| PipelineError::io(&batch.step_dir, e))?;

        let mut executed = 0;
        for task in &batch.tasks {
            info!("Running {} on sample {}", batch.flag, task.stub);
            // A worker that cannot start fails its sample at aggregation
            match self.run_task(batch, task) {
                Ok(_) => executed += 1,
                Err(e) => warn!("Could not run worker for sample {}: {}", task.stub, e),
            }
        }

        Ok(BatchHandle::Local { executed })
    }

    fn wait(&mut self, _handle: &BatchHandle, _cancel: &AtomicBool) -> Result<()> {
        Ok(())
    }
}

/// Submits workers as scheduler jobs and waits for the whole batch.
pub struct ClusterDispatcher<S: SchedulerAdapter> {
    scheduler: S,
    waiter: CompletionWaiter,
    user: String,
    job_prefix: String,
}

impl<S: SchedulerAdapter> ClusterDispatcher<S> {
    pub fn new(
        scheduler: S,
        waiter: CompletionWaiter,
        user: impl Into<String>,
        job_prefix: impl Into<String>,
    ) -> Self {
        Self {
            scheduler,
            waiter,
            user: user.into(),
            job_prefix: job_prefix.into(),
        }
    }

    pub fn scheduler(&self) -> &S {
        &self.scheduler
    }
}

impl<S: SchedulerAdapter> Dispatcher for ClusterDispatcher<S> {
    fn dispatch(&mut self, batch: &Batch) -> Result<BatchHandle> {
        fs::create_dir_all(&batch.step_dir).map_err(|e| PipelineError::io(&batch.step_dir, e))?;
        fs::create_dir_all(&batch.qsub_dir).map_err(|e| PipelineError::io(&batch.qsub_dir, e))?;

        let batch_id = generate_batch_id(&self.job_prefix);
        let mut submitted = 0;

        for task in &batch.tasks {
            let command = batch.worker.command_line(&WorkerArgs::new(
                task.index,
                CLUSTER_CORES,
                &batch.context_file,
            ));
            let job = JobRequest::new(
                &batch.qsub_dir,
                &task.stub,
                &batch_id,
                command,
                batch.resources.clone(),
            );

            // A rejected job fails its sample at aggregation
            match self.scheduler.submit(&job) {
                Ok(()) => submitted += 1,
                Err(e) => warn!("Submission for sample {} failed: {}", task.stub, e),
            }
        }

        info!(
            "Submitted {}/{} jobs of {} as batch {}",
            submitted,
            batch.tasks.len(),
            batch.flag,
            batch_id
        );

        Ok(BatchHandle::Cluster {
            batch_id,
            qsub_dir: batch.qsub_dir.clone(),
            submitted,
        })
    }

    fn wait(&mut self, handle: &BatchHandle, cancel: &AtomicBool) -> Result<()> {
        match handle {
            BatchHandle::Cluster {
                submitted: 0, ..
            } => Ok(()),
            BatchHandle::Cluster {
                batch_id, qsub_dir, ..
            } => self
                .waiter
                .wait(&mut self.scheduler, &self.user, batch_id, qsub_dir, cancel),
            BatchHandle::Local { .. } => Ok(()),
        }
    }
}

/// Generates a batch id from the job prefix and the current time.
pub fn generate_batch_id(prefix: &str) -> String {
    let modulus = 10_i64.pow(BATCH_ID_DIGITS as u32);
    let suffix = Local::now().timestamp_millis().rem_euclid(modulus);
    format!("{}{:0width$}", prefix, suffix, width = BATCH_ID_DIGITS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::scheduler::RunningJob;
    use std::collections::BTreeSet;
    use std::path::Path;
    use std::time::Duration;
    use tempfile::tempdir;

    #[derive(Default)]
    struct RecordingScheduler {
        submitted: Vec<JobRequest>,
        reject: Option<String>,
    }

    impl SchedulerAdapter for RecordingScheduler {
        fn submit(&mut self, job: &JobRequest) -> Result<()> {
            if self.reject.as_deref() == Some(job.job_id.as_str()) {
                return Err(PipelineError::Scheduler("rejected".to_string()));
            }
            self.submitted.push(job.clone());
            Ok(())
        }

        fn list_running_jobs(&mut self, _user: &str) -> Result<BTreeSet<RunningJob>> {
            Ok(BTreeSet::new())
        }
    }

    fn batch(dir: &Path, worker: WorkerCommand) -> Batch {
        Batch {
            flag: "trim_raw_files".to_string(),
            step_name: "trim".to_string(),
            step_dir: dir.join("results/trim"),
            qsub_dir: dir.join("results/qsub"),
            context_file: dir.join("results/context.json"),
            worker,
            resources: ResourceHints {
                cores: "1-8".to_string(),
                memory: None,
            },
            tasks: vec![
                Task {
                    index: 0,
                    stub: "A".to_string(),
                },
                Task {
                    index: 2,
                    stub: "C".to_string(),
                },
            ],
        }
    }

    #[test]
    fn test_builtin_worker_args() {
        let worker = WorkerCommand::builtin("/usr/bin/seqflow", "trim_raw_files");
        let args = worker.args_for(&WorkerArgs::new(1, "2", "/w/results/context.json"));
        assert_eq!(
            args,
            vec![
                "exec",
                "--step",
                "trim_raw_files",
                "-i",
                "1",
                "-n",
                "2",
                "-d",
                "/w/results/context.json"
            ]
        );
    }

    #[test]
    fn test_command_line_quoting() {
        let worker = WorkerCommand::program("/opt/my wrappers/run_star");
        let line = worker.command_line(&WorkerArgs::new(0, CLUSTER_CORES, "/w/results/context.json"));
        assert_eq!(
            line,
            "'/opt/my wrappers/run_star' -i 0 -n $NSLOTS -d /w/results/context.json"
        );
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn test_batch_id_format() {
        let id = generate_batch_id("SF_");
        assert_eq!(id.len(), 9);
        assert!(id.starts_with("SF_"));
        assert!(id[3..].chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn test_cluster_dispatch_submits_one_job_per_task() {
        let temp_dir = tempdir().unwrap();
        let mut dispatcher = ClusterDispatcher::new(
            RecordingScheduler::default(),
            CompletionWaiter::new(Duration::from_millis(1), None),
            "alice",
            "SF_",
        );

        let handle = dispatcher
            .dispatch(&batch(temp_dir.path(), WorkerCommand::program("/opt/run_trim")))
            .unwrap();

        let jobs = &dispatcher.scheduler().submitted;
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[1].job_id, "C");
        assert!(jobs[1].command.contains("-i 2 -n $NSLOTS -d"));
        assert_eq!(jobs[0].batch_id, jobs[1].batch_id);
        assert!(temp_dir.path().join("results/trim").is_dir());

        let BatchHandle::Cluster { submitted, .. } = &handle else {
            panic!("expected a cluster handle");
        };
        assert_eq!(*submitted, 2);
        dispatcher.wait(&handle, &AtomicBool::new(false)).unwrap();
    }

    #[test]
    fn test_cluster_dispatch_survives_rejected_job() {
        let temp_dir = tempdir().unwrap();
        let scheduler = RecordingScheduler {
            reject: Some("A".to_string()),
            ..RecordingScheduler::default()
        };
        let mut dispatcher = ClusterDispatcher::new(
            scheduler,
            CompletionWaiter::new(Duration::from_millis(1), None),
            "alice",
            "SF_",
        );

        let handle = dispatcher
            .dispatch(&batch(temp_dir.path(), WorkerCommand::program("/opt/run_trim")))
            .unwrap();

        assert!(matches!(handle, BatchHandle::Cluster { submitted: 1, .. }));
        assert_eq!(dispatcher.scheduler().submitted[0].job_id, "C");
    }

    #[cfg(unix)]
    #[test]
    fn test_local_dispatch_captures_output() {
        use std::os::unix::fs::PermissionsExt;

        let temp_dir = tempdir().unwrap();
        let script = temp_dir.path().join("worker.sh");
        fs::write(&script, "#!/bin/sh\necho \"worker $@\"\n[ \"$2\" = \"0\" ]\n").unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();

        let mut dispatcher = LocalDispatcher::new(3);
        let handle = dispatcher
            .dispatch(&batch(temp_dir.path(), WorkerCommand::program(&script)))
            .unwrap();

        assert_eq!(handle, BatchHandle::Local { executed: 2 });
        let out = fs::read_to_string(temp_dir.path().join("results/trim/A.out")).unwrap();
        assert!(out.contains("worker -i 0 -n 3 -d"));
        assert!(temp_dir.path().join("results/trim/C.out").exists());
    }

    #[test]
    fn test_local_dispatch_missing_program() {
        let temp_dir = tempdir().unwrap();
        let mut dispatcher = LocalDispatcher::new(1);

        let handle = dispatcher
            .dispatch(&batch(
                temp_dir.path(),
                WorkerCommand::program(temp_dir.path().join("does_not_exist")),
            ))
            .unwrap();

        assert_eq!(handle, BatchHandle::Local { executed: 0 });
    }
}
