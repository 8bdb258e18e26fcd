//! Cluster Scheduler Adapter
//!
//! Everything that talks to the batch scheduler lives behind
//! [`SchedulerAdapter`]: writing and submitting one job script per sample,
//! and listing the jobs still queued for the current user.
//!
//! The provided implementation targets Sun Grid Engine (`qsub`, `qstat`).

use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;

use log::{debug, info, warn};
use once_cell::sync::Lazy;

use crate::error::{PipelineError, Result};
use crate::workflow::validator::SCHEDULER_NAME_WIDTH;
use crate::workflow::{ClusterSettings, ResourceHints};

/// Name of the user whose jobs are polled.
///
/// Resolved once from `USER`, `LOGNAME` and finally `whoami`.
pub static CURRENT_USER: Lazy<String> = Lazy::new(|| {
    for var in ["USER", "LOGNAME"] {
        if let Ok(user) = std::env::var(var) {
            if !user.trim().is_empty() {
                return user.trim().to_string();
            }
        }
    }

    if let Ok(output) = Command::new("whoami").output() {
        if output.status.success() {
            let user = String::from_utf8_lossy(&output.stdout).trim().to_string();
            if !user.is_empty() {
                return user;
            }
        }
    }

    warn!("Could not determine the current user; qstat will list all jobs");
    String::new()
});

/// One per-sample job handed to the scheduler.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRequest {
    /// Sample name, used for the script and log file names
    pub job_id: String,
    /// Shared job name of every job of the batch
    pub batch_id: String,
    /// Worker command line executed by the job
    pub command: String,
    pub resources: ResourceHints,
    pub script_path: PathBuf,
    /// Joined stdout/stderr of the job
    pub output_log: PathBuf,
}

impl JobRequest {
    /// Builds the request of a sample; scripts live in `qsub_dir`.
    pub fn new(
        qsub_dir: &Path,
        stub: &str,
        batch_id: &str,
        command: impl Into<String>,
        resources: ResourceHints,
    ) -> Self {
        Self {
            job_id: stub.to_string(),
            batch_id: batch_id.to_string(),
            command: command.into(),
            resources,
            script_path: qsub_dir.join(format!("{}.qsub", stub)),
            output_log: qsub_dir.join(format!("{}.qlog", stub)),
        }
    }
}

/// A job still known to the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct RunningJob {
    pub id: String,
    pub name: String,
}

impl RunningJob {
    /// True if this job was submitted as part of `batch_id`.
    ///
    /// `qstat` truncates long names, so a name that is a long enough prefix
    /// of the batch id also counts.
    pub fn belongs_to(&self, batch_id: &str) -> bool {
        if self.name == batch_id {
            return true;
        }
        self.name.len() >= SCHEDULER_NAME_WIDTH && batch_id.starts_with(&self.name)
    }
}

/// Interface to a batch scheduler.
pub trait SchedulerAdapter {
    /// Writes the job script and submits it.
    fn submit(&mut self, job: &JobRequest) -> Result<()>;

    /// Lists the jobs of `user` that are still queued or running.
    fn list_running_jobs(&mut self, user: &str) -> Result<BTreeSet<RunningJob>>;
}

/// Sun Grid Engine adapter.
#[derive(Debug, Clone)]
pub struct SgeScheduler {
    settings: ClusterSettings,
}

impl SgeScheduler {
    pub fn new(settings: ClusterSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &ClusterSettings {
        &self.settings
    }

    /// Renders the job script of a request.
    pub fn render_script(&self, job: &JobRequest) -> String {
        let mut script = String::new();
        let mut line = |text: &str| {
            script.push_str(text);
            script.push('\n');
        };

        if self.settings.machine == "scc" {
            line("source ~/.bashrc");
            line("");
        } else {
            line("#!/bin/bash");
            line("#");
            line("");
        }

        if !self.settings.runtime_limit.is_empty() {
            line(&format!("#$ -l h_rt={}", self.settings.runtime_limit));
            line("");
        }

        line("#$ -S /bin/bash");
        line("#$ -cwd");
        line(&format!("#$ -N {}", job.batch_id));
        line("#$ -j y");
        line(&format!("#$ -o {}", job.output_log.display()));

        if !self.settings.project.is_empty() {
            line(&format!("#$ -P {}", self.settings.project));
        }

        if self.settings.send_email && !self.settings.email.is_empty() {
            line("#$ -m be");
            line(&format!("#$ -M {}", self.settings.email));
        }

        if let Some(memory) = &job.resources.memory {
            line(&format!("#$ -l mem_free={}", memory));
        }
        line("");

        line("echo \"========================================\"");
        line("echo \"Starting on : $(date)\"");
        line("echo \"Running on node : $(hostname)\"");
        line("echo \"Current directory : $(pwd)\"");
        line("echo \"Current job ID : $JOB_ID\"");
        line("echo \"Current job name : $JOB_NAME\"");
        line("echo \"========================================\"");
        line("");
        line(&job.command);
        line("");
        line("echo \"========================================\"");
        line("echo \"Finished on : $(date)\"");
        line("echo \"========================================\"");

        script
    }

    fn write_script(&self, job: &JobRequest) -> Result<()> {
        if let Some(dir) = job.script_path.parent() {
            fs::create_dir_all(dir).map_err(|e| PipelineError::io(dir, e))?;
        }

        let mut file =
            File::create(&job.script_path).map_err(|e| PipelineError::io(&job.script_path, e))?;
        file.write_all(self.render_script(job).as_bytes())
            .map_err(|e| PipelineError::io(&job.script_path, e))?;

        debug!("Wrote job script {}", job.script_path.display());
        Ok(())
    }
}

impl SchedulerAdapter for SgeScheduler {
    fn submit(&mut self, job: &JobRequest) -> Result<()> {
        self.write_script(job)?;

        let output = Command::new("qsub")
            .arg("-pe")
            .arg(&self.settings.parallel_env)
            .arg(&job.resources.cores)
            .arg(&job.script_path)
            .output()
            .map_err(|e| PipelineError::Scheduler(format!("failed to run qsub: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(PipelineError::Scheduler(format!(
                "qsub rejected {}: {}",
                job.script_path.display(),
                stderr.trim()
            )));
        }

        info!(
            "Submitted {} ({})",
            job.job_id,
            String::from_utf8_lossy(&output.stdout).trim()
        );
        Ok(())
    }

    fn list_running_jobs(&mut self, user: &str) -> Result<BTreeSet<RunningJob>> {
        let mut cmd = Command::new("qstat");
        if !user.is_empty() {
            cmd.arg("-u").arg(user);
        }

        let output = cmd
            .output()
            .map_err(|e| PipelineError::Scheduler(format!("failed to run qstat: {}", e)))?;

        if !output.status.success() {
            return Err(PipelineError::Scheduler(format!(
                "qstat exited with {:?}: {}",
                output.status.code(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        Ok(parse_qstat(&String::from_utf8_lossy(&output.stdout)))
    }
}

/// Parses the table printed by `qstat`.
///
/// Header and separator lines are ignored; every row whose first column is
/// numeric yields the job id and the (possibly truncated) job name.
pub fn parse_qstat(output: &str) -> BTreeSet<RunningJob> {
    output
        .lines()
        .filter_map(|line| {
            let mut columns = line.split_whitespace();
            let id = columns.next()?;
            if !id.chars().all(|c| c.is_ascii_digit()) {
                return None;
            }
            // Priority column sits between id and name
            let name = columns.nth(1)?;
            Some(RunningJob {
                id: id.to_string(),
                name: name.to_string(),
            })
        })
        .collect()
}
