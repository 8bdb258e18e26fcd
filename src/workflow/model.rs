//! Pipeline Data Model
//!
//! Core data structures describing a pipeline: the ordered step list, the
//! execution strategy and the cluster settings.
//!
//! # Example YAML Format
//!
//! ```yaml
//! working_dir: /data/run1
//! samples: /data/run1/samples.txt
//! sample_header: true
//! strategy: cluster
//! cluster:
//!   memory: 8G
//!   poll_interval_secs: 60
//! steps:
//!   - name: fastqc
//!     input: raw_files
//!     program: /opt/wrappers/run_fastqc
//!
//!   - name: trim
//!     input: raw_files
//!     output: fastq_files
//!     command: cutadapt -o {output} {input}
//!     outputs: "{step_dir}/{sample}.fastq"
//!
//!   - name: align
//!     input: fastq_files
//!     output: bam_files
//!     cores: "4-8"
//!     memory: 32G
//!     program: /opt/wrappers/run_star
//! ```

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::PipelineError;

/// Name of the file role holding the raw sample files.
pub const RAW_ROLE: &str = "raw_files";

/// Row header of the first run-log row.
pub const RAW_FLAG: &str = "raw";

/// Memory value meaning "use the cluster default".
pub const STANDARD_MEMORY: &str = "standard";

/// Derives the resume key of a step.
///
/// The flag only depends on the step name and the role it reads, so a
/// resumed run of the same pipeline finds the same markers again.
pub fn current_flag(step_name: &str, input_role: &str) -> String {
    format!("{}_{}", step_name, input_role)
}

/// How per-sample tasks are executed.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    /// Submit every task to the cluster scheduler and poll for completion
    #[default]
    Cluster,
    /// Run every task sequentially on this machine
    Local,
}

/// How a step's worker is started.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Invocation<'a> {
    /// External wrapper called as `<program> -i <index> -n <cores> -d <context>`
    Program(&'a Path),
    /// Command template executed by the built-in `exec` worker
    Command(&'a str),
}

/// A single step of the pipeline.
///
/// Steps are plain descriptors: the engine derives all runtime state from
/// the run context and the per-sample logs.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Step {
    /// Step name, also used as the name of its working directory
    pub name: String,

    /// File role the step reads
    pub input: String,

    /// File role the step writes (none for pure QC steps)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,

    /// Initialise a missing output role with a copy of the input role
    #[serde(default)]
    pub seed_from_input: bool,

    /// Delete the (non-raw) input files after success when the run allows it
    #[serde(default)]
    pub remove_input: bool,

    /// Core request passed to the scheduler (e.g. "1-8")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cores: Option<String>,

    /// Memory class ("standard" or an explicit value such as "32G")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,

    /// External per-sample wrapper
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub program: Option<PathBuf>,

    /// Command template for the built-in worker
    /// Supported placeholders: {input}, {input2}, {output}, {output2},
    /// {sample}, {step_dir}, {cores}
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,

    /// Output path templates reported by the built-in worker (at most two)
    #[serde(
        deserialize_with = "single_or_vec",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub outputs: Vec<String>,
}

/// Deserializes either a single string or array of strings into Vec<String>
fn single_or_vec<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let val = Value::deserialize(deserializer)?;
    match val {
        Value::Null => Ok(Vec::new()),
        Value::String(s) if s.is_empty() => Ok(Vec::new()),
        Value::String(s) => Ok(vec![s]),
        Value::Array(arr) => arr
            .into_iter()
            .map(|v| match v {
                Value::String(s) => Ok(s),
                _ => Err(de::Error::custom("Expected string in array")),
            })
            .collect(),
        _ => Err(de::Error::custom("Expected string or array of strings")),
    }
}

impl Step {
    /// Creates a step reading `input`.
    ///
    /// # Example
    ///
    /// ```
    /// use seqflow::workflow::Step;
    ///
    /// let step = Step::new("align", "fastq_files")
    ///     .with_output("bam_files")
    ///     .with_program("/opt/wrappers/run_star")
    ///     .with_cores("4-8");
    /// assert_eq!(step.flag(), "align_fastq_files");
    /// ```
    pub fn new(name: impl Into<String>, input: impl Into<String>) -> Self {
        Self {
            name: name.into().trim().to_string(),
            input: input.into().trim().to_string(),
            output: None,
            seed_from_input: false,
            remove_input: false,
            cores: None,
            memory: None,
            program: None,
            command: None,
            outputs: Vec::new(),
        }
    }

    /// Sets the output role.
    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.output = Some(output.into());
        self
    }

    /// Seeds the output role from the input role when it does not exist yet.
    pub fn seeded(mut self) -> Self {
        self.seed_from_input = true;
        self
    }

    /// Marks the step's input files as intermediate.
    pub fn removing_input(mut self) -> Self {
        self.remove_input = true;
        self
    }

    /// Uses an external wrapper as worker.
    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = Some(program.into());
        self
    }

    /// Uses the built-in worker with a command template.
    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = Some(command.into());
        self
    }

    /// Sets the output templates of a command step.
    pub fn with_outputs(mut self, outputs: Vec<String>) -> Self {
        self.outputs = outputs;
        self
    }

    /// Sets the core request.
    pub fn with_cores(mut self, cores: impl Into<String>) -> Self {
        self.cores = Some(cores.into());
        self
    }

    /// Sets the memory class.
    pub fn with_memory(mut self, memory: impl Into<String>) -> Self {
        self.memory = Some(memory.into());
        self
    }

    /// Resume key of this step.
    pub fn flag(&self) -> String {
        current_flag(&self.name, &self.input)
    }

    /// Output role, if the step propagates one.
    pub fn output_role(&self) -> Option<&str> {
        self.output
            .as_deref()
            .map(str::trim)
            .filter(|role| !role.is_empty())
    }

    /// Returns how the worker for this step is started.
    pub fn invocation(&self) -> Option<Invocation<'_>> {
        match (&self.program, &self.command) {
            (Some(program), None) => Some(Invocation::Program(program)),
            (None, Some(command)) => Some(Invocation::Command(command)),
            _ => None,
        }
    }

    /// Core request for the scheduler, falling back to the cluster default.
    pub fn core_request<'a>(&'a self, cluster: &'a ClusterSettings) -> &'a str {
        self.cores
            .as_deref()
            .filter(|c| !c.trim().is_empty())
            .unwrap_or(&cluster.num_processors)
    }

    /// Memory request for the scheduler; `None` leaves it to the scheduler.
    pub fn memory_request(&self, cluster: &ClusterSettings) -> Option<String> {
        let memory = match self.memory.as_deref().map(str::trim) {
            None | Some("") | Some(STANDARD_MEMORY) => cluster.memory.trim(),
            Some(explicit) => explicit,
        };
        (!memory.is_empty()).then(|| memory.to_string())
    }
}

/// Settings of the cluster strategy.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ClusterSettings {
    /// Address notified on job begin/end
    #[serde(default)]
    pub email: String,

    #[serde(default)]
    pub send_email: bool,

    /// Default memory request ("standard" memory class)
    #[serde(default)]
    pub memory: String,

    /// Scheduler project the jobs are accounted to
    #[serde(default)]
    pub project: String,

    /// Cluster flavour; "scc" sources ~/.bashrc instead of a shebang
    #[serde(default)]
    pub machine: String,

    /// Hard runtime limit (h_rt), e.g. "24:00:00"
    #[serde(default)]
    pub runtime_limit: String,

    /// Default core request for steps that do not set one
    #[serde(default = "default_num_processors")]
    pub num_processors: String,

    /// Parallel environment used with `-pe`
    #[serde(default = "default_parallel_env")]
    pub parallel_env: String,

    /// Seconds between two queue checks
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Give up waiting for a batch after this many seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,

    /// Prefix of generated batch ids
    #[serde(default = "default_job_prefix")]
    pub job_prefix: String,
}

fn default_num_processors() -> String {
    "1-8".to_string()
}

fn default_parallel_env() -> String {
    "single_node".to_string()
}

fn default_poll_interval() -> u64 {
    30
}

fn default_job_prefix() -> String {
    "SF_".to_string()
}

impl ClusterSettings {
    /// Time between two queue checks.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    /// Optional upper bound on a single batch wait.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

impl Default for ClusterSettings {
    fn default() -> Self {
        Self {
            email: String::new(),
            send_email: false,
            memory: String::new(),
            project: String::new(),
            machine: String::new(),
            runtime_limit: String::new(),
            num_processors: default_num_processors(),
            parallel_env: default_parallel_env(),
            poll_interval_secs: default_poll_interval(),
            timeout_secs: None,
            job_prefix: default_job_prefix(),
        }
    }
}

/// A complete pipeline definition.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PipelineConfig {
    /// Root of the run; results, report and deliverables live below it
    pub working_dir: PathBuf,

    /// Tab-separated sample sheet
    pub samples: PathBuf,

    /// First line of the sample sheet is a header
    #[serde(default)]
    pub sample_header: bool,

    /// Two raw files per sample
    #[serde(default)]
    pub paired: bool,

    /// Ignore and delete all previous results
    #[serde(default)]
    pub clean_run: bool,

    /// Ask before deleting previous results on a clean run
    #[serde(default)]
    pub ask_before_deleting: bool,

    /// Workers delete their (non-raw) input files after success
    #[serde(default)]
    pub remove_intermediate: bool,

    #[serde(default)]
    pub strategy: Strategy,

    /// Cores handed to workers by the local strategy
    #[serde(default = "default_local_cores")]
    pub local_cores: usize,

    #[serde(default)]
    pub cluster: ClusterSettings,

    /// Ordered step list
    pub steps: Vec<Step>,
}

fn default_local_cores() -> usize {
    1
}

impl PipelineConfig {
    /// Creates a configuration with default settings.
    pub fn new(working_dir: impl Into<PathBuf>, samples: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: working_dir.into(),
            samples: samples.into(),
            sample_header: false,
            paired: false,
            clean_run: false,
            ask_before_deleting: false,
            remove_intermediate: false,
            strategy: Strategy::default(),
            local_cores: default_local_cores(),
            cluster: ClusterSettings::default(),
            steps: Vec::new(),
        }
    }

    /// Appends a step.
    pub fn with_step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    /// Directory layout of this run.
    pub fn paths(&self) -> RunPaths {
        RunPaths::new(&self.working_dir)
    }

    /// Makes `working_dir`, `samples` and relative program paths absolute
    /// against the current directory.
    ///
    /// Workers run inside their step directory and only receive the path of
    /// the persisted context, so every path they derive from it must be
    /// absolute. Bare program names are left for the `PATH` lookup.
    pub fn resolve_paths(&mut self) -> crate::error::Result<()> {
        let cwd = env::current_dir().map_err(|e| PipelineError::io(".", e))?;

        if self.working_dir.is_relative() {
            self.working_dir = cwd.join(&self.working_dir);
        }
        if self.samples.is_relative() {
            self.samples = cwd.join(&self.samples);
        }
        for program in self.steps.iter_mut().filter_map(|s| s.program.as_mut()) {
            if program.is_relative() && program.components().count() > 1 {
                *program = cwd.join(&*program);
            }
        }
        Ok(())
    }
}

/// On-disk layout of a run below the working directory.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RunPaths {
    root: PathBuf,
}

impl RunPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn results_dir(&self) -> PathBuf {
        self.root.join("results")
    }

    pub fn report_dir(&self) -> PathBuf {
        self.root.join("report")
    }

    pub fn deliverables_dir(&self) -> PathBuf {
        self.root.join("deliverables")
    }

    /// Directory holding one durable log per sample.
    pub fn log_dir(&self) -> PathBuf {
        self.results_dir().join("log")
    }

    pub fn sample_log(&self, stub: &str) -> PathBuf {
        self.log_dir().join(format!("{}.log", stub))
    }

    /// The aggregate log read by the resume check.
    pub fn main_log(&self) -> PathBuf {
        self.results_dir().join("main.log")
    }

    /// Persisted run context read by workers.
    pub fn context_file(&self) -> PathBuf {
        self.results_dir().join("context.json")
    }

    pub fn qsub_dir(&self) -> PathBuf {
        self.results_dir().join("qsub")
    }

    pub fn step_dir(&self, step_name: &str) -> PathBuf {
        self.results_dir().join(step_name)
    }
}
