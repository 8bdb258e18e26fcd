//! Run Context
//!
//! Mutable state of one pipeline invocation: samples, file-role
//! registries, the run-log matrix and the active step.
//!
//! The context is persisted to `results/context.json` before every
//! dispatch. Worker processes restore it from there and never see the
//! controller's in-memory copy.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info};
use serde::{Deserialize, Serialize};

use super::model::{current_flag, PipelineConfig, RunPaths, Step, RAW_ROLE};
use super::run_log::RunLog;
use crate::error::{PipelineError, Result};

/// File paths of one sample within a file role.
///
/// An empty primary path marks the sample as unavailable for the role.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct SamplePaths {
    pub primary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secondary: Option<String>,
}

impl SamplePaths {
    pub fn single(primary: impl Into<String>) -> Self {
        Self {
            primary: primary.into(),
            secondary: None,
        }
    }

    pub fn pair(primary: impl Into<String>, secondary: impl Into<String>) -> Self {
        Self {
            primary: primary.into(),
            secondary: Some(secondary.into()),
        }
    }

    /// Slot of a sample that has no file for this role.
    pub fn unavailable() -> Self {
        Self::default()
    }

    pub fn is_available(&self) -> bool {
        !self.primary.is_empty()
    }

    /// Joins relative paths onto `base`.
    pub fn rooted_at(&self, base: &Path) -> Self {
        let root = |file: &str| {
            if file.is_empty() || Path::new(file).is_absolute() {
                file.to_string()
            } else {
                base.join(file).display().to_string()
            }
        };
        Self {
            primary: root(&self.primary),
            secondary: self.secondary.as_deref().map(root),
        }
    }

    /// Non-empty paths of this slot.
    pub fn files(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.primary.as_str())
            .chain(self.secondary.as_deref())
            .filter(|f| !f.is_empty())
    }

    /// Applies an ENDING payload (`path` or `path1;path2`).
    ///
    /// A single-path payload keeps the current secondary path.
    pub fn apply_payload(&mut self, payload: &str) {
        let mut parts = payload.split(';').map(str::trim);
        self.primary = parts.next().unwrap_or_default().to_string();
        if let Some(second) = parts.next() {
            self.secondary = Some(second.to_string());
        }
    }

    /// Renders the slot as an ENDING payload.
    pub fn to_payload(&self) -> String {
        self.files().collect::<Vec<_>>().join(";")
    }
}

/// A sample of the run.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Sample {
    /// Unique sample name, used for log and job file names
    pub stub: String,
    /// Raw input file(s)
    pub raw: SamplePaths,
}

impl Sample {
    pub fn new(stub: impl Into<String>, raw: SamplePaths) -> Self {
        Self {
            stub: stub.into(),
            raw,
        }
    }
}

/// Resource hints handed to the workers of the active step.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ResourceHints {
    /// Core request, e.g. "1-8"
    pub cores: String,
    /// Memory request; `None` leaves it to the scheduler
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
}

/// The step currently being dispatched.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ActiveStep {
    pub name: String,
    pub flag: String,
    pub input_role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_role: Option<String>,
    pub resources: ResourceHints,
}

/// Persistent state of one pipeline invocation.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct RunContext {
    paths: RunPaths,
    samples: Vec<Sample>,
    steps: Vec<Step>,
    roles: BTreeMap<String, Vec<SamplePaths>>,
    run_log: RunLog,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    current: Option<ActiveStep>,

    /// Two raw files per sample
    pub paired: bool,
    /// Prior completion state is ignored
    pub clean_run: bool,
    /// Workers delete non-raw inputs after success
    pub remove_intermediate: bool,
}

impl RunContext {
    /// Creates the context of a new invocation.
    ///
    /// The raw files become the `raw_files` role and the run log starts
    /// with its `raw` row.
    pub fn new(config: &PipelineConfig, samples: Vec<Sample>) -> Self {
        let mut roles = BTreeMap::new();
        roles.insert(
            RAW_ROLE.to_string(),
            samples.iter().map(|s| s.raw.clone()).collect(),
        );

        Self {
            paths: config.paths(),
            run_log: RunLog::new(samples.len()),
            samples,
            steps: config.steps.clone(),
            roles,
            current: None,
            paired: config.paired,
            clean_run: config.clean_run,
            remove_intermediate: config.remove_intermediate,
        }
    }

    pub fn paths(&self) -> &RunPaths {
        &self.paths
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    /// Gets a sample by position.
    pub fn sample(&self, index: usize) -> Result<&Sample> {
        self.samples
            .get(index)
            .ok_or(PipelineError::SampleOutOfRange {
                index,
                count: self.samples.len(),
            })
    }

    /// Sample names in sheet order.
    pub fn stubs(&self) -> Vec<&str> {
        self.samples.iter().map(|s| s.stub.as_str()).collect()
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// Gets a pipeline step by its flag.
    ///
    /// Step names may repeat across input roles; flags never do.
    pub fn step_by_flag(&self, flag: &str) -> Result<&Step> {
        self.steps
            .iter()
            .find(|s| s.flag() == flag)
            .ok_or_else(|| PipelineError::UnknownStep(flag.to_string()))
    }

    pub fn run_log(&self) -> &RunLog {
        &self.run_log
    }

    pub fn run_log_mut(&mut self) -> &mut RunLog {
        &mut self.run_log
    }

    /// Per-sample paths of a file role.
    pub fn role(&self, name: &str) -> Option<&[SamplePaths]> {
        self.roles.get(name).map(Vec::as_slice)
    }

    /// Declares the roles a step reads and writes.
    ///
    /// The input role must already exist. A missing output role is created
    /// with one empty slot per sample, or as a copy of the input role when
    /// `seed` is set.
    pub fn register_io(&mut self, input_role: &str, output_role: Option<&str>, seed: bool) -> Result<()> {
        let input = self
            .roles
            .get(input_role)
            .filter(|slots| !slots.is_empty())
            .ok_or_else(|| PipelineError::UnknownInputRole(input_role.to_string()))?
            .clone();

        if let Some(output) = output_role.filter(|r| !r.is_empty()) {
            if !self.roles.contains_key(output) {
                let slots = if seed {
                    debug!("Seeding role '{}' from '{}'", output, input_role);
                    input
                } else {
                    vec![SamplePaths::unavailable(); self.samples.len()]
                };
                self.roles.insert(output.to_string(), slots);
            }
        }

        Ok(())
    }

    /// Replaces the slot of a sample in a role.
    pub fn set_slot(&mut self, role: &str, index: usize, paths: SamplePaths) -> Result<()> {
        let count = self.samples.len();
        let slot = self
            .roles
            .get_mut(role)
            .ok_or_else(|| PipelineError::UnknownInputRole(role.to_string()))?
            .get_mut(index)
            .ok_or(PipelineError::SampleOutOfRange { index, count })?;
        *slot = paths;
        Ok(())
    }

    /// Gets the slot of a sample in a role.
    pub fn slot(&self, role: &str, index: usize) -> Option<&SamplePaths> {
        self.roles.get(role).and_then(|slots| slots.get(index))
    }

    /// Marks a step as the active one and returns its flag.
    pub fn begin_step(&mut self, step: &Step, resources: ResourceHints) -> String {
        let flag = current_flag(&step.name, &step.input);
        self.current = Some(ActiveStep {
            name: step.name.clone(),
            flag: flag.clone(),
            input_role: step.input.clone(),
            output_role: step.output_role().map(str::to_string),
            resources,
        });
        flag
    }

    pub fn current(&self) -> Option<&ActiveStep> {
        self.current.as_ref()
    }

    /// True if `path` is one of the raw sample files.
    pub fn is_raw_file(&self, path: &str) -> bool {
        self.samples.iter().any(|s| s.raw.files().any(|f| f == path))
    }

    /// Writes the context to `results/context.json` and returns its path.
    ///
    /// The snapshot is written to a temporary file first and renamed, so a
    /// worker never reads a half-written context.
    pub fn persist(&self) -> Result<PathBuf> {
        let target = self.paths.context_file();
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|e| PipelineError::io(parent, e))?;
        }

        let json = serde_json::to_string_pretty(self)?;
        let tmp = target.with_extension("json.tmp");
        fs::write(&tmp, json).map_err(|e| PipelineError::io(&tmp, e))?;
        fs::rename(&tmp, &target).map_err(|e| PipelineError::io(&target, e))?;

        debug!("Persisted run context to {}", target.display());
        Ok(target)
    }

    /// Reads a persisted context.
    pub fn restore(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| PipelineError::io(path, e))?;
        let context: RunContext = serde_json::from_str(&content)?;
        context.run_log.validate(context.samples.len())?;

        info!(
            "Restored run context from {} ({} samples)",
            path.display(),
            context.samples.len()
        );
        Ok(context)
    }
}
