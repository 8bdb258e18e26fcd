//! Pipeline Definition Module
//!
//! Provides the data structures describing a pipeline and the mutable
//! state of one run.
//!
//! # Structure
//!
//! - [`model`]: Core data structures (Step, PipelineConfig, RunPaths)
//! - [`parser`]: YAML and sample sheet loading
//! - [`validator`]: Validation rules
//! - [`state`]: The run context shared with worker processes
//! - [`run_log`]: Step × sample success matrix

pub mod model;
pub mod parser;
pub mod run_log;
pub mod state;
pub mod validator;

pub use model::{current_flag, ClusterSettings, PipelineConfig, RunPaths, Step, Strategy, RAW_ROLE};
pub use parser::{load_pipeline, load_sample_sheet};
pub use run_log::{RunLog, RunLogRow};
pub use state::{ActiveStep, ResourceHints, RunContext, Sample, SamplePaths};
