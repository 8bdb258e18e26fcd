//! seqflow - Resumable Per-Sample Pipeline Engine
//!
//! Runs an ordered list of analysis steps over a set of sequencing samples.
//! Each step is executed once per sample, either as Grid Engine jobs or as
//! local child processes. Progress is journaled in plain-text logs so an
//! interrupted run picks up where it stopped.
//!
//! # Architecture
//!
//! The library is organized into five modules:
//!
//! - [`workflow`]: Pipeline definition, sample sheet and run context
//! - [`journal`]: Durable per-sample and aggregate logs
//! - [`execution`]: Step loop, dispatch, scheduler polling and workers
//! - [`monitoring`]: Execution timeline and end-of-run reports
//! - [`error`]: Error type shared by all modules
//!
//! # Example
//!
//! ```rust,no_run
//! use seqflow::execution::Engine;
//! use seqflow::load_pipeline;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Load a pipeline from YAML
//!     let config = load_pipeline("pipeline.yaml")?;
//!
//!     // Run every step, skipping what an earlier run finished
//!     let mut engine = Engine::new(config);
//!     let summary = engine.run()?;
//!
//!     println!("{} samples passed", summary.context.run_log().last().success_count());
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod execution;
pub mod journal;
pub mod monitoring;
pub mod workflow;

// Re-export commonly used types
pub use error::{PipelineError, Result};
pub use execution::engine::Engine;
pub use workflow::model::{PipelineConfig, Step};
pub use workflow::parser::load_pipeline;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "seqflow";
