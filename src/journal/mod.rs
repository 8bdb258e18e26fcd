//! Run Journals
//!
//! Durable text records that make a run resumable.
//!
//! - [`sample_log`]: per-sample STARTING/ENDING markers written by workers
//! - [`main_log`]: aggregate log with per-step success/failure summaries

pub mod main_log;
pub mod sample_log;

pub use main_log::MainLog;
pub use sample_log::{LogEvent, SampleHistory, SampleLog};
