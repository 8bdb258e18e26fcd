//! Run Monitoring Module
//!
//! Reports on the progress and outcome of a run.
//!
//! # Components
//!
//! - [`ExecutionTimeline`]: Step start/end timing
//! - [`report`]: Status table and report files written at the end of a run

pub mod report;
pub mod timeline;

pub use report::{status_table, write_reports, ReportFiles};
pub use timeline::{EventType, ExecutionTimeline, TimelineEvent};
