//! Pipeline Execution Module
//!
//! Runs steps over all samples and keeps the run resumable.
//!
//! # Architecture
//!
//! - [`engine`]: Step loop driving a whole run
//! - [`dispatch`]: Local and cluster dispatch of per-sample workers
//! - [`scheduler`]: Grid Engine adapter (`qsub`/`qstat`)
//! - [`waiter`]: Polls the scheduler until a batch is gone
//! - [`aggregate`]: Folds the durable logs into a run-log row
//! - [`resume`]: Completion checks against earlier runs
//! - [`worker`]: Protocol of a per-sample worker process
//! - [`step`]: Built-in worker executing a command template

pub mod aggregate;
pub mod dispatch;
pub mod engine;
pub mod resume;
pub mod scheduler;
pub mod step;
pub mod waiter;
pub mod worker;

pub use aggregate::{aggregate, StepSummary};
pub use dispatch::{Batch, BatchHandle, ClusterDispatcher, Dispatcher, LocalDispatcher, Task, WorkerCommand};
pub use engine::{Engine, RunSummary, StepOutcome};
pub use resume::ResumeController;
pub use scheduler::{JobRequest, RunningJob, SchedulerAdapter, SgeScheduler};
pub use waiter::CompletionWaiter;
pub use worker::{WorkerArgs, WorkerSession, WorkerStart};
