//! Completion Waiter
//!
//! Blocks until the scheduler no longer lists any job of a batch. Polling
//! is unbounded unless a timeout is configured; a shared cancellation flag
//! ends the wait early.

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use super::scheduler::SchedulerAdapter;
use crate::error::{PipelineError, Result};

/// Longest uninterrupted sleep, so cancellation is noticed quickly.
const SLEEP_SLICE: Duration = Duration::from_millis(200);

/// Poll loop over the scheduler queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletionWaiter {
    poll_interval: Duration,
    timeout: Option<Duration>,
}

impl CompletionWaiter {
    pub fn new(poll_interval: Duration, timeout: Option<Duration>) -> Self {
        Self {
            poll_interval,
            timeout,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Waits until no job named after `batch_id` is left in the queue.
    ///
    /// Sleeps one interval before every check, like a freshly submitted batch
    /// needs. A failing `qstat` is logged and retried at the next interval.
    /// Once the batch is gone the files in `qsub_dir` are opened to the group.
    pub fn wait<S: SchedulerAdapter + ?Sized>(
        &self,
        scheduler: &mut S,
        user: &str,
        batch_id: &str,
        qsub_dir: &Path,
        cancel: &AtomicBool,
    ) -> Result<()> {
        let started = Instant::now();
        info!("Waiting for jobs of batch {} to finish", batch_id);

        loop {
            self.sleep(cancel);
            if cancel.load(Ordering::Relaxed) {
                return Err(PipelineError::Cancelled(batch_id.to_string()));
            }

            match scheduler.list_running_jobs(user) {
                Ok(jobs) => {
                    let remaining = jobs.iter().filter(|job| job.belongs_to(batch_id)).count();
                    if remaining == 0 {
                        break;
                    }
                    debug!("{} job(s) of batch {} still queued", remaining, batch_id);
                }
                Err(e) => warn!("Could not query the scheduler: {}", e),
            }

            if let Some(timeout) = self.timeout {
                let waited = started.elapsed();
                if waited >= timeout {
                    return Err(PipelineError::WaitTimeout {
                        batch_id: batch_id.to_string(),
                        waited,
                    });
                }
            }
        }

        info!(
            "Batch {} finished after {:.0?}",
            batch_id,
            started.elapsed()
        );
        open_permissions(qsub_dir);
        Ok(())
    }

    fn sleep(&self, cancel: &AtomicBool) {
        let deadline = Instant::now() + self.poll_interval;
        loop {
            let now = Instant::now();
            if now >= deadline || cancel.load(Ordering::Relaxed) {
                return;
            }
            thread::sleep((deadline - now).min(SLEEP_SLICE));
        }
    }
}

/// Gives the group write access to every job file, so other users can
/// rerun the pipeline on the same working directory.
pub fn open_permissions(qsub_dir: &Path) {
    let entries = match fs::read_dir(qsub_dir) {
        Ok(entries) => entries,
        Err(e) => {
            debug!("Skipping permissions of {}: {}", qsub_dir.display(), e);
            return;
        }
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Err(e) = fs::set_permissions(&path, fs::Permissions::from_mode(0o770)) {
                warn!("Failed to set permissions on {}: {}", path.display(), e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::scheduler::{JobRequest, RunningJob};
    use std::collections::{BTreeSet, VecDeque};
    use std::sync::Arc;
    use tempfile::tempdir;

    /// Scheduler replaying a fixed sequence of queue listings.
    struct FakeScheduler {
        listings: VecDeque<Result<Vec<&'static str>>>,
        polls: usize,
    }

    impl FakeScheduler {
        fn new(listings: Vec<Result<Vec<&'static str>>>) -> Self {
            Self {
                listings: listings.into(),
                polls: 0,
            }
        }
    }

    impl SchedulerAdapter for FakeScheduler {
        fn submit(&mut self, _job: &JobRequest) -> Result<()> {
            Ok(())
        }

        fn list_running_jobs(&mut self, _user: &str) -> Result<BTreeSet<RunningJob>> {
            self.polls += 1;
            let names = self.listings.pop_front().unwrap_or_else(|| Ok(Vec::new()))?;
            Ok(names
                .into_iter()
                .enumerate()
                .map(|(i, name)| RunningJob {
                    id: i.to_string(),
                    name: name.to_string(),
                })
                .collect())
        }
    }

    fn waiter(timeout: Option<Duration>) -> CompletionWaiter {
        CompletionWaiter::new(Duration::from_millis(1), timeout)
    }

    #[test]
    fn test_wait_until_batch_leaves_queue() {
        let temp_dir = tempdir().unwrap();
        let mut scheduler = FakeScheduler::new(vec![
            Ok(vec!["SF_000001", "SF_000001", "OTHER"]),
            Ok(vec!["SF_000001", "OTHER"]),
            Ok(vec!["OTHER"]),
        ]);

        let cancel = AtomicBool::new(false);
        waiter(None)
            .wait(&mut scheduler, "alice", "SF_000001", temp_dir.path(), &cancel)
            .unwrap();

        assert_eq!(scheduler.polls, 3);
    }

    #[test]
    fn test_scheduler_errors_are_retried() {
        let temp_dir = tempdir().unwrap();
        let mut scheduler = FakeScheduler::new(vec![
            Err(PipelineError::Scheduler("qstat: not reachable".to_string())),
            Ok(vec!["SF_000001"]),
            Ok(vec![]),
        ]);

        let cancel = AtomicBool::new(false);
        let result = waiter(None).wait(&mut scheduler, "alice", "SF_000001", temp_dir.path(), &cancel);

        assert!(result.is_ok());
        assert_eq!(scheduler.polls, 3);
    }

    #[test]
    fn test_wait_times_out() {
        let temp_dir = tempdir().unwrap();
        let stuck = (0..10_000).map(|_| Ok(vec!["SF_000001"])).collect();
        let mut scheduler = FakeScheduler::new(stuck);

        let cancel = AtomicBool::new(false);
        let result = waiter(Some(Duration::from_millis(20))).wait(
            &mut scheduler,
            "alice",
            "SF_000001",
            temp_dir.path(),
            &cancel,
        );

        assert!(matches!(
            result,
            Err(PipelineError::WaitTimeout { batch_id, .. }) if batch_id == "SF_000001"
        ));
    }

    #[test]
    fn test_wait_is_cancelled() {
        let temp_dir = tempdir().unwrap();
        let stuck = (0..10).map(|_| Ok(vec!["SF_000001"])).collect();
        let mut scheduler = FakeScheduler::new(stuck);

        let cancel = Arc::new(AtomicBool::new(true));
        let result = CompletionWaiter::new(Duration::from_secs(3600), None).wait(
            &mut scheduler,
            "alice",
            "SF_000001",
            temp_dir.path(),
            &cancel,
        );

        assert!(matches!(result, Err(PipelineError::Cancelled(_))));
        assert_eq!(scheduler.polls, 0);
    }

    #[cfg(unix)]
    #[test]
    fn test_open_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let temp_dir = tempdir().unwrap();
        let file = temp_dir.path().join("A.qsub");
        fs::write(&file, "#!/bin/bash\n").unwrap();
        fs::set_permissions(&file, fs::Permissions::from_mode(0o600)).unwrap();

        open_permissions(temp_dir.path());

        let mode = fs::metadata(&file).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o770);
    }
}
