//! Skip/Resume Controller
//!
//! Decides before dispatch whether a step, or a single sample within a
//! step, already completed in an earlier invocation. Step completion comes
//! from the aggregate log; sample completion from the sample's durable log.

use log::{debug, warn};

use crate::error::Result;
use crate::journal::{MainLog, SampleLog};
use crate::workflow::{RunContext, RunPaths, SamplePaths};

/// Read-only view on the completion state left by earlier runs.
#[derive(Debug, Clone)]
pub struct ResumeController {
    main_log: MainLog,
    clean_run: bool,
}

impl ResumeController {
    pub fn new(main_log: MainLog, clean_run: bool) -> Self {
        Self {
            main_log,
            clean_run,
        }
    }

    /// Controller over the logs of a run context.
    pub fn for_context(context: &RunContext) -> Self {
        Self::new(MainLog::new(context.paths().main_log()), context.clean_run)
    }

    /// True if every sample finished `flag` in an earlier run.
    pub fn is_step_finished(&self, flag: &str) -> bool {
        !self.clean_run && self.main_log.is_step_finished(flag)
    }

    /// True if the sample's durable log holds an ENDING marker for `flag`.
    pub fn is_sample_finished(&self, paths: &RunPaths, stub: &str, flag: &str) -> bool {
        !self.clean_run && SampleLog::for_sample(paths, stub).read().has_ending(flag)
    }

    /// Rebuilds the output role of a finished step from the durable logs
    /// and appends an all-passed run-log row.
    ///
    /// Returns the number of samples whose slot could not be restored.
    pub fn restore_outputs(
        &self,
        context: &mut RunContext,
        flag: &str,
        output_role: Option<&str>,
    ) -> Result<usize> {
        let mut missing = 0;

        if let Some(role) = output_role {
            for index in 0..context.sample_count() {
                let stub = context.sample(index)?.stub.clone();
                let history = SampleLog::for_sample(context.paths(), &stub).read();

                let slot = match history.completion(flag) {
                    Some(payload) => {
                        let mut slot = context.slot(role, index).cloned().unwrap_or_default();
                        slot.apply_payload(payload);
                        slot
                    }
                    None => {
                        warn!(
                            "{}: no unique ENDING marker for {}, output left empty",
                            stub, flag
                        );
                        missing += 1;
                        SamplePaths::unavailable()
                    }
                };
                context.set_slot(role, index, slot)?;
            }
            debug!("Restored role '{}' from durable logs", role);
        }

        context.run_log_mut().push_all_passed(flag);
        Ok(missing)
    }
}
