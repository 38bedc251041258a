//! Runs one fired trigger's job body to completion and reports the
//! outcome (spec.md §4.F, §9).

use std::panic::AssertUnwindSafe;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use tracing::{error, info, warn};

use crate::context::JobContext;
use crate::job::{Job, RunOutcome};
use crate::store::FireBundle;
use crate::trigger::TriggerIdentity;

/// How one fire ended. Never silent — a missing parameter or an
/// interrupt always produces an explicit code, per spec.md §9's
/// resolution of the corresponding open question.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionCode {
    Success,
    Interrupted,
    MissingParameter,
    /// The job's `run` returned an `Err`, or panicked.
    Failed,
    /// A trigger listener vetoed the fire before the job ran at all.
    Vetoed,
}

/// Cooperative interrupt handle for a single in-flight fire, held by the
/// engine so `Scheduler::stop_job` can signal it (spec.md §4.F).
#[derive(Clone)]
pub struct InterruptHandle {
    flag: Arc<AtomicBool>,
}

impl InterruptHandle {
    pub fn new() -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn flag(&self) -> Arc<AtomicBool> {
        self.flag.clone()
    }

    pub fn request_stop(&self) {
        self.flag.store(true, std::sync::atomic::Ordering::SeqCst);
    }
}

impl Default for InterruptHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Build the [`JobContext`] for a bundle and run the job body inline on
/// the calling (worker) thread, returning the [`CompletionCode`] the
/// engine reports to listeners. `cleanup` always runs, success or not
/// (spec.md §4.F "finally" step).
pub fn run_fired_trigger(
    bundle: &FireBundle,
    interrupt: &InterruptHandle,
) -> (JobContext, CompletionCode) {
    let ctx = JobContext::new(
        bundle.merged_data.clone(),
        bundle.job_identity.name.clone(),
        &trigger_identity_parts(bundle),
        bundle.cron_expression.as_deref(),
        bundle.fire_time,
        bundle.previous_fire_time,
        bundle.next_fire_time,
        interrupt.flag(),
    );

    let mut job = (bundle.job_factory)();
    info!(job = %bundle.job_identity, trigger = %bundle.trigger_identity, "firing job");

    let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| job.run(&ctx)));
    job.cleanup();

    let code = match outcome {
        Ok(Ok(RunOutcome::Success)) => CompletionCode::Success,
        Ok(Ok(RunOutcome::Interrupted)) => {
            warn!(job = %bundle.job_identity, "job reported interruption");
            CompletionCode::Interrupted
        }
        Ok(Ok(RunOutcome::MissingParameter(key))) => {
            warn!(job = %bundle.job_identity, key, "job required a missing context parameter");
            CompletionCode::MissingParameter
        }
        Ok(Err(err)) => {
            error!(job = %bundle.job_identity, error = %err, "job returned an error");
            CompletionCode::Failed
        }
        Err(_) => {
            error!(job = %bundle.job_identity, "job panicked");
            CompletionCode::Failed
        }
    };

    (ctx, code)
}

fn trigger_identity_parts(bundle: &FireBundle) -> TriggerIdentity {
    bundle.trigger_identity.clone()
}
