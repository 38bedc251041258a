//! Listener traits and matchers (spec.md §4.G). Listener callbacks are
//! notified at fire boundaries; a listener raising an error is caught,
//! logged, and never propagates into the scheduler loop.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::context::JobContext;
use crate::job::JobIdentity;
use crate::runner::CompletionCode;
use crate::trigger::TriggerIdentity;

/// Shared handle to a [`ListenerRegistry`], held by both the [`Scheduler`]
/// façade (for registration) and the engine's loop thread (for
/// notification). `RwLock` rather than a plain `Mutex` since
/// notification is the hot path and registration is rare.
///
/// [`Scheduler`]: crate::api::Scheduler
pub type SharedListenerRegistry = Arc<RwLock<ListenerRegistry>>;

/// Matches a subset of triggers or jobs by identity, for scoping a
/// listener's notifications (spec.md §4.G).
pub trait Matcher<T>: Send + Sync {
    fn matches(&self, identity: &T) -> bool;
}

/// Matches everything — the default scope for a newly-registered listener.
pub struct EverythingMatcher;

impl<T> Matcher<T> for EverythingMatcher {
    fn matches(&self, _identity: &T) -> bool {
        true
    }
}

/// Matches identities within a single named group.
pub struct GroupMatcher {
    pub group: String,
}

impl Matcher<JobIdentity> for GroupMatcher {
    fn matches(&self, identity: &JobIdentity) -> bool {
        identity.group == self.group
    }
}

impl Matcher<TriggerIdentity> for GroupMatcher {
    fn matches(&self, identity: &TriggerIdentity) -> bool {
        identity.group == self.group
    }
}

/// Observes trigger lifecycle events (spec.md §4.G).
pub trait TriggerListener: Send + Sync {
    fn trigger_fired(&self, trigger: &TriggerIdentity, ctx: &JobContext);

    /// Return `true` to veto the fire — the job will not run and
    /// `trigger_misfired`/`trigger_complete` are not called for it.
    fn veto_job_execution(&self, _trigger: &TriggerIdentity, _ctx: &JobContext) -> bool {
        false
    }

    fn trigger_misfired(&self, _trigger: &TriggerIdentity, _scheduled_for: DateTime<Utc>) {}

    fn trigger_complete(&self, _trigger: &TriggerIdentity, _code: CompletionCode) {}
}

/// Observes job execution lifecycle events (spec.md §4.G).
pub trait JobListener: Send + Sync {
    fn job_to_be_executed(&self, _job: &JobIdentity, _ctx: &JobContext) {}

    fn job_execution_vetoed(&self, _job: &JobIdentity, _ctx: &JobContext) {}

    fn job_was_executed(&self, job: &JobIdentity, ctx: &JobContext, code: CompletionCode);
}

/// Observes scheduler-wide lifecycle events (spec.md §4.G).
pub trait SchedulerListener: Send + Sync {
    fn scheduler_started(&self) {}
    fn scheduler_shutdown(&self) {}
    fn job_added(&self, _job: &JobIdentity) {}
    fn job_removed(&self, _job: &JobIdentity) {}
    fn trigger_paused(&self, _trigger: &TriggerIdentity) {}
    fn trigger_resumed(&self, _trigger: &TriggerIdentity) {}
    fn scheduler_error(&self, _message: &str) {}
}

pub(crate) struct MatchedTriggerListener {
    pub listener: Box<dyn TriggerListener>,
    pub matcher: Box<dyn Matcher<TriggerIdentity>>,
}

pub(crate) struct MatchedJobListener {
    pub listener: Box<dyn JobListener>,
    pub matcher: Box<dyn Matcher<JobIdentity>>,
}

/// Owns every registered listener and fans events out to the matching
/// subset, catching and logging any panic a listener raises so it can
/// never take down the scheduler loop (spec.md §4.G, §7).
#[derive(Default)]
pub struct ListenerRegistry {
    trigger_listeners: Vec<MatchedTriggerListener>,
    job_listeners: Vec<MatchedJobListener>,
    scheduler_listeners: Vec<Box<dyn SchedulerListener>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_trigger_listener(
        &mut self,
        listener: Box<dyn TriggerListener>,
        matcher: Box<dyn Matcher<TriggerIdentity>>,
    ) {
        self.trigger_listeners
            .push(MatchedTriggerListener { listener, matcher });
    }

    pub fn add_job_listener(
        &mut self,
        listener: Box<dyn JobListener>,
        matcher: Box<dyn Matcher<JobIdentity>>,
    ) {
        self.job_listeners.push(MatchedJobListener { listener, matcher });
    }

    pub fn add_scheduler_listener(&mut self, listener: Box<dyn SchedulerListener>) {
        self.scheduler_listeners.push(listener);
    }

    /// Returns `true` if any matching trigger listener vetoes the fire.
    pub fn notify_trigger_fired(&self, trigger: &TriggerIdentity, ctx: &JobContext) -> bool {
        let mut vetoed = false;
        for entry in &self.trigger_listeners {
            if entry.matcher.matches(trigger) {
                guarded(|| entry.listener.trigger_fired(trigger, ctx));
                if guarded(|| entry.listener.veto_job_execution(trigger, ctx)).unwrap_or(false) {
                    vetoed = true;
                }
            }
        }
        vetoed
    }

    pub fn notify_job_to_be_executed(&self, job: &JobIdentity, ctx: &JobContext) {
        for entry in &self.job_listeners {
            if entry.matcher.matches(job) {
                guarded(|| entry.listener.job_to_be_executed(job, ctx));
            }
        }
    }

    pub fn notify_job_execution_vetoed(&self, job: &JobIdentity, ctx: &JobContext) {
        for entry in &self.job_listeners {
            if entry.matcher.matches(job) {
                guarded(|| entry.listener.job_execution_vetoed(job, ctx));
            }
        }
        for entry in &self.trigger_listeners {
            guarded(|| entry.listener.trigger_complete(&ctx_trigger(ctx), CompletionCode::Vetoed));
        }
    }

    pub fn notify_job_was_executed(
        &self,
        job: &JobIdentity,
        ctx: &JobContext,
        code: CompletionCode,
    ) {
        for entry in &self.job_listeners {
            if entry.matcher.matches(job) {
                guarded(|| entry.listener.job_was_executed(job, ctx, code));
            }
        }
    }

    pub fn notify_trigger_complete(&self, trigger: &TriggerIdentity, code: CompletionCode) {
        for entry in &self.trigger_listeners {
            if entry.matcher.matches(trigger) {
                guarded(|| entry.listener.trigger_complete(trigger, code));
            }
        }
    }

    pub fn notify_trigger_misfired(&self, trigger: &TriggerIdentity, scheduled_for: DateTime<Utc>) {
        for entry in &self.trigger_listeners {
            if entry.matcher.matches(trigger) {
                guarded(|| entry.listener.trigger_misfired(trigger, scheduled_for));
            }
        }
    }

    pub fn notify_scheduler_started(&self) {
        for l in &self.scheduler_listeners {
            guarded(|| l.scheduler_started());
        }
    }

    pub fn notify_scheduler_shutdown(&self) {
        for l in &self.scheduler_listeners {
            guarded(|| l.scheduler_shutdown());
        }
    }

    pub fn notify_job_added(&self, job: &JobIdentity) {
        for l in &self.scheduler_listeners {
            guarded(|| l.job_added(job));
        }
    }

    pub fn notify_job_removed(&self, job: &JobIdentity) {
        for l in &self.scheduler_listeners {
            guarded(|| l.job_removed(job));
        }
    }

    pub fn notify_trigger_paused(&self, trigger: &TriggerIdentity) {
        for l in &self.scheduler_listeners {
            guarded(|| l.trigger_paused(trigger));
        }
    }

    pub fn notify_trigger_resumed(&self, trigger: &TriggerIdentity) {
        for l in &self.scheduler_listeners {
            guarded(|| l.trigger_resumed(trigger));
        }
    }

    pub fn notify_scheduler_error(&self, message: &str) {
        for l in &self.scheduler_listeners {
            guarded(|| l.scheduler_error(message));
        }
    }
}

fn ctx_trigger(ctx: &JobContext) -> TriggerIdentity {
    TriggerIdentity::new(ctx.trigger_name(), ctx.trigger_group())
}

/// Run `f`, catching a panic so one broken listener can't take down a
/// fire (spec.md §7: listener errors are caught, logged, and never
/// propagate out of the call site that notifies listeners).
fn guarded<F, R>(f: F) -> Option<R>
where
    F: FnOnce() -> R + std::panic::UnwindSafe,
{
    match std::panic::catch_unwind(f) {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::error!("listener panicked; continuing without it");
            None
        }
    }
}
