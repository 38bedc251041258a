//! The scheduler loop (spec.md §4.E): repeatedly acquire due triggers,
//! hand each to the worker pool, and sleep until the next candidate.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::thread::{self, JoinHandle};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tracing::{debug, info, warn};

use crate::context::JobContext;
use crate::job::{JobDataMap, JobDataValue, JobIdentity};
use crate::listener::SharedListenerRegistry;
use crate::pool::WorkerPool;
use crate::runner::{run_fired_trigger, InterruptHandle};
use crate::signal::Signaler;
use crate::store::{JobStore, TriggerFiredResult};
use crate::trigger::TriggerIdentity;

/// How far ahead the loop looks when acquiring triggers per pass
/// (spec.md §4.E step 1).
const DEFAULT_ACQUIRE_WINDOW: ChronoDuration = ChronoDuration::milliseconds(0);

/// Misfire threshold: how late a fire can run before it counts as
/// misfired (spec.md §4.B).
const DEFAULT_MISFIRE_THRESHOLD: ChronoDuration = ChronoDuration::seconds(5);

/// One currently-executing fire, keyed by job identity in `in_flight` so
/// `stop_job`/`is_job_running` (spec.md §6) operate on the job a caller
/// actually names rather than the trigger that happened to fire it.
struct RunningFire {
    trigger_identity: TriggerIdentity,
    interrupt: InterruptHandle,
    data: JobDataMap,
}

/// Owns the scheduler thread and coordinates the store, pool, and
/// listeners. Mirrors the shape of the teacher's
/// `agentor_orchestrator::Orchestrator` plan/execute loop, generalized
/// from a one-shot plan to a perpetual fire loop.
pub struct SchedulerEngine {
    store: Arc<JobStore>,
    pool: Arc<WorkerPool>,
    signaler: Arc<Signaler>,
    listeners: SharedListenerRegistry,
    running: Arc<AtomicBool>,
    locked: Arc<AtomicBool>,
    misfire_threshold: ChronoDuration,
    handle: StdMutex<Option<JoinHandle<()>>>,
    in_flight: Arc<StdMutex<std::collections::HashMap<JobIdentity, Vec<RunningFire>>>>,
}

impl SchedulerEngine {
    pub fn new(
        store: Arc<JobStore>,
        pool: Arc<WorkerPool>,
        signaler: Arc<Signaler>,
        listeners: SharedListenerRegistry,
    ) -> Self {
        Self::with_misfire_threshold(store, pool, signaler, listeners, DEFAULT_MISFIRE_THRESHOLD)
    }

    pub fn with_misfire_threshold(
        store: Arc<JobStore>,
        pool: Arc<WorkerPool>,
        signaler: Arc<Signaler>,
        listeners: SharedListenerRegistry,
        misfire_threshold: ChronoDuration,
    ) -> Self {
        Self {
            store,
            pool,
            signaler,
            listeners,
            running: Arc::new(AtomicBool::new(false)),
            locked: Arc::new(AtomicBool::new(false)),
            misfire_threshold,
            handle: StdMutex::new(None),
            in_flight: Arc::new(StdMutex::new(std::collections::HashMap::new())),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn lock(&self) {
        self.locked.store(true, Ordering::SeqCst);
    }

    pub fn unlock(&self) {
        self.locked.store(false, Ordering::SeqCst);
        self.signaler.signal_earlier_trigger(Utc::now());
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::SeqCst)
    }

    /// Spawn the dedicated scheduler thread. Idempotent — calling this
    /// while already running is a no-op.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        self.listeners.read().notify_scheduler_started();

        let store = self.store.clone();
        let pool = self.pool.clone();
        let signaler = self.signaler.clone();
        let listeners = self.listeners.clone();
        let running = self.running.clone();
        let locked = self.locked.clone();
        let misfire_threshold = self.misfire_threshold;
        let in_flight = self.in_flight.clone();

        let handle = thread::Builder::new()
            .name("scheduler-loop".into())
            .spawn(move || {
                run_loop(
                    store,
                    pool,
                    signaler,
                    listeners,
                    running,
                    locked,
                    misfire_threshold,
                    in_flight,
                );
            })
            .expect("failed to spawn scheduler thread");
        *self.handle.lock().expect("handle mutex poisoned") = Some(handle);
    }

    /// Signal the loop to stop and, if `wait_for_jobs` is true, block
    /// until the loop thread and every in-flight worker have finished
    /// (spec.md §4.E shutdown semantics). If `wait_for_jobs` is false,
    /// every in-flight fire is also asked to cooperatively interrupt via
    /// its [`InterruptHandle`] before the pool is torn down, rather than
    /// left running unsignaled.
    pub fn shutdown(&self, wait_for_jobs: bool) {
        self.running.store(false, Ordering::SeqCst);
        self.signaler.shutdown();
        if let Some(handle) = self.handle.lock().expect("handle mutex poisoned").take() {
            let _ = handle.join();
        }
        if !wait_for_jobs {
            for fires in self.in_flight.lock().expect("in_flight mutex poisoned").values() {
                for fire in fires {
                    fire.interrupt.request_stop();
                }
            }
        }
        self.pool.shutdown(wait_for_jobs);
        self.listeners.read().notify_scheduler_shutdown();
    }

    /// Expose the shared listener registry so the `Scheduler` façade can
    /// register listeners both before and after `start()`.
    pub fn listeners(&self) -> &SharedListenerRegistry {
        &self.listeners
    }

    /// Nudge the loop in case a just-stored trigger fires sooner than
    /// whatever it's currently sleeping for.
    pub fn wake(&self) {
        self.signaler.signal_earlier_trigger(Utc::now());
    }

    /// Request cooperative interruption of every currently-executing fire
    /// of `job` (spec.md §6 `stopJob`). Returns `true` if at least one
    /// running instance was signaled.
    pub fn stop_job(&self, job: &JobIdentity) -> bool {
        let in_flight = self.in_flight.lock().expect("in_flight mutex poisoned");
        match in_flight.get(job) {
            Some(fires) if !fires.is_empty() => {
                for fire in fires {
                    fire.interrupt.request_stop();
                }
                true
            }
            _ => false,
        }
    }

    /// Like [`Self::stop_job`], but only signals instances whose merged
    /// job data has `key` set to `value` (spec.md §6 `stopJob(name, key,
    /// value)` variant).
    pub fn stop_job_matching(&self, job: &JobIdentity, key: &str, value: &JobDataValue) -> bool {
        let in_flight = self.in_flight.lock().expect("in_flight mutex poisoned");
        let mut signaled = false;
        if let Some(fires) = in_flight.get(job) {
            for fire in fires {
                if fire.data.get(key) == Some(value) {
                    fire.interrupt.request_stop();
                    signaled = true;
                }
            }
        }
        signaled
    }

    pub fn is_job_running(&self, job: &JobIdentity) -> bool {
        self.in_flight
            .lock()
            .expect("in_flight mutex poisoned")
            .get(job)
            .is_some_and(|fires| !fires.is_empty())
    }
}

type InFlightMap = Arc<StdMutex<std::collections::HashMap<JobIdentity, Vec<RunningFire>>>>;

#[allow(clippy::too_many_arguments)]
fn run_loop(
    store: Arc<JobStore>,
    pool: Arc<WorkerPool>,
    signaler: Arc<Signaler>,
    listeners: SharedListenerRegistry,
    running: Arc<AtomicBool>,
    locked: Arc<AtomicBool>,
    misfire_threshold: ChronoDuration,
    in_flight: InFlightMap,
) {
    info!("scheduler loop started");
    while running.load(Ordering::SeqCst) {
        if locked.load(Ordering::SeqCst) {
            signaler.wait_until(Some(Utc::now() + ChronoDuration::milliseconds(250)));
            continue;
        }

        let now = Utc::now();
        let capacity = pool.available().max(1);
        let acquired = store.acquire_next_triggers(now, capacity, DEFAULT_ACQUIRE_WINDOW);

        if acquired.is_empty() {
            let next_candidate = peek_next_candidate(&store);
            signaler.wait_until(next_candidate);
            continue;
        }

        for trigger in acquired {
            if !running.load(Ordering::SeqCst) {
                store.release_acquired_trigger(&trigger.identity);
                continue;
            }

            if trigger.has_misfired(now, misfire_threshold) {
                debug!(trigger = %trigger.identity, "misfire detected");
                listeners
                    .read()
                    .notify_trigger_misfired(&trigger.identity, trigger.next_fire_time.unwrap_or(now));
                if let Err(err) = store.apply_misfire_and_release(&trigger.identity, now) {
                    warn!(error = %err, "failed to apply misfire instruction");
                }
                continue;
            }

            dispatch_fire(
                &store,
                &pool,
                &listeners,
                &signaler,
                &in_flight,
                &locked,
                trigger.identity.clone(),
            );
        }
    }
    info!("scheduler loop exiting");
}

fn dispatch_fire(
    store: &Arc<JobStore>,
    pool: &Arc<WorkerPool>,
    listeners: &SharedListenerRegistry,
    signaler: &Arc<Signaler>,
    in_flight: &InFlightMap,
    locked: &Arc<AtomicBool>,
    trigger_identity: TriggerIdentity,
) {
    // Re-check the global lock at dispatch time, not just at the loop's
    // sleep boundary: a trigger acquired just before lockScheduler() is
    // called must not fire (spec.md §4.F step 1).
    if locked.load(Ordering::SeqCst) {
        debug!(trigger = %trigger_identity, "scheduler locked at dispatch time; releasing trigger unfired");
        store.release_acquired_trigger(&trigger_identity);
        return;
    }

    let fired = match store.triggers_fired(&trigger_identity) {
        Ok(f) => f,
        Err(err) => {
            warn!(error = %err, trigger = %trigger_identity, "triggers_fired failed");
            return;
        }
    };

    let bundle = match fired {
        TriggerFiredResult::Blocked => return,
        TriggerFiredResult::Fire(bundle) => bundle,
    };

    let listeners = listeners.clone();
    let signaler = signaler.clone();
    let interrupt = InterruptHandle::new();

    in_flight
        .lock()
        .expect("in_flight mutex poisoned")
        .entry(bundle.job_identity.clone())
        .or_default()
        .push(RunningFire {
            trigger_identity: bundle.trigger_identity.clone(),
            interrupt: interrupt.clone(),
            data: bundle.merged_data.clone(),
        });

    let pool_store = store.clone();
    let in_flight = in_flight.clone();
    pool.submit(Box::new(move || {
        let placeholder_ctx = JobContext::new(
            bundle.merged_data.clone(),
            bundle.job_identity.name.clone(),
            &bundle.trigger_identity,
            bundle.cron_expression.as_deref(),
            bundle.fire_time,
            bundle.previous_fire_time,
            bundle.next_fire_time,
            interrupt.flag(),
        );

        let vetoed = listeners
            .read()
            .notify_trigger_fired(&bundle.trigger_identity, &placeholder_ctx);
        if vetoed {
            listeners
                .read()
                .notify_job_execution_vetoed(&bundle.job_identity, &placeholder_ctx);
            pool_store.triggered_job_complete(&bundle.trigger_identity, &bundle.job_identity);
            remove_in_flight(&in_flight, &bundle.job_identity, &bundle.trigger_identity);
            return;
        }

        listeners
            .read()
            .notify_job_to_be_executed(&bundle.job_identity, &placeholder_ctx);
        let (ctx, code) = run_fired_trigger(&bundle, &interrupt);
        let registry = listeners.read();
        registry.notify_job_was_executed(&bundle.job_identity, &ctx, code);
        registry.notify_trigger_complete(&bundle.trigger_identity, code);

        pool_store.triggered_job_complete(&bundle.trigger_identity, &bundle.job_identity);
        remove_in_flight(&in_flight, &bundle.job_identity, &bundle.trigger_identity);
        signaler.signal_earlier_trigger(Utc::now());
    }));
}

/// Remove one completed fire from `in_flight`, dropping the job's entry
/// entirely once its last running instance is gone.
fn remove_in_flight(in_flight: &InFlightMap, job: &JobIdentity, trigger: &TriggerIdentity) {
    let mut in_flight = in_flight.lock().expect("in_flight mutex poisoned");
    if let Some(fires) = in_flight.get_mut(job) {
        fires.retain(|f| &f.trigger_identity != trigger);
        if fires.is_empty() {
            in_flight.remove(job);
        }
    }
}

fn peek_next_candidate(_store: &Arc<JobStore>) -> Option<DateTime<Utc>> {
    // The store doesn't expose a direct "peek earliest" accessor to avoid
    // widening its lock surface; a short fixed poll interval is used
    // instead when nothing is immediately due.
    Some(Utc::now() + ChronoDuration::milliseconds(200))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobDefinition, JobFactory};
    use crate::listener::ListenerRegistry;
    use crate::trigger::{RepeatCount, ScheduleKind, Trigger};
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    #[test]
    fn test_engine_fires_a_simple_job_once() {
        let store = Arc::new(JobStore::new());
        let pool = Arc::new(WorkerPool::new(2));
        let signaler = Arc::new(Signaler::new());
        let listeners = Arc::new(parking_lot::RwLock::new(ListenerRegistry::new()));

        let counter = Arc::new(AtomicU32::new(0));
        let counter_for_job = counter.clone();

        struct CountingJob(Arc<AtomicU32>);
        impl crate::job::Job for CountingJob {
            fn run(
                &mut self,
                _ctx: &JobContext,
            ) -> crate::error::SchedulerResult<crate::job::RunOutcome> {
                self.0.fetch_add(1, Ordering::SeqCst);
                Ok(crate::job::RunOutcome::Success)
            }
        }

        let factory: JobFactory = Arc::new(move || Box::new(CountingJob(counter_for_job.clone())));
        let job_id = crate::job::JobIdentity::named("count-job");
        store
            .store_job(JobDefinition::builder(job_id.clone(), factory).build(), false)
            .unwrap();

        let trigger = Trigger::new(
            TriggerIdentity::named("count-trigger"),
            job_id,
            Utc::now(),
            ScheduleKind::simple(ChronoDuration::seconds(3600), RepeatCount::Times(0)),
        );
        store.store_trigger(trigger, false).unwrap();

        let engine = SchedulerEngine::new(store, pool, signaler, listeners);
        engine.start();
        thread::sleep(Duration::from_millis(300));
        engine.shutdown(true);

        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
