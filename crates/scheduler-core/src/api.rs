//! Programmatic scheduler API (spec.md §6): the façade embedding
//! applications actually construct and call. Builder-configured, then
//! started once; every other call is safe to make from any thread.

use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;

use crate::engine::SchedulerEngine;
use crate::error::SchedulerResult;
use crate::job::{JobDefinition, JobIdentity};
use crate::listener::{JobListener, ListenerRegistry, Matcher, SchedulerListener, TriggerListener};
use crate::loader::{load_descriptor, JobFactoryRegistry};
use crate::pool::WorkerPool;
use crate::signal::Signaler;
use crate::store::JobStore;
use crate::trigger::{Trigger, TriggerIdentity, TriggerState};

const DEFAULT_WORKER_POOL_SIZE: usize = 10;
const DEFAULT_MISFIRE_THRESHOLD_SECONDS: i64 = 5;

/// Builder for [`Scheduler`], following the teacher's `with_x` builder
/// convention (`agentor_orchestrator::engine::Orchestrator`).
pub struct SchedulerBuilder {
    worker_pool_size: usize,
    misfire_threshold_seconds: i64,
    start_locked: bool,
}

impl Default for SchedulerBuilder {
    fn default() -> Self {
        Self {
            worker_pool_size: DEFAULT_WORKER_POOL_SIZE,
            misfire_threshold_seconds: DEFAULT_MISFIRE_THRESHOLD_SECONDS,
            start_locked: false,
        }
    }
}

impl SchedulerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_worker_pool_size(mut self, size: usize) -> Self {
        self.worker_pool_size = size;
        self
    }

    pub fn with_misfire_threshold_seconds(mut self, seconds: i64) -> Self {
        self.misfire_threshold_seconds = seconds;
        self
    }

    /// Start the scheduler already locked (paused) so an operator can
    /// inspect or top up the store before the first trigger fires.
    pub fn start_locked(mut self, locked: bool) -> Self {
        self.start_locked = locked;
        self
    }

    pub fn build(self) -> Scheduler {
        let store = Arc::new(JobStore::new());
        let pool = Arc::new(WorkerPool::new(self.worker_pool_size));
        let signaler = Arc::new(Signaler::new());
        let listeners = Arc::new(RwLock::new(ListenerRegistry::new()));
        let engine = Arc::new(SchedulerEngine::with_misfire_threshold(
            store.clone(),
            pool,
            signaler,
            listeners.clone(),
            chrono::Duration::seconds(self.misfire_threshold_seconds),
        ));
        if self.start_locked {
            engine.lock();
        }
        Scheduler { store, engine }
    }
}

/// The in-process job scheduler (spec.md §2 overview, §6 external
/// interfaces). One instance owns one store, one worker pool, and one
/// scheduler loop. Listener registration goes through the engine, which
/// owns the single shared [`ListenerRegistry`] — this keeps one source
/// of truth whether a listener is added before or after `start()`.
pub struct Scheduler {
    store: Arc<JobStore>,
    engine: Arc<SchedulerEngine>,
}

impl Scheduler {
    pub fn builder() -> SchedulerBuilder {
        SchedulerBuilder::new()
    }

    /// Start the scheduler loop. Idempotent.
    pub fn start(&self) {
        self.engine.start();
    }

    /// Stop the scheduler loop. If `wait_for_jobs_to_complete`, blocks
    /// until every in-flight fire has finished.
    pub fn shutdown(&self, wait_for_jobs_to_complete: bool) {
        self.engine.shutdown(wait_for_jobs_to_complete);
    }

    pub fn is_started(&self) -> bool {
        self.engine.is_running()
    }

    /// Pause all trigger firing without tearing down the loop or
    /// discarding any state (spec.md §6 `lockScheduler`).
    pub fn lock_scheduler(&self) {
        self.engine.lock();
    }

    pub fn unlock_scheduler(&self) {
        self.engine.unlock();
    }

    pub fn is_locked(&self) -> bool {
        self.engine.is_locked()
    }

    pub fn add_job(&self, job: JobDefinition) -> SchedulerResult<()> {
        let identity = job.identity.clone();
        self.store.store_job(job, false)?;
        self.engine.listeners().read().notify_job_added(&identity);
        Ok(())
    }

    pub fn remove_job(&self, identity: &JobIdentity) -> SchedulerResult<()> {
        self.store.remove_job(identity)?;
        self.engine.listeners().read().notify_job_removed(identity);
        Ok(())
    }

    /// Attach a trigger to an already-stored job and seed its first
    /// fire time immediately (spec.md §6 `addCronTrigger` / `addSimpleTrigger`
    /// generalize to this single entry point over a pre-built [`Trigger`]).
    pub fn add_trigger(&self, trigger: Trigger) -> SchedulerResult<()> {
        self.store.store_trigger(trigger, false)?;
        self.engine.wake();
        Ok(())
    }

    pub fn remove_trigger(&self, identity: &TriggerIdentity) -> SchedulerResult<()> {
        self.store.remove_trigger(identity)
    }

    pub fn pause_trigger(&self, identity: &TriggerIdentity) -> SchedulerResult<()> {
        self.store.pause_trigger(identity)?;
        self.engine
            .listeners()
            .read()
            .notify_trigger_paused(identity);
        Ok(())
    }

    pub fn resume_trigger(&self, identity: &TriggerIdentity) -> SchedulerResult<()> {
        self.store.resume_trigger(identity)?;
        self.engine
            .listeners()
            .read()
            .notify_trigger_resumed(identity);
        self.engine.wake();
        Ok(())
    }

    /// Request cooperative interruption of every currently-executing fire
    /// of `job` (spec.md §6 `stopJob`). Returns `false` if nothing is
    /// currently running for it.
    pub fn stop_job(&self, job: &JobIdentity) -> bool {
        self.engine.stop_job(job)
    }

    /// Like [`Self::stop_job`], but only interrupts running instances
    /// whose merged job data has `key` set to `value` (spec.md §6
    /// `stopJob(name, key, value)` variant).
    pub fn stop_job_matching(&self, job: &JobIdentity, key: &str, value: &crate::job::JobDataValue) -> bool {
        self.engine.stop_job_matching(job, key, value)
    }

    pub fn is_job_running(&self, job: &JobIdentity) -> bool {
        self.engine.is_job_running(job)
    }

    pub fn trigger_state(&self, identity: &TriggerIdentity) -> Option<TriggerState> {
        self.store.trigger_state(identity)
    }

    pub fn get_all_job_names(&self) -> Vec<JobIdentity> {
        self.store.all_job_identities()
    }

    pub fn get_all_trigger_names(&self) -> Vec<TriggerIdentity> {
        self.store.all_trigger_identities()
    }

    pub fn get_triggers_of_job(&self, identity: &JobIdentity) -> Vec<TriggerIdentity> {
        self.store.triggers_for_job(identity)
    }

    pub fn add_trigger_listener(
        &self,
        listener: Box<dyn TriggerListener>,
        matcher: Box<dyn Matcher<TriggerIdentity>>,
    ) {
        self.engine
            .listeners()
            .write()
            .add_trigger_listener(listener, matcher);
    }

    pub fn add_job_listener(
        &self,
        listener: Box<dyn JobListener>,
        matcher: Box<dyn Matcher<JobIdentity>>,
    ) {
        self.engine
            .listeners()
            .write()
            .add_job_listener(listener, matcher);
    }

    pub fn add_scheduler_listener(&self, listener: Box<dyn SchedulerListener>) {
        self.engine
            .listeners()
            .write()
            .add_scheduler_listener(listener);
    }

    /// Load a YAML job/trigger descriptor into this scheduler's store
    /// (spec.md §4.H). Returns the number of jobs plus triggers installed.
    pub fn load_descriptor(
        &self,
        yaml: &str,
        registry: &JobFactoryRegistry,
    ) -> SchedulerResult<usize> {
        load_descriptor(yaml, registry, &self.store)
    }
}
