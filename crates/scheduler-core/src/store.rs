//! In-memory job store: owns jobs and triggers, and is the single place
//! that knows which triggers are next to fire (spec.md §3, §4.C).

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;

use crate::error::{SchedulerError, SchedulerResult};
use crate::job::{JobDataMap, JobDefinition, JobFactory, JobIdentity};
use crate::trigger::{ScheduleKind, Trigger, TriggerIdentity, TriggerState};

/// Ordering key for the "waiting to fire" index: earliest fire time first,
/// then highest priority first, then identity for determinism.
#[derive(Debug, Clone, PartialEq, Eq)]
struct FireKey {
    fire_time: DateTime<Utc>,
    priority: i32,
    identity: TriggerIdentity,
}

impl Ord for FireKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.fire_time
            .cmp(&other.fire_time)
            .then_with(|| other.priority.cmp(&self.priority))
            .then_with(|| self.identity.cmp(&other.identity))
    }
}

impl PartialOrd for FireKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Everything the runner needs to execute one fire, handed out of the
/// store by [`JobStore::triggers_fired`].
#[derive(Clone)]
pub struct FireBundle {
    pub trigger_identity: TriggerIdentity,
    pub job_identity: JobIdentity,
    pub job_factory: JobFactory,
    pub merged_data: JobDataMap,
    pub fire_time: DateTime<Utc>,
    pub previous_fire_time: Option<DateTime<Utc>>,
    pub next_fire_time: Option<DateTime<Utc>>,
    pub cron_expression: Option<String>,
}

/// Result of [`JobStore::triggers_fired`] for one acquired trigger.
pub enum TriggerFiredResult {
    Fire(FireBundle),
    /// The job disallows concurrent execution and is already running;
    /// the trigger moves to [`TriggerState::Blocked`] until it completes.
    Blocked,
}

struct StoreInner {
    jobs: HashMap<JobIdentity, JobDefinition>,
    triggers: HashMap<TriggerIdentity, Trigger>,
    job_triggers: HashMap<JobIdentity, HashSet<TriggerIdentity>>,
    waiting: std::collections::BTreeSet<FireKey>,
    executing_jobs: HashSet<JobIdentity>,
    blocked_triggers: HashSet<TriggerIdentity>,
}

impl StoreInner {
    fn fire_key_of(trigger: &Trigger) -> Option<FireKey> {
        trigger.next_fire_time.map(|ft| FireKey {
            fire_time: ft,
            priority: trigger.priority,
            identity: trigger.identity.clone(),
        })
    }
}

/// The scheduler's in-memory data store (spec.md §4.C). All mutation goes
/// through a single lock; the lock is held only for short, non-blocking
/// critical sections — no job code ever runs while it is held.
pub struct JobStore {
    inner: Mutex<StoreInner>,
}

impl Default for JobStore {
    fn default() -> Self {
        Self::new()
    }
}

impl JobStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(StoreInner {
                jobs: HashMap::new(),
                triggers: HashMap::new(),
                job_triggers: HashMap::new(),
                waiting: std::collections::BTreeSet::new(),
                executing_jobs: HashSet::new(),
                blocked_triggers: HashSet::new(),
            }),
        }
    }

    /// Register a job definition. Errors if the identity is already taken
    /// and `replace` is false; with `replace` true an existing job's
    /// definition is overwritten in place, keeping its attached triggers
    /// (spec.md:85-86).
    pub fn store_job(&self, job: JobDefinition, replace: bool) -> SchedulerResult<()> {
        let mut inner = self.inner.lock();
        if inner.jobs.contains_key(&job.identity) && !replace {
            return Err(SchedulerError::State(format!(
                "job '{}' already exists",
                job.identity
            )));
        }
        inner.job_triggers.entry(job.identity.clone()).or_default();
        inner.jobs.insert(job.identity.clone(), job);
        Ok(())
    }

    /// Register a trigger and seed its first fire time. Errors if the
    /// identity is taken and `replace` is false, or if its target job is
    /// not in the store. With `replace` true, an existing trigger with the
    /// same identity is removed from the waiting index first and the new
    /// one rescheduled from scratch (spec.md:85-86, spec.md:144).
    pub fn store_trigger(&self, mut trigger: Trigger, replace: bool) -> SchedulerResult<()> {
        let mut inner = self.inner.lock();
        let existed = inner.triggers.contains_key(&trigger.identity);
        if existed && !replace {
            return Err(SchedulerError::State(format!(
                "trigger '{}' already exists",
                trigger.identity
            )));
        }
        if !inner.jobs.contains_key(&trigger.job_identity) {
            return Err(SchedulerError::State(format!(
                "trigger '{}' refers to unknown job '{}'",
                trigger.identity, trigger.job_identity
            )));
        }
        if existed {
            remove_trigger_locked(&mut inner, &trigger.identity);
        }
        trigger.compute_first_fire_time()?;
        let key = StoreInner::fire_key_of(&trigger);
        inner
            .job_triggers
            .entry(trigger.job_identity.clone())
            .or_default()
            .insert(trigger.identity.clone());
        if let Some(key) = key {
            inner.waiting.insert(key);
        }
        inner.triggers.insert(trigger.identity.clone(), trigger);
        Ok(())
    }

    /// Remove a job and every trigger attached to it.
    pub fn remove_job(&self, identity: &JobIdentity) -> SchedulerResult<()> {
        let mut inner = self.inner.lock();
        if inner.jobs.remove(identity).is_none() {
            return Err(SchedulerError::State(format!("job '{identity}' not found")));
        }
        if let Some(trigger_ids) = inner.job_triggers.remove(identity) {
            for tid in trigger_ids {
                remove_trigger_locked(&mut inner, &tid);
            }
        }
        Ok(())
    }

    /// Remove a single trigger. If it was the job's last trigger and the
    /// job is not durable, the job is removed too (mirrors the teacher's
    /// `SubAgentSpawner` validate-then-mutate pattern: we already hold the
    /// only lock that can race with this).
    pub fn remove_trigger(&self, identity: &TriggerIdentity) -> SchedulerResult<()> {
        let mut inner = self.inner.lock();
        let job_identity = inner
            .triggers
            .get(identity)
            .map(|t| t.job_identity.clone())
            .ok_or_else(|| SchedulerError::State(format!("trigger '{identity}' not found")))?;
        remove_trigger_locked(&mut inner, identity);

        let should_drop_job = inner
            .job_triggers
            .get(&job_identity)
            .is_some_and(|set| set.is_empty())
            && inner
                .jobs
                .get(&job_identity)
                .is_some_and(|j| !j.durable);
        if should_drop_job {
            inner.jobs.remove(&job_identity);
            inner.job_triggers.remove(&job_identity);
        }
        Ok(())
    }

    pub fn pause_trigger(&self, identity: &TriggerIdentity) -> SchedulerResult<()> {
        let mut inner = self.inner.lock();
        let trigger = inner
            .triggers
            .get_mut(identity)
            .ok_or_else(|| SchedulerError::State(format!("trigger '{identity}' not found")))?;
        if let Some(key) = StoreInner::fire_key_of(trigger) {
            inner.waiting.remove(&key);
        }
        inner
            .triggers
            .get_mut(identity)
            .expect("just looked up")
            .state = TriggerState::Paused;
        Ok(())
    }

    pub fn resume_trigger(&self, identity: &TriggerIdentity) -> SchedulerResult<()> {
        let mut inner = self.inner.lock();
        let trigger = inner
            .triggers
            .get_mut(identity)
            .ok_or_else(|| SchedulerError::State(format!("trigger '{identity}' not found")))?;
        trigger.state = TriggerState::Normal;
        if let Some(key) = StoreInner::fire_key_of(trigger) {
            inner.waiting.insert(key);
        }
        Ok(())
    }

    /// Acquire up to `max_count` triggers due within `time_window` of
    /// `now`, earliest first. Acquired triggers leave the waiting index
    /// until released via [`Self::release_acquired_trigger`] or consumed
    /// by [`Self::triggers_fired`].
    pub fn acquire_next_triggers(
        &self,
        now: DateTime<Utc>,
        max_count: usize,
        time_window: ChronoDuration,
    ) -> Vec<Trigger> {
        let mut inner = self.inner.lock();
        let mut acquired = Vec::new();
        let horizon = now + time_window;

        let due: Vec<FireKey> = inner
            .waiting
            .iter()
            .take_while(|k| k.fire_time <= horizon)
            .take(max_count)
            .cloned()
            .collect();

        for key in due {
            inner.waiting.remove(&key);
            if let Some(trigger) = inner.triggers.get_mut(&key.identity) {
                trigger.state = TriggerState::Acquired;
                acquired.push(trigger.clone());
            }
        }
        acquired
    }

    /// Return an acquired trigger to the waiting index without firing it
    /// (used when the engine loses a shutdown race after acquiring).
    pub fn release_acquired_trigger(&self, identity: &TriggerIdentity) {
        let mut inner = self.inner.lock();
        if let Some(trigger) = inner.triggers.get_mut(identity) {
            trigger.state = TriggerState::Normal;
            if let Some(key) = StoreInner::fire_key_of(trigger) {
                inner.waiting.insert(key);
            }
        }
    }

    /// Apply the resolved misfire instruction to the live trigger and put
    /// it back in the waiting index (or drop it if it completed).
    pub fn apply_misfire_and_release(
        &self,
        identity: &TriggerIdentity,
        now: DateTime<Utc>,
    ) -> SchedulerResult<()> {
        let mut inner = self.inner.lock();
        let trigger = inner
            .triggers
            .get_mut(identity)
            .ok_or_else(|| SchedulerError::State(format!("trigger '{identity}' not found")))?;
        trigger.apply_misfire(now)?;
        let completed = trigger.state == TriggerState::Complete;
        if !completed {
            trigger.state = TriggerState::Normal;
        }
        let key = StoreInner::fire_key_of(trigger);
        if completed {
            remove_trigger_locked(&mut inner, identity);
        } else if let Some(key) = key {
            inner.waiting.insert(key);
        }
        Ok(())
    }

    /// Transition an acquired trigger into firing: either a [`FireBundle`]
    /// ready to run, or `Blocked` if its job disallows concurrent
    /// execution and is already running (spec.md §4.C, §3 BLOCKED state).
    pub fn triggers_fired(&self, identity: &TriggerIdentity) -> SchedulerResult<TriggerFiredResult> {
        let mut inner = self.inner.lock();
        let job_identity = inner
            .triggers
            .get(identity)
            .map(|t| t.job_identity.clone())
            .ok_or_else(|| SchedulerError::State(format!("trigger '{identity}' not found")))?;

        let job = inner
            .jobs
            .get(&job_identity)
            .ok_or_else(|| SchedulerError::State(format!("job '{job_identity}' not found")))?;

        if job.disallow_concurrent_execution && inner.executing_jobs.contains(&job_identity) {
            inner.blocked_triggers.insert(identity.clone());
            if let Some(trigger) = inner.triggers.get_mut(identity) {
                trigger.state = TriggerState::Blocked;
            }
            return Ok(TriggerFiredResult::Blocked);
        }

        let job_data = job.data.clone();
        let job_factory = job.factory.clone();

        let trigger = inner
            .triggers
            .get_mut(identity)
            .expect("looked up above");
        let fire_time = trigger
            .next_fire_time
            .ok_or_else(|| SchedulerError::State("acquired trigger has no next fire time".into()))?;
        let merged_data = job_data.merged_over(&trigger.data);
        let cron_expression = match &trigger.schedule {
            ScheduleKind::Cron {
                expression_source, ..
            } => Some(expression_source.clone()),
            _ => None,
        };
        let previous_fire_time = trigger.previous_fire_time;
        trigger.state = TriggerState::Executing;
        trigger.advance_after_fire(fire_time)?;
        let next_fire_time = trigger.next_fire_time;

        inner.executing_jobs.insert(job_identity.clone());

        Ok(TriggerFiredResult::Fire(FireBundle {
            trigger_identity: identity.clone(),
            job_identity,
            job_factory,
            merged_data,
            fire_time,
            previous_fire_time,
            next_fire_time,
            cron_expression,
        }))
    }

    /// Called once the job body (and its listeners) have finished running.
    /// Releases the job's concurrency slot, re-queues the trigger if it
    /// has more fires left, and unblocks any triggers that queued up
    /// behind this job while it was running.
    pub fn triggered_job_complete(
        &self,
        trigger_identity: &TriggerIdentity,
        job_identity: &JobIdentity,
    ) {
        let mut inner = self.inner.lock();
        inner.executing_jobs.remove(job_identity);

        if let Some(trigger) = inner.triggers.get(trigger_identity) {
            match trigger.state {
                TriggerState::Complete => {
                    remove_trigger_locked(&mut inner, trigger_identity);
                }
                _ => {
                    if let Some(trigger) = inner.triggers.get_mut(trigger_identity) {
                        trigger.state = TriggerState::Normal;
                    }
                    if let Some(trigger) = inner.triggers.get(trigger_identity) {
                        if let Some(key) = StoreInner::fire_key_of(trigger) {
                            inner.waiting.insert(key);
                        }
                    }
                }
            }
        }

        let blocked: Vec<TriggerIdentity> = inner
            .blocked_triggers
            .iter()
            .filter(|tid| {
                inner
                    .triggers
                    .get(*tid)
                    .is_some_and(|t| &t.job_identity == job_identity)
            })
            .cloned()
            .collect();
        for tid in blocked {
            inner.blocked_triggers.remove(&tid);
            if let Some(trigger) = inner.triggers.get_mut(&tid) {
                trigger.state = TriggerState::Normal;
                if let Some(key) = StoreInner::fire_key_of(trigger) {
                    inner.waiting.insert(key);
                }
            }
        }
    }

    pub fn job_exists(&self, identity: &JobIdentity) -> bool {
        self.inner.lock().jobs.contains_key(identity)
    }

    pub fn trigger_state(&self, identity: &TriggerIdentity) -> Option<TriggerState> {
        self.inner.lock().triggers.get(identity).map(|t| t.state)
    }

    pub fn all_job_identities(&self) -> Vec<JobIdentity> {
        self.inner.lock().jobs.keys().cloned().collect()
    }

    pub fn all_trigger_identities(&self) -> Vec<TriggerIdentity> {
        self.inner.lock().triggers.keys().cloned().collect()
    }

    pub fn triggers_for_job(&self, identity: &JobIdentity) -> Vec<TriggerIdentity> {
        self.inner
            .lock()
            .job_triggers
            .get(identity)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn is_job_executing(&self, identity: &JobIdentity) -> bool {
        self.inner.lock().executing_jobs.contains(identity)
    }
}

fn remove_trigger_locked(inner: &mut StoreInner, identity: &TriggerIdentity) {
    if let Some(trigger) = inner.triggers.remove(identity) {
        if let Some(key) = StoreInner::fire_key_of(&trigger) {
            inner.waiting.remove(&key);
        }
        if let Some(set) = inner.job_triggers.get_mut(&trigger.job_identity) {
            set.remove(identity);
        }
    }
    inner.blocked_triggers.remove(identity);
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, TimeZone, Utc};
    use std::sync::Arc;

    fn noop_job(identity: JobIdentity, durable: bool) -> JobDefinition {
        let factory: JobFactory = Arc::new(|| panic!("not invoked in store tests"));
        JobDefinition::builder(identity, factory)
            .durable(durable)
            .build()
    }

    fn simple_trigger(identity: TriggerIdentity, job: JobIdentity, start: DateTime<Utc>) -> Trigger {
        Trigger::new(
            identity,
            job,
            start,
            ScheduleKind::simple(ChronoDuration::seconds(1), crate::trigger::RepeatCount::Times(0)),
        )
    }

    #[test]
    fn test_store_and_acquire_ordering() {
        let store = JobStore::new();
        let job_id = JobIdentity::named("j1");
        store.store_job(noop_job(job_id.clone(), false), false).unwrap();

        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        store
            .store_trigger(simple_trigger(TriggerIdentity::named("t1"), job_id.clone(), start), false)
            .unwrap();

        let acquired = store.acquire_next_triggers(start, 10, ChronoDuration::seconds(0));
        assert_eq!(acquired.len(), 1);
        assert_eq!(acquired[0].identity, TriggerIdentity::named("t1"));
        assert_eq!(
            store.trigger_state(&TriggerIdentity::named("t1")),
            Some(TriggerState::Acquired)
        );
    }

    #[test]
    fn test_non_concurrent_job_blocks_second_trigger() {
        let store = JobStore::new();
        let job_id = JobIdentity::named("j1");
        let factory: JobFactory = Arc::new(|| panic!("not invoked in store tests"));
        store
            .store_job(
                JobDefinition::builder(job_id.clone(), factory)
                    .durable(true)
                    .disallow_concurrent_execution(true)
                    .build(),
                false,
            )
            .unwrap();

        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        store
            .store_trigger(simple_trigger(TriggerIdentity::named("t1"), job_id.clone(), start), false)
            .unwrap();
        store
            .store_trigger(simple_trigger(TriggerIdentity::named("t2"), job_id.clone(), start), false)
            .unwrap();

        store.acquire_next_triggers(start, 10, ChronoDuration::seconds(0));
        let fire1 = store.triggers_fired(&TriggerIdentity::named("t1")).unwrap();
        assert!(matches!(fire1, TriggerFiredResult::Fire(_)));

        let fire2 = store.triggers_fired(&TriggerIdentity::named("t2")).unwrap();
        assert!(matches!(fire2, TriggerFiredResult::Blocked));
        assert_eq!(
            store.trigger_state(&TriggerIdentity::named("t2")),
            Some(TriggerState::Blocked)
        );

        store.triggered_job_complete(&TriggerIdentity::named("t1"), &job_id);
        assert_eq!(
            store.trigger_state(&TriggerIdentity::named("t2")),
            Some(TriggerState::Normal)
        );
    }

    #[test]
    fn test_remove_trigger_cascades_non_durable_job() {
        let store = JobStore::new();
        let job_id = JobIdentity::named("j1");
        store.store_job(noop_job(job_id.clone(), false), false).unwrap();
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        store
            .store_trigger(simple_trigger(TriggerIdentity::named("t1"), job_id.clone(), start), false)
            .unwrap();

        store.remove_trigger(&TriggerIdentity::named("t1")).unwrap();
        assert!(!store.job_exists(&job_id));
    }

    #[test]
    fn test_durable_job_survives_last_trigger_removal() {
        let store = JobStore::new();
        let job_id = JobIdentity::named("j1");
        store.store_job(noop_job(job_id.clone(), true), false).unwrap();
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        store
            .store_trigger(simple_trigger(TriggerIdentity::named("t1"), job_id.clone(), start), false)
            .unwrap();

        store.remove_trigger(&TriggerIdentity::named("t1")).unwrap();
        assert!(store.job_exists(&job_id));
    }

    #[test]
    fn test_pause_removes_from_waiting() {
        let store = JobStore::new();
        let job_id = JobIdentity::named("j1");
        store.store_job(noop_job(job_id.clone(), false), false).unwrap();
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        store
            .store_trigger(simple_trigger(TriggerIdentity::named("t1"), job_id, start), false)
            .unwrap();

        store.pause_trigger(&TriggerIdentity::named("t1")).unwrap();
        let acquired = store.acquire_next_triggers(start, 10, ChronoDuration::seconds(0));
        assert!(acquired.is_empty());

        store.resume_trigger(&TriggerIdentity::named("t1")).unwrap();
        let acquired = store.acquire_next_triggers(start, 10, ChronoDuration::seconds(0));
        assert_eq!(acquired.len(), 1);
    }

    #[test]
    fn test_store_job_without_replace_rejects_duplicate() {
        let store = JobStore::new();
        let job_id = JobIdentity::named("j1");
        store.store_job(noop_job(job_id.clone(), false), false).unwrap();
        assert!(store.store_job(noop_job(job_id, false), false).is_err());
    }

    #[test]
    fn test_store_job_with_replace_is_idempotent() {
        let store = JobStore::new();
        let job_id = JobIdentity::named("j1");
        store.store_job(noop_job(job_id.clone(), false), true).unwrap();
        store.store_job(noop_job(job_id.clone(), false), true).unwrap();
        assert!(store.job_exists(&job_id));
        assert_eq!(store.all_job_identities().len(), 1);
    }

    #[test]
    fn test_store_trigger_with_replace_reschedules_on_collision() {
        let store = JobStore::new();
        let job_id = JobIdentity::named("j1");
        store.store_job(noop_job(job_id.clone(), true), false).unwrap();
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        store
            .store_trigger(simple_trigger(TriggerIdentity::named("t1"), job_id.clone(), start), false)
            .unwrap();

        let later = start + ChronoDuration::hours(1);
        store
            .store_trigger(simple_trigger(TriggerIdentity::named("t1"), job_id, later), true)
            .unwrap();

        assert_eq!(store.all_trigger_identities().len(), 1);
        let acquired = store.acquire_next_triggers(start, 10, ChronoDuration::seconds(0));
        assert!(acquired.is_empty(), "old fire time must no longer be in the waiting index");
        let acquired = store.acquire_next_triggers(later, 10, ChronoDuration::seconds(0));
        assert_eq!(acquired.len(), 1);
    }
}
