//! YAML descriptor loader (spec.md §4.H). Parses a document describing
//! jobs and triggers, validates it completely, then installs it into a
//! [`JobStore`] in one pass — never partially. Mirrors the teacher's
//! `SubAgentSpawner` read-phase-then-write-phase pattern
//! (`agentor_orchestrator::spawner`).

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Deserialize;

use crate::error::{SchedulerError, SchedulerResult};
use crate::job::{JobDataMap, JobDataValue, JobDefinition, JobFactory, JobIdentity};
use crate::store::JobStore;
use crate::trigger::{CalendarUnit, RepeatCount, ScheduleKind, Trigger, TriggerIdentity};

/// Top-level shape of a descriptor file.
#[derive(Debug, Deserialize)]
pub struct ScheduleDocument {
    #[serde(default)]
    pub jobs: Vec<JobDescriptor>,
    #[serde(default)]
    pub triggers: Vec<TriggerDescriptor>,
}

#[derive(Debug, Deserialize)]
pub struct JobDescriptor {
    pub name: String,
    #[serde(default = "default_group")]
    pub group: String,
    /// Looked up in the [`JobFactoryRegistry`] supplied to the loader —
    /// descriptors name a job *type*, not Rust code, so the factory for
    /// each type must be registered by the embedding application first.
    #[serde(rename = "type")]
    pub job_type: String,
    pub description: Option<String>,
    #[serde(default)]
    pub data: HashMap<String, JobDataValue>,
    #[serde(default)]
    pub durable: bool,
    #[serde(default)]
    pub disallow_concurrent_execution: bool,
    #[serde(default)]
    pub requests_recovery: bool,
}

#[derive(Debug, Deserialize)]
pub struct TriggerDescriptor {
    pub name: String,
    #[serde(default = "default_group")]
    pub group: String,
    pub job_name: String,
    #[serde(default = "default_group")]
    pub job_group: String,
    #[serde(default)]
    pub priority: i32,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub data: HashMap<String, JobDataValue>,
    pub schedule: ScheduleDescriptor,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum ScheduleDescriptor {
    Simple {
        repeat_interval_seconds: i64,
        /// Omitted means "repeat forever".
        repeat_count: Option<u32>,
    },
    Cron {
        expression: String,
        #[serde(default = "default_time_zone")]
        time_zone: String,
    },
    CalendarInterval {
        interval: i64,
        unit: CalendarUnitDescriptor,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CalendarUnitDescriptor {
    Second,
    Minute,
    Hour,
    Day,
    Week,
    Month,
    Year,
}

impl From<CalendarUnitDescriptor> for CalendarUnit {
    fn from(value: CalendarUnitDescriptor) -> Self {
        match value {
            CalendarUnitDescriptor::Second => CalendarUnit::Second,
            CalendarUnitDescriptor::Minute => CalendarUnit::Minute,
            CalendarUnitDescriptor::Hour => CalendarUnit::Hour,
            CalendarUnitDescriptor::Day => CalendarUnit::Day,
            CalendarUnitDescriptor::Week => CalendarUnit::Week,
            CalendarUnitDescriptor::Month => CalendarUnit::Month,
            CalendarUnitDescriptor::Year => CalendarUnit::Year,
        }
    }
}

fn default_group() -> String {
    "DEFAULT".to_string()
}

fn default_time_zone() -> String {
    "UTC".to_string()
}

/// Maps a descriptor's `type` field to the factory that builds that
/// kind of job. Registered by the embedding application before loading
/// any descriptor (spec.md §9: job classes become a registry lookup).
#[derive(Clone, Default)]
pub struct JobFactoryRegistry {
    factories: HashMap<String, JobFactory>,
}

impl JobFactoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, job_type: impl Into<String>, factory: JobFactory) {
        self.factories.insert(job_type.into(), factory);
    }

    fn get(&self, job_type: &str) -> SchedulerResult<JobFactory> {
        self.factories
            .get(job_type)
            .cloned()
            .ok_or_else(|| SchedulerError::Config(format!("unknown job type '{job_type}'")))
    }
}

/// Parse a YAML descriptor and install every job and trigger it
/// describes into `store`. The whole document is built and validated in
/// memory before the first `store_job` call — if any entry is invalid,
/// nothing is installed (spec.md §4.H atomicity note). Jobs and triggers
/// already present under the same identity are replaced in place rather
/// than rejected, so reloading the same (or an updated) descriptor is
/// idempotent (spec.md:193-194) and a colliding trigger is simply
/// rescheduled from the reloaded definition (spec.md:144).
pub fn load_descriptor(
    yaml: &str,
    registry: &JobFactoryRegistry,
    store: &JobStore,
) -> SchedulerResult<usize> {
    let document: ScheduleDocument = serde_yaml::from_str(yaml)?;

    let mut built_jobs = Vec::with_capacity(document.jobs.len());
    for job_desc in &document.jobs {
        built_jobs.push(build_job(job_desc, registry)?);
    }

    let mut built_triggers = Vec::with_capacity(document.triggers.len());
    for trigger_desc in &document.triggers {
        built_triggers.push(build_trigger(trigger_desc)?);
    }

    let installed = built_jobs.len() + built_triggers.len();
    for job in built_jobs {
        store.store_job(job, true)?;
    }
    for trigger in built_triggers {
        store.store_trigger(trigger, true)?;
    }
    Ok(installed)
}

fn build_job(desc: &JobDescriptor, registry: &JobFactoryRegistry) -> SchedulerResult<JobDefinition> {
    let factory = registry.get(&desc.job_type)?;
    let mut data = JobDataMap::new();
    for (k, v) in &desc.data {
        data.insert(k.clone(), v.clone());
    }
    let mut builder = JobDefinition::builder(JobIdentity::new(&desc.name, &desc.group), factory)
        .data(data)
        .durable(desc.durable)
        .disallow_concurrent_execution(desc.disallow_concurrent_execution)
        .requests_recovery(desc.requests_recovery);
    if let Some(description) = &desc.description {
        builder = builder.description(description.clone());
    }
    Ok(builder.build())
}

fn build_trigger(desc: &TriggerDescriptor) -> SchedulerResult<Trigger> {
    let start_time = desc.start_time.unwrap_or_else(Utc::now);
    let schedule = match &desc.schedule {
        ScheduleDescriptor::Simple {
            repeat_interval_seconds,
            repeat_count,
        } => ScheduleKind::simple(
            ChronoDuration::seconds(*repeat_interval_seconds),
            match repeat_count {
                Some(n) => RepeatCount::Times(*n),
                None => RepeatCount::Indefinite,
            },
        ),
        ScheduleDescriptor::Cron {
            expression,
            time_zone,
        } => ScheduleKind::cron(expression, time_zone)?,
        ScheduleDescriptor::CalendarInterval { interval, unit } => {
            ScheduleKind::calendar_interval(*interval, unit.clone().into())
        }
    };

    let mut trigger = Trigger::new(
        TriggerIdentity::new(&desc.name, &desc.group),
        JobIdentity::new(&desc.job_name, &desc.job_group),
        start_time,
        schedule,
    );
    trigger.priority = desc.priority;
    trigger.end_time = desc.end_time;
    for (k, v) in &desc.data {
        trigger.data.insert(k.clone(), v.clone());
    }
    Ok(trigger)
}

/// A factory wired straight to a no-argument constructor, for the common
/// case of a job type with no descriptor-driven configuration beyond
/// its data map.
pub fn simple_factory<J>(make: impl Fn() -> J + Send + Sync + 'static) -> JobFactory
where
    J: crate::job::Job + 'static,
{
    Arc::new(move || Box::new(make()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::JobContext;
    use crate::job::{Job, RunOutcome};

    struct NoopJob;
    impl Job for NoopJob {
        fn run(&mut self, _ctx: &JobContext) -> SchedulerResult<RunOutcome> {
            Ok(RunOutcome::Success)
        }
    }

    fn registry() -> JobFactoryRegistry {
        let mut r = JobFactoryRegistry::new();
        r.register("noop", simple_factory(|| NoopJob));
        r
    }

    const DOC: &str = r#"
jobs:
  - name: nightly-report
    type: noop
    durable: true
triggers:
  - name: nightly-report-trigger
    job_name: nightly-report
    schedule:
      kind: cron
      expression: "0 0 2 * * ?"
"#;

    #[test]
    fn test_load_valid_descriptor() {
        let store = JobStore::new();
        let installed = load_descriptor(DOC, &registry(), &store).unwrap();
        assert_eq!(installed, 2);
        assert!(store.job_exists(&JobIdentity::named("nightly-report")));
    }

    #[test]
    fn test_unknown_job_type_is_rejected_before_install() {
        let store = JobStore::new();
        let doc = DOC.replace("type: noop", "type: does-not-exist");
        let result = load_descriptor(&doc, &registry(), &store);
        assert!(result.is_err());
        assert!(!store.job_exists(&JobIdentity::named("nightly-report")));
    }

    #[test]
    fn test_invalid_cron_expression_is_rejected() {
        let store = JobStore::new();
        let doc = DOC.replace("0 0 2 * * ?", "not a cron expression");
        assert!(load_descriptor(&doc, &registry(), &store).is_err());
    }

    #[test]
    fn test_simple_schedule_descriptor() {
        const SIMPLE_DOC: &str = r#"
jobs:
  - name: poller
    type: noop
triggers:
  - name: poller-trigger
    job_name: poller
    schedule:
      kind: simple
      repeat_interval_seconds: 30
      repeat_count: 5
"#;
        let store = JobStore::new();
        load_descriptor(SIMPLE_DOC, &registry(), &store).unwrap();
        assert!(store.job_exists(&JobIdentity::named("poller")));
    }

    #[test]
    fn test_reloading_same_descriptor_is_idempotent() {
        let store = JobStore::new();
        load_descriptor(DOC, &registry(), &store).unwrap();
        load_descriptor(DOC, &registry(), &store).unwrap();
        assert_eq!(store.all_job_identities().len(), 1);
        assert_eq!(store.all_trigger_identities().len(), 1);
    }
}
