//! Job data model: identity, the typed data map, and the job trait itself.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::context::JobContext;

/// Identity of a job: unique `(name, group)` pair within a store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobIdentity {
    pub name: String,
    pub group: String,
}

impl JobIdentity {
    pub fn new(name: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            group: group.into(),
        }
    }

    /// Identity in the default group.
    pub fn named(name: impl Into<String>) -> Self {
        Self::new(name, "DEFAULT")
    }
}

impl fmt::Display for JobIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.group, self.name)
    }
}

/// A single value in a [`JobDataMap`]. Closed set of scalar kinds —
/// the idiomatic Rust rendition of a dynamically-typed Java map entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JobDataValue {
    String(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Bytes(Vec<u8>),
}

impl JobDataValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            JobDataValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            JobDataValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            JobDataValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            JobDataValue::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl From<&str> for JobDataValue {
    fn from(s: &str) -> Self {
        JobDataValue::String(s.to_string())
    }
}
impl From<String> for JobDataValue {
    fn from(s: String) -> Self {
        JobDataValue::String(s)
    }
}
impl From<i64> for JobDataValue {
    fn from(i: i64) -> Self {
        JobDataValue::Int(i)
    }
}
impl From<f64> for JobDataValue {
    fn from(f: f64) -> Self {
        JobDataValue::Float(f)
    }
}
impl From<bool> for JobDataValue {
    fn from(b: bool) -> Self {
        JobDataValue::Bool(b)
    }
}

/// Key/value data carried by a job or a trigger. At fire time the job's
/// map is merged with the trigger's map, the trigger winning on conflicts
/// (spec.md §3, Trigger attributes).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobDataMap(pub HashMap<String, JobDataValue>);

impl JobDataMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<JobDataValue>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&JobDataValue> {
        self.0.get(key)
    }

    /// Merge `other` on top of `self`, `other` winning key conflicts.
    /// Returns a new snapshot map; neither input is mutated (data handed
    /// to user code must be a snapshot per spec.md §5).
    pub fn merged_over(&self, other: &JobDataMap) -> JobDataMap {
        let mut merged = self.clone();
        for (k, v) in &other.0 {
            merged.0.insert(k.clone(), v.clone());
        }
        merged
    }
}

/// Outcome of one call to [`Job::run`], inspected by the runner to decide
/// the completion code (spec.md §4.F, §9 open question).
pub enum RunOutcome {
    /// Normal successful completion.
    Success,
    /// The job observed `context.is_interrupted()` and aborted cleanly.
    Interrupted,
    /// The job required a context key that was absent.
    MissingParameter(String),
}

/// User-supplied unit of work. A fresh instance is produced per fire via
/// a [`JobFactory`] registered at job-install time (spec.md §9: inheritance
/// of job base classes maps to an interface implemented by user code, with
/// the runner constructing instances through a factory).
pub trait Job: Send {
    /// Execute the job body against the given context.
    fn run(&mut self, ctx: &JobContext) -> crate::error::SchedulerResult<RunOutcome>;

    /// Always invoked after `run`, regardless of outcome.
    fn cleanup(&mut self) {}
}

/// Factory producing a fresh [`Job`] instance for each fire.
pub type JobFactory = Arc<dyn Fn() -> Box<dyn Job> + Send + Sync>;

/// A registered job: identity, factory, data, and the durability /
/// concurrency flags of spec.md §3.
#[derive(Clone)]
pub struct JobDefinition {
    pub identity: JobIdentity,
    pub description: Option<String>,
    pub factory: JobFactory,
    pub data: JobDataMap,
    pub durable: bool,
    pub disallow_concurrent_execution: bool,
    pub requests_recovery: bool,
}

impl fmt::Debug for JobDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("identity", &self.identity)
            .field("description", &self.description)
            .field("durable", &self.durable)
            .field(
                "disallow_concurrent_execution",
                &self.disallow_concurrent_execution,
            )
            .field("requests_recovery", &self.requests_recovery)
            .finish()
    }
}

impl JobDefinition {
    pub fn builder(identity: JobIdentity, factory: JobFactory) -> JobBuilder {
        JobBuilder {
            identity,
            factory,
            description: None,
            data: JobDataMap::new(),
            durable: false,
            disallow_concurrent_execution: false,
            requests_recovery: false,
        }
    }
}

/// Builder for [`JobDefinition`], following the teacher's `with_x` builder
/// convention (`agentor_orchestrator::engine::Orchestrator::with_output_dir`).
pub struct JobBuilder {
    identity: JobIdentity,
    factory: JobFactory,
    description: Option<String>,
    data: JobDataMap,
    durable: bool,
    disallow_concurrent_execution: bool,
    requests_recovery: bool,
}

impl JobBuilder {
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn data(mut self, data: JobDataMap) -> Self {
        self.data = data;
        self
    }

    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    pub fn disallow_concurrent_execution(mut self, disallow: bool) -> Self {
        self.disallow_concurrent_execution = disallow;
        self
    }

    pub fn requests_recovery(mut self, requests_recovery: bool) -> Self {
        self.requests_recovery = requests_recovery;
        self
    }

    pub fn build(self) -> JobDefinition {
        JobDefinition {
            identity: self.identity,
            description: self.description,
            factory: self.factory,
            data: self.data,
            durable: self.durable,
            disallow_concurrent_execution: self.disallow_concurrent_execution,
            requests_recovery: self.requests_recovery,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_display() {
        let id = JobIdentity::new("report", "nightly");
        assert_eq!(id.to_string(), "nightly.report");
    }

    #[test]
    fn test_identity_default_group() {
        let id = JobIdentity::named("report");
        assert_eq!(id.group, "DEFAULT");
    }

    #[test]
    fn test_data_map_merge_trigger_wins() {
        let mut job_data = JobDataMap::new();
        job_data.insert("k1", "job");
        job_data.insert("k2", "job-only");

        let mut trigger_data = JobDataMap::new();
        trigger_data.insert("k1", "trigger");

        let merged = job_data.merged_over(&trigger_data);
        assert_eq!(merged.get("k1").unwrap().as_str(), Some("trigger"));
        assert_eq!(merged.get("k2").unwrap().as_str(), Some("job-only"));

        // Inputs are untouched (snapshot semantics).
        assert_eq!(job_data.get("k1").unwrap().as_str(), Some("job"));
    }

    #[test]
    fn test_job_builder_defaults() {
        let factory: JobFactory = Arc::new(|| panic!("not invoked in this test"));
        let job = JobDefinition::builder(JobIdentity::named("x"), factory).build();
        assert!(!job.durable);
        assert!(!job.disallow_concurrent_execution);
    }
}
