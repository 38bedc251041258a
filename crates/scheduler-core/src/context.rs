//! Per-fire execution context (spec.md §3 "JobContext", §4.F).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::job::{JobDataMap, JobDataValue};
use crate::trigger::TriggerIdentity;

/// Reserved `JobContext` keys injected by the runner.
pub const KEY_JOB_NAME: &str = "__job_name__";
pub const KEY_TRIGGER_NAME: &str = "__trigger_name__";
pub const KEY_TRIGGER_CRON_EXPRESSION: &str = "__trigger_cron_expression__";

/// Ephemeral, per-fire object handed to a [`crate::job::Job`]. Built as the
/// union of the job's data map overlaid by the trigger's (merge done by
/// [`JobDataMap::merged_over`] before this is constructed), plus reserved
/// metadata entries. Scoped to one execution; discarded in the runner's
/// finally step.
#[derive(Debug, Clone)]
pub struct JobContext {
    data: JobDataMap,
    job_name: String,
    trigger_name: String,
    trigger_group: String,
    fire_time: DateTime<Utc>,
    previous_fire_time: Option<DateTime<Utc>>,
    next_fire_time: Option<DateTime<Utc>>,
    interrupted: Arc<AtomicBool>,
}

impl JobContext {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        mut data: JobDataMap,
        job_name: String,
        trigger: &TriggerIdentity,
        cron_expression: Option<&str>,
        fire_time: DateTime<Utc>,
        previous_fire_time: Option<DateTime<Utc>>,
        next_fire_time: Option<DateTime<Utc>>,
        interrupted: Arc<AtomicBool>,
    ) -> Self {
        data.insert(KEY_JOB_NAME, job_name.clone());
        data.insert(KEY_TRIGGER_NAME, trigger.name.clone());
        if let Some(cron) = cron_expression {
            data.insert(KEY_TRIGGER_CRON_EXPRESSION, cron.to_string());
        }
        Self {
            data,
            job_name,
            trigger_name: trigger.name.clone(),
            trigger_group: trigger.group.clone(),
            fire_time,
            previous_fire_time,
            next_fire_time,
            interrupted,
        }
    }

    /// Read a value from the merged data map.
    pub fn get(&self, key: &str) -> Option<&JobDataValue> {
        self.data.get(key)
    }

    /// Read a required string value, or `None` if absent — the caller is
    /// expected to translate `None` into [`crate::job::RunOutcome::MissingParameter`].
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(JobDataValue::as_str)
    }

    pub fn job_name(&self) -> &str {
        &self.job_name
    }

    pub fn trigger_name(&self) -> &str {
        &self.trigger_name
    }

    pub fn trigger_group(&self) -> &str {
        &self.trigger_group
    }

    pub fn fire_time(&self) -> DateTime<Utc> {
        self.fire_time
    }

    pub fn previous_fire_time(&self) -> Option<DateTime<Utc>> {
        self.previous_fire_time
    }

    pub fn next_fire_time(&self) -> Option<DateTime<Utc>> {
        self.next_fire_time
    }

    /// Cooperative interrupt flag, set by `Scheduler::stop_job`. User code
    /// polls this and returns `RunOutcome::Interrupted` when set.
    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trigger_id() -> TriggerIdentity {
        TriggerIdentity::named("t1")
    }

    #[test]
    fn test_reserved_keys_injected() {
        let ctx = JobContext::new(
            JobDataMap::new(),
            "myjob".into(),
            &trigger_id(),
            Some("0 * * * * ?"),
            Utc::now(),
            None,
            None,
            Arc::new(AtomicBool::new(false)),
        );
        assert_eq!(ctx.get_str(KEY_JOB_NAME), Some("myjob"));
        assert_eq!(ctx.get_str(KEY_TRIGGER_NAME), Some("t1"));
        assert_eq!(
            ctx.get_str(KEY_TRIGGER_CRON_EXPRESSION),
            Some("0 * * * * ?")
        );
    }

    #[test]
    fn test_interrupt_flag_visible() {
        let flag = Arc::new(AtomicBool::new(false));
        let ctx = JobContext::new(
            JobDataMap::new(),
            "myjob".into(),
            &trigger_id(),
            None,
            Utc::now(),
            None,
            None,
            flag.clone(),
        );
        assert!(!ctx.is_interrupted());
        flag.store(true, Ordering::SeqCst);
        assert!(ctx.is_interrupted());
    }
}
