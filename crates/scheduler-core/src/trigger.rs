//! Trigger models: identity, state machine, schedule variants, and
//! next-fire-time computation (spec.md §3, §4.B).

use std::fmt;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::cron::CronExpression;
use crate::error::{SchedulerError, SchedulerResult};
use crate::job::JobDataMap;
use crate::job::JobIdentity;

/// Identity of a trigger: unique `(name, group)` pair within a store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TriggerIdentity {
    pub name: String,
    pub group: String,
}

impl TriggerIdentity {
    pub fn new(name: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            group: group.into(),
        }
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self::new(name, "DEFAULT")
    }
}

impl fmt::Display for TriggerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.group, self.name)
    }
}

/// Trigger lifecycle state (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TriggerState {
    Normal,
    Paused,
    Acquired,
    Executing,
    /// Waiting because its job is non-concurrent and already executing.
    Blocked,
    Complete,
    Error,
}

/// How a misfired trigger should be handled (spec.md §4.B).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum MisfireInstruction {
    #[default]
    SmartPolicy,
    FireNow,
    RescheduleNextWithExistingCount,
    RescheduleNextWithRemainingCount,
    RescheduleNowWithExistingRepeatCount,
    RescheduleNowWithRemainingRepeatCount,
    DoNothing,
    FireOnceNow,
}

/// Non-negative repeat count, or "fire indefinitely".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RepeatCount {
    Times(u32),
    Indefinite,
}

/// A unit for [`ScheduleKind::CalendarInterval`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CalendarUnit {
    Second,
    Minute,
    Hour,
    Day,
    Week,
    Month,
    Year,
}

/// Variant-specific schedule data (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ScheduleKind {
    Simple {
        repeat_interval: ChronoDuration,
        repeat_count: RepeatCount,
        times_triggered: u32,
    },
    Cron {
        #[serde(skip, default)]
        expression: Option<CronExpression>,
        expression_source: String,
        time_zone: String,
    },
    CalendarInterval {
        interval: i64,
        unit: CalendarUnit,
        times_triggered: u32,
    },
}

impl ScheduleKind {
    pub fn simple(repeat_interval: ChronoDuration, repeat_count: RepeatCount) -> Self {
        ScheduleKind::Simple {
            repeat_interval,
            repeat_count,
            times_triggered: 0,
        }
    }

    pub fn cron(expression: &str, time_zone: &str) -> SchedulerResult<Self> {
        let parsed = CronExpression::parse(expression)?;
        Ok(ScheduleKind::Cron {
            expression: Some(parsed),
            expression_source: expression.to_string(),
            time_zone: time_zone.to_string(),
        })
    }

    pub fn calendar_interval(interval: i64, unit: CalendarUnit) -> Self {
        ScheduleKind::CalendarInterval {
            interval,
            unit,
            times_triggered: 0,
        }
    }
}

/// A trigger: a firing rule bound to a job (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trigger {
    pub identity: TriggerIdentity,
    pub job_identity: JobIdentity,
    pub description: Option<String>,
    pub priority: i32,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub data: JobDataMap,
    pub misfire_instruction: MisfireInstruction,
    pub calendar_name: Option<String>,
    pub schedule: ScheduleKind,
    pub state: TriggerState,
    pub next_fire_time: Option<DateTime<Utc>>,
    pub previous_fire_time: Option<DateTime<Utc>>,
}

impl Trigger {
    pub fn new(
        identity: TriggerIdentity,
        job_identity: JobIdentity,
        start_time: DateTime<Utc>,
        schedule: ScheduleKind,
    ) -> Self {
        Self {
            identity,
            job_identity,
            description: None,
            priority: 5,
            start_time,
            end_time: None,
            data: JobDataMap::new(),
            misfire_instruction: MisfireInstruction::SmartPolicy,
            calendar_name: None,
            schedule,
            state: TriggerState::Normal,
            next_fire_time: None,
            previous_fire_time: None,
        }
    }

    /// Seed `next_fire_time` the first time the trigger is stored.
    pub fn compute_first_fire_time(&mut self) -> SchedulerResult<()> {
        self.next_fire_time = self.next_fire_time_after(None)?;
        if self.next_fire_time.is_none() {
            self.state = TriggerState::Complete;
        }
        Ok(())
    }

    /// Compute the next fire time given the current `previous_fire_time`
    /// (or `None` before the first fire), per spec.md §4.B.
    fn next_fire_time_after(
        &self,
        after_override: Option<DateTime<Utc>>,
    ) -> SchedulerResult<Option<DateTime<Utc>>> {
        let next = match &self.schedule {
            ScheduleKind::Simple {
                repeat_interval,
                repeat_count,
                times_triggered,
            } => {
                let exhausted = match repeat_count {
                    RepeatCount::Indefinite => false,
                    RepeatCount::Times(n) => *times_triggered > *n,
                };
                if exhausted {
                    None
                } else if let Some(prev) = after_override.or(self.previous_fire_time) {
                    Some(prev + *repeat_interval)
                } else {
                    Some(self.start_time)
                }
            }
            ScheduleKind::Cron {
                expression,
                time_zone,
                ..
            } => {
                let expr = expression.as_ref().ok_or_else(|| {
                    SchedulerError::Config(
                        "cron trigger's expression was not rehydrated after load".into(),
                    )
                })?;
                let zone: Tz = time_zone
                    .parse()
                    .map_err(|_| SchedulerError::Config(format!("unknown time zone '{time_zone}'")))?;
                let base = after_override
                    .or(self.previous_fire_time)
                    .map(|p| p.max(self.start_time))
                    .unwrap_or(self.start_time - ChronoDuration::milliseconds(1));
                expr.next_after(base, zone)
            }
            ScheduleKind::CalendarInterval {
                interval,
                unit,
                times_triggered,
            } => add_calendar_interval(self.start_time, *unit, *interval * (*times_triggered as i64)),
        };

        Ok(match next {
            Some(t) => {
                if let Some(end) = self.end_time {
                    if t > end {
                        None
                    } else {
                        Some(t)
                    }
                } else {
                    Some(t)
                }
            }
            None => None,
        })
    }

    /// Advance the trigger's state after a fire: bump `times_triggered`,
    /// move `previous_fire_time` forward, and recompute `next_fire_time`.
    /// Transitions to `Complete` when exhausted (spec.md §3, §4.C
    /// `triggersFired`).
    pub fn advance_after_fire(&mut self, fire_time: DateTime<Utc>) -> SchedulerResult<()> {
        self.previous_fire_time = Some(fire_time);
        match &mut self.schedule {
            ScheduleKind::Simple {
                times_triggered, ..
            } => *times_triggered += 1,
            ScheduleKind::CalendarInterval {
                times_triggered, ..
            } => *times_triggered += 1,
            ScheduleKind::Cron { .. } => {}
        }
        self.next_fire_time = self.next_fire_time_after(Some(fire_time))?;
        self.state = if self.next_fire_time.is_none() {
            TriggerState::Complete
        } else {
            TriggerState::Normal
        };
        Ok(())
    }

    /// Whether `now` constitutes a misfire given `threshold` (spec.md §4.B).
    pub fn has_misfired(&self, now: DateTime<Utc>, threshold: ChronoDuration) -> bool {
        match self.next_fire_time {
            Some(nft) => now > nft + threshold,
            None => false,
        }
    }

    /// Resolve `SMART_POLICY` into a concrete instruction (spec.md §4.B).
    pub fn resolve_smart_misfire_instruction(&self) -> MisfireInstruction {
        if self.misfire_instruction != MisfireInstruction::SmartPolicy {
            return self.misfire_instruction;
        }
        match &self.schedule {
            ScheduleKind::Simple { repeat_count, .. } => match repeat_count {
                RepeatCount::Indefinite => MisfireInstruction::RescheduleNextWithRemainingCount,
                RepeatCount::Times(_) => MisfireInstruction::RescheduleNowWithExistingRepeatCount,
            },
            ScheduleKind::Cron { .. } => MisfireInstruction::FireOnceNow,
            ScheduleKind::CalendarInterval { .. } => MisfireInstruction::FireOnceNow,
        }
    }

    /// Apply a misfire instruction: mutate `next_fire_time` (and, for the
    /// "existing/remaining count" simple variants, `times_triggered`)
    /// in place. `now` is the instant the misfire was detected at.
    pub fn apply_misfire(&mut self, now: DateTime<Utc>) -> SchedulerResult<()> {
        let instruction = self.resolve_smart_misfire_instruction();
        match instruction {
            MisfireInstruction::DoNothing => {}
            MisfireInstruction::FireNow | MisfireInstruction::FireOnceNow => {
                self.next_fire_time = Some(now);
            }
            MisfireInstruction::RescheduleNextWithExistingCount
            | MisfireInstruction::RescheduleNextWithRemainingCount => {
                // Skip ahead to the next regularly scheduled time after now.
                self.next_fire_time = self.next_fire_time_after(Some(now))?;
                if self.next_fire_time.is_none() {
                    self.state = TriggerState::Complete;
                }
            }
            MisfireInstruction::RescheduleNowWithExistingRepeatCount
            | MisfireInstruction::RescheduleNowWithRemainingRepeatCount => {
                self.next_fire_time = Some(now);
            }
            MisfireInstruction::SmartPolicy => unreachable!("resolved above"),
        }
        Ok(())
    }
}

fn add_calendar_interval(
    start: DateTime<Utc>,
    unit: CalendarUnit,
    amount: i64,
) -> Option<DateTime<Utc>> {
    use chrono::Months;
    match unit {
        CalendarUnit::Second => start.checked_add_signed(ChronoDuration::seconds(amount)),
        CalendarUnit::Minute => start.checked_add_signed(ChronoDuration::minutes(amount)),
        CalendarUnit::Hour => start.checked_add_signed(ChronoDuration::hours(amount)),
        CalendarUnit::Day => start.checked_add_signed(ChronoDuration::days(amount)),
        CalendarUnit::Week => start.checked_add_signed(ChronoDuration::weeks(amount)),
        CalendarUnit::Month => {
            if amount >= 0 {
                start.checked_add_months(Months::new(amount as u32))
            } else {
                start.checked_sub_months(Months::new((-amount) as u32))
            }
        }
        CalendarUnit::Year => {
            let months = amount.saturating_mul(12);
            if months >= 0 {
                start.checked_add_months(Months::new(months as u32))
            } else {
                start.checked_sub_months(Months::new((-months) as u32))
            }
        }
    }
}
