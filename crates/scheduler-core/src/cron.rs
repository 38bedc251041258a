//! Cron expression evaluator (spec.md §4.A).
//!
//! Six or seven whitespace-delimited fields: seconds, minutes, hours,
//! day-of-month, month, day-of-week, and an optional year. Supports `*`,
//! ranges, steps, lists, month/weekday names, `?` on exactly one of the
//! day fields, and `L`/`W`/`#n` on the day fields. This is hand-rolled
//! rather than built on the `cron` crate because that crate does not
//! implement `L`/`W`/`#n` semantics — those are the point of this module.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Timelike, Utc, Weekday};
use chrono_tz::Tz;

use crate::error::{SchedulerError, SchedulerResult};

const DEFAULT_MIN_YEAR: u32 = 1970;
const DEFAULT_MAX_YEAR: u32 = 2099;

/// A parsed cron expression, ready for repeated `next_after` queries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpression {
    source: String,
    seconds: Vec<u32>,
    minutes: Vec<u32>,
    hours: Vec<u32>,
    months: Vec<u32>,
    day_of_month: DayOfMonthField,
    day_of_week: DayOfWeekField,
    min_year: u32,
    max_year: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum DayOfMonthField {
    Any,
    Question,
    Values(Vec<u32>),
    /// `L` — last day of the month.
    Last,
    /// `LW` — last weekday of the month.
    LastWeekday,
    /// `nW` — nearest weekday to day `n`, without crossing month boundaries.
    NearestWeekday(u32),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum DayOfWeekField {
    Any,
    Question,
    Values(Vec<u32>),
    /// `nL` (or bare `L`, meaning Saturday) — weekday `n`'s last occurrence
    /// in the month. `n` is 1=SUN..7=SAT.
    LastOccurrence(u32),
    /// `n#k` — the k-th (1..5) occurrence of weekday `n` in the month.
    NthOccurrence(u32, u32),
}

const MONTH_NAMES: &[(&str, u32)] = &[
    ("JAN", 1),
    ("FEB", 2),
    ("MAR", 3),
    ("APR", 4),
    ("MAY", 5),
    ("JUN", 6),
    ("JUL", 7),
    ("AUG", 8),
    ("SEP", 9),
    ("OCT", 10),
    ("NOV", 11),
    ("DEC", 12),
];

const WEEKDAY_NAMES: &[(&str, u32)] = &[
    ("SUN", 1),
    ("MON", 2),
    ("TUE", 3),
    ("WED", 4),
    ("THU", 5),
    ("FRI", 6),
    ("SAT", 7),
];

impl CronExpression {
    /// Parse a 6- or 7-field cron expression.
    pub fn parse(expr: &str) -> SchedulerResult<Self> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != 6 && fields.len() != 7 {
            return Err(SchedulerError::Config(format!(
                "cron expression '{expr}' must have 6 or 7 fields, found {}",
                fields.len()
            )));
        }

        let seconds = parse_numeric_field(fields[0], 0, 59, None, "seconds")?;
        let minutes = parse_numeric_field(fields[1], 0, 59, None, "minutes")?;
        let hours = parse_numeric_field(fields[2], 0, 23, None, "hours")?;
        let month_field = fields[4];
        let months = parse_numeric_field(month_field, 1, 12, Some(MONTH_NAMES), "month")?;

        let dom_raw = fields[3];
        let dow_raw = fields[5];
        let day_of_month = parse_day_of_month(dom_raw)?;
        let day_of_week = parse_day_of_week(dow_raw)?;

        let dom_is_question = matches!(day_of_month, DayOfMonthField::Question);
        let dow_is_question = matches!(day_of_week, DayOfWeekField::Question);
        if dom_is_question == dow_is_question {
            return Err(SchedulerError::Config(
                "cron expression: exactly one of day-of-month / day-of-week must be '?'".into(),
            ));
        }

        let (min_year, max_year) = if fields.len() == 7 {
            parse_year_field(fields[6])?
        } else {
            (DEFAULT_MIN_YEAR, DEFAULT_MAX_YEAR)
        };

        Ok(Self {
            source: expr.to_string(),
            seconds,
            minutes,
            hours,
            months,
            day_of_month,
            day_of_week,
            min_year,
            max_year,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Returns the smallest instant strictly after `after` that satisfies
    /// every field, evaluated in `zone`, or `None` if no such instant
    /// exists (e.g. past the configured year range).
    pub fn next_after(&self, after: DateTime<Utc>, zone: Tz) -> Option<DateTime<Utc>> {
        let local_after = after.with_timezone(&zone).naive_local();
        let mut candidate_date = local_after.date();
        let mut start_tod: Option<(u32, u32, u32)> = Some(add_one_second(
            local_after.hour(),
            local_after.minute(),
            local_after.second(),
            &mut candidate_date,
        ));

        // Bound the search: a few centuries of days is always enough given
        // the year range check below will terminate it far sooner in
        // practice.
        for _ in 0..(400 * 366) {
            let year = candidate_date.year() as u32;
            if year > self.max_year {
                return None;
            }
            if year >= self.min_year
                && self.months.contains(&candidate_date.month())
                && self.day_matches(candidate_date)
            {
                if let Some((h, m, s)) = self.first_time_of_day(start_tod) {
                    let naive_time = NaiveTime::from_hms_opt(h, m, s)?;
                    let naive_dt = NaiveDateTime::new(candidate_date, naive_time);
                    if let Some(dt) = local_to_utc(&zone, naive_dt) {
                        return Some(dt);
                    }
                }
            }
            candidate_date = candidate_date.succ_opt()?;
            start_tod = None;
        }
        None
    }

    fn day_matches(&self, date: NaiveDate) -> bool {
        let dom_ok = match &self.day_of_month {
            DayOfMonthField::Any => true,
            DayOfMonthField::Question => false,
            DayOfMonthField::Values(vs) => vs.contains(&date.day()),
            DayOfMonthField::Last => is_last_day_of_month(date),
            DayOfMonthField::LastWeekday => date.day() == last_weekday_on_or_before_last_day(date),
            DayOfMonthField::NearestWeekday(n) => nearest_weekday(date, *n),
        };
        let dow_ok = match &self.day_of_week {
            DayOfWeekField::Any => true,
            DayOfWeekField::Question => false,
            DayOfWeekField::Values(vs) => vs.contains(&our_weekday(date)),
            DayOfWeekField::LastOccurrence(wd) => {
                our_weekday(date) == *wd && date.day() + 7 > days_in_month(date.year(), date.month())
            }
            DayOfWeekField::NthOccurrence(wd, n) => {
                our_weekday(date) == *wd && (date.day() - 1) / 7 + 1 == *n
            }
        };

        // parse() guarantees exactly one of the two fields is `?`.
        match (&self.day_of_month, &self.day_of_week) {
            (DayOfMonthField::Question, _) => dow_ok,
            (_, DayOfWeekField::Question) => dom_ok,
            _ => unreachable!("parse() rejects day-of-month/day-of-week without exactly one '?'"),
        }
    }

    fn first_time_of_day(&self, start: Option<(u32, u32, u32)>) -> Option<(u32, u32, u32)> {
        match start {
            None => Some((
                *self.hours.first()?,
                *self.minutes.first()?,
                *self.seconds.first()?,
            )),
            Some((sh, sm, ss)) => {
                if self.hours.contains(&sh) {
                    if self.minutes.contains(&sm) {
                        if let Some(s) = next_in_set(&self.seconds, ss, true) {
                            return Some((sh, sm, s));
                        }
                    }
                    if let Some(m) = next_in_set(&self.minutes, sm, false) {
                        return Some((sh, m, *self.seconds.first()?));
                    }
                }
                if let Some(h) = next_in_set(&self.hours, sh, false) {
                    return Some((h, *self.minutes.first()?, *self.seconds.first()?));
                }
                None
            }
        }
    }
}

fn add_one_second(h: u32, m: u32, s: u32, date: &mut NaiveDate) -> (u32, u32, u32) {
    let mut s = s + 1;
    let mut m = m;
    let mut h = h;
    if s >= 60 {
        s = 0;
        m += 1;
    }
    if m >= 60 {
        m = 0;
        h += 1;
    }
    if h >= 24 {
        h = 0;
        if let Some(next) = date.succ_opt() {
            *date = next;
        }
    }
    (h, m, s)
}

fn next_in_set(set: &[u32], from: u32, inclusive: bool) -> Option<u32> {
    set.iter()
        .copied()
        .find(|&v| if inclusive { v >= from } else { v > from })
}

fn local_to_utc(zone: &Tz, naive: NaiveDateTime) -> Option<DateTime<Utc>> {
    match zone.from_local_datetime(&naive) {
        chrono::LocalResult::Single(dt) => Some(dt.with_timezone(&Utc)),
        chrono::LocalResult::Ambiguous(earliest, _) => Some(earliest.with_timezone(&Utc)),
        chrono::LocalResult::None => None,
    }
}

fn our_weekday(date: NaiveDate) -> u32 {
    // 1 = SUN .. 7 = SAT
    date.weekday().num_days_from_sunday() + 1
}

fn is_weekday(date: NaiveDate) -> bool {
    !matches!(date.weekday(), Weekday::Sat | Weekday::Sun)
}

fn days_in_month(year: i32, month: u32) -> u32 {
    let next_month_first = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)
    }
    .expect("valid calendar date");
    let this_month_first = NaiveDate::from_ymd_opt(year, month, 1).expect("valid calendar date");
    (next_month_first - this_month_first).num_days() as u32
}

fn is_last_day_of_month(date: NaiveDate) -> bool {
    date.day() == days_in_month(date.year(), date.month())
}

fn last_weekday_on_or_before_last_day(date: NaiveDate) -> u32 {
    let last = days_in_month(date.year(), date.month());
    let last_date = NaiveDate::from_ymd_opt(date.year(), date.month(), last).expect("valid date");
    let mut d = last_date;
    while !is_weekday(d) {
        d = d.pred_opt().expect("valid date");
    }
    d.day()
}

/// `nW`: nearest weekday to day `n`, never crossing a month boundary.
fn nearest_weekday(date: NaiveDate, n: u32) -> bool {
    let last = days_in_month(date.year(), date.month());
    let n = n.min(last);
    let target = NaiveDate::from_ymd_opt(date.year(), date.month(), n).expect("valid date");
    let candidate = if is_weekday(target) {
        target
    } else {
        match target.weekday() {
            Weekday::Sat => {
                if n == 1 {
                    target.succ_opt().expect("valid date")
                } else {
                    target.pred_opt().expect("valid date")
                }
            }
            Weekday::Sun => {
                if n == last {
                    target.pred_opt().expect("valid date")
                } else {
                    target.succ_opt().expect("valid date")
                }
            }
            _ => target,
        }
    };
    candidate == date
}

fn parse_year_field(field: &str) -> SchedulerResult<(u32, u32)> {
    if field == "*" {
        return Ok((DEFAULT_MIN_YEAR, DEFAULT_MAX_YEAR));
    }
    let values = parse_numeric_field(field, DEFAULT_MIN_YEAR, DEFAULT_MAX_YEAR, None, "year")?;
    let min = *values.iter().min().ok_or_else(|| {
        SchedulerError::Config("cron expression: empty year field".into())
    })?;
    let max = *values.iter().max().ok_or_else(|| {
        SchedulerError::Config("cron expression: empty year field".into())
    })?;
    Ok((min, max))
}

fn parse_day_of_month(field: &str) -> SchedulerResult<DayOfMonthField> {
    let upper = field.to_ascii_uppercase();
    if upper == "?" {
        return Ok(DayOfMonthField::Question);
    }
    if upper == "*" {
        return Ok(DayOfMonthField::Any);
    }
    if upper == "L" {
        return Ok(DayOfMonthField::Last);
    }
    if upper == "LW" {
        return Ok(DayOfMonthField::LastWeekday);
    }
    if let Some(prefix) = upper.strip_suffix('W') {
        let n: u32 = prefix.parse().map_err(|_| {
            SchedulerError::Config(format!("cron expression: invalid day-of-month 'W' spec '{field}'"))
        })?;
        return Ok(DayOfMonthField::NearestWeekday(n));
    }
    Ok(DayOfMonthField::Values(parse_numeric_field(
        field, 1, 31, None, "day-of-month",
    )?))
}

fn parse_day_of_week(field: &str) -> SchedulerResult<DayOfWeekField> {
    let upper = field.to_ascii_uppercase();
    if upper == "?" {
        return Ok(DayOfWeekField::Question);
    }
    if upper == "*" {
        return Ok(DayOfWeekField::Any);
    }
    if upper == "L" {
        return Ok(DayOfWeekField::LastOccurrence(7)); // bare L == last Saturday
    }
    if let Some(prefix) = upper.strip_suffix('L') {
        let wd = resolve_weekday_token(prefix)?;
        return Ok(DayOfWeekField::LastOccurrence(wd));
    }
    if let Some((wd_part, n_part)) = upper.split_once('#') {
        let wd = resolve_weekday_token(wd_part)?;
        let n: u32 = n_part.parse().map_err(|_| {
            SchedulerError::Config(format!("cron expression: invalid day-of-week '#n' spec '{field}'"))
        })?;
        if !(1..=5).contains(&n) {
            return Err(SchedulerError::Config(format!(
                "cron expression: day-of-week occurrence '#{n}' must be 1..5"
            )));
        }
        return Ok(DayOfWeekField::NthOccurrence(wd, n));
    }
    Ok(DayOfWeekField::Values(parse_numeric_field(
        field,
        1,
        7,
        Some(WEEKDAY_NAMES),
        "day-of-week",
    )?))
}

fn resolve_weekday_token(token: &str) -> SchedulerResult<u32> {
    if let Ok(n) = token.parse::<u32>() {
        if (1..=7).contains(&n) {
            return Ok(n);
        }
    }
    for (name, value) in WEEKDAY_NAMES {
        if *name == token {
            return Ok(*value);
        }
    }
    Err(SchedulerError::Config(format!(
        "cron expression: unrecognized weekday token '{token}'"
    )))
}

/// Parses a numeric field: `*`, `*/step`, `a-b`, `a-b/step`, `a/step`,
/// comma-separated lists of the above, literal values, and (if `names` is
/// given) case-insensitive names.
fn parse_numeric_field(
    field: &str,
    min: u32,
    max: u32,
    names: Option<&[(&str, u32)]>,
    field_label: &str,
) -> SchedulerResult<Vec<u32>> {
    let mut values = std::collections::BTreeSet::new();
    for token in field.split(',') {
        parse_token(token, min, max, names, field_label, &mut values)?;
    }
    if values.is_empty() {
        return Err(SchedulerError::Config(format!(
            "cron expression: '{field_label}' field '{field}' yielded no values"
        )));
    }
    Ok(values.into_iter().collect())
}

fn parse_token(
    token: &str,
    min: u32,
    max: u32,
    names: Option<&[(&str, u32)]>,
    field_label: &str,
    out: &mut std::collections::BTreeSet<u32>,
) -> SchedulerResult<()> {
    let upper = token.to_ascii_uppercase();

    let resolve = |s: &str| -> SchedulerResult<u32> {
        if let Ok(n) = s.parse::<u32>() {
            return Ok(n);
        }
        if let Some(names) = names {
            for (name, value) in names {
                if *name == s {
                    return Ok(*value);
                }
            }
        }
        Err(SchedulerError::Config(format!(
            "cron expression: unrecognized '{field_label}' token '{s}' at position in '{token}'"
        )))
    };

    if let Some((base, step)) = upper.split_once('/') {
        let step: u32 = step.parse().map_err(|_| {
            SchedulerError::Config(format!("cron expression: invalid step '{step}' in '{token}'"))
        })?;
        if step == 0 {
            return Err(SchedulerError::Config(format!(
                "cron expression: step 0 is invalid in '{token}'"
            )));
        }
        let (start, end) = if base == "*" {
            (min, max)
        } else if let Some((a, b)) = base.split_once('-') {
            (resolve(a)?, resolve(b)?)
        } else {
            (resolve(base)?, max)
        };
        let mut v = start;
        while v <= end {
            validate_range(v, min, max, field_label, token)?;
            out.insert(v);
            v += step;
        }
        return Ok(());
    }

    if upper == "*" {
        for v in min..=max {
            out.insert(v);
        }
        return Ok(());
    }

    if let Some((a, b)) = upper.split_once('-') {
        let start = resolve(a)?;
        let end = resolve(b)?;
        if start > end {
            return Err(SchedulerError::Config(format!(
                "cron expression: range '{token}' has start > end"
            )));
        }
        for v in start..=end {
            validate_range(v, min, max, field_label, token)?;
            out.insert(v);
        }
        return Ok(());
    }

    let v = resolve(&upper)?;
    validate_range(v, min, max, field_label, token)?;
    out.insert(v);
    Ok(())
}

fn validate_range(v: u32, min: u32, max: u32, field_label: &str, token: &str) -> SchedulerResult<()> {
    if v < min || v > max {
        return Err(SchedulerError::Config(format!(
            "cron expression: '{field_label}' value {v} (from '{token}') out of range {min}..={max}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone as _;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn test_invalid_field_count() {
        assert!(CronExpression::parse("0 * * *").is_err());
    }

    #[test]
    fn test_every_five_seconds() {
        let cron = CronExpression::parse("0/5 * * * * ?").unwrap();
        let start = utc(2024, 1, 1, 0, 0, 0);
        let mut t = start;
        let expected = [0, 5, 10, 15, 20];
        for exp in expected {
            t = cron.next_after(t, Tz::UTC).unwrap();
            assert_eq!(t, utc(2024, 1, 1, 0, 0, exp));
        }
    }

    #[test]
    fn test_weekday_business_hours() {
        // Friday 2024-01-05 10:15:01 -> next Monday 2024-01-08 10:15:00.
        let cron = CronExpression::parse("0 15 10 ? * MON-FRI").unwrap();
        let t = utc(2024, 1, 5, 10, 15, 1);
        let next = cron.next_after(t, Tz::UTC).unwrap();
        assert_eq!(next, utc(2024, 1, 8, 10, 15, 0));
    }

    #[test]
    fn test_idempotent_just_before_next() {
        let cron = CronExpression::parse("0 15 10 ? * MON-FRI").unwrap();
        let t = utc(2024, 1, 5, 10, 15, 1);
        let next = cron.next_after(t, Tz::UTC).unwrap();
        let just_before = next - Duration::milliseconds(1);
        assert_eq!(cron.next_after(just_before, Tz::UTC).unwrap(), next);
    }

    #[test]
    fn test_last_day_of_month() {
        let cron = CronExpression::parse("0 0 0 L * ?").unwrap();
        let t = utc(2024, 2, 1, 0, 0, 0);
        let next = cron.next_after(t, Tz::UTC).unwrap();
        assert_eq!(next, utc(2024, 2, 29, 0, 0, 0)); // 2024 is a leap year
    }

    #[test]
    fn test_nearest_weekday() {
        // 2024-06-01 is a Saturday; nearest weekday to the 1st is Friday 2024-05-31.
        let cron = CronExpression::parse("0 0 0 1W * ?").unwrap();
        let t = utc(2024, 5, 1, 0, 0, 0);
        let next = cron.next_after(t, Tz::UTC).unwrap();
        assert_eq!(next, utc(2024, 5, 31, 0, 0, 0));
    }

    #[test]
    fn test_third_friday() {
        let cron = CronExpression::parse("0 0 12 ? * FRI#3").unwrap();
        let t = utc(2024, 3, 1, 0, 0, 0);
        let next = cron.next_after(t, Tz::UTC).unwrap();
        // Third Friday of March 2024 is the 15th.
        assert_eq!(next, utc(2024, 3, 15, 12, 0, 0));
    }

    #[test]
    fn test_last_friday_of_month() {
        let cron = CronExpression::parse("0 0 12 ? * 6L").unwrap();
        let t = utc(2024, 3, 1, 0, 0, 0);
        let next = cron.next_after(t, Tz::UTC).unwrap();
        // Last Friday of March 2024 is the 29th.
        assert_eq!(next, utc(2024, 3, 29, 12, 0, 0));
    }

    #[test]
    fn test_year_field_exhausted_returns_none() {
        let cron = CronExpression::parse("0 0 0 1 1 ? 2024").unwrap();
        let t = utc(2024, 6, 1, 0, 0, 0);
        assert!(cron.next_after(t, Tz::UTC).is_none());
    }

    #[test]
    fn test_both_day_fields_question_rejected() {
        assert!(CronExpression::parse("0 0 0 ? * ?").is_err());
    }

    #[test]
    fn test_neither_day_field_question_rejected() {
        // Quartz requires exactly one of day-of-month/day-of-week to be
        // `?`; a bare "every day, but only Mondays" without one is
        // ambiguous and must be rejected rather than silently firing
        // every day (dom_ok always true for `*` swallows the dow clause).
        assert!(CronExpression::parse("0 0 0 * * MON").is_err());
    }

    #[test]
    fn test_day_of_week_only_fires_on_matching_weekday() {
        let cron = CronExpression::parse("0 0 0 ? * MON").unwrap();
        // 2024-01-02 is a Tuesday; next Monday is 2024-01-08.
        let t = utc(2024, 1, 2, 0, 0, 0);
        let next = cron.next_after(t, Tz::UTC).unwrap();
        assert_eq!(next, utc(2024, 1, 8, 0, 0, 0));
        assert_eq!(next.weekday(), chrono::Weekday::Mon);
    }

    #[test]
    fn test_step_field() {
        let cron = CronExpression::parse("*/15 * * * * ?").unwrap();
        let t = utc(2024, 1, 1, 0, 0, 0);
        let next = cron.next_after(t, Tz::UTC).unwrap();
        assert_eq!(next, utc(2024, 1, 1, 0, 0, 15));
    }
}
