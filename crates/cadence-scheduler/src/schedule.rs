//! Next-fire computation for every recurrence kind.

use std::str::FromStr;

use chrono::{DateTime, Duration, Months, Utc};
use tracing::warn;

use crate::{
    error::{Result, SchedulerError},
    recurrence::{Recurrence, RecurrenceKind},
};

const WEEKDAY_NAMES: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

/// Compute the first occurrence of `recurrence` strictly after `reference`.
///
/// Month and year steps clamp to the last day of a shorter target month
/// (Jan 31 + 1 month = Feb 28/29), they never spill into the month after.
pub fn next_fire_after(recurrence: &Recurrence, reference: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let n = recurrence.interval();
    match recurrence.kind() {
        RecurrenceKind::OneTime => None,
        RecurrenceKind::EveryMinute => reference.checked_add_signed(Duration::minutes(n.into())),
        RecurrenceKind::EveryHour => reference.checked_add_signed(Duration::hours(n.into())),
        RecurrenceKind::EveryDay => reference.checked_add_signed(Duration::days(n.into())),
        RecurrenceKind::EveryWeek => reference.checked_add_signed(Duration::weeks(n.into())),
        RecurrenceKind::EveryMonth => reference.checked_add_months(Months::new(n)),
        RecurrenceKind::EveryYear => reference.checked_add_months(Months::new(n.checked_mul(12)?)),
        RecurrenceKind::Cron => {
            let expr = recurrence.cron_expression()?;
            match parse_cron(expr) {
                Ok(schedule) => schedule.next_after(reference),
                Err(e) => {
                    // Rules are validated on construction; reaching this means
                    // a stored row bypassed the factories.
                    warn!(expression = %expr, "unparseable cron expression: {e}");
                    None
                }
            }
        }
    }
}

/// A parsed five-field cron expression.
///
/// When both day-of-month and day-of-week are restricted, a time matches if
/// either one does, as in standard cron. The `cron` crate requires both, so
/// that case is held as two schedules and the earlier match wins.
#[derive(Debug, Clone)]
pub struct CronSchedule {
    primary: cron::Schedule,
    by_weekday: Option<cron::Schedule>,
}

impl CronSchedule {
    /// First match strictly after `reference`.
    pub fn next_after(&self, reference: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let first = |schedule: &cron::Schedule| {
            schedule.after(&reference).find(|t| *t > reference)
        };
        match (first(&self.primary), self.by_weekday.as_ref().and_then(first)) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }
}

/// Parse a standard five-field cron expression.
///
/// The `cron` crate expects a leading seconds field and numbers weekdays
/// 1-7 from Sunday, so the expression is rewritten: seconds pinned to 0 and
/// weekdays (0-7 with both 0 and 7 meaning Sunday, or names) turned into a
/// list of names.
pub fn parse_cron(expression: &str) -> Result<CronSchedule> {
    let fields: Vec<&str> = expression.split_whitespace().collect();
    if fields.len() != 5 {
        return Err(SchedulerError::InvalidRecurrence(format!(
            "cron expression '{expression}' must have 5 fields \
             (minute hour day-of-month month day-of-week), got {}",
            fields.len()
        )));
    }
    let (minute, hour, day_of_month, month) = (fields[0], fields[1], fields[2], fields[3]);
    let day_of_week = normalize_day_of_week(fields[4]).map_err(|reason| {
        SchedulerError::InvalidRecurrence(format!(
            "cron expression '{expression}': day-of-week {reason}"
        ))
    })?;

    let build = |dom: &str, dow: &str| {
        cron::Schedule::from_str(&format!("0 {minute} {hour} {dom} {month} {dow}")).map_err(|e| {
            SchedulerError::InvalidRecurrence(format!("invalid cron expression '{expression}': {e}"))
        })
    };

    if is_restricted(day_of_month) && is_restricted(&day_of_week) {
        Ok(CronSchedule {
            primary: build(day_of_month, "*")?,
            by_weekday: Some(build("*", day_of_week.as_str())?),
        })
    } else {
        Ok(CronSchedule {
            primary: build(day_of_month, day_of_week.as_str())?,
            by_weekday: None,
        })
    }
}

/// A day field starting with `*` (or `?`) does not narrow the match.
fn is_restricted(field: &str) -> bool {
    !(field.starts_with('*') || field == "?")
}

/// Expand a day-of-week field into a list of weekday names.
///
/// Every comma item is resolved on its own, so numbers and names can be
/// mixed (`MON,3`, `1-FRI`).
fn normalize_day_of_week(field: &str) -> std::result::Result<String, String> {
    if field == "*" || field == "?" {
        return Ok(field.to_string());
    }

    let mut days = [false; 7];
    for item in field.split(',') {
        let (range, step) = match item.split_once('/') {
            Some((range, step)) => {
                let step: usize = step
                    .parse()
                    .map_err(|_| format!("has invalid step '{step}'"))?;
                if step == 0 {
                    return Err("step must be >= 1".to_string());
                }
                (range, Some(step))
            }
            None => (item, None),
        };

        let (lo, hi) = if range == "*" {
            (0, 6)
        } else if let Some((lo, hi)) = range.split_once('-') {
            (parse_day(lo)?, parse_day(hi)?)
        } else {
            let day = parse_day(range)?;
            // "a/s" means "from a to the end of the week, every s days"
            if step.is_some() { (day, 6) } else { (day, day) }
        };
        if lo > hi {
            return Err(format!("has descending range '{range}'"));
        }

        for day in (lo..=hi).step_by(step.unwrap_or(1)) {
            days[day % 7] = true;
        }
    }

    let names: Vec<&str> = days
        .iter()
        .zip(WEEKDAY_NAMES)
        .filter_map(|(on, name)| on.then_some(name))
        .collect();
    if names.is_empty() {
        return Err("matches no day".to_string());
    }
    Ok(names.join(","))
}

fn parse_day(s: &str) -> std::result::Result<usize, String> {
    if let Some(day) = WEEKDAY_NAMES
        .iter()
        .position(|name| name.eq_ignore_ascii_case(s))
    {
        return Ok(day);
    }
    match s.parse::<usize>() {
        Ok(day) if day <= 7 => Ok(day),
        _ => Err(format!("has invalid value '{s}' (expected 0-7 or SUN-SAT)")),
    }
}
