use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    error::{Result, SchedulerError},
    schedule,
};

/// How a job repeats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecurrenceKind {
    OneTime,
    EveryMinute,
    EveryHour,
    EveryDay,
    EveryWeek,
    EveryMonth,
    EveryYear,
    Cron,
}

impl RecurrenceKind {
    /// (interval == 1 label, interval > 1 unit word)
    fn labels(self) -> (&'static str, &'static str) {
        match self {
            RecurrenceKind::OneTime => ("Once", "once"),
            RecurrenceKind::EveryMinute => ("Minutely", "minutely"),
            RecurrenceKind::EveryHour => ("Hourly", "hourly"),
            RecurrenceKind::EveryDay => ("Daily", "daily"),
            RecurrenceKind::EveryWeek => ("Weekly", "weekly"),
            RecurrenceKind::EveryMonth => ("Monthly", "monthly"),
            RecurrenceKind::EveryYear => ("Yearly", "yearly"),
            RecurrenceKind::Cron => ("Cron", "cron"),
        }
    }
}

/// Immutable description of a job's repetition and its optional end bounds.
///
/// Construct through the factories; every one of them enforces that
/// `interval >= 1` for non-cron kinds and that a cron expression is present
/// exactly when the kind is [`RecurrenceKind::Cron`]. To change a job's
/// recurrence, build a new value and replace it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RecurrenceDescriptor", into = "RecurrenceDescriptor")]
pub struct Recurrence {
    kind: RecurrenceKind,
    interval: u32,
    cron_expression: Option<String>,
    ends_at: Option<DateTime<Utc>>,
    max_occurrences: Option<u32>,
}

/// Structural, serde-friendly form of a [`Recurrence`].
///
/// This is what gets persisted; converting back re-runs validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecurrenceDescriptor {
    #[serde(rename = "type")]
    pub kind: RecurrenceKind,
    #[serde(default = "default_interval")]
    pub interval: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cron_expression: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ends_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_occurrences: Option<u32>,
}

fn default_interval() -> u32 {
    1
}

impl Recurrence {
    /// General constructor; the named factories below are thin wrappers.
    pub fn new(kind: RecurrenceKind, interval: u32, cron_expression: Option<String>) -> Result<Self> {
        match (kind, cron_expression) {
            (RecurrenceKind::Cron, Some(expr)) => {
                schedule::parse_cron(&expr)?;
                Ok(Self {
                    kind,
                    interval,
                    cron_expression: Some(expr),
                    ends_at: None,
                    max_occurrences: None,
                })
            }
            (RecurrenceKind::Cron, None) => Err(SchedulerError::InvalidRecurrence(
                "cron recurrence requires an expression".to_string(),
            )),
            (_, Some(_)) => Err(SchedulerError::InvalidRecurrence(format!(
                "{kind:?} recurrence must not carry a cron expression"
            ))),
            (_, None) if interval < 1 => Err(SchedulerError::InvalidRecurrence(format!(
                "interval must be >= 1, got {interval}"
            ))),
            (_, None) => Ok(Self::unchecked(kind, interval)),
        }
    }

    fn unchecked(kind: RecurrenceKind, interval: u32) -> Self {
        Self {
            kind,
            interval,
            cron_expression: None,
            ends_at: None,
            max_occurrences: None,
        }
    }

    pub fn once() -> Self {
        Self::unchecked(RecurrenceKind::OneTime, 1)
    }

    pub fn every_n_minutes(interval: u32) -> Result<Self> {
        Self::new(RecurrenceKind::EveryMinute, interval, None)
    }

    pub fn every_n_hours(interval: u32) -> Result<Self> {
        Self::new(RecurrenceKind::EveryHour, interval, None)
    }

    pub fn daily() -> Self {
        Self::unchecked(RecurrenceKind::EveryDay, 1)
    }

    pub fn every_n_days(interval: u32) -> Result<Self> {
        Self::new(RecurrenceKind::EveryDay, interval, None)
    }

    pub fn weekly() -> Self {
        Self::unchecked(RecurrenceKind::EveryWeek, 1)
    }

    pub fn every_n_weeks(interval: u32) -> Result<Self> {
        Self::new(RecurrenceKind::EveryWeek, interval, None)
    }

    pub fn monthly() -> Self {
        Self::unchecked(RecurrenceKind::EveryMonth, 1)
    }

    pub fn every_n_months(interval: u32) -> Result<Self> {
        Self::new(RecurrenceKind::EveryMonth, interval, None)
    }

    pub fn yearly() -> Self {
        Self::unchecked(RecurrenceKind::EveryYear, 1)
    }

    pub fn every_n_years(interval: u32) -> Result<Self> {
        Self::new(RecurrenceKind::EveryYear, interval, None)
    }

    /// Five-field cron (minute hour day-of-month month day-of-week).
    pub fn cron(expression: impl Into<String>) -> Result<Self> {
        Self::new(RecurrenceKind::Cron, 1, Some(expression.into()))
    }

    /// Stop firing once the clock is strictly past `at`.
    pub fn ending_at(mut self, at: DateTime<Utc>) -> Self {
        self.ends_at = Some(at);
        self
    }

    /// Stop firing after `max` completed occurrences.
    pub fn with_max_occurrences(mut self, max: u32) -> Result<Self> {
        if max < 1 {
            return Err(SchedulerError::InvalidRecurrence(
                "max_occurrences must be >= 1".to_string(),
            ));
        }
        self.max_occurrences = Some(max);
        Ok(self)
    }

    pub fn kind(&self) -> RecurrenceKind {
        self.kind
    }

    pub fn interval(&self) -> u32 {
        self.interval
    }

    pub fn cron_expression(&self) -> Option<&str> {
        self.cron_expression.as_deref()
    }

    pub fn ends_at(&self) -> Option<DateTime<Utc>> {
        self.ends_at
    }

    pub fn max_occurrences(&self) -> Option<u32> {
        self.max_occurrences
    }

    pub fn is_recurring(&self) -> bool {
        self.kind != RecurrenceKind::OneTime
    }

    /// Human-readable summary, e.g. "Weekly", "Every 2 daily", "Cron: 0 0 * * *".
    pub fn describe(&self) -> String {
        let (single, unit) = self.kind.labels();
        match self.kind {
            RecurrenceKind::OneTime => single.to_string(),
            RecurrenceKind::Cron => {
                format!("Cron: {}", self.cron_expression.as_deref().unwrap_or_default())
            }
            _ if self.interval == 1 => single.to_string(),
            _ => format!("Every {} {}", self.interval, unit),
        }
    }

    /// First occurrence strictly after `reference`.
    ///
    /// `None` for one-time rules (nothing follows the single fire) and for
    /// cron expressions with no future match.
    pub fn next_fire_after(&self, reference: DateTime<Utc>) -> Option<DateTime<Utc>> {
        schedule::next_fire_after(self, reference)
    }

    /// `asOf` strictly after `ends_at`, or the occurrence budget is spent.
    ///
    /// At exactly `ends_at` the rule has not ended yet.
    pub fn has_ended(&self, as_of: DateTime<Utc>, occurrence_count: u32) -> bool {
        self.ends_at.is_some_and(|end| as_of > end)
            || self.max_occurrences.is_some_and(|max| occurrence_count >= max)
    }

    pub fn to_descriptor(&self) -> RecurrenceDescriptor {
        RecurrenceDescriptor {
            kind: self.kind,
            interval: self.interval,
            cron_expression: self.cron_expression.clone(),
            ends_at: self.ends_at,
            max_occurrences: self.max_occurrences,
        }
    }

    pub fn from_descriptor(descriptor: RecurrenceDescriptor) -> Result<Self> {
        let RecurrenceDescriptor {
            kind,
            interval,
            cron_expression,
            ends_at,
            max_occurrences,
        } = descriptor;
        let mut rule = Self::new(kind, interval, cron_expression)?;
        rule.ends_at = ends_at;
        if let Some(max) = max_occurrences {
            rule = rule.with_max_occurrences(max)?;
        }
        Ok(rule)
    }
}

impl TryFrom<RecurrenceDescriptor> for Recurrence {
    type Error = SchedulerError;

    fn try_from(descriptor: RecurrenceDescriptor) -> Result<Self> {
        Self::from_descriptor(descriptor)
    }
}

impl From<Recurrence> for RecurrenceDescriptor {
    fn from(rule: Recurrence) -> Self {
        rule.to_descriptor()
    }
}

impl std::fmt::Display for Recurrence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.describe())
    }
}
