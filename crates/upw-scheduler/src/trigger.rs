// SPDX-License-Identifier: MIT OR Apache-2.0
//! Scheduling triggers: fixed interval or 5-field cron, evaluated in UTC.

use chrono::{DateTime, TimeDelta, Utc};
use cron::Schedule;
use std::str::FromStr;
use upw_core::{EngineError, Monitor};

/// Scheduling rule attached to a job.
#[derive(Clone, Debug)]
pub enum Trigger {
    /// Fire every `n` seconds.
    Interval(u64),
    /// Fire on a cron cadence; the original 5-field expression is kept for
    /// persistence and display.
    Cron(Box<Schedule>, String),
}

impl Trigger {
    /// Derive the effective trigger for a monitor: cron wins when set.
    ///
    /// # Errors
    ///
    /// [`EngineError::Validation`] for malformed cron expressions.
    pub fn for_monitor(monitor: &Monitor) -> Result<Trigger, EngineError> {
        match monitor.schedule.as_deref() {
            Some(expr) => parse_cron(expr).map(|s| Trigger::Cron(Box::new(s), expr.to_string())),
            None => Ok(Trigger::Interval(monitor.interval)),
        }
    }

    /// Stable kind tag used in the persisted job record.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Trigger::Interval(_) => "interval",
            Trigger::Cron(..) => "cron",
        }
    }

    /// Serialized trigger payload for the persisted job record.
    #[must_use]
    pub fn spec(&self) -> String {
        match self {
            Trigger::Interval(secs) => secs.to_string(),
            Trigger::Cron(_, expr) => expr.clone(),
        }
    }

    /// Next fire time strictly after `after`.
    ///
    /// `None` only for cron expressions with no future occurrence.
    #[must_use]
    pub fn next_fire(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Trigger::Interval(secs) => Some(after + TimeDelta::seconds(*secs as i64)),
            Trigger::Cron(schedule, _) => schedule.after(&after).next(),
        }
    }
}

/// Parse a standard 5-field cron expression (`minute hour day-of-month
/// month day-of-week`), timezone UTC.
///
/// The evaluation library wants a seconds field, so the expression is
/// fronted with `0` internally.
///
/// # Errors
///
/// [`EngineError::Validation`] when the field count or syntax is wrong.
pub fn parse_cron(expr: &str) -> Result<Schedule, EngineError> {
    let fields = expr.split_whitespace().count();
    if fields != 5 {
        return Err(EngineError::Validation(format!(
            "cron expression must have 5 fields, got {fields}"
        )));
    }
    Schedule::from_str(&format!("0 {expr}"))
        .map_err(|e| EngineError::Validation(format!("invalid cron expression `{expr}`: {e}")))
}
