//! Cron expression handling.
//!
//! Classic five-field expressions (`MIN HOUR DOM MON DOW`) are accepted and
//! pinned to second 0. Six- and seven-field expressions are passed to the
//! `cron` crate unchanged, with seconds as the first field.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use cron::Schedule as CronSchedule;

use crate::error::ValidationError;

/// Parse a cron expression.
pub fn parse(expression: &str) -> Result<CronSchedule, ValidationError> {
    let trimmed = expression.trim();
    let normalized = if trimmed.split_whitespace().count() == 5 {
        format!("0 {}", trimmed)
    } else {
        trimmed.to_string()
    };

    CronSchedule::from_str(&normalized).map_err(|e| ValidationError::InvalidCron {
        expression: expression.to_string(),
        reason: e.to_string(),
    })
}

/// The first instant on the expression's grid strictly after `after`.
pub fn next_after(expression: &str, after: DateTime<Utc>) -> Result<DateTime<Utc>, ValidationError> {
    parse(expression)?
        .after(&after)
        .next()
        .ok_or_else(|| ValidationError::InvalidCron {
            expression: expression.to_string(),
            reason: "expression has no future fire times".to_string(),
        })
}
