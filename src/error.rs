//! Domain error types.
//!
//! Only [`ValidationError`] ever reaches a caller: it is returned when a job
//! change is requested with a bad configuration. [`ExecutionError`] describes
//! a single failed attempt and ends up as the `error` text of a failed
//! `RequestResult`. Storage and notification failures are logged where they
//! happen and never leave their component.

use std::time::Duration;

use thiserror::Error;

/// A job configuration was rejected. Registration does not partially apply.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("required field '{0}' is missing or empty")]
    MissingField(&'static str),

    #[error("invalid URL '{0}': only http:// and https:// are supported")]
    InvalidUrl(String),

    #[error("unsupported HTTP method: {0}")]
    UnsupportedMethod(String),

    #[error("interval_seconds must be a positive number for interval schedules")]
    NonPositiveInterval,

    #[error("cron_expression is required for cron schedules")]
    MissingCronExpression,

    #[error("invalid cron expression '{expression}': {reason}")]
    InvalidCron { expression: String, reason: String },

    #[error("timeout_seconds must be at least 1")]
    ZeroTimeout,
}

/// Why one request attempt failed.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("request timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("HTTP {status}: {reason}")]
    HttpStatus { status: u16, reason: String },

    #[error("{0}")]
    Transport(#[from] reqwest::Error),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}
