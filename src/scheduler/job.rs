//! Job configuration, validation and per-job runtime state.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::AbortHandle;
use tracing::{info, warn};

use super::cron;
use crate::error::ValidationError;
use crate::executor::RequestResult;

/// How a job's next run time is derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleType {
    /// Fixed number of seconds after the previous run completed.
    Interval,
    /// First cron-grid instant after the previous run completed.
    Cron,
}

/// HTTP methods a job may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
    Patch,
    Head,
    Options,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Head => "HEAD",
            HttpMethod::Options => "OPTIONS",
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HttpMethod {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "GET" => Ok(HttpMethod::Get),
            "POST" => Ok(HttpMethod::Post),
            "PUT" => Ok(HttpMethod::Put),
            "DELETE" => Ok(HttpMethod::Delete),
            "PATCH" => Ok(HttpMethod::Patch),
            "HEAD" => Ok(HttpMethod::Head),
            "OPTIONS" => Ok(HttpMethod::Options),
            other => Err(ValidationError::UnsupportedMethod(other.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// JobConfig
// ---------------------------------------------------------------------------

/// One scheduled request, as it appears in `[[schedules]]` or in the body of
/// `POST /api/v1/jobs`.
///
/// Fields that must be present are still `#[serde(default)]` so that a missing
/// value is reported by [`JobConfig::validate`] rather than by the parser.
/// Timeout and retry settings left unset fall back to the global HTTP
/// settings at execution time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobConfig {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<serde_json::Value>,
    #[serde(default)]
    pub schedule_type: Option<ScheduleType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval_seconds: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cron_expression: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_delay_seconds: Option<u64>,
}

fn default_enabled() -> bool {
    true
}

impl JobConfig {
    /// A `GET` job that runs every `seconds`.
    pub fn interval(id: impl Into<String>, url: impl Into<String>, seconds: i64) -> Self {
        Self {
            schedule_type: Some(ScheduleType::Interval),
            interval_seconds: Some(seconds),
            ..Self::bare(id.into(), url.into())
        }
    }

    /// A `GET` job that runs on a cron expression.
    pub fn cron(id: impl Into<String>, url: impl Into<String>, expression: impl Into<String>) -> Self {
        Self {
            schedule_type: Some(ScheduleType::Cron),
            cron_expression: Some(expression.into()),
            ..Self::bare(id.into(), url.into())
        }
    }

    fn bare(id: String, url: String) -> Self {
        Self {
            name: id.clone(),
            id,
            enabled: true,
            url,
            method: "GET".to_string(),
            headers: BTreeMap::new(),
            body: None,
            schedule_type: None,
            interval_seconds: None,
            cron_expression: None,
            timeout_seconds: None,
            retry_count: None,
            retry_delay_seconds: None,
        }
    }

    /// Name shown in logs, history and notifications.
    pub fn display_name(&self) -> &str {
        if self.name.trim().is_empty() {
            &self.id
        } else {
            &self.name
        }
    }

    /// Parsed HTTP method.
    pub fn http_method(&self) -> Result<HttpMethod, ValidationError> {
        if self.method.trim().is_empty() {
            return Err(ValidationError::MissingField("method"));
        }
        self.method.parse()
    }

    /// Check every field a job needs before it may be registered.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.id.trim().is_empty() {
            return Err(ValidationError::MissingField("id"));
        }
        if self.url.trim().is_empty() {
            return Err(ValidationError::MissingField("url"));
        }
        if !(self.url.starts_with("http://") || self.url.starts_with("https://")) {
            return Err(ValidationError::InvalidUrl(self.url.clone()));
        }
        self.http_method()?;

        match self.schedule_type {
            None => return Err(ValidationError::MissingField("schedule_type")),
            Some(ScheduleType::Interval) => match self.interval_seconds {
                Some(secs) if secs > 0 => {}
                _ => return Err(ValidationError::NonPositiveInterval),
            },
            Some(ScheduleType::Cron) => {
                let expression = self
                    .cron_expression
                    .as_deref()
                    .filter(|e| !e.trim().is_empty())
                    .ok_or(ValidationError::MissingCronExpression)?;
                cron::parse(expression)?;
            }
        }
        if self.timeout_seconds == Some(0) {
            return Err(ValidationError::ZeroTimeout);
        }
        Ok(())
    }

    /// Next run time for a run that completed (or a registration made) at `from`.
    pub fn next_run_after(&self, from: DateTime<Utc>) -> Result<DateTime<Utc>, ValidationError> {
        match self.schedule_type {
            Some(ScheduleType::Interval) => match self.interval_seconds {
                Some(secs) if secs > 0 => Ok(from + Duration::seconds(secs)),
                _ => Err(ValidationError::NonPositiveInterval),
            },
            Some(ScheduleType::Cron) => {
                let expression = self
                    .cron_expression
                    .as_deref()
                    .ok_or(ValidationError::MissingCronExpression)?;
                cron::next_after(expression, from)
            }
            None => Err(ValidationError::MissingField("schedule_type")),
        }
    }
}

// ---------------------------------------------------------------------------
// ScheduleJob
// ---------------------------------------------------------------------------

/// A registered job together with its runtime state.
#[derive(Debug)]
pub struct ScheduleJob {
    pub config: JobConfig,
    pub next_run_time: Option<DateTime<Utc>>,
    pub last_run_time: Option<DateTime<Utc>>,
    pub is_running: bool,
    pub run_count: u64,
    pub error_count: u64,
    pub last_result: Option<RequestResult>,
    /// Distinguishes this registration from earlier ones with the same id.
    pub(crate) instance: u64,
    /// Instance whose run is in flight. Differs from `instance` while a run
    /// started before the last replacement is still finishing.
    pub(crate) run_instance: Option<u64>,
    pub(crate) abort: Option<AbortHandle>,
}

impl ScheduleJob {
    /// Build a job from an already validated config. Disabled jobs get no
    /// next run time and are never picked up by the tick loop.
    pub(crate) fn new(config: JobConfig, instance: u64, now: DateTime<Utc>) -> Result<Self, ValidationError> {
        let next_run_time = if config.enabled {
            Some(config.next_run_after(now)?)
        } else {
            None
        };
        Ok(Self {
            config,
            next_run_time,
            last_run_time: None,
            is_running: false,
            run_count: 0,
            error_count: 0,
            last_result: None,
            instance,
            run_instance: None,
            abort: None,
        })
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        !self.is_running && self.next_run_time.is_some_and(|t| t <= now)
    }

    /// Idle -> Running.
    pub(crate) fn begin(&mut self, now: DateTime<Utc>) {
        self.is_running = true;
        self.run_instance = Some(self.instance);
        self.last_run_time = Some(now);
    }

    /// Take over the in-flight run of the registration this job replaces, so
    /// the tick loop does not start a second run until it finishes.
    pub(crate) fn inherit_run(&mut self, previous: ScheduleJob) {
        if previous.is_running {
            self.is_running = true;
            self.run_instance = previous.run_instance;
            self.abort = previous.abort;
        }
    }

    /// Running -> Idle after a run from a replaced registration finished.
    /// Its result belongs to the old config and is discarded.
    pub(crate) fn release_stale_run(&mut self) {
        self.is_running = false;
        self.run_instance = None;
        self.abort = None;
    }

    /// Running -> Idle. The next run is computed from `completed_at`.
    pub(crate) fn complete(&mut self, result: RequestResult, completed_at: DateTime<Utc>) {
        self.is_running = false;
        self.run_instance = None;
        self.abort = None;
        self.run_count += 1;
        if !result.success {
            self.error_count += 1;
            warn!(
                job_id = %self.config.id,
                error = result.error.as_deref().unwrap_or("unknown error"),
                "job run failed"
            );
        }
        self.last_result = Some(result);

        self.next_run_time = match self.config.next_run_after(completed_at) {
            Ok(next) => {
                info!(job_id = %self.config.id, next_run = %next, "next run scheduled");
                Some(next)
            }
            Err(e) => {
                warn!(job_id = %self.config.id, error = %e, "could not compute next run time, job is dormant");
                None
            }
        };
    }

    /// Running -> Idle without a result (the run was cancelled). The pending
    /// next run time is kept so the job fires again once the scheduler restarts.
    pub(crate) fn interrupt(&mut self) {
        self.is_running = false;
        self.run_instance = None;
        self.abort = None;
    }

    pub fn status(&self) -> JobStatus {
        JobStatus {
            id: self.config.id.clone(),
            name: self.config.display_name().to_string(),
            enabled: self.config.enabled,
            next_run_time: self.next_run_time,
            last_run_time: self.last_run_time,
            is_running: self.is_running,
            run_count: self.run_count,
            error_count: self.error_count,
            last_result: self.last_result.clone(),
            schedule_type: self.config.schedule_type,
            interval_seconds: self.config.interval_seconds,
            cron_expression: self.config.cron_expression.clone(),
            url: self.config.url.clone(),
            method: self.config.method.to_ascii_uppercase(),
        }
    }
}

/// Read-only projection of a [`ScheduleJob`].
#[derive(Debug, Clone, Serialize)]
pub struct JobStatus {
    pub id: String,
    pub name: String,
    pub enabled: bool,
    pub next_run_time: Option<DateTime<Utc>>,
    pub last_run_time: Option<DateTime<Utc>>,
    pub is_running: bool,
    pub run_count: u64,
    pub error_count: u64,
    pub last_result: Option<RequestResult>,
    pub schedule_type: Option<ScheduleType>,
    pub interval_seconds: Option<i64>,
    pub cron_expression: Option<String>,
    pub url: String,
    pub method: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 14, h, m, s).unwrap()
    }

    #[test]
    fn test_valid_interval_job() {
        let job = JobConfig::interval("health", "https://example.com/health", 60);
        assert!(job.validate().is_ok());
    }

    #[test]
    fn test_missing_fields() {
        let mut job = JobConfig::interval("", "https://example.com", 60);
        assert_eq!(job.validate(), Err(ValidationError::MissingField("id")));

        job.id = "a".into();
        job.url = String::new();
        assert_eq!(job.validate(), Err(ValidationError::MissingField("url")));

        job.url = "https://example.com".into();
        job.method = String::new();
        assert_eq!(job.validate(), Err(ValidationError::MissingField("method")));

        job.method = "get".into();
        job.schedule_type = None;
        assert_eq!(job.validate(), Err(ValidationError::MissingField("schedule_type")));
    }

    #[test]
    fn test_rejects_non_http_url() {
        let job = JobConfig::interval("a", "ftp://example.com/file", 60);
        assert!(matches!(job.validate(), Err(ValidationError::InvalidUrl(_))));
    }

    #[test]
    fn test_rejects_unknown_method() {
        let mut job = JobConfig::interval("a", "http://example.com", 60);
        job.method = "TRACE".into();
        assert_eq!(
            job.validate(),
            Err(ValidationError::UnsupportedMethod("TRACE".into()))
        );
    }

    #[test]
    fn test_method_is_case_insensitive() {
        assert_eq!("patch".parse::<HttpMethod>().unwrap(), HttpMethod::Patch);
        assert_eq!(HttpMethod::Options.to_string(), "OPTIONS");
    }

    #[test]
    fn test_rejects_non_positive_interval() {
        let zero = JobConfig::interval("a", "http://example.com", 0);
        assert_eq!(zero.validate(), Err(ValidationError::NonPositiveInterval));

        let negative = JobConfig::interval("a", "http://example.com", -5);
        assert_eq!(negative.validate(), Err(ValidationError::NonPositiveInterval));

        let mut missing = JobConfig::interval("a", "http://example.com", 5);
        missing.interval_seconds = None;
        assert_eq!(missing.validate(), Err(ValidationError::NonPositiveInterval));
    }

    #[test]
    fn test_cron_validation() {
        let ok = JobConfig::cron("a", "http://example.com", "*/5 * * * *");
        assert!(ok.validate().is_ok());

        let bad = JobConfig::cron("a", "http://example.com", "every tuesday");
        assert!(matches!(bad.validate(), Err(ValidationError::InvalidCron { .. })));

        let mut missing = JobConfig::cron("a", "http://example.com", "");
        assert_eq!(missing.validate(), Err(ValidationError::MissingCronExpression));
        missing.cron_expression = None;
        assert_eq!(missing.validate(), Err(ValidationError::MissingCronExpression));
    }

    #[test]
    fn test_display_name_falls_back_to_id() {
        let mut job = JobConfig::interval("ping", "http://example.com", 5);
        job.name = String::new();
        assert_eq!(job.display_name(), "ping");
        job.name = "Ping".into();
        assert_eq!(job.display_name(), "Ping");
    }

    #[test]
    fn test_interval_next_run_is_exact() {
        let job = JobConfig::interval("a", "http://example.com", 90);
        let t = at(10, 0, 7);
        assert_eq!(job.next_run_after(t).unwrap(), t + Duration::seconds(90));
    }

    #[test]
    fn test_complete_recomputes_from_completion_time() {
        let config = JobConfig::interval("a", "http://example.com", 30);
        let mut job = ScheduleJob::new(config, 1, at(9, 0, 0)).unwrap();
        assert_eq!(job.next_run_time, Some(at(9, 0, 30)));

        job.begin(at(9, 0, 30));
        assert!(job.is_running);
        assert!(!job.is_due(at(9, 5, 0)));

        // The run overran by 12 seconds.
        let completed = at(9, 0, 42);
        job.complete(RequestResult::failure("a", at(9, 0, 30), 1, "boom"), completed);

        assert!(!job.is_running);
        assert_eq!(job.run_count, 1);
        assert_eq!(job.error_count, 1);
        assert_eq!(job.next_run_time, Some(completed + Duration::seconds(30)));
        assert_eq!(job.last_run_time, Some(at(9, 0, 30)));
    }

    #[test]
    fn test_cron_next_run_strictly_after_completion() {
        let config = JobConfig::cron("a", "http://example.com", "*/5 * * * *");
        let mut job = ScheduleJob::new(config, 1, at(10, 0, 0)).unwrap();
        assert_eq!(job.next_run_time, Some(at(10, 5, 0)));

        job.begin(at(10, 5, 0));
        job.complete(RequestResult::failure("a", at(10, 5, 0), 1, "x"), at(10, 5, 0));
        assert_eq!(job.next_run_time, Some(at(10, 10, 0)));

        job.begin(at(10, 10, 0));
        job.complete(RequestResult::failure("a", at(10, 10, 0), 1, "x"), at(10, 12, 30));
        assert_eq!(job.next_run_time, Some(at(10, 15, 0)));
    }

    #[test]
    fn test_invalid_cron_after_update_leaves_job_dormant() {
        let config = JobConfig::cron("a", "http://example.com", "0 * * * *");
        let mut job = ScheduleJob::new(config, 1, at(10, 0, 0)).unwrap();
        job.config.cron_expression = Some("nonsense".into());

        job.begin(at(11, 0, 0));
        job.complete(RequestResult::failure("a", at(11, 0, 0), 1, "x"), at(11, 0, 1));
        assert_eq!(job.next_run_time, None);
        assert!(!job.is_due(at(23, 0, 0)));
    }

    #[test]
    fn test_replacement_inherits_in_flight_run() {
        let old_config = JobConfig::interval("a", "http://example.com", 1);
        let mut old = ScheduleJob::new(old_config, 1, at(10, 0, 0)).unwrap();
        old.begin(at(10, 0, 1));

        let new_config = JobConfig::interval("a", "http://example.com/v2", 1);
        let mut new = ScheduleJob::new(new_config, 2, at(10, 0, 2)).unwrap();
        new.inherit_run(old);

        assert!(new.is_running);
        assert_eq!(new.run_instance, Some(1));
        assert!(!new.is_due(at(10, 0, 30)));

        new.release_stale_run();
        assert!(new.is_due(at(10, 0, 30)));
        assert_eq!(new.run_count, 0);
        assert!(new.last_result.is_none());
    }

    #[test]
    fn test_replacing_idle_job_starts_idle() {
        let old = ScheduleJob::new(JobConfig::interval("a", "http://example.com", 1), 1, at(10, 0, 0)).unwrap();
        let mut new = ScheduleJob::new(JobConfig::interval("a", "http://example.com", 5), 2, at(10, 0, 0)).unwrap();
        new.inherit_run(old);
        assert!(!new.is_running);
        assert_eq!(new.run_instance, None);
    }

    #[test]
    fn test_rejects_zero_timeout() {
        let mut job = JobConfig::interval("a", "http://example.com", 60);
        job.timeout_seconds = Some(0);
        assert_eq!(job.validate(), Err(ValidationError::ZeroTimeout));

        job.timeout_seconds = Some(1);
        assert!(job.validate().is_ok());
    }

    #[test]
    fn test_disabled_job_is_never_due() {
        let mut config = JobConfig::interval("a", "http://example.com", 1);
        config.enabled = false;
        let job = ScheduleJob::new(config, 1, at(10, 0, 0)).unwrap();
        assert_eq!(job.next_run_time, None);
        assert!(!job.is_due(at(12, 0, 0)));
        assert!(!job.status().enabled);
    }

    #[test]
    fn test_parse_from_toml() {
        let job: JobConfig = toml::from_str(
            r#"
id = "post-status"
name = "Post status"
url = "https://example.com/status"
method = "post"
schedule_type = "cron"
cron_expression = "0 */2 * * *"
timeout_seconds = 10
retry_count = 2

[headers]
Authorization = "Bearer abc"

[body]
source = "webtimer"
timestamp = "auto"
"#,
        )
        .unwrap();

        assert!(job.validate().is_ok());
        assert_eq!(job.http_method().unwrap(), HttpMethod::Post);
        assert_eq!(job.schedule_type, Some(ScheduleType::Cron));
        assert_eq!(job.headers["Authorization"], "Bearer abc");
        assert_eq!(job.body.as_ref().unwrap()["timestamp"], "auto");
        assert_eq!(job.retry_count, Some(2));
        assert_eq!(job.retry_delay_seconds, None);
        assert!(job.enabled);
    }
}
