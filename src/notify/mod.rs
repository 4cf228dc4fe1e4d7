//! Change detection and UDP notification.
//!
//! Successful results are hashed and compared with the job's previous hash;
//! failures are deduplicated by `(job id, error)`. Notifications go out
//! through a [`DelayedUdpSender`], so a burst of events collapses into the
//! latest one.

pub mod hash;
pub mod udp;

pub use self::hash::content_hash;
pub use self::udp::DelayedUdpSender;

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::runtime::Handle;
use tracing::{debug, error, info};

use crate::config::NotifierConfig;
use crate::executor::RequestResult;
use crate::scheduler::JobConfig;

/// Why a notification was raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    FirstSuccess,
    ResponseChanged,
    Unchanged,
    Failure,
    Recovery,
}

impl Classification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Classification::FirstSuccess => "first_success",
            Classification::ResponseChanged => "response_changed",
            Classification::Unchanged => "unchanged",
            Classification::Failure => "failure",
            Classification::Recovery => "recovery",
        }
    }

    fn embeds_body(&self) -> bool {
        matches!(
            self,
            Classification::FirstSuccess | Classification::ResponseChanged
        )
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobSummary {
    pub id: String,
    pub name: String,
    pub url: String,
    pub method: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResultSummary {
    pub request_id: String,
    pub success: bool,
    pub status_code: Option<u16>,
    pub response_time_ms: Option<u64>,
    pub timestamp: DateTime<Utc>,
    pub attempt: u32,
}

/// JSON payload of one datagram.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub application: String,
    pub version: String,
    pub timestamp: DateTime<Utc>,
    pub notification_type: Classification,
    pub schedule: JobSummary,
    pub request_result: ResultSummary,
    pub additional_data: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_body: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_body_truncated: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_size_bytes: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Notification {
    fn build(
        application: &str,
        max_body_bytes: usize,
        result: &RequestResult,
        job: &JobConfig,
        kind: Classification,
        additional_data: Value,
    ) -> Self {
        let mut message = Self {
            application: application.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            timestamp: Utc::now(),
            notification_type: kind,
            schedule: JobSummary {
                id: job.id.clone(),
                name: job.display_name().to_string(),
                url: job.url.clone(),
                method: job.method.to_ascii_uppercase(),
            },
            request_result: ResultSummary {
                request_id: result.request_id.clone(),
                success: result.success,
                status_code: result.status_code,
                response_time_ms: result.response_time_ms,
                timestamp: result.timestamp,
                attempt: result.attempt,
            },
            additional_data,
            response_body: None,
            response_body_truncated: None,
            response_size_bytes: None,
            error: None,
        };

        if result.success && kind.embeds_body() {
            if let Some(body) = result.response_body.as_ref().filter(|b| !is_empty_body(b)) {
                let size = body_size(body);
                if size <= max_body_bytes {
                    message.response_body = Some(body.clone());
                } else {
                    message.response_body_truncated = Some(true);
                    message.response_size_bytes = Some(size);
                }
            }
        }
        if !result.success {
            message.error = result.error.clone();
        }
        message
    }
}

/// Serialized size used for the truncation limit.
pub fn body_size(body: &Value) -> usize {
    match body {
        Value::String(s) => s.len(),
        other => serde_json::to_string(other).map(|s| s.len()).unwrap_or(0),
    }
}

fn is_empty_body(body: &Value) -> bool {
    match body {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        _ => false,
    }
}

/// Snapshot returned by [`ChangeDetector::statistics`].
#[derive(Debug, Clone, Serialize)]
pub struct NotifierStatistics {
    pub total_tracked_schedules: usize,
    pub active_error_notifications: usize,
    pub config: NotifierConfig,
    pub tracked_schedules: Vec<String>,
}

struct DetectorState {
    config: NotifierConfig,
    hashes: HashMap<String, String>,
    open_failures: HashSet<(String, String)>,
}

fn lock(mutex: &Mutex<DetectorState>) -> MutexGuard<'_, DetectorState> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct ChangeDetector {
    application: String,
    state: Mutex<DetectorState>,
    sender: DelayedUdpSender,
}

impl ChangeDetector {
    pub fn new(config: NotifierConfig, application: impl Into<String>, runtime: Handle) -> Self {
        let sender = DelayedUdpSender::new(udp::delay_from_secs(config.delay_seconds), runtime);
        Self {
            application: application.into(),
            state: Mutex::new(DetectorState {
                config,
                hashes: HashMap::new(),
                open_failures: HashSet::new(),
            }),
            sender,
        }
    }

    /// Classify a result and queue the resulting notifications.
    ///
    /// Returns the classifications that were queued, in order. A success that
    /// closes open failures queues its own classification followed by
    /// `Recovery`.
    pub fn process(&self, result: &RequestResult, job: &JobConfig) -> Vec<Classification> {
        let (messages, host, port) = {
            let mut state = lock(&self.state);
            if !state.config.enabled {
                return Vec::new();
            }
            let messages = self.classify(&mut state, result, job);
            (
                messages,
                state.config.server_address.clone(),
                state.config.port,
            )
        };

        let mut queued = Vec::with_capacity(messages.len());
        for message in messages {
            match serde_json::to_vec(&message) {
                Ok(payload) => {
                    info!(
                        job_id = %job.id,
                        kind = %message.notification_type,
                        bytes = payload.len(),
                        "notification queued"
                    );
                    self.sender.send(host.clone(), port, payload);
                    queued.push(message.notification_type);
                }
                Err(e) => error!(job_id = %job.id, error = %e, "failed to encode notification"),
            }
        }
        queued
    }

    fn classify(
        &self,
        state: &mut DetectorState,
        result: &RequestResult,
        job: &JobConfig,
    ) -> Vec<Notification> {
        let cfg = state.config.clone();
        let build = |kind, extra| {
            Notification::build(
                &self.application,
                cfg.max_response_size_bytes,
                result,
                job,
                kind,
                extra,
            )
        };
        let mut out = Vec::new();

        if result.success {
            let current = content_hash(result.response_body.as_ref());
            let previous = state.hashes.insert(job.id.clone(), current.clone());
            let kind = match previous.as_deref() {
                None => Classification::FirstSuccess,
                Some(p) if p != current => Classification::ResponseChanged,
                Some(_) => Classification::Unchanged,
            };
            let wanted = match kind {
                Classification::ResponseChanged => cfg.notify_on_response_change,
                _ => cfg.notify_on_success,
            };
            debug!(job_id = %job.id, kind = %kind, wanted, "classified success");
            if wanted {
                out.push(build(
                    kind,
                    json!({
                        "is_first_run": previous.is_none(),
                        "is_response_changed": kind == Classification::ResponseChanged,
                        "response_hash": current,
                        "previous_hash": previous,
                    }),
                ));
            }

            let open_before = state.open_failures.len();
            state.open_failures.retain(|(id, _)| id != &job.id);
            if state.open_failures.len() < open_before {
                out.push(build(
                    Classification::Recovery,
                    json!({ "message": "request recovered from error state" }),
                ));
            }
        } else if cfg.notify_on_failure {
            let error = result.error_message().to_string();
            if state.open_failures.insert((job.id.clone(), error.clone())) {
                out.push(build(
                    Classification::Failure,
                    json!({
                        "error_message": error,
                        "status_code": result.status_code,
                        "attempt_count": result.attempt,
                    }),
                ));
            } else {
                debug!(job_id = %job.id, "failure already notified");
            }
        }

        out
    }

    /// Swap the configuration, keeping hashes and open failures.
    pub fn update_config(&self, config: NotifierConfig) {
        self.sender
            .set_delay(udp::delay_from_secs(config.delay_seconds));
        lock(&self.state).config = config;
        info!("notifier configuration updated");
    }

    pub fn config(&self) -> NotifierConfig {
        lock(&self.state).config.clone()
    }

    pub fn statistics(&self) -> NotifierStatistics {
        let state = lock(&self.state);
        let mut tracked: Vec<String> = state.hashes.keys().cloned().collect();
        tracked.sort();
        NotifierStatistics {
            total_tracked_schedules: state.hashes.len(),
            active_error_notifications: state.open_failures.len(),
            config: state.config.clone(),
            tracked_schedules: tracked,
        }
    }

    /// Forget hashes and open failures for one job, or for all jobs.
    pub fn clear_history(&self, job_id: Option<&str>) {
        let mut state = lock(&self.state);
        match job_id {
            Some(id) => {
                state.hashes.remove(id);
                state.open_failures.retain(|(job, _)| job != id);
                info!(job_id = %id, "cleared notification history");
            }
            None => {
                state.hashes.clear();
                state.open_failures.clear();
                info!("cleared all notification history");
            }
        }
    }
}
