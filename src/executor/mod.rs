//! Request executor -- one job's HTTP call with per-attempt timeout and
//! bounded, sequential retries.

mod result;

pub use self::result::{parse_body, RequestResult, ResponseData};

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{ensure, Context, Result};
use chrono::{DateTime, Utc};
use reqwest::redirect::Policy;
use reqwest::{Client, RequestBuilder};
use serde_json::Value;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::config::HttpSettings;
use crate::error::ExecutionError;
use crate::scheduler::{HttpMethod, JobConfig};

impl From<HttpMethod> for reqwest::Method {
    fn from(method: HttpMethod) -> Self {
        match method {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Delete => reqwest::Method::DELETE,
            HttpMethod::Patch => reqwest::Method::PATCH,
            HttpMethod::Head => reqwest::Method::HEAD,
            HttpMethod::Options => reqwest::Method::OPTIONS,
        }
    }
}

/// Timeout and retry settings resolved for one job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub timeout: Duration,
    pub retry_count: u32,
    pub retry_delay: Duration,
}

impl RetryPolicy {
    /// Job values win; unset ones come from the global settings.
    pub fn resolve(job: &JobConfig, settings: &HttpSettings) -> Self {
        Self {
            timeout: Duration::from_secs(job.timeout_seconds.unwrap_or(settings.default_timeout)),
            retry_count: job.retry_count.unwrap_or(settings.default_retry_count),
            retry_delay: Duration::from_secs(
                job.retry_delay_seconds.unwrap_or(settings.default_retry_delay),
            ),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.retry_count.saturating_add(1)
    }
}

/// Request body as it goes on the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    Json(Value),
    Text(String),
}

/// Turn a configured body into what one attempt sends.
///
/// An object whose `timestamp` field is the string `"auto"` gets the current
/// time in its place. Objects and arrays go out as JSON, strings verbatim and
/// any other scalar as its textual form.
pub fn render_body(body: &Value, now: DateTime<Utc>) -> Option<RequestBody> {
    match body {
        Value::Null => None,
        Value::Object(map) => {
            let mut map = map.clone();
            if map.get("timestamp").and_then(Value::as_str) == Some("auto") {
                map.insert("timestamp".to_string(), Value::String(now.to_rfc3339()));
            }
            Some(RequestBody::Json(Value::Object(map)))
        }
        Value::Array(_) => Some(RequestBody::Json(body.clone())),
        Value::String(s) => Some(RequestBody::Text(s.clone())),
        other => Some(RequestBody::Text(other.to_string())),
    }
}

/// Executes job requests with a shared `reqwest` client.
pub struct HttpExecutor {
    client: Client,
    settings: HttpSettings,
    permits: Arc<Semaphore>,
}

impl HttpExecutor {
    pub fn new(settings: HttpSettings) -> Result<Self> {
        ensure!(settings.default_timeout > 0, "http.default_timeout must be at least 1 second");

        let redirect = if settings.follow_redirects {
            Policy::default()
        } else {
            Policy::none()
        };

        let client = Client::builder()
            .user_agent(settings.user_agent.clone())
            .danger_accept_invalid_certs(!settings.verify_ssl)
            .redirect(redirect)
            .build()
            .context("failed to build HTTP client")?;

        let permits = Arc::new(Semaphore::new(settings.max_concurrent_requests.max(1)));

        Ok(Self {
            client,
            settings,
            permits,
        })
    }

    pub fn settings(&self) -> &HttpSettings {
        &self.settings
    }

    /// Run the job's request, retrying failed attempts.
    ///
    /// Never returns an error: exhausting all attempts yields a failed
    /// [`RequestResult`] carrying the last attempt's error message.
    pub async fn execute(&self, job: &JobConfig) -> RequestResult {
        let started = Utc::now();
        let method = match job.http_method() {
            Ok(m) => m,
            Err(e) => return RequestResult::failure(&job.id, started, 1, e.to_string()),
        };

        let policy = RetryPolicy::resolve(job, &self.settings);
        let max_attempts = policy.max_attempts();
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            match self.attempt(job, method, policy.timeout, attempt).await {
                Ok(response) => {
                    info!(
                        job_id = %job.id,
                        attempt,
                        status = response.status_code,
                        response_time_ms = response.response_time_ms,
                        "request succeeded"
                    );
                    return RequestResult::success(&job.id, started, attempt, response);
                }
                Err(e) => {
                    warn!(job_id = %job.id, attempt, max_attempts, error = %e, "request attempt failed");
                    last_error = e.to_string();
                    if attempt < max_attempts && !policy.retry_delay.is_zero() {
                        tokio::time::sleep(policy.retry_delay).await;
                    }
                }
            }
        }

        RequestResult::failure(&job.id, started, max_attempts, last_error)
    }

    async fn attempt(
        &self,
        job: &JobConfig,
        method: HttpMethod,
        timeout: Duration,
        attempt: u32,
    ) -> Result<ResponseData, ExecutionError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| ExecutionError::InvalidRequest("request limiter closed".to_string()))?;

        let request = self.build_request(job, method);
        debug!(job_id = %job.id, %method, url = %job.url, attempt, "sending request");

        tokio::time::timeout(timeout, async move {
            let start = Instant::now();
            let response = request.send().await?;
            let response_time_ms = start.elapsed().as_millis() as u64;

            let status = response.status();
            if status.as_u16() >= 400 {
                return Err(ExecutionError::HttpStatus {
                    status: status.as_u16(),
                    reason: status.canonical_reason().unwrap_or("Unknown").to_string(),
                });
            }

            let url = response.url().to_string();
            let headers: BTreeMap<String, String> = response
                .headers()
                .iter()
                .map(|(k, v)| (k.to_string(), String::from_utf8_lossy(v.as_bytes()).into_owned()))
                .collect();

            let body = match response.text().await {
                Ok(text) => parse_body(text),
                Err(e) => Value::String(format!("Failed to read response body: {}", e)),
            };

            Ok::<_, ExecutionError>(ResponseData {
                status_code: status.as_u16(),
                body,
                headers,
                response_time_ms,
                url,
                method: method.to_string(),
            })
        })
        .await
        .map_err(|_| ExecutionError::Timeout(timeout))?
    }

    fn build_request(&self, job: &JobConfig, method: HttpMethod) -> RequestBuilder {
        let mut request = self.client.request(method.into(), &job.url);
        for (name, value) in &job.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        match job.body.as_ref().and_then(|b| render_body(b, Utc::now())) {
            Some(RequestBody::Json(value)) => request.json(&value),
            Some(RequestBody::Text(text)) => request.body(text),
            None => request,
        }
    }
}
