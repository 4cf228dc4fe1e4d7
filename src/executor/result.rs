use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Outcome of one job execution, after all retries.
///
/// On success the response fields are populated; on failure only `error` is,
/// and `status_code`/`response_body` stay `None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestResult {
    /// Id of the job that issued the request.
    pub request_id: String,
    /// When the first attempt started.
    pub timestamp: DateTime<Utc>,
    /// Attempts actually made (1-based).
    pub attempt: u32,
    pub success: bool,
    pub status_code: Option<u16>,
    /// Parsed JSON when the body was valid JSON, the raw text otherwise.
    pub response_body: Option<serde_json::Value>,
    pub response_headers: Option<BTreeMap<String, String>>,
    pub response_time_ms: Option<u64>,
    /// Final URL after redirects.
    pub url: Option<String>,
    pub method: Option<String>,
    pub error: Option<String>,
}

/// Response data of a successful attempt.
#[derive(Debug, Clone)]
pub struct ResponseData {
    pub status_code: u16,
    pub body: serde_json::Value,
    pub headers: BTreeMap<String, String>,
    pub response_time_ms: u64,
    pub url: String,
    pub method: String,
}

impl RequestResult {
    pub fn success(
        request_id: impl Into<String>,
        timestamp: DateTime<Utc>,
        attempt: u32,
        response: ResponseData,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            timestamp,
            attempt,
            success: true,
            status_code: Some(response.status_code),
            response_body: Some(response.body),
            response_headers: Some(response.headers),
            response_time_ms: Some(response.response_time_ms),
            url: Some(response.url),
            method: Some(response.method),
            error: None,
        }
    }

    pub fn failure(
        request_id: impl Into<String>,
        timestamp: DateTime<Utc>,
        attempt: u32,
        error: impl Into<String>,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            timestamp,
            attempt,
            success: false,
            status_code: None,
            response_body: None,
            response_headers: None,
            response_time_ms: None,
            url: None,
            method: None,
            error: Some(error.into()),
        }
    }

    /// Error text, or a placeholder for results without one.
    pub fn error_message(&self) -> &str {
        self.error.as_deref().unwrap_or("unknown error")
    }
}

/// Best-effort structured parse of a response body.
pub fn parse_body(text: String) -> serde_json::Value {
    match serde_json::from_str(&text) {
        Ok(value) => value,
        Err(_) => serde_json::Value::String(text),
    }
}
