//! Request history log and per-job statistics.
//!
//! Every execution appends one `request_history` row and updates the job's
//! `schedule_stats` row in the same transaction. Writes go through a single
//! lock so the statistics read-modify-write never interleaves. Failures are
//! logged and swallowed; reads fall back to empty results.

use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, params_from_iter, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info};

use super::{format_ts, parse_ts, Pool};
use crate::executor::RequestResult;
use crate::scheduler::JobConfig;

/// Rows returned by [`HistoryStore::query`] when the filter sets no limit.
pub const DEFAULT_HISTORY_LIMIT: usize = 100;

/// One persisted execution.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryRecord {
    pub id: i64,
    pub request_id: String,
    pub schedule_name: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub attempt: u32,
    pub success: bool,
    pub status_code: Option<u16>,
    pub response_time_ms: Option<u64>,
    pub url: Option<String>,
    pub method: Option<String>,
    pub request_headers: BTreeMap<String, String>,
    pub request_body: Option<Value>,
    pub response_body: Option<Value>,
    pub response_headers: Option<BTreeMap<String, String>>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// History query. Every criterion is optional.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HistoryFilter {
    /// Matches records whose job id starts with this string.
    pub job_id: Option<String>,
    pub success: Option<bool>,
    /// Inclusive lower bound on the request timestamp.
    pub start: Option<DateTime<Utc>>,
    /// Inclusive upper bound on the request timestamp.
    pub end: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

/// Cumulative counters for one job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScheduleStats {
    pub schedule_id: String,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub last_request_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
    /// Mean over successful requests only.
    pub avg_response_time_ms: Option<f64>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StatsSummary {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    /// Percentage of successful requests, 0 when nothing ran yet.
    pub success_rate: f64,
    pub requests_last_24h: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StatsReport {
    pub schedules: Vec<ScheduleStats>,
    pub summary: StatsSummary,
}

/// Incremental mean over successes.
pub(crate) fn next_average(old_avg: Option<f64>, old_successes: u64, sample_ms: u64) -> f64 {
    match old_avg {
        Some(avg) if old_successes > 0 => {
            (avg * old_successes as f64 + sample_ms as f64) / (old_successes + 1) as f64
        }
        _ => sample_ms as f64,
    }
}

/// History/statistics store backed by the SQLite pool.
pub struct HistoryStore {
    pool: Pool,
    write_lock: Mutex<()>,
}

impl HistoryStore {
    pub fn new(pool: Pool) -> Self {
        Self {
            pool,
            write_lock: Mutex::new(()),
        }
    }

    /// Persist one execution and fold it into the job's statistics.
    /// Returns the new record id, or `None` when the write failed.
    pub fn record_result(&self, result: &RequestResult, job: &JobConfig) -> Option<i64> {
        match self.try_record(result, job) {
            Ok(id) => {
                debug!(job_id = %result.request_id, record_id = id, success = result.success, "recorded request result");
                Some(id)
            }
            Err(e) => {
                error!(job_id = %result.request_id, error = %format!("{:#}", e), "failed to record request result");
                None
            }
        }
    }

    fn try_record(&self, result: &RequestResult, job: &JobConfig) -> Result<i64> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut conn = self.pool.get().context("failed to get database connection")?;
        let tx = conn.transaction()?;

        let timestamp = format_ts(result.timestamp);
        let now = format_ts(Utc::now());

        tx.execute(
            "INSERT INTO request_history (
                request_id, schedule_name, timestamp, attempt, success, status_code,
                response_time_ms, url, method, request_headers, request_body,
                response_body, response_headers, error, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            params![
                result.request_id,
                job.display_name(),
                timestamp,
                result.attempt,
                result.success,
                result.status_code,
                result.response_time_ms.map(|ms| ms as i64),
                job.url,
                job.method.to_ascii_uppercase(),
                serde_json::to_string(&job.headers)?,
                job.body.as_ref().map(serde_json::to_string).transpose()?,
                result.response_body.as_ref().map(serde_json::to_string).transpose()?,
                result.response_headers.as_ref().map(serde_json::to_string).transpose()?,
                result.error,
                now,
            ],
        )
        .context("failed to insert request history")?;
        let id = tx.last_insert_rowid();

        let previous: Option<(u64, Option<f64>)> = tx
            .query_row(
                "SELECT successful_requests, avg_response_time_ms FROM schedule_stats WHERE schedule_id = ?1",
                [&result.request_id],
                |row| Ok((row.get::<_, i64>(0)? as u64, row.get(1)?)),
            )
            .optional()?;
        let (old_successes, old_avg) = previous.unwrap_or((0, None));

        let avg = if result.success {
            Some(next_average(
                old_avg,
                old_successes,
                result.response_time_ms.unwrap_or(0),
            ))
        } else {
            old_avg
        };
        let success_at = result.success.then(|| timestamp.clone());
        let failure_at = (!result.success).then(|| timestamp.clone());

        tx.execute(
            "INSERT INTO schedule_stats (
                schedule_id, total_requests, successful_requests, failed_requests,
                last_request_at, last_success_at, last_failure_at, avg_response_time_ms, updated_at
            ) VALUES (?1, 1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(schedule_id) DO UPDATE SET
                total_requests = total_requests + 1,
                successful_requests = successful_requests + excluded.successful_requests,
                failed_requests = failed_requests + excluded.failed_requests,
                last_request_at = excluded.last_request_at,
                last_success_at = COALESCE(excluded.last_success_at, last_success_at),
                last_failure_at = COALESCE(excluded.last_failure_at, last_failure_at),
                avg_response_time_ms = excluded.avg_response_time_ms,
                updated_at = excluded.updated_at",
            params![
                result.request_id,
                result.success as i64,
                (!result.success) as i64,
                timestamp,
                success_at,
                failure_at,
                avg,
                now,
            ],
        )
        .context("failed to update schedule stats")?;

        tx.commit()?;
        Ok(id)
    }

    /// Records matching `filter`, newest first.
    pub fn query(&self, filter: &HistoryFilter) -> Vec<HistoryRecord> {
        self.try_query(filter).unwrap_or_else(|e| {
            error!(error = %format!("{:#}", e), "failed to query request history");
            Vec::new()
        })
    }

    fn try_query(&self, filter: &HistoryFilter) -> Result<Vec<HistoryRecord>> {
        let mut sql = String::from("SELECT * FROM request_history WHERE 1=1");
        let mut args: Vec<rusqlite::types::Value> = Vec::new();

        if let Some(prefix) = filter.job_id.as_deref().filter(|p| !p.is_empty()) {
            sql.push_str(" AND request_id LIKE ? ESCAPE '\\'");
            args.push(format!("{}%", escape_like(prefix)).into());
        }
        if let Some(success) = filter.success {
            sql.push_str(" AND success = ?");
            args.push((success as i64).into());
        }
        if let Some(start) = filter.start {
            sql.push_str(" AND timestamp >= ?");
            args.push(format_ts(start).into());
        }
        if let Some(end) = filter.end {
            sql.push_str(" AND timestamp <= ?");
            args.push(format_ts(end).into());
        }
        sql.push_str(" ORDER BY timestamp DESC, id DESC LIMIT ?");
        args.push((filter.limit.unwrap_or(DEFAULT_HISTORY_LIMIT) as i64).into());

        let conn = self.pool.get().context("failed to get database connection")?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(args), map_record)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Statistics for one job, if it ever ran.
    pub fn stats(&self, job_id: &str) -> Option<ScheduleStats> {
        let result = self
            .pool
            .get()
            .context("failed to get database connection")
            .and_then(|conn| {
                conn.query_row(
                    "SELECT * FROM schedule_stats WHERE schedule_id = ?1",
                    [job_id],
                    map_stats,
                )
                .optional()
                .context("failed to read schedule stats")
            });
        result.unwrap_or_else(|e| {
            error!(job_id = %job_id, error = %format!("{:#}", e), "failed to read schedule stats");
            None
        })
    }

    /// All per-job statistics plus a global summary.
    pub fn statistics(&self) -> StatsReport {
        self.try_statistics().unwrap_or_else(|e| {
            error!(error = %format!("{:#}", e), "failed to read statistics");
            StatsReport::default()
        })
    }

    fn try_statistics(&self) -> Result<StatsReport> {
        let conn = self.pool.get().context("failed to get database connection")?;

        let mut stmt = conn.prepare("SELECT * FROM schedule_stats ORDER BY schedule_id")?;
        let schedules = stmt
            .query_map([], map_stats)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let total: u64 = schedules.iter().map(|s| s.total_requests).sum();
        let successful: u64 = schedules.iter().map(|s| s.successful_requests).sum();
        let failed: u64 = schedules.iter().map(|s| s.failed_requests).sum();

        let since = format_ts(Utc::now() - Duration::hours(24));
        let recent: i64 = conn.query_row(
            "SELECT COUNT(*) FROM request_history WHERE timestamp >= ?1",
            [since],
            |row| row.get(0),
        )?;

        Ok(StatsReport {
            schedules,
            summary: StatsSummary {
                total_requests: total,
                successful_requests: successful,
                failed_requests: failed,
                success_rate: if total > 0 {
                    successful as f64 / total as f64 * 100.0
                } else {
                    0.0
                },
                requests_last_24h: recent as u64,
            },
        })
    }

    /// Delete records from before the start of the current UTC day minus
    /// `retention_days`. Statistics are kept. Returns the number of deleted
    /// records.
    pub fn cleanup(&self, retention_days: u32) -> usize {
        let cutoff = cleanup_cutoff(Utc::now(), retention_days);
        let result = (|| -> Result<usize> {
            let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
            let conn = self.pool.get().context("failed to get database connection")?;
            Ok(conn.execute(
                "DELETE FROM request_history WHERE timestamp < ?1",
                [format_ts(cutoff)],
            )?)
        })();

        match result {
            Ok(deleted) => {
                info!(deleted, retention_days, cutoff = %cutoff, "cleaned up request history");
                deleted
            }
            Err(e) => {
                error!(error = %format!("{:#}", e), "failed to clean up request history");
                0
            }
        }
    }
}

pub(crate) fn cleanup_cutoff(now: DateTime<Utc>, retention_days: u32) -> DateTime<Utc> {
    let midnight = now
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .map(|t| t.and_utc())
        .unwrap_or(now);
    midnight - Duration::days(i64::from(retention_days))
}

fn escape_like(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn json_column<T: serde::de::DeserializeOwned>(row: &Row<'_>, name: &str) -> rusqlite::Result<Option<T>> {
    let raw: Option<String> = row.get(name)?;
    Ok(raw.and_then(|s| serde_json::from_str(&s).ok()))
}

fn ts_column(row: &Row<'_>, name: &str) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(name)?;
    Ok(raw.as_deref().and_then(parse_ts))
}

fn map_record(row: &Row<'_>) -> rusqlite::Result<HistoryRecord> {
    Ok(HistoryRecord {
        id: row.get("id")?,
        request_id: row.get("request_id")?,
        schedule_name: row.get("schedule_name")?,
        timestamp: ts_column(row, "timestamp")?.unwrap_or_default(),
        attempt: row.get("attempt")?,
        success: row.get("success")?,
        status_code: row.get("status_code")?,
        response_time_ms: row
            .get::<_, Option<i64>>("response_time_ms")?
            .map(|ms| ms as u64),
        url: row.get("url")?,
        method: row.get("method")?,
        request_headers: json_column(row, "request_headers")?.unwrap_or_default(),
        request_body: json_column(row, "request_body")?,
        response_body: json_column(row, "response_body")?,
        response_headers: json_column(row, "response_headers")?,
        error: row.get("error")?,
        created_at: ts_column(row, "created_at")?.unwrap_or_default(),
    })
}

fn map_stats(row: &Row<'_>) -> rusqlite::Result<ScheduleStats> {
    Ok(ScheduleStats {
        schedule_id: row.get("schedule_id")?,
        total_requests: row.get::<_, i64>("total_requests")? as u64,
        successful_requests: row.get::<_, i64>("successful_requests")? as u64,
        failed_requests: row.get::<_, i64>("failed_requests")? as u64,
        last_request_at: ts_column(row, "last_request_at")?,
        last_success_at: ts_column(row, "last_success_at")?,
        last_failure_at: ts_column(row, "last_failure_at")?,
        avg_response_time_ms: row.get("avg_response_time_ms")?,
        updated_at: ts_column(row, "updated_at")?,
    })
}
