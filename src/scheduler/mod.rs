//! Job scheduler.
//!
//! Owns the registry of jobs, computes next run times and drives executions
//! from a one-second tick loop. Every execution runs as a tracked task in a
//! `JoinSet` owned by the scheduler, so `stop` can cancel and await them.

pub mod cron;
mod engine;
mod job;

pub use self::job::{HttpMethod, JobConfig, JobStatus, ScheduleJob, ScheduleType};

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::ValidationError;
use crate::executor::RequestResult;

/// Upper bound on fire times listed per job by [`Scheduler::preview`].
const PREVIEW_LIMIT_PER_JOB: usize = 500;

/// Work performed for one due job.
///
/// The scheduler calls `run` once per execution and never overlaps two calls
/// for the same job. Whatever the handler returns becomes the job's
/// `last_result`.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn run(&self, job: &JobConfig) -> RequestResult;
}

/// Snapshot returned by [`Scheduler::status`].
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub total_jobs: usize,
    pub running_jobs: usize,
    pub scheduler_running: bool,
    pub jobs: BTreeMap<String, JobStatus>,
}

/// One upcoming fire time, as listed by a dry run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedRun {
    pub at: DateTime<Utc>,
    pub job_id: String,
    pub name: String,
}

struct Ticker {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

struct Inner {
    jobs: Mutex<HashMap<String, ScheduleJob>>,
    units: Mutex<JoinSet<()>>,
    ticker: Mutex<Option<Ticker>>,
    handler: Arc<dyn JobHandler>,
    runtime: Handle,
    next_instance: AtomicU64,
}

/// Cheap to clone; all clones share one registry.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Scheduler {
    /// Create a stopped scheduler. Tasks are spawned on `runtime`, so the
    /// scheduler may be driven from threads outside it.
    pub fn new(handler: Arc<dyn JobHandler>, runtime: Handle) -> Self {
        Self {
            inner: Arc::new(Inner {
                jobs: Mutex::new(HashMap::new()),
                units: Mutex::new(JoinSet::new()),
                ticker: Mutex::new(None),
                handler,
                runtime,
                next_instance: AtomicU64::new(1),
            }),
        }
    }

    /// Register a job, or replace the one with the same id.
    ///
    /// The replaced instance's in-flight run, if any, is left to finish. The
    /// new instance is not dispatched before it does, and that run's result
    /// is not applied to it. Nothing changes when validation fails.
    pub fn add_or_update_job(&self, config: JobConfig) -> Result<(), ValidationError> {
        config.validate()?;

        let instance = self.inner.next_instance.fetch_add(1, Ordering::Relaxed);
        let mut job = ScheduleJob::new(config, instance, Utc::now())?;
        let id = job.id().to_string();
        let next_run = job.next_run_time;

        let mut jobs = lock(&self.inner.jobs);
        let replaced = match jobs.remove(&id) {
            Some(previous) => {
                job.inherit_run(previous);
                true
            }
            None => false,
        };
        if job.is_running {
            debug!(job_id = %id, "previous run still in flight, new config waits for it");
        }
        jobs.insert(id.clone(), job);
        drop(jobs);

        match next_run {
            Some(next) => info!(job_id = %id, replaced, next_run = %next, "job registered"),
            None => info!(job_id = %id, replaced, "job registered (disabled)"),
        }
        Ok(())
    }

    /// Delete a job and cancel its in-flight run. Returns `false` for an
    /// unknown id.
    pub fn remove_job(&self, id: &str) -> bool {
        let Some(job) = lock(&self.inner.jobs).remove(id) else {
            debug!(job_id = %id, "remove requested for unknown job");
            return false;
        };
        if let Some(abort) = job.abort {
            abort.abort();
            info!(job_id = %id, "cancelled in-flight run");
        }
        info!(job_id = %id, "job removed");
        true
    }

    /// Launch the tick loop. A second call while running is a no-op.
    pub fn start(&self) {
        let mut ticker = lock(&self.inner.ticker);
        if ticker.is_some() {
            debug!("scheduler already running");
            return;
        }

        let cancel = CancellationToken::new();
        let task = self
            .inner
            .runtime
            .spawn(engine::run_scheduler_loop(self.clone(), cancel.clone()));
        *ticker = Some(Ticker { cancel, task });
        info!("scheduler started");
    }

    /// Cancel the tick loop and every in-flight run, and wait for them.
    ///
    /// Interrupted jobs go back to idle with their pending next run time.
    pub async fn stop(&self) {
        let Some(ticker) = lock(&self.inner.ticker).take() else {
            debug!("scheduler already stopped");
            return;
        };

        ticker.cancel.cancel();
        if let Err(e) = ticker.task.await {
            warn!(error = %e, "scheduler loop ended abnormally");
        }

        let mut units = std::mem::take(&mut *lock(&self.inner.units));
        let in_flight = units.len();
        units.abort_all();
        while units.join_next().await.is_some() {}

        let mut interrupted = 0usize;
        for job in lock(&self.inner.jobs).values_mut().filter(|j| j.is_running) {
            job.interrupt();
            interrupted += 1;
        }

        info!(in_flight, interrupted, "scheduler stopped");
    }

    pub fn is_running(&self) -> bool {
        lock(&self.inner.ticker).is_some()
    }

    pub fn status(&self) -> SchedulerStatus {
        let scheduler_running = self.is_running();
        let jobs = lock(&self.inner.jobs);
        SchedulerStatus {
            total_jobs: jobs.len(),
            running_jobs: jobs.values().filter(|j| j.is_running).count(),
            scheduler_running,
            jobs: jobs.iter().map(|(id, j)| (id.clone(), j.status())).collect(),
        }
    }

    pub fn job_status(&self, id: &str) -> Option<JobStatus> {
        lock(&self.inner.jobs).get(id).map(ScheduleJob::status)
    }

    /// Copy of a registered job's configuration.
    pub fn job_config(&self, id: &str) -> Option<JobConfig> {
        lock(&self.inner.jobs).get(id).map(|j| j.config.clone())
    }

    pub fn job_configs(&self) -> Vec<JobConfig> {
        let mut configs: Vec<JobConfig> = lock(&self.inner.jobs)
            .values()
            .map(|j| j.config.clone())
            .collect();
        configs.sort_by(|a, b| a.id.cmp(&b.id));
        configs
    }

    /// Fire times of every scheduled job within the next `hours`, assuming
    /// each run completes instantly.
    pub fn preview(&self, hours: u32) -> Vec<PlannedRun> {
        let until = Utc::now() + Duration::hours(i64::from(hours));
        let jobs = lock(&self.inner.jobs);

        let mut runs = Vec::new();
        for job in jobs.values() {
            let Some(first) = job.next_run_time.filter(|t| *t <= until) else {
                continue;
            };
            let mut times = vec![first];
            while times.len() < PREVIEW_LIMIT_PER_JOB {
                let Some(last) = times.last().copied() else { break };
                match job.config.next_run_after(last) {
                    Ok(next) if next <= until => times.push(next),
                    _ => break,
                }
            }
            runs.extend(times.into_iter().map(|at| PlannedRun {
                at,
                job_id: job.config.id.clone(),
                name: job.config.display_name().to_string(),
            }));
        }

        runs.sort_by(|a, b| a.at.cmp(&b.at).then_with(|| a.job_id.cmp(&b.job_id)));
        runs
    }

    /// Apply a finished run to the job that started it. Results for an
    /// instance that has since been replaced or removed are dropped; a
    /// replacement waiting on that run becomes idle.
    pub(crate) fn finish_run(
        &self,
        job_id: &str,
        instance: u64,
        result: RequestResult,
        completed_at: DateTime<Utc>,
    ) {
        match lock(&self.inner.jobs).get_mut(job_id) {
            Some(job) if job.instance == instance => job.complete(result, completed_at),
            Some(job) if job.run_instance == Some(instance) => {
                job.release_stale_run();
                debug!(job_id = %job_id, "job changed while running, result not applied");
            }
            _ => debug!(job_id = %job_id, "job removed while running, result not applied"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration as StdDuration;

    /// Handler that sleeps, counts calls and tracks overlap.
    #[derive(Default)]
    struct TestHandler {
        delay: StdDuration,
        panic: bool,
        calls: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl TestHandler {
        fn sleeping(delay: StdDuration) -> Arc<Self> {
            Arc::new(Self {
                delay,
                ..Self::default()
            })
        }
    }

    #[async_trait]
    impl JobHandler for TestHandler {
        async fn run(&self, job: &JobConfig) -> RequestResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            if self.panic {
                panic!("handler exploded");
            }
            RequestResult::failure(&job.id, Utc::now(), 1, "test handler")
        }
    }

    fn scheduler(handler: Arc<TestHandler>) -> Scheduler {
        Scheduler::new(handler, Handle::current())
    }

    fn every_second(id: &str) -> JobConfig {
        JobConfig::interval(id, "http://127.0.0.1:9/", 1)
    }

    async fn wait_until(mut cond: impl FnMut() -> bool, limit: StdDuration) -> bool {
        let deadline = tokio::time::Instant::now() + limit;
        while tokio::time::Instant::now() < deadline {
            if cond() {
                return true;
            }
            tokio::time::sleep(StdDuration::from_millis(50)).await;
        }
        cond()
    }

    #[tokio::test]
    async fn test_add_job_sets_next_run_from_now() {
        let s = scheduler(Arc::new(TestHandler::default()));
        let before = Utc::now();
        s.add_or_update_job(JobConfig::interval("a", "http://example.com", 60))
            .unwrap();

        let status = s.job_status("a").unwrap();
        let next = status.next_run_time.unwrap();
        assert!(next >= before + Duration::seconds(60));
        assert!(next <= Utc::now() + Duration::seconds(60));
        assert!(!status.is_running);
        assert_eq!(s.status().total_jobs, 1);
    }

    #[tokio::test]
    async fn test_invalid_job_leaves_registry_untouched() {
        let s = scheduler(Arc::new(TestHandler::default()));
        s.add_or_update_job(JobConfig::interval("a", "http://example.com", 60))
            .unwrap();

        let bad = JobConfig::interval("a", "http://example.com", 0);
        assert_eq!(
            s.add_or_update_job(bad),
            Err(ValidationError::NonPositiveInterval)
        );
        assert_eq!(s.job_status("a").unwrap().interval_seconds, Some(60));
    }

    #[tokio::test]
    async fn test_update_replaces_job() {
        let s = scheduler(Arc::new(TestHandler::default()));
        s.add_or_update_job(JobConfig::interval("a", "http://example.com", 60))
            .unwrap();
        s.add_or_update_job(JobConfig::cron("a", "http://example.com/v2", "0 * * * *"))
            .unwrap();

        let status = s.status();
        assert_eq!(status.total_jobs, 1);
        assert_eq!(status.jobs["a"].url, "http://example.com/v2");
        assert_eq!(status.jobs["a"].schedule_type, Some(ScheduleType::Cron));
    }

    #[tokio::test]
    async fn test_remove_unknown_job() {
        let s = scheduler(Arc::new(TestHandler::default()));
        assert!(!s.remove_job("ghost"));
        s.add_or_update_job(every_second("a")).unwrap();
        assert!(s.remove_job("a"));
        assert!(s.job_status("a").is_none());
    }

    #[tokio::test]
    async fn test_start_stop_idempotent() {
        let s = scheduler(Arc::new(TestHandler::default()));
        s.stop().await;
        s.start();
        s.start();
        assert!(s.status().scheduler_running);
        s.stop().await;
        s.stop().await;
        assert!(!s.status().scheduler_running);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_due_job_runs_and_reschedules() {
        let handler = TestHandler::sleeping(StdDuration::ZERO);
        let s = scheduler(handler.clone());
        s.add_or_update_job(every_second("a")).unwrap();
        s.start();

        let ran = wait_until(
            || s.job_status("a").is_some_and(|j| j.run_count >= 1),
            StdDuration::from_secs(5),
        )
        .await;
        s.stop().await;

        assert!(ran);
        let status = s.job_status("a").unwrap();
        assert!(status.error_count >= 1);
        assert_eq!(status.last_result.unwrap().error.as_deref(), Some("test handler"));
        assert!(status.next_run_time.unwrap() > status.last_run_time.unwrap());
        assert!(handler.calls.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_runs_of_one_job_never_overlap() {
        let handler = TestHandler::sleeping(StdDuration::from_millis(2500));
        let s = scheduler(handler.clone());
        s.add_or_update_job(every_second("slow")).unwrap();
        s.start();

        tokio::time::sleep(StdDuration::from_secs(4)).await;
        s.stop().await;

        assert!(handler.calls.load(Ordering::SeqCst) >= 1);
        assert_eq!(handler.max_in_flight.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stop_cancels_in_flight_runs() {
        let handler = TestHandler::sleeping(StdDuration::from_secs(60));
        let s = scheduler(handler.clone());
        s.add_or_update_job(every_second("stuck")).unwrap();
        s.start();

        assert!(wait_until(|| s.status().running_jobs == 1, StdDuration::from_secs(5)).await);
        let pending = s.job_status("stuck").unwrap().next_run_time;

        tokio::time::timeout(StdDuration::from_secs(5), s.stop())
            .await
            .expect("stop should not wait for the sleeping handler");

        let status = s.status();
        assert!(!status.scheduler_running);
        assert_eq!(status.running_jobs, 0);
        let job = &status.jobs["stuck"];
        assert_eq!(job.run_count, 0);
        assert_eq!(job.next_run_time, pending);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_replaced_job_ignores_old_completion() {
        let handler = TestHandler::sleeping(StdDuration::from_millis(1500));
        let s = scheduler(handler.clone());
        s.add_or_update_job(every_second("a")).unwrap();
        s.start();

        assert!(wait_until(|| s.status().running_jobs == 1, StdDuration::from_secs(5)).await);
        s.add_or_update_job(JobConfig::interval("a", "http://example.com", 3600))
            .unwrap();

        // Let the old run finish.
        tokio::time::sleep(StdDuration::from_secs(2)).await;
        s.stop().await;

        let job = s.job_status("a").unwrap();
        assert_eq!(job.run_count, 0);
        assert!(job.last_result.is_none());
        assert_eq!(job.interval_seconds, Some(3600));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_replacement_waits_for_old_run() {
        let handler = TestHandler::sleeping(StdDuration::from_millis(2000));
        let s = scheduler(handler.clone());
        s.add_or_update_job(every_second("a")).unwrap();
        s.start();

        assert!(wait_until(|| s.status().running_jobs == 1, StdDuration::from_secs(5)).await);
        s.add_or_update_job(JobConfig::interval("a", "http://127.0.0.1:9/v2", 1))
            .unwrap();
        assert!(s.job_status("a").unwrap().is_running);

        // The old run ends, then the replacement gets its own run.
        let second = wait_until(
            || handler.calls.load(Ordering::SeqCst) >= 2,
            StdDuration::from_secs(6),
        )
        .await;
        tokio::time::sleep(StdDuration::from_millis(500)).await;
        s.stop().await;

        assert!(second);
        assert_eq!(handler.max_in_flight.load(Ordering::SeqCst), 1);
        assert_eq!(s.job_status("a").unwrap().url, "http://127.0.0.1:9/v2");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_panicking_handler_is_contained() {
        let handler = Arc::new(TestHandler {
            panic: true,
            ..TestHandler::default()
        });
        let s = scheduler(handler);
        s.add_or_update_job(every_second("boom")).unwrap();
        s.start();

        let ran = wait_until(
            || s.job_status("boom").is_some_and(|j| j.run_count >= 1),
            StdDuration::from_secs(5),
        )
        .await;
        s.stop().await;

        assert!(ran);
        let job = s.job_status("boom").unwrap();
        assert!(!job.is_running);
        assert!(job.error_count >= 1);
        let error = job.last_result.unwrap().error.unwrap();
        assert!(error.contains("handler exploded"), "{}", error);
    }

    #[tokio::test]
    async fn test_disabled_job_is_registered_but_not_scheduled() {
        let s = scheduler(Arc::new(TestHandler::default()));
        let mut config = every_second("off");
        config.enabled = false;
        s.add_or_update_job(config).unwrap();

        let job = s.job_status("off").unwrap();
        assert!(!job.enabled);
        assert!(job.next_run_time.is_none());
        assert!(s.preview(24).is_empty());
    }

    #[tokio::test]
    async fn test_preview_lists_runs_in_order() {
        let s = scheduler(Arc::new(TestHandler::default()));
        s.add_or_update_job(JobConfig::interval("quarter", "http://example.com", 900))
            .unwrap();
        s.add_or_update_job(JobConfig::cron("hourly", "http://example.com", "0 * * * *"))
            .unwrap();

        let runs = s.preview(2);
        let quarter = runs.iter().filter(|r| r.job_id == "quarter").count();
        let hourly = runs.iter().filter(|r| r.job_id == "hourly").count();

        assert_eq!(quarter, 8);
        assert_eq!(hourly, 2);
        assert!(runs.windows(2).all(|w| w[0].at <= w[1].at));
    }
}
