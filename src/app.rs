//! Application wiring and control surface.
//!
//! The scheduler drives a [`Pipeline`] for every due job: execute the
//! request, persist the outcome, then classify it for notification. [`App`]
//! exposes the operations used by the CLI and the HTTP API.

use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use tokio::runtime::Handle;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::{AppConfig, NotifierConfig};
use crate::error::ValidationError;
use crate::executor::{HttpExecutor, RequestResult};
use crate::notify::{ChangeDetector, NotifierStatistics};
use crate::scheduler::{JobConfig, JobHandler, JobStatus, PlannedRun, Scheduler, SchedulerStatus};
use crate::storage::{self, HistoryFilter, HistoryRecord, HistoryStore, ScheduleStats, StatsReport};

/// Largest number of history records a single query may return.
pub const MAX_HISTORY_LIMIT: usize = 1000;

/// Execute -> record -> classify.
pub struct Pipeline {
    executor: HttpExecutor,
    store: Arc<HistoryStore>,
    detector: ChangeDetector,
}

impl Pipeline {
    pub async fn run_once(&self, job: &JobConfig) -> RequestResult {
        let run_id = Uuid::new_v4();
        async {
            let result = self.executor.execute(job).await;
            self.record(&result, job).await;
            self.detector.process(&result, job);
            result
        }
        .instrument(info_span!("request", job_id = %job.id, run_id = %run_id))
        .await
    }

    /// Persist on the blocking pool so SQLite never stalls a runtime worker.
    async fn record(&self, result: &RequestResult, job: &JobConfig) {
        let store = self.store.clone();
        let result = result.clone();
        let job = job.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || store.record_result(&result, &job)).await {
            warn!(error = %e, "history write task failed");
        }
    }

    /// Run a read or maintenance call against the store on the blocking pool.
    async fn with_store<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&HistoryStore) -> T + Send + 'static,
    {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || f(&store))
            .await
            .context("history store task failed")
    }
}

#[async_trait]
impl JobHandler for Pipeline {
    async fn run(&self, job: &JobConfig) -> RequestResult {
        self.run_once(job).await
    }
}

/// Combined statistics of the store and the notifier.
#[derive(Debug, Clone, Serialize)]
pub struct Statistics {
    #[serde(flatten)]
    pub history: StatsReport,
    pub notifier: NotifierStatistics,
}

struct AppInner {
    base_config: AppConfig,
    scheduler: Scheduler,
    pipeline: Arc<Pipeline>,
    runtime: Handle,
}

/// Handle to a running webtimer instance. Cheap to clone.
#[derive(Clone)]
pub struct App {
    inner: Arc<AppInner>,
}

impl App {
    /// Build the application on the current tokio runtime.
    pub fn new(config: AppConfig) -> Result<Self> {
        let runtime = Handle::try_current().context("webtimer must be started inside a tokio runtime")?;
        Self::with_runtime(config, runtime)
    }

    /// Build the application on `runtime`. Jobs from the configuration are
    /// registered right away; invalid ones are logged and skipped.
    pub fn with_runtime(config: AppConfig, runtime: Handle) -> Result<Self> {
        info!(path = %config.storage.database_path.display(), "opening history database");
        let pool = storage::open_pool(&config.storage.database_path)?;

        let pipeline = Arc::new(Pipeline {
            executor: HttpExecutor::new(config.http.clone())?,
            store: Arc::new(HistoryStore::new(pool)),
            detector: ChangeDetector::new(
                config.notification.clone(),
                config.app_name.clone(),
                runtime.clone(),
            ),
        });
        let scheduler = Scheduler::new(pipeline.clone(), runtime.clone());

        for job in &config.schedules {
            if let Err(e) = scheduler.add_or_update_job(job.clone()) {
                warn!(job_id = %job.id, error = %e, "skipping invalid job");
            }
        }

        Ok(Self {
            inner: Arc::new(AppInner {
                base_config: config,
                scheduler,
                pipeline,
                runtime,
            }),
        })
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.inner.scheduler
    }

    /// Current configuration, including runtime job and notifier changes.
    pub fn config(&self) -> AppConfig {
        let mut config = self.inner.base_config.clone();
        config.schedules = self.inner.scheduler.job_configs();
        config.notification = self.inner.pipeline.detector.config();
        config
    }

    pub fn add_or_update_job(&self, job: JobConfig) -> Result<(), ValidationError> {
        self.inner.scheduler.add_or_update_job(job)
    }

    pub fn remove_job(&self, id: &str) -> bool {
        let removed = self.inner.scheduler.remove_job(id);
        if removed {
            self.inner.pipeline.detector.clear_history(Some(id));
        }
        removed
    }

    pub fn start(&self) {
        self.inner.scheduler.start();
    }

    pub async fn stop(&self) {
        self.inner.scheduler.stop().await;
    }

    /// [`App::stop`] for threads outside the runtime. Must not be called
    /// from within an async context.
    pub fn stop_blocking(&self) {
        self.inner.runtime.block_on(self.stop());
    }

    pub fn status(&self) -> SchedulerStatus {
        self.inner.scheduler.status()
    }

    pub fn job_status(&self, id: &str) -> Option<JobStatus> {
        self.inner.scheduler.job_status(id)
    }

    /// History query with the limit clamped to [`MAX_HISTORY_LIMIT`].
    pub async fn history(&self, mut filter: HistoryFilter) -> Result<Vec<HistoryRecord>> {
        filter.limit = Some(
            filter
                .limit
                .unwrap_or(storage::history::DEFAULT_HISTORY_LIMIT)
                .min(MAX_HISTORY_LIMIT),
        );
        self.inner
            .pipeline
            .with_store(move |store| store.query(&filter))
            .await
    }

    pub async fn statistics(&self) -> Result<Statistics> {
        let history = self.inner.pipeline.with_store(HistoryStore::statistics).await?;
        Ok(Statistics {
            history,
            notifier: self.notifier_statistics(),
        })
    }

    pub async fn job_stats(&self, id: &str) -> Result<Option<ScheduleStats>> {
        let id = id.to_string();
        self.inner
            .pipeline
            .with_store(move |store| store.stats(&id))
            .await
    }

    pub fn notifier_config(&self) -> NotifierConfig {
        self.inner.pipeline.detector.config()
    }

    pub fn update_notifier_config(&self, config: NotifierConfig) {
        self.inner.pipeline.detector.update_config(config);
    }

    pub fn clear_notification_history(&self, job_id: Option<&str>) {
        self.inner.pipeline.detector.clear_history(job_id);
    }

    pub fn notifier_statistics(&self) -> NotifierStatistics {
        self.inner.pipeline.detector.statistics()
    }

    /// Run one job immediately, outside its schedule. The result is recorded
    /// and classified like a scheduled run. Without an id the first job (by
    /// id) is used.
    pub async fn test_request(&self, job_id: Option<&str>) -> Result<RequestResult> {
        let job = match job_id {
            Some(id) => self
                .inner
                .scheduler
                .job_config(id)
                .ok_or_else(|| anyhow!("unknown job: {}", id))?,
            None => match self.inner.scheduler.job_configs().into_iter().next() {
                Some(job) => job,
                None => bail!("no jobs configured"),
            },
        };

        info!(job_id = %job.id, "running test request");
        Ok(self.inner.pipeline.run_once(&job).await)
    }

    /// [`App::test_request`] for threads outside the runtime.
    pub fn test_request_blocking(&self, job_id: Option<&str>) -> Result<RequestResult> {
        self.inner.runtime.block_on(self.test_request(job_id))
    }

    pub fn preview(&self, hours: u32) -> Vec<PlannedRun> {
        self.inner.scheduler.preview(hours)
    }

    /// Delete history older than `retention_days`; returns deleted rows.
    pub async fn cleanup(&self, retention_days: u32) -> Result<usize> {
        self.inner
            .pipeline
            .with_store(move |store| store.cleanup(retention_days))
            .await
    }
}
