use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, Instrument};

use super::{lock, Scheduler};
use crate::executor::RequestResult;

/// Cadence of the due-job check.
pub const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Main scheduler loop. Every tick reaps finished runs and dispatches the
/// jobs that are due, until `cancel` fires.
pub(super) async fn run_scheduler_loop(scheduler: Scheduler, cancel: CancellationToken) {
    info!("scheduler loop started");

    let mut ticker = tokio::time::interval(TICK_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                scheduler.reap_finished();
                scheduler.dispatch_due(Utc::now());
            }
        }
    }

    info!("scheduler loop stopped");
}

impl Scheduler {
    /// Start one execution unit per due job.
    fn dispatch_due(&self, now: DateTime<Utc>) {
        let mut jobs = lock(&self.inner.jobs);
        let mut units = lock(&self.inner.units);

        for job in jobs.values_mut().filter(|j| j.is_due(now)) {
            // Mark running before spawning so the next tick skips this job.
            job.begin(now);

            let config = job.config.clone();
            let instance = job.instance;
            let handler = self.inner.handler.clone();
            let scheduler = self.clone();
            let span = info_span!("job_run", job_id = %config.id, instance);

            debug!(job_id = %config.id, "job due");
            let unit = async move {
                let result = match AssertUnwindSafe(handler.run(&config)).catch_unwind().await {
                    Ok(result) => result,
                    Err(payload) => {
                        let message = panic_message(payload.as_ref());
                        error!(job_id = %config.id, panic = %message, "job handler panicked");
                        RequestResult::failure(
                            &config.id,
                            now,
                            1,
                            format!("job handler panicked: {}", message),
                        )
                    }
                };
                scheduler.finish_run(&config.id, instance, result, Utc::now());
            };

            job.abort = Some(units.spawn_on(unit.instrument(span), &self.inner.runtime));
        }
    }

    /// Drop finished tasks from the join set.
    fn reap_finished(&self) {
        let mut units = lock(&self.inner.units);
        while let Some(joined) = units.try_join_next() {
            if let Err(e) = joined {
                if e.is_panic() {
                    error!(error = %e, "execution unit panicked");
                }
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
