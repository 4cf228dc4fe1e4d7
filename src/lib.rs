//! webtimer -- scheduled HTTP requests with history and change notification.
//!
//! This crate provides the job scheduler, the retrying request executor, the
//! SQLite history/statistics store and the change detector with its debounced
//! UDP notifier, plus the HTTP control API that fronts them.

pub mod api;
pub mod app;
pub mod config;
pub mod error;
pub mod executor;
pub mod notify;
pub mod scheduler;
pub mod storage;

#[cfg(test)]
pub(crate) mod testutil;

use std::net::SocketAddr;

use anyhow::{Context, Result};
use tracing::{info, warn};

pub use crate::app::App;
pub use crate::config::AppConfig;

/// Start the webtimer daemon: history store, scheduler and API server.
///
/// Runs until Ctrl-C, then stops the scheduler and waits for in-flight runs.
pub async fn serve(config: AppConfig, bind: &str, auto_start: bool) -> Result<()> {
    let addr: SocketAddr = bind
        .parse()
        .with_context(|| format!("invalid bind address: {}", bind))?;
    let retention_days = config.storage.retention_days;

    let app = App::new(config)?;
    if let Some(days) = retention_days {
        app.cleanup(days).await?;
    }
    if auto_start {
        app.start();
    } else {
        info!("scheduler auto-start disabled, use POST /api/v1/scheduler/start");
    }

    let router = api::router(api::state::AppState::new(app.clone()));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;

    info!(%addr, jobs = app.status().total_jobs, "webtimer listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    app.stop().await;
    info!("webtimer stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}
