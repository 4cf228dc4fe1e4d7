use std::io::Write;
use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};

use webtimer::config::LoggingConfig;
use webtimer::executor::RequestResult;
use webtimer::storage::{HistoryFilter, HistoryRecord};
use webtimer::{App, AppConfig};

#[derive(Parser)]
#[command(
    name = "webtimer",
    about = "Scheduled HTTP requests with history and change notification",
    version,
    long_about = None
)]
struct Cli {
    /// Config file (defaults to $WEBTIMER_CONFIG, then ./webtimer.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon (API server + scheduler)
    Serve {
        /// Bind address
        #[arg(long, default_value = "127.0.0.1:8080")]
        bind: String,

        /// Leave the scheduler stopped until started through the API
        #[arg(long)]
        no_auto_start: bool,
    },

    /// Run the scheduler with an interactive console on stdin
    Console,

    /// Execute one job immediately and print the result
    Test {
        /// Job id (defaults to the first configured job)
        #[arg(long)]
        job: Option<String>,
    },

    /// Show recent request history
    History {
        /// Number of records
        #[arg(long, default_value = "20")]
        limit: usize,

        /// Only jobs whose id starts with this prefix
        #[arg(long)]
        job: Option<String>,

        /// Only failed requests
        #[arg(long)]
        failed_only: bool,
    },

    /// Show per-job and global statistics
    Stats,

    /// Delete old request history (statistics are kept)
    Cleanup {
        /// Days of history to keep (defaults to storage.retention_days, then 30)
        #[arg(long)]
        days: Option<u32>,
    },

    /// Validate the configuration and every configured job
    CheckConfig,

    /// Preview what will run in the next N hours
    DryRun {
        /// Hours to preview
        #[arg(long, default_value = "24")]
        hours: u32,
    },
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::resolve(cli.config.as_deref())?;
    init_tracing(&config.logging);

    match cli.command {
        Commands::Serve {
            bind,
            no_auto_start,
        } => {
            let auto_start = config.auto_start_scheduler && !no_auto_start;
            tracing::info!(%bind, auto_start, "starting webtimer daemon");
            webtimer::serve(config, &bind, auto_start).await?;
        }
        Commands::Console => {
            let app = App::new(config)?;
            app.start();
            console(&app).await?;
            app.stop().await;
        }
        Commands::Test { job } => {
            let app = App::new(config)?;
            let result = app.test_request(job.as_deref()).await?;
            print_result(&result);
            if !result.success {
                bail!("request failed: {}", result.error_message());
            }
        }
        Commands::History {
            limit,
            job,
            failed_only,
        } => {
            let app = App::new(config)?;
            let records = app
                .history(HistoryFilter {
                    job_id: job,
                    success: failed_only.then_some(false),
                    limit: Some(limit),
                    ..HistoryFilter::default()
                })
                .await?;
            print_history(&records);
        }
        Commands::Stats => {
            let app = App::new(config)?;
            print_stats(&app).await?;
        }
        Commands::Cleanup { days } => {
            let days = days.or(config.storage.retention_days).unwrap_or(30);
            let app = App::new(config)?;
            let deleted = app.cleanup(days).await?;
            println!("Deleted {} history records older than {} days.", deleted, days);
        }
        Commands::CheckConfig => check_config(&config)?,
        Commands::DryRun { hours } => {
            let app = App::new(config)?;
            let preview = app.preview(hours);
            if preview.is_empty() {
                println!("No runs scheduled in next {} hours.", hours);
            } else {
                println!("Upcoming runs (next {} hours):", hours);
                for run in preview {
                    println!("{} : {} ({})", run.at.to_rfc3339(), run.job_id, run.name);
                }
            }
        }
    }

    Ok(())
}

fn check_config(config: &AppConfig) -> Result<()> {
    println!("Database: {}", config.storage.database_path.display());
    println!(
        "Notifier: {} ({}:{})",
        if config.notification.enabled { "enabled" } else { "disabled" },
        config.notification.server_address,
        config.notification.port
    );

    let mut invalid = 0;
    for job in &config.schedules {
        match job.validate() {
            Ok(()) => println!("  ok      {}", job.id),
            Err(e) => {
                invalid += 1;
                println!("  INVALID {} : {}", job.id, e);
            }
        }
    }
    println!("{} jobs, {} invalid", config.schedules.len(), invalid);

    if invalid > 0 {
        bail!("{} invalid job(s) in configuration", invalid);
    }
    Ok(())
}

fn print_result(result: &RequestResult) {
    match serde_json::to_string_pretty(result) {
        Ok(json) => println!("{}", json),
        Err(e) => eprintln!("failed to render result: {}", e),
    }
}

fn print_history(records: &[HistoryRecord]) {
    if records.is_empty() {
        println!("No history found.");
        return;
    }
    println!(
        "{:<24} | {:<20} | {:<7} | {:<6} | {:<8} | Error",
        "Timestamp", "Job", "Result", "Status", "Time"
    );
    println!("{:-<24}-|-{:-<20}-|-{:-<7}-|-{:-<6}-|-{:-<8}-|-{:-<20}", "", "", "", "", "", "");
    for r in records {
        println!(
            "{:<24} | {:<20} | {:<7} | {:<6} | {:<8} | {}",
            r.timestamp.format("%Y-%m-%d %H:%M:%S%.3f"),
            r.request_id,
            if r.success { "OK" } else { "FAIL" },
            r.status_code.map(|s| s.to_string()).unwrap_or_else(|| "-".into()),
            r.response_time_ms.map(|ms| format!("{}ms", ms)).unwrap_or_else(|| "-".into()),
            r.error.as_deref().unwrap_or("")
        );
    }
}

async fn print_stats(app: &App) -> Result<()> {
    let stats = app.statistics().await?;
    let summary = &stats.history.summary;
    println!(
        "Total: {}  Successful: {}  Failed: {}  Success rate: {:.1}%  Last 24h: {}",
        summary.total_requests,
        summary.successful_requests,
        summary.failed_requests,
        summary.success_rate,
        summary.requests_last_24h
    );
    if stats.history.schedules.is_empty() {
        return Ok(());
    }
    println!();
    println!("{:<20} | {:>7} | {:>7} | {:>7} | Avg time", "Job", "Total", "OK", "Failed");
    println!("{:-<20}-|-{:->7}-|-{:->7}-|-{:->7}-|-{:-<9}", "", "", "", "", "");
    for s in &stats.history.schedules {
        println!(
            "{:<20} | {:>7} | {:>7} | {:>7} | {}",
            s.schedule_id,
            s.total_requests,
            s.successful_requests,
            s.failed_requests,
            s.avg_response_time_ms
                .map(|ms| format!("{:.1}ms", ms))
                .unwrap_or_else(|| "-".into())
        );
    }
    Ok(())
}

const CONSOLE_HELP: &str =
    "commands: status | start | stop | test [job] | history [n] | stats | clear [job] | help | quit";

async fn console(app: &App) -> Result<()> {
    println!("webtimer console. {}", CONSOLE_HELP);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        print!("> ");
        std::io::stdout().flush()?;
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let mut words = line.split_whitespace();
        match (words.next(), words.next()) {
            (None, _) => {}
            (Some("status"), _) => {
                let status = app.status();
                println!(
                    "scheduler {} | {} jobs, {} running",
                    if status.scheduler_running { "running" } else { "stopped" },
                    status.total_jobs,
                    status.running_jobs
                );
                for job in status.jobs.values() {
                    println!(
                        "  {:<20} runs={} errors={} next={}",
                        job.id,
                        job.run_count,
                        job.error_count,
                        job.next_run_time
                            .map(|t| t.to_rfc3339())
                            .unwrap_or_else(|| "-".into())
                    );
                }
            }
            (Some("start"), _) => {
                app.start();
                println!("scheduler started");
            }
            (Some("stop"), _) => {
                app.stop().await;
                println!("scheduler stopped");
            }
            (Some("test"), job) => match app.test_request(job).await {
                Ok(result) => print_result(&result),
                Err(e) => println!("error: {}", e),
            },
            (Some("history"), n) => {
                let limit = n.and_then(|n| n.parse().ok()).unwrap_or(10);
                let filter = HistoryFilter {
                    limit: Some(limit),
                    ..HistoryFilter::default()
                };
                match app.history(filter).await {
                    Ok(records) => print_history(&records),
                    Err(e) => println!("error: {}", e),
                }
            }
            (Some("stats"), _) => {
                if let Err(e) = print_stats(app).await {
                    println!("error: {}", e);
                }
            }
            (Some("clear"), job) => {
                app.clear_notification_history(job);
                println!("notification history cleared");
            }
            (Some("help"), _) => println!("{}", CONSOLE_HELP),
            (Some("quit" | "exit"), _) => break,
            (Some(other), _) => println!("unknown command: {} ({})", other, CONSOLE_HELP),
        }
    }
    Ok(())
}
