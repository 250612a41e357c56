//! Nightly backup daemon - Main entry point

use anyhow::Result;
use chrono::Local;
use clap::Parser;
use nightly_backup::{
    config::Config, daemon::shutdown::ShutdownCoordinator, executor::BackupExecutor,
    scheduler::BackupScheduler, utils,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE", default_value = "nightly-backup.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    /// Run one backup now and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let config = Config::from_file(&args.config)?;

    // Initialize logging
    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    let log = utils::logger::init(&config.log, log_level)?;

    tracing::info!(
        "Starting nightly-backup v{} (source: {}, bucket: {})",
        env!("CARGO_PKG_VERSION"),
        config.source.dir.display(),
        config.storage.bucket
    );

    let executor = Arc::new(BackupExecutor::from_config(&config));

    if let Some(days) = config.storage.expiration_days {
        if let Err(e) = executor.apply_lifecycle(days).await {
            tracing::warn!(kind = e.kind(), "Failed to apply lifecycle rule: {}", e);
        }
    }

    if args.once {
        let result = async {
            let job = executor.job_for(Local::now())?;
            executor.execute(&job).await
        }
        .await;

        log.wait_idle(Duration::from_secs(2)).await;
        result?;
        return Ok(());
    }

    let scheduler = BackupScheduler::from_config(&config, Arc::clone(&executor))?;

    // Create shutdown coordinator
    let shutdown_coordinator = ShutdownCoordinator::new();
    let token = shutdown_coordinator.token();
    let scheduler_handle = tokio::spawn(async move { scheduler.run(token).await });

    // Wait for shutdown signal
    shutdown_coordinator.wait_for_signal().await;

    match tokio::time::timeout(Duration::from_secs(5), scheduler_handle).await {
        Ok(Ok(())) => tracing::info!("Shutdown complete"),
        Ok(Err(e)) => tracing::error!("Scheduler task panicked: {}", e),
        Err(_) => tracing::warn!("Scheduler shutdown timeout, forcing exit"),
    }

    log.wait_idle(Duration::from_secs(2)).await;
    Ok(())
}
