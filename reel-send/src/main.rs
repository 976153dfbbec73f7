//! reel-send - Background daemon that publishes due uploads
//!
//! Polls the Reelcast queue and hands every due video to its platform's
//! uploader, one upload at a time per platform.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use libreelcast::logging::LoggingConfig;
use libreelcast::{Reelcast, ReelcastError, Result};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "reel-send")]
#[command(version)]
#[command(about = "Background daemon that publishes due uploads")]
#[command(long_about = "\
reel-send - Background daemon that publishes due uploads

DESCRIPTION:
    reel-send is a long-running daemon that watches the Reelcast queue and
    uploads each video when its slot arrives.

    Every tick it checks the pause flag, re-verifies credentials when the
    health check is due, then publishes due tasks: platforms run side by
    side, tasks of one platform strictly one after another. Failures are
    retried with backoff; repeated failures pause the queue.

    Uploads left in flight by a crashed daemon are retried once they are
    older than the publish timeout, so a daemon that is still uploading is
    never disturbed. A duplicate post is possible and is flagged in the
    task history.

    Each upload waits a random [dispatch] jitter first (10-30s by default).

USAGE:
    # Run in foreground (logs to stderr)
    reel-send

    # Run with custom poll interval
    reel-send --poll-interval 30s

    # Process due tasks once and exit
    reel-send --once

SIGNALS:
    SIGTERM, SIGINT - Graceful shutdown (finishes current uploads)

CONFIGURATION:
    Configuration file: ~/.config/reelcast/config.toml
    Database location: ~/.local/share/reelcast/reelcast.db

    Override with environment variables:
        REELCAST_CONFIG      - Path to config file
        REELCAST_DB_PATH     - Path to database file
        REELCAST_LOG_FORMAT  - text, json or pretty
        REELCAST_LOG_LEVEL   - error, warn, info, debug or trace

EXIT CODES:
    0 - Clean shutdown
    1 - Runtime error
    2 - Configuration or database error
")]
struct Cli {
    /// Poll interval (overrides config), e.g. 30s or 2m
    #[arg(long, value_name = "DURATION", value_parser = humantime::parse_duration)]
    poll_interval: Option<Duration>,

    /// Enable verbose logging to stderr
    #[arg(short, long)]
    verbose: bool,

    /// Process due tasks once and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    LoggingConfig::from_env(cli.verbose).init();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {}", e);
        std::process::exit(e.exit_code());
    }
}

async fn run(cli: Cli) -> Result<()> {
    let service = Reelcast::new().await?;
    let dispatcher = service.dispatcher()?;

    for platform in service.unpublishable_platforms() {
        warn!(platform = %platform, "Platform enabled without a [publishers] entry; its tasks will wait");
    }

    info!("reel-send daemon starting");

    if cli.once {
        let report = dispatcher.tick(chrono::Utc::now()).await?;
        info!(
            recovered = report.recovered,
            posted = report.posted,
            retried = report.retried,
            failed = report.failed,
            deferred = report.deferred,
            paused = report.paused,
            "reel-send: processed due tasks once, exiting"
        );
        return Ok(());
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    setup_signal_handlers(shutdown.clone())?;

    let poll_interval = cli
        .poll_interval
        .unwrap_or(service.config().dispatch.poll_interval);
    if poll_interval.is_zero() {
        return Err(ReelcastError::InvalidInput(
            "poll interval must be greater than zero".to_string(),
        ));
    }
    info!(poll_interval = %humantime::format_duration(poll_interval), "Dispatch loop running");

    dispatcher.run(poll_interval, shutdown).await?;

    info!("reel-send daemon stopped");
    Ok(())
}

/// Set up signal handlers for graceful shutdown
#[cfg(unix)]
fn setup_signal_handlers(shutdown: Arc<AtomicBool>) -> Result<()> {
    use signal_hook::consts::{SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    let mut signals = Signals::new([SIGINT, SIGTERM])
        .map_err(|e| ReelcastError::InvalidInput(format!("Signal setup failed: {}", e)))?;

    std::thread::spawn(move || {
        if let Some(sig) = signals.forever().next() {
            info!(signal = sig, "Received shutdown signal, stopping after the current tick");
            shutdown.store(true, Ordering::Relaxed);
        }
    });

    Ok(())
}

#[cfg(not(unix))]
fn setup_signal_handlers(shutdown: Arc<AtomicBool>) -> Result<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl-C, stopping after the current tick");
            shutdown.store(true, Ordering::Relaxed);
        }
    });
    Ok(())
}
