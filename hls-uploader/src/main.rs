use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use hls_uploader::app::App;
use hls_uploader::config::AppConfig;
use hls_uploader::logging::{LogFormat, init_logging, resolve_filter};

#[derive(Debug, Parser)]
#[command(name = "hls-uploader", version, about)]
struct Args {
    /// Configuration file; missing files fall back to defaults and environment.
    #[arg(short, long, env = "HLS_UPLOADER_CONFIG", default_value = "hls-uploader.toml")]
    config: PathBuf,

    /// Number of concurrent jobs (overrides `processing.workers`).
    #[arg(short, long)]
    workers: Option<usize>,

    /// Enable debug logging.
    #[arg(short, long, conflicts_with = "quiet")]
    verbose: bool,

    /// Only log errors.
    #[arg(short, long)]
    quiet: bool,

    /// Log output format (overrides `logging.format`).
    #[arg(long, value_enum)]
    log_format: Option<LogFormat>,

    /// Process at most one job, then exit.
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run(Args::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let mut config = AppConfig::load(&args.config)?;
    if let Some(workers) = args.workers {
        config.processing.workers = workers;
    }

    let filter = resolve_filter(
        args.verbose,
        args.quiet,
        std::env::var("RUST_LOG").ok(),
        &config.logging,
    );
    init_logging(&filter, args.log_format.unwrap_or(config.logging.format))?;

    config.validate()?;
    let app = App::from_config(&config).context("failed to set up worker")?;

    let token = CancellationToken::new();
    tokio::spawn(shutdown_on_signal(token.clone()));

    info!(version = env!("CARGO_PKG_VERSION"), "hls-uploader started");
    if args.once {
        let processed = app.run_once(token).await?;
        info!(processed, "Single run finished");
    } else {
        app.run(token).await?;
    }
    Ok(())
}

async fn shutdown_on_signal(token: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("Received Ctrl+C, shutting down"),
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
        }
    }
    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            return;
        }
        info!("Received Ctrl+C, shutting down");
    }

    token.cancel();
}
