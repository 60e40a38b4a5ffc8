use clap::Parser;
use nexuts_sentry::config::SentryConfig;
use nexuts_sentry::{api, health, pipeline, SentryState};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

/// Per-host agent mirroring one worker's radix cache index and health.
#[derive(Parser, Debug)]
#[command(name = "nexuts-sentry")]
struct Cli {
    /// Path to a Sentry TOML config file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the tracing log level (e.g. "debug", "nexuts_sentry=trace").
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = cli
        .log_level
        .map(tracing_subscriber::EnvFilter::new)
        .unwrap_or_else(tracing_subscriber::EnvFilter::from_default_env);
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = SentryConfig::load(cli.config.as_deref())?;
    info!(sentry_id = %config.sentry_id, bind_address = %config.bind_address, "starting Sentry");

    let state = Arc::new(SentryState::new(config)?);

    health::restart_reload(state.clone()).await;

    let (_flush_task, _send_task) = pipeline::spawn(
        state.pipeline.clone(),
        Duration::from_secs_f64(state.config.flush_interval_secs),
        Duration::from_secs_f64(state.config.send_nexuts_cycle_secs),
    );

    if let Err(e) = api::start(state).await {
        error!(error = %e, "Sentry API server exited with error");
        return Err(e);
    }

    Ok(())
}
