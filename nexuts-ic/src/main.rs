use clap::Parser;
use nexuts_ic::config::IcConfig;
use nexuts_ic::{api, health, IcState};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

/// The Information Center: fleet-wide merge prefix tree, WAL/snapshot
/// pipeline, Sentry/worker registry, and routing endpoint.
#[derive(Parser, Debug)]
#[command(name = "nexuts-ic")]
struct Cli {
    /// Path to an IC TOML config file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the tracing log level (e.g. "debug", "nexuts_ic=trace").
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

    let config = IcConfig::load(cli.config.as_deref())?;
    info!(bind_address = %config.bind_address, resume = config.resume, "starting Nexuts");

    let state = Arc::new(IcState::new(config).await?);
    state.recover().await?;
    info!(
        global_version = state.tree.global_version(),
        node_count = state.tree.core().node_count(),
        "tree recovered"
    );

    health::spawn_known_sentry_watchers(state.clone());
    health::spawn_metrics_poller(state.clone());
    state.snapshot_mgr.clone().spawn_periodic();

    if let Err(e) = api::start(state).await {
        error!(error = %e, "Nexuts API server exited with error");
        return Err(e);
    }

    Ok(())
}
