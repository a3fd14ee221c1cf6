mod api;

use anyhow::{bail, Context};
use clap::Parser;
use launch_orchestrator::ProcessLauncher;
use recovery_engine::FleetRuntime;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use warden_core::{validate_paths, SupervisorSettings, BUILD_INFO, VERSION};

#[derive(Parser, Debug)]
#[command(name = "warden-platform")]
#[command(about = "Warden Platform - launch, supervise and heal an agent fleet")]
#[command(version = VERSION)]
struct Args {
    /// Per-host manifest (repeat for each host)
    #[arg(short, long = "manifest", required = true)]
    manifests: Vec<PathBuf>,

    /// Settings file; defaults to ./warden.toml when present
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the status API bind address
    #[arg(long)]
    listen: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    info!("Starting Warden Platform {}", BUILD_INFO);

    let mut settings = match &args.config {
        Some(path) => SupervisorSettings::from_file(path)?,
        None => SupervisorSettings::load()?,
    };
    if let Some(listen) = args.listen {
        settings.listen_addr = listen;
    }

    let report = validate_paths(&args.manifests);
    for warning in report.warnings() {
        warn!("{}", warning);
    }
    if !report.is_valid() {
        for issue in &report.errors {
            error!("{}", issue);
        }
        bail!("fleet validation failed with {} issue(s)", report.errors.len());
    }
    let validated = report.into_validated()?;
    info!(
        "Fleet of {} agents planned in {} batches",
        validated.fleet.len(),
        validated.plan.batches().len()
    );

    let runtime = Arc::new(FleetRuntime::new(
        validated,
        &settings,
        Arc::new(ProcessLauncher::new()),
    )?);
    let shutdown = CancellationToken::new();

    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {}", e);
            }
            info!("Shutdown requested");
            shutdown.cancel();
        }
    });

    let listener = TcpListener::bind(&settings.listen_addr)
        .await
        .with_context(|| format!("binding status API to {}", settings.listen_addr))?;
    info!("Warden Platform listening on {}", listener.local_addr()?);
    let server = tokio::spawn({
        let app = api::router(runtime.clone());
        let shutdown = shutdown.clone();
        async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(shutdown.cancelled_owned())
                .await
        }
    });

    let launch = runtime.deploy(shutdown.clone()).await;
    info!(
        started = launch.started.len(),
        failed = launch.failed.len(),
        skipped = launch.skipped.len(),
        complete = launch.complete,
        "Deployment cycle finished"
    );

    runtime.supervise(shutdown.clone()).await;
    shutdown.cancel();
    server.await??;

    info!("Warden Platform stopped");
    Ok(())
}
