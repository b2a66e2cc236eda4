mod api;
mod cancel;
mod config;
mod error;
mod job;
mod orchestrator;
mod restore;
mod storage;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::info;

use crate::api::{build_router, AppState};
use crate::cancel::{CancelGuard, CancelToken};
use crate::config::AppConfig;
use crate::orchestrator::Orchestrator;
use crate::restore::build_service;
use crate::storage::ArtifactStore;

/// Photo restoration server. Settings come from the environment; flags override them.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    /// Host interface to bind (overrides `HOST`).
    #[arg(long)]
    host: Option<String>,
    /// TCP port to bind (overrides `PORT`).
    #[arg(long)]
    port: Option<u16>,
    /// Directory holding `uploads/` and `restored/` (overrides `DATA_DIR`).
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "photo_restore_server=info,tower_http=info".into()),
        )
        .compact()
        .init();

    let cli = Cli::parse();
    let mut cfg = AppConfig::from_env()?;
    cfg.apply_overrides(cli.host, cli.port, cli.data_dir);

    let store = ArtifactStore::open(&cfg.data_dir).await?;
    info!(
        staging = %store.staging_dir().display(),
        results = %store.results_dir().display(),
        "artifact directories ready"
    );
    let service = build_service(&cfg)?;
    let orchestrator = Arc::new(Orchestrator::new(service, store, cfg.poll_interval));

    let (shutdown_guard, shutdown) = CancelToken::root();
    let state = Arc::new(AppState::new(cfg.clone(), orchestrator, shutdown));
    let app = build_router(state);

    let addr = format!("{}:{}", cfg.host, cfg.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!(
        host = %cfg.host,
        port = cfg.port,
        upstream = %cfg.upstream_base,
        poll_interval_ms = cfg.poll_interval.as_millis() as u64,
        "starting photo-restore-server"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown_guard))
        .await?;
    Ok(())
}

/// Waits for Ctrl-C or SIGTERM, then cancels in-flight restoration jobs.
async fn shutdown_signal(guard: CancelGuard) {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
            let _ = sigterm.recv().await;
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("shutdown requested; cancelling in-flight restorations");
    guard.cancel();
}
