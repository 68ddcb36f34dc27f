mod align;
mod cli;
mod config;
mod context;
mod http;
mod ingress;
mod metrics;
mod modes;
mod snapshot;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::sync::watch;
use tracing_subscriber::{fmt, EnvFilter};

use crate::cli::Cli;
use crate::config::Config;
use crate::context::AppContext;
use crate::metrics::Metrics;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();

    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        tracing::error!(error = ?e, "tudomesh exited with an error");
        std::process::exit(1);
    }
    Ok(())
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = Config::load(cli.config.as_deref())?;
    config
        .validate(cli.mqtt)
        .map_err(|e| anyhow::anyhow!(e.to_string()))?;
    tracing::info!(vacuums = config.vacuums.len(), "loaded configuration");

    let data_dir = config::resolve_data_dir(cli.data_dir.clone());
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("failed to create data dir {}", data_dir.display()))?;
    let calibration_cache_path = cli
        .calibration_cache
        .clone()
        .unwrap_or_else(|| data_dir.join("calibration.json"));

    let metrics = Arc::new(Metrics::new());
    let context = AppContext::new(config, data_dir, calibration_cache_path, metrics)?;

    if cli.is_one_shot_mode() {
        return run_one_shot(&context, &cli);
    }

    if cli.is_service_mode() {
        return run_service(context, &cli).await;
    }

    anyhow::bail!(
        "nothing to do: pass --render, --calibrate, --parse-only, --detect-rotation, \
         --compare-rotation <id>, --mqtt, or --http"
    );
}

fn run_one_shot(context: &Arc<AppContext>, cli: &Cli) -> anyhow::Result<()> {
    if cli.parse_only {
        modes::run_parse_only(context)?;
    }
    if cli.detect_rotation {
        modes::run_detect_rotation(context)?;
    }
    if let Some(target_id) = &cli.compare_rotation {
        modes::run_compare_rotation(context, target_id)?;
    }
    if cli.calibrate {
        let force_rotation = cli::parse_force_rotation(&cli.force_rotation);
        modes::run_calibrate(context, &force_rotation)?;
    }
    if cli.render {
        modes::run_render(context, cli)?;
    }
    Ok(())
}

async fn run_service(context: Arc<AppContext>, cli: &Cli) -> anyhow::Result<()> {
    let (shutdown_tx, shutdown_rx) = watch::channel(());

    let ingress_handle = if cli.mqtt {
        let ctx = context.clone();
        let rx = shutdown_rx.clone();
        Some(tokio::spawn(async move { ingress::run(ctx, rx).await }))
    } else {
        None
    };

    let http_handle = if cli.http {
        let router = http::router(context.clone());
        let addr = SocketAddr::from(([0, 0, 0, 0], cli.http_port));
        let mut rx = shutdown_rx.clone();
        Some(tokio::spawn(async move {
            let listener = tokio::net::TcpListener::bind(addr).await?;
            tracing::info!(%addr, "http server listening");
            axum::serve(listener, router.into_make_service())
                .with_graceful_shutdown(async move {
                    let _ = rx.changed().await;
                })
                .await?;
            Ok::<(), anyhow::Error>(())
        }))
    } else {
        None
    };

    tracing::info!("tudomesh running, awaiting shutdown signal");
    shutdown_signal().await;
    tracing::info!("shutdown signal received, terminating services");
    drop(shutdown_tx);

    if let Some(handle) = ingress_handle {
        if let Err(e) = handle.await {
            tracing::error!(error = %e, "ingress task failed");
        }
    }
    if let Some(handle) = http_handle {
        if let Err(e) = handle.await {
            tracing::error!(error = %e, "http task failed");
        }
    }

    tracing::info!("tudomesh shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
