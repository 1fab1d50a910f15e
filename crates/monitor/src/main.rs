use anyhow::{Context, Result};
use std::env;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use leafwatch::config;
use leafwatch::fleet::Fleet;
use leafwatch::web;

#[tokio::main]
async fn main() -> Result<()> {
    // ── Logging ─────────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // ── Config file ─────────────────────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "leafwatch.toml".to_string());
    let cfg = config::load(&config_path)?;
    info!(
        path = %config_path,
        namespace = %cfg.namespace,
        gateways = cfg.gateways.len(),
        "config loaded"
    );

    // ── Gateways ────────────────────────────────────────────────────
    let fleet = Arc::new(Fleet::connect(&cfg).await?);
    info!(active = ?fleet.gateway_names(), "fleet ready");

    for name in &cfg.monitor.observe {
        if let Err(e) = fleet.observe(name).await {
            warn!(gateway = %name, "cannot observe: {e}");
        }
    }

    // ── Operator API ────────────────────────────────────────────────
    let shutdown = CancellationToken::new();
    let mut web_task = tokio::spawn(web::serve(Arc::clone(&fleet), shutdown.clone()));

    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            res.context("failed to listen for ctrl-c")?;
            info!("ctrl-c received, shutting down");
        }
        res = &mut web_task => match res {
            Ok(Ok(())) => warn!("operator api exited"),
            Ok(Err(e)) => error!("operator api failed: {e:#}"),
            Err(e) => error!("operator api task failed: {e}"),
        },
    }

    shutdown.cancel();
    fleet.shutdown().await;
    if !web_task.is_finished() {
        match web_task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("operator api failed: {e:#}"),
            Err(e) => error!("operator api task failed: {e}"),
        }
    }

    Ok(())
}
