use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::Result;
use sqlx::postgres::PgPoolOptions;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use towersync_common::Config;
use towersync_worker::{listener, web, Metrics};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("towersync=info".parse()?))
        .init();

    info!("Starting catalog snapshot persister");
    let config = Config::from_env();
    config.log_redacted();

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url())
        .await?;
    towersync_models::run_migrations(&pool).await?;
    info!("Connected to database");

    let metrics = Arc::new(Metrics::new()?);
    let ready = Arc::new(AtomicBool::new(false));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Signal handling: stop taking new jobs, let in-flight ones finish.
    tokio::spawn({
        let shutdown_tx = shutdown_tx.clone();
        async move {
            let mut sigterm = signal(SignalKind::terminate()).expect("signal handler");
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
            info!("Shutdown signal received");
            let _ = shutdown_tx.send(true);
        }
    });

    let web_server = tokio::spawn(web::serve(
        web::health_router(ready.clone()),
        config.web_port,
        shutdown_rx.clone(),
    ));
    let metrics_server = tokio::spawn(web::serve(
        web::metrics_router(metrics.registry.clone()),
        config.metrics_port,
        shutdown_rx.clone(),
    ));

    listener::run(&config, pool, metrics, ready, shutdown_rx).await?;

    for server in [web_server, metrics_server] {
        match server.await {
            Ok(Err(e)) => warn!(error = %e, "HTTP server exited with error"),
            Err(e) => warn!(error = %e, "HTTP server task panicked"),
            Ok(Ok(())) => {}
        }
    }

    info!("Persister finished");
    Ok(())
}
