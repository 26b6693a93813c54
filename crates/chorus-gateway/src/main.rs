use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::watch;
use tracing::info;

mod app;
mod http;
mod ws;

#[derive(Parser)]
#[command(name = "chorus-gateway", about = "Chorus conversation platform gateway")]
struct Cli {
    /// Path to chorus.toml (defaults to ~/.chorus/chorus.toml).
    #[arg(long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "chorus_gateway=info,tower_http=warn".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = chorus_core::ChorusConfig::load(cli.config.as_deref()).unwrap_or_else(|e| {
        tracing::warn!("config load failed ({e}), using defaults");
        chorus_core::ChorusConfig::default()
    });

    let bind = config.gateway.bind.clone();
    let port = config.gateway.port;
    let state = Arc::new(app::AppState::new(config));

    // Background loops share one shutdown signal; each finishes its
    // in-flight iteration and exits.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = Vec::new();
    tasks.push(tokio::spawn(
        state.presence.clone().run_monitor(shutdown_rx.clone()),
    ));
    tasks.push(tokio::spawn(
        state.caches.clone().run_sweeper(shutdown_rx.clone()),
    ));
    tasks.push(tokio::spawn(
        state.optimizer.clone().run_flusher(shutdown_rx.clone()),
    ));
    tasks.push(tokio::spawn(
        state.storage.clone().run_reconnector(shutdown_rx.clone()),
    ));
    tasks.extend(state.integrator.start(shutdown_rx.clone()));

    let router = app::build_router(state.clone());
    let addr: SocketAddr = format!("{bind}:{port}").parse()?;
    info!("chorus gateway listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await?;

    // Stop the loops and give them a moment to wind down.
    let _ = shutdown_tx.send(true);
    for task in tasks {
        let _ = tokio::time::timeout(Duration::from_secs(5), task).await;
    }
    info!("chorus gateway stopped");
    Ok(())
}
