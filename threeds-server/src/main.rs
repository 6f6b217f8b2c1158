//! `threeds-server`: hosts the 3-D Secure orchestrator behind an HTTP API.
//!
//! The process owns one service context: both correlation stores and the orchestrator.
//! Every handler borrows it through axum state, and a background task sweeps
//! correlation records nobody consumed and transactions that finished long ago.

mod args;
mod routes;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use args::Args;
use clap::Parser;
use eyre::WrapErr;
use threeds_core::{
    logger::init_tracing, CorrelationStores, Orchestrator, ProtocolClient, TokenExClient,
};
use tokio::net::TcpListener;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> eyre::Result<()> {
    let args = Args::parse();
    init_tracing(&args.log_filter);

    let config = Arc::new(args.to_config()?);
    let stores = CorrelationStores::new();
    let client = TokenExClient::new(&config);
    let orchestrator = Arc::new(Orchestrator::new(
        client,
        Arc::clone(&config),
        stores,
    ));

    spawn_sweeper(
        Arc::clone(&orchestrator),
        config.correlation_ttl,
        args.sweep_interval(),
    );

    let app = routes::router(routes::AppState::new(orchestrator))?;
    let listener = TcpListener::bind(args.bind)
        .await
        .wrap_err_with(|| format!("failed to bind {}", args.bind))?;
    info!(
        bind = %args.bind,
        authentication_url = %config.authentication_url,
        challenge_notification_url = %config.challenge_notification_url,
        "threeds-server listening"
    );

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;
    Ok(())
}

fn spawn_sweeper<C: ProtocolClient + 'static>(
    orchestrator: Arc<Orchestrator<C>>,
    ttl: Duration,
    every: Duration,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        // first tick completes immediately
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let records = orchestrator.stores().expire_older_than(ttl);
            let transactions = orchestrator.expire_terminal_older_than(ttl);
            if records > 0 || transactions > 0 {
                info!(records, transactions, "swept stale correlation records and transactions");
            }
        }
    });
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(%err, "failed to listen for ctrl-c, shutting down");
    }
    info!("shutting down");
}
