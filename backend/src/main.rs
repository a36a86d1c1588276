mod api;
mod bootstrap;
mod config;
mod context;
mod error;
mod gateway;
mod ledger;
mod middleware;
mod polls;
mod repayment;
mod server;
mod settlement;
mod votes;

#[cfg(test)]
mod testing;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

// Initialize logging and tracing
fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "info,tower_http=debug,poll_backend=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Cancel the root token on Ctrl-C or SIGTERM
fn watch_signals(shutdown: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for Ctrl-C: {}", e);
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                }
                Err(e) => {
                    error!("Failed to listen for SIGTERM: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };
        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {}
            _ = terminate => {}
        }

        info!("🛑 Shutdown requested");
        shutdown.cancel();
    });
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    info!("🚀 Starting Lightning poll backend");

    let config = config::Config::from_env().context("invalid configuration")?;

    let shutdown = CancellationToken::new();
    watch_signals(shutdown.clone());

    let (state, background) = bootstrap::initialize_app_state(&config, shutdown.clone())
        .await
        .context("failed to initialize application")?;

    let app = server::create_app(state);
    let served = server::run_server(app, &config.bind_address, shutdown.clone()).await;

    // stop the loops even when the listener failed
    shutdown.cancel();
    for handle in background {
        if let Err(e) = handle.await {
            error!("Background task ended abnormally: {}", e);
        }
    }

    served?;
    info!("👋 Shut down cleanly");
    Ok(())
}
