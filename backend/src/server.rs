use axum::{
    routing::{get, post},
    Router,
};
use tokio_util::sync::CancellationToken;
use tower_http::{compression::CompressionLayer, cors::CorsLayer, trace::TraceLayer};
use tracing::info;

use crate::api::handler::{
    cast_vote, close_poll, create_poll, get_poll, get_results, get_stats, get_vote, health_check,
    list_active_polls, list_inactive_polls, list_schemes, AppState,
};

pub fn create_app(state: AppState) -> Router {
    info!("⚙️ Setting up HTTP routes...");

    let app = Router::new()
        .route("/health", get(health_check))
        .nest(
            "/api/v1",
            Router::new()
                // Polls
                .route("/polls", post(create_poll))
                .route("/polls/active", get(list_active_polls))
                .route("/polls/inactive", get(list_inactive_polls))
                .route("/polls/:id", get(get_poll))
                .route("/polls/:id/results", get(get_results))
                .route("/polls/:id/close", post(close_poll))
                // Votes
                .route("/votes", post(cast_vote))
                .route("/votes/:id", get(get_vote))
                // Catalogue and stats
                .route("/schemes", get(list_schemes))
                .route("/stats", get(get_stats)),
        )
        .layer(CompressionLayer::new())
        .layer(CorsLayer::very_permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    info!("✓ HTTP routes configured");
    app
}

/// Serve until the shutdown token is cancelled, then drain open requests
pub async fn run_server(
    app: Router,
    bind_address: &str,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind_address).await?;
    info!("🌐 Server listening on: {}", bind_address);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    info!("✓ HTTP server stopped");
    Ok(())
}
