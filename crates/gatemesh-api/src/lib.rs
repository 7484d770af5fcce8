//! gatemesh-api: the node's public HTTP surface.
//!
//! `/api/*` exposes overlay state as JSON. Every other path is gateway
//! traffic: [`relay::relay_or_serve`] either serves it through the local
//! backend or relays it to a less loaded peer. [`middleware::track_requests`]
//! wraps everything and feeds the metrics collector.

pub mod handlers;
pub mod middleware;
pub mod relay;

use std::net::SocketAddr;

use axum::routing::get;
use axum::Router;
use tokio::sync::broadcast;
use tower_http::cors::{Any, CorsLayer};

pub use handlers::ApiState;

pub fn router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_routes = Router::new()
        .route("/status", get(handlers::status::handle_status))
        .route("/peers", get(handlers::peers::handle_peers))
        .route(
            "/peers/{id}",
            get(handlers::peers::handle_peer_inspect).delete(handlers::peers::handle_peer_drop),
        )
        .route("/metrics", get(handlers::status::handle_metrics))
        .route("/scores", get(handlers::peers::handle_scores))
        .route("/select", get(handlers::peers::handle_select))
        .with_state(state.clone());

    let collector = state.collector.clone();
    Router::new()
        .nest("/api", api_routes)
        .fallback(relay::relay_or_serve)
        .with_state(state)
        .layer(cors)
        .layer(axum::middleware::from_fn_with_state(
            collector,
            middleware::track_requests,
        ))
}

pub async fn serve(state: ApiState, addr: SocketAddr, mut shutdown: broadcast::Receiver<()>) -> anyhow::Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "HTTP listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await?;
    Ok(())
}
