use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::http::dispatch::{dispatch_message, status_handler, AppState};
use crate::http::{MESSAGE_PATH, STATUS_PATH};

/// The node's HTTP surface: the cluster message endpoint plus read-only
/// status introspection.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route(MESSAGE_PATH, post(dispatch_message))
        .route(STATUS_PATH, get(status_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serves until the lifecycle token is cancelled, then drains in-flight
/// connections.
pub async fn serve(
    addr: SocketAddr,
    state: Arc<AppState>,
    lifecycle: CancellationToken,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    serve_with_listener(listener, state, lifecycle).await
}

/// `serve` with a listener the caller already bound.
pub async fn serve_with_listener(
    listener: tokio::net::TcpListener,
    state: Arc<AppState>,
    lifecycle: CancellationToken,
) -> std::io::Result<()> {
    let router = build_router(state);
    tracing::info!(addr = %listener.local_addr()?, "Cluster endpoint listening");

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { lifecycle.cancelled().await })
    .await
}
