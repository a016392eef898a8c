use crate::state::ControllerState;
use axum::{Router, extract::State, http::StatusCode, response::IntoResponse, routing::get};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub async fn readiness_probe(State(state): State<Arc<ControllerState>>) -> impl IntoResponse {
    if state.is_ready() {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

pub async fn liveness_probe() -> impl IntoResponse {
    StatusCode::NO_CONTENT
}

pub fn create_app(state: Arc<ControllerState>) -> Router {
    Router::new()
        .route("/health/live", get(liveness_probe))
        .route("/health/ready", get(readiness_probe))
        .with_state(state)
}

/// Serves the probes until `shutdown` is cancelled.
pub async fn serve(
    port: u16,
    state: Arc<ControllerState>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    info!("Starting webserver on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, create_app(state))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;
    info!("Webserver stopped");
    Ok(())
}
