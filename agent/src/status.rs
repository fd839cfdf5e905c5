//! Readiness endpoint. Reports ready once the agent has applied its initial
//! snapshot from the remote store.

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub fn router(ready: Arc<AtomicBool>) -> Router {
    Router::new().route("/ready", get(ready_handler)).with_state(ready)
}

async fn ready_handler(State(ready): State<Arc<AtomicBool>>) -> (StatusCode, &'static str) {
    if ready.load(Ordering::SeqCst) {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready")
    }
}

pub async fn serve(
    addr: SocketAddr,
    ready: Arc<AtomicBool>,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "status server listening");

    axum::serve(listener, router(ready))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
}
