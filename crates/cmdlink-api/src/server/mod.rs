//! HTTP server for the trigger and status consumer processes.

pub mod state;

pub use state::{ConsumerState, ServerState};

use std::future::Future;
use std::net::SocketAddr;

use axum::Router;
use axum::routing::{get, post};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use crate::auth::{AuthState, auth_middleware};
use crate::handlers::{basic, dispatch};

/// Maximum accepted request body (256 KB).
pub const MAX_REQUEST_BODY_SIZE: usize = 256 * 1024;

/// Router for the trigger process.
pub fn create_router(state: ServerState, auth: AuthState) -> Router {
    let protected_routes = Router::new()
        .route("/dispatch", post(dispatch::dispatch_handler))
        .route_layer(axum::middleware::from_fn_with_state(auth, auth_middleware));

    Router::new()
        .route("/health", get(basic::health_handler))
        .route("/health/live", get(basic::liveness_handler))
        .merge(protected_routes)
        .layer(RequestBodyLimitLayer::new(MAX_REQUEST_BODY_SIZE))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Router for the status consumer's health port.
pub fn create_consumer_router(state: ConsumerState) -> Router {
    Router::new()
        .route("/health", get(basic::consumer_health_handler))
        .route("/health/live", get(basic::liveness_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve `app` on `bind` until `shutdown` resolves.
pub async fn serve<F>(bind: SocketAddr, app: Router, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = tokio::net::TcpListener::bind(bind).await?;
    tracing::info!(addr = %listener.local_addr()?, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    tracing::info!("HTTP server stopped");
    Ok(())
}
