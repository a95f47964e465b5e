//! HTTP API server
//!
//! Exposes liveness, readiness, and Prometheus metrics on a configurable
//! port. The server shares only the database pool with the control loop;
//! conversation state never crosses the thread boundary.

pub mod health;
pub mod metrics;

use std::sync::Arc;

use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::store::DbPool;
use crate::{Error, Result};

pub use metrics::Stage;

/// Shared state for API handlers
pub struct ApiState {
    /// Store pool, present when persistence is enabled
    pub db: Option<DbPool>,

    /// Whether voice I/O came up at startup
    pub voice_enabled: bool,

    /// Handle for rendering the metrics endpoint
    pub metrics: PrometheusHandle,
}

/// Build the full API router
#[must_use]
pub fn router(state: Arc<ApiState>) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any);

    health::router(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

/// Bind and serve the API until the process exits
///
/// # Errors
///
/// Returns error if the port cannot be bound
pub async fn serve(state: Arc<ApiState>, port: u16) -> Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .map_err(|e| Error::Api(format!("failed to bind port {port}: {e}")))?;

    let addr = listener
        .local_addr()
        .map_err(|e| Error::Api(e.to_string()))?;
    tracing::info!(%addr, "api server listening");

    axum::serve(listener, router(state))
        .await
        .map_err(|e| Error::Api(e.to_string()))?;

    Ok(())
}
