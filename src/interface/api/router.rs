//! API Router configuration

use super::health::health_check;
use super::metrics_handler::metrics_handler;
use super::signaling_ws::signaling_router;
use crate::domain::relay::SignalingRelay;
use axum::{routing::get, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Build the relay's HTTP router
pub fn build_router(relay: Arc<SignalingRelay>, prometheus_handle: PrometheusHandle) -> Router {
    let health_routes = Router::new()
        .route("/health", get(health_check))
        .with_state(relay.clone());

    // Metrics route (separate state)
    let metrics_routes = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(prometheus_handle);

    Router::new()
        .merge(health_routes)
        .merge(metrics_routes)
        .merge(signaling_router(relay))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}
