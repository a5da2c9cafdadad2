//! Prometheus metrics handler

use crate::domain::shared::{MeshError, Result};
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use metrics::{describe_counter, describe_gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Install the Prometheus recorder as the global metrics recorder
pub fn init_metrics() -> Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| MeshError::Internal(format!("metrics recorder: {}", e)))?;

    describe_metrics();
    Ok(handle)
}

fn describe_metrics() {
    describe_gauge!("relay_active_rooms", "Number of rooms with at least one member");
    describe_gauge!("relay_participants", "Number of participants across all rooms");
    describe_counter!("relay_joins_total", "Total number of room joins");
    describe_counter!("relay_leaves_total", "Total number of room leaves");
    describe_counter!(
        "relay_messages_total",
        "Point-to-point messages by kind and outcome (delivered or dropped)"
    );
    describe_counter!("relay_chat_messages_total", "Total number of chat broadcasts");
    describe_counter!(
        "relay_parse_errors_total",
        "Frames from clients that could not be parsed"
    );
}

/// HTTP metrics handler
pub async fn metrics_handler(State(prometheus_handle): State<PrometheusHandle>) -> Response {
    (StatusCode::OK, prometheus_handle.render()).into_response()
}
