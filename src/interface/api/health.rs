//! Health endpoint

use crate::domain::relay::SignalingRelay;
use axum::{extract::State, Json};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Serialize)]
pub struct HealthStatus {
    pub status: &'static str,
    pub rooms: usize,
    pub participants: usize,
    pub timestamp: DateTime<Utc>,
}

pub async fn health_check(State(relay): State<Arc<SignalingRelay>>) -> Json<HealthStatus> {
    Json(HealthStatus {
        status: "ok",
        rooms: relay.room_count().await,
        participants: relay.participant_count(),
        timestamp: Utc::now(),
    })
}
