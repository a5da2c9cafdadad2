//! Interface layer - External interfaces
//!
//! This layer handles:
//! - The signaling WebSocket endpoint
//! - Health and Prometheus metrics endpoints

pub mod api;
