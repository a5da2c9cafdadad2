//! API interface implementations

pub mod health;
pub mod metrics_handler;
pub mod router;
pub mod signaling_ws;

pub use health::HealthStatus;
pub use metrics_handler::init_metrics;
pub use router::build_router;
pub use signaling_ws::signaling_router;
