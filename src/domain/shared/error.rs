//! Domain errors

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MeshError {
    /// Camera, microphone or display capture denied or unavailable
    #[error("Device acquisition failed: {0}")]
    DeviceAcquisition(String),

    /// Malformed or unexpected session description, or a message for an unknown link
    #[error("Negotiation error: {0}")]
    Negotiation(String),

    /// The channel to the relay is gone; the session must be rejoined
    #[error("Transport disconnected")]
    TransportDisconnected,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Room {room_id} is full ({capacity} participants)")]
    RoomFull { room_id: String, capacity: usize },

    /// The relay answered a join with an `error` frame
    #[error("Join rejected ({code}): {message}")]
    JoinRejected { code: String, message: String },

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl MeshError {
    /// Stable code sent to clients in `error` messages
    pub fn code(&self) -> &'static str {
        match self {
            MeshError::DeviceAcquisition(_) => "DEVICE_ACQUISITION",
            MeshError::Negotiation(_) => "NEGOTIATION",
            MeshError::TransportDisconnected => "TRANSPORT_DISCONNECTED",
            MeshError::Transport(_) => "TRANSPORT",
            MeshError::RoomFull { .. } => "ROOM_FULL",
            MeshError::JoinRejected { .. } => "JOIN_REJECTED",
            MeshError::InvalidState(_) => "INVALID_STATE",
            MeshError::Config(_) => "CONFIG",
            MeshError::Internal(_) => "INTERNAL",
        }
    }
}

impl From<webrtc::Error> for MeshError {
    fn from(err: webrtc::Error) -> Self {
        MeshError::Negotiation(err.to_string())
    }
}

impl From<config::ConfigError> for MeshError {
    fn from(err: config::ConfigError) -> Self {
        MeshError::Config(err.to_string())
    }
}
