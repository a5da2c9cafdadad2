//! Domain result type

use super::error::MeshError;

/// Standard result type for domain operations
pub type Result<T> = std::result::Result<T, MeshError>;
