//! Shared kernel - Common types used by both the relay and the client side

pub mod error;
pub mod result;
pub mod value_objects;

pub use error::MeshError;
pub use result::Result;
pub use value_objects::*;
