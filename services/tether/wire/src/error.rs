//! Wire protocol error types.

use thiserror::Error;

/// Wire protocol errors
#[derive(Error, Debug)]
pub enum WireError {
    /// Inbound payload is not valid JSON
    #[error("malformed frame: {0}")]
    Malformed(#[source] serde_json::Error),

    /// Inbound payload is JSON but not an object
    #[error("frame is not a JSON object")]
    NotAnObject,

    /// Inbound object carries no string `action` field
    #[error("frame has no action")]
    MissingAction,

    /// Outbound frame could not be serialized
    #[error("frame encode failed: {0}")]
    Encode(#[source] serde_json::Error),
}
