//! Wire frames for tether sessions.
//!
//! The relay endpoint speaks JSON text frames over a WebSocket. This crate
//! owns their shapes: building the AUTH response and PING probe, and
//! classifying inbound frames by their `action` tag.
//!
//! ## Frames
//!
//! ```text
//! peer -> client   {"id": "...", "action": "AUTH", ...}
//! client -> peer   {"id": "<challenge id>", "origin_action": "AUTH", "result": {...}}
//! client -> peer   {"id": "<uuid>", "version": "1.0.0", "action": "PING", "data": {}}
//! peer -> client   {"id": "...", "action": "PONG", ...}
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod frame;

// Re-export main types
pub use error::WireError;
pub use frame::{
    encode, parse_inbound, unix_timestamp, AuthResponse, AuthResult, InboundFrame, Ping,
    ACTION_AUTH, ACTION_PING, ACTION_PONG, PING_VERSION,
};
