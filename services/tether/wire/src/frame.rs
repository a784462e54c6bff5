//! JSON frames exchanged with the relay endpoint.
//!
//! Outbound there are two shapes: the AUTH response sent after the peer
//! challenges us, and the PING liveness probe. Inbound frames are classified
//! by their `action` tag only; everything else in them is opaque.

use crate::error::WireError;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Action tag of the challenge / response pair
pub const ACTION_AUTH: &str = "AUTH";
/// Action tag of the liveness probe
pub const ACTION_PING: &str = "PING";
/// Action tag of the liveness echo
pub const ACTION_PONG: &str = "PONG";
/// Version carried by PING frames
pub const PING_VERSION: &str = "1.0.0";

/// Payload of the AUTH response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthResult {
    /// Random identifier scoped to one connection
    pub browser_id: String,
    /// Identity being authenticated
    pub user_id: String,
    /// Client identity string
    pub user_agent: String,
    /// Unix timestamp in seconds
    pub timestamp: u64,
    /// Device type tag
    pub device_type: String,
    /// Client version tag
    pub version: String,
}

/// AUTH response frame, answers one challenge by echoing its id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthResponse {
    /// Id of the challenge being answered
    pub id: String,
    /// Always `AUTH`
    pub origin_action: String,
    /// Handshake fields
    pub result: AuthResult,
}

impl AuthResponse {
    /// Build a response to challenge `challenge_id`
    pub fn new(challenge_id: impl Into<String>, result: AuthResult) -> Self {
        Self {
            id: challenge_id.into(),
            origin_action: ACTION_AUTH.to_string(),
            result,
        }
    }
}

/// PING liveness probe
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ping {
    /// Fresh random message id
    pub id: String,
    /// Probe version tag
    pub version: String,
    /// Always `PING`
    pub action: String,
    /// Empty object
    pub data: serde_json::Map<String, serde_json::Value>,
}

impl Ping {
    /// Build a probe with a fresh random id
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            version: PING_VERSION.to_string(),
            action: ACTION_PING.to_string(),
            data: serde_json::Map::new(),
        }
    }
}

impl Default for Ping {
    fn default() -> Self {
        Self::new()
    }
}

/// Classified inbound frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    /// Peer asks us to authenticate
    AuthChallenge {
        /// Challenge id, echoed back in the response
        id: String,
    },
    /// Answer to one of our probes
    LivenessEcho {
        /// Message id, if present
        id: Option<String>,
    },
    /// Any other action; ignored by the session
    Unrecognized {
        /// The unknown action tag
        action: String,
    },
}

/// Classify one inbound text frame
pub fn parse_inbound(raw: &str) -> Result<InboundFrame, WireError> {
    let value: serde_json::Value = serde_json::from_str(raw).map_err(WireError::Malformed)?;
    let object = value.as_object().ok_or(WireError::NotAnObject)?;

    let action = match object.get("action") {
        Some(serde_json::Value::String(action)) => action.clone(),
        _ => return Err(WireError::MissingAction),
    };

    // Ids are usually strings but some peers send numbers
    let id = object.get("id").and_then(|v| match v {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Null => None,
        other => Some(other.to_string()),
    });

    Ok(match action.as_str() {
        ACTION_AUTH => InboundFrame::AuthChallenge {
            id: id.unwrap_or_default(),
        },
        ACTION_PONG => InboundFrame::LivenessEcho { id },
        _ => InboundFrame::Unrecognized { action },
    })
}

/// Encode an outbound frame as JSON text
pub fn encode<T: Serialize>(frame: &T) -> Result<String, WireError> {
    serde_json::to_string(frame).map_err(WireError::Encode)
}

/// Current Unix time in seconds
pub fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
