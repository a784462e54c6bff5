//! AUTH handshake for tether sessions.
//!
//! The relay opens with an AUTH challenge; the client answers with its
//! identity and a fixed client profile. A session may be challenged again at
//! any time and answers each challenge the same way.

use crate::error::Result;
use tether_wire::{encode, unix_timestamp, AuthResponse, AuthResult};
use tracing::debug;
use uuid::Uuid;

/// Fixed client profile reported in AUTH responses
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientProfile {
    /// Client identity string
    pub user_agent: String,
    /// Device type tag
    pub device_type: String,
    /// Client version tag
    pub version: String,
}

impl Default for ClientProfile {
    fn default() -> Self {
        Self {
            user_agent: "Mozilla/5.0".to_string(),
            device_type: "desktop".to_string(),
            version: "4.28.2".to_string(),
        }
    }
}

/// Handshake state for one connection
#[derive(Debug, Clone)]
pub struct Handshake {
    identity: String,
    browser_id: String,
    profile: ClientProfile,
}

impl Handshake {
    /// Start a handshake for `identity`; the browser id is fixed per connection
    pub fn new(identity: impl Into<String>, profile: ClientProfile) -> Self {
        Self {
            identity: identity.into(),
            browser_id: Uuid::new_v4().to_string(),
            profile,
        }
    }

    /// Browser id used by this connection
    pub fn browser_id(&self) -> &str {
        &self.browser_id
    }

    /// Build the response frame for challenge `challenge_id`
    pub fn response(&self, challenge_id: &str) -> AuthResponse {
        AuthResponse::new(
            challenge_id,
            AuthResult {
                browser_id: self.browser_id.clone(),
                user_id: self.identity.clone(),
                user_agent: self.profile.user_agent.clone(),
                timestamp: unix_timestamp(),
                device_type: self.profile.device_type.clone(),
                version: self.profile.version.clone(),
            },
        )
    }

    /// Encode the response to challenge `challenge_id`
    pub fn auth_response(&self, challenge_id: &str) -> Result<String> {
        let text = encode(&self.response(challenge_id))?;
        debug!(challenge = %challenge_id, browser_id = %self.browser_id, "Built AUTH response");
        Ok(text)
    }
}
