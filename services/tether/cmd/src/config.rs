//! Configuration handling for the tether binary.
//!
//! Settings come from three layers: built-in defaults, an optional YAML file
//! (root key `tether:`), and `TETHER_*` environment variables. Command-line
//! flags are applied on top by `main`.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tether_session::{ClientProfile, ReconnectPolicy, SessionConfig};
use tracing::{info, warn};

/// Tether runtime configuration
#[derive(Debug, Clone, PartialEq)]
pub struct TetherConfig {
    /// Relay WebSocket URL
    pub endpoint: String,
    /// Address-echo URL used to probe proxies
    pub ip_check_url: String,
    /// Interval between PING probes
    pub ping_interval: Duration,
    /// Firings without PONG before a connection is dropped
    pub max_missed_pongs: u32,
    /// First backoff delay
    pub base_retry_delay: Duration,
    /// Attempts per session before giving up
    pub max_reconnect_attempts: u32,
    /// Proxy probe timeout
    pub probe_timeout: Duration,
    /// Dial + upgrade timeout
    pub connect_timeout: Duration,
    /// Wait for the first AUTH challenge
    pub handshake_timeout: Duration,
    /// `user_agent` reported in AUTH responses
    pub user_agent: String,
    /// `device_type` reported in AUTH responses
    pub device_type: String,
    /// `version` reported in AUTH responses
    pub client_version: String,
    /// Headers on the WebSocket upgrade
    pub headers: Vec<(String, String)>,
}

impl Default for TetherConfig {
    fn default() -> Self {
        let session = SessionConfig::default();
        Self {
            endpoint: session.endpoint,
            ip_check_url: session.ip_check_url,
            ping_interval: session.ping_interval,
            max_missed_pongs: session.max_missed_pongs,
            base_retry_delay: session.reconnect.base_delay,
            max_reconnect_attempts: session.reconnect.max_attempts,
            probe_timeout: session.probe_timeout,
            connect_timeout: session.connect_timeout,
            handshake_timeout: session.handshake_timeout,
            user_agent: session.profile.user_agent,
            device_type: session.profile.device_type,
            client_version: session.profile.version,
            headers: session.headers,
        }
    }
}

/// Root configuration structure (matches the YAML structure)
#[derive(Debug, Deserialize)]
struct RootConfig {
    tether: Option<FileConfig>,
}

#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    endpoint: Option<String>,
    ip_check_url: Option<String>,
    ping_interval_secs: Option<u64>,
    max_missed_pongs: Option<u32>,
    base_retry_delay_ms: Option<u64>,
    max_reconnect_attempts: Option<u32>,
    probe_timeout_secs: Option<u64>,
    connect_timeout_secs: Option<u64>,
    handshake_timeout_secs: Option<u64>,
    user_agent: Option<String>,
    device_type: Option<String>,
    client_version: Option<String>,
    headers: Option<BTreeMap<String, String>>,
}

impl TetherConfig {
    /// Load configuration from file and environment variables.
    ///
    /// A missing file keeps the defaults; a file that exists but does not
    /// parse is an error.
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let path = config_path.as_ref();
        let mut config = Self::default();

        match std::fs::read_to_string(path) {
            Ok(content) => {
                let root: RootConfig = serde_yaml::from_str(&content)
                    .with_context(|| format!("Failed to parse config file {:?}", path))?;
                if let Some(file) = root.tether {
                    config.apply_file_config(file);
                }
                info!("Loaded configuration from {:?}", path);
            }
            Err(e) => warn!("Config file {:?} not readable ({}), using defaults", path, e),
        }

        config.apply_environment_overrides();
        Ok(config)
    }

    fn apply_file_config(&mut self, file: FileConfig) {
        if let Some(endpoint) = file.endpoint {
            self.endpoint = endpoint;
        }
        if let Some(url) = file.ip_check_url {
            self.ip_check_url = url;
        }
        if let Some(secs) = file.ping_interval_secs {
            self.ping_interval = Duration::from_secs(secs);
        }
        if let Some(missed) = file.max_missed_pongs {
            self.max_missed_pongs = missed;
        }
        if let Some(ms) = file.base_retry_delay_ms {
            self.base_retry_delay = Duration::from_millis(ms);
        }
        if let Some(attempts) = file.max_reconnect_attempts {
            self.max_reconnect_attempts = attempts;
        }
        if let Some(secs) = file.probe_timeout_secs {
            self.probe_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = file.connect_timeout_secs {
            self.connect_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = file.handshake_timeout_secs {
            self.handshake_timeout = Duration::from_secs(secs);
        }
        if let Some(user_agent) = file.user_agent {
            self.user_agent = user_agent;
        }
        if let Some(device_type) = file.device_type {
            self.device_type = device_type;
        }
        if let Some(version) = file.client_version {
            self.client_version = version;
        }
        for (name, value) in file.headers.unwrap_or_default() {
            self.set_header(name, value);
        }
    }

    /// Replace a header by case-insensitive name, or append it
    pub fn set_header(&mut self, name: String, value: String) {
        match self
            .headers
            .iter_mut()
            .find(|(existing, _)| existing.eq_ignore_ascii_case(&name))
        {
            Some(header) => header.1 = value,
            None => self.headers.push((name, value)),
        }
    }

    /// Apply environment variable overrides
    fn apply_environment_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(endpoint) = lookup("TETHER_ENDPOINT") {
            info!("Endpoint overridden by environment: {}", endpoint);
            self.endpoint = endpoint;
        }

        if let Some(url) = lookup("TETHER_IP_CHECK_URL") {
            info!("IP check URL overridden by environment: {}", url);
            self.ip_check_url = url;
        }

        if let Some(value) = lookup("TETHER_PING_INTERVAL_SECS") {
            match value.parse::<u64>() {
                Ok(secs) => {
                    self.ping_interval = Duration::from_secs(secs);
                    info!("Ping interval overridden by environment: {}s", secs);
                }
                Err(_) => warn!("Ignoring invalid TETHER_PING_INTERVAL_SECS={:?}", value),
            }
        }

        if let Some(value) = lookup("TETHER_MAX_RECONNECT_ATTEMPTS") {
            match value.parse::<u32>() {
                Ok(attempts) => {
                    self.max_reconnect_attempts = attempts;
                    info!("Max reconnect attempts overridden by environment: {}", attempts);
                }
                Err(_) => warn!("Ignoring invalid TETHER_MAX_RECONNECT_ATTEMPTS={:?}", value),
            }
        }
    }

    /// Reject settings no session could run with
    pub fn validate(&self) -> Result<()> {
        if !(self.endpoint.starts_with("ws://") || self.endpoint.starts_with("wss://")) {
            bail!("endpoint must be a ws:// or wss:// URL, got {:?}", self.endpoint);
        }
        if self.ping_interval.is_zero() {
            bail!("ping interval must be greater than zero");
        }
        if self.max_missed_pongs == 0 {
            bail!("max_missed_pongs must be at least 1");
        }
        if self.max_reconnect_attempts == 0 {
            bail!("max_reconnect_attempts must be at least 1");
        }
        Ok(())
    }

    /// Session settings derived from this configuration
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            endpoint: self.endpoint.clone(),
            headers: self.headers.clone(),
            ip_check_url: self.ip_check_url.clone(),
            probe_timeout: self.probe_timeout,
            connect_timeout: self.connect_timeout,
            handshake_timeout: self.handshake_timeout,
            ping_interval: self.ping_interval,
            max_missed_pongs: self.max_missed_pongs,
            reconnect: ReconnectPolicy {
                base_delay: self.base_retry_delay,
                max_attempts: self.max_reconnect_attempts,
            },
            profile: ClientProfile {
                user_agent: self.user_agent.clone(),
                device_type: self.device_type.clone(),
                version: self.client_version.clone(),
            },
        }
    }
}
