//! Proxy descriptors and the pre-dial reachability probe.
//!
//! A descriptor is the opaque string read from the proxy list. It is
//! normalized once (no scheme means SOCKS5), classified into a dialing
//! strategy, and probed by fetching the address-echo endpoint through it
//! before any session traffic is attempted.

use crate::error::{Result, SessionError};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tracing::{debug, warn};

/// Sentinel descriptor used for direct (proxy-less) sessions
pub const DIRECT: &str = "direct";

/// Scheme assumed for descriptors that carry none
pub const DEFAULT_SCHEME: &str = "socks5";

/// Proxy descriptor, normalized at construction
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProxyDescriptor {
    raw: String,
    normalized: String,
}

impl ProxyDescriptor {
    /// Normalize a descriptor; `direct` stays the direct sentinel
    pub fn new(raw: impl Into<String>) -> Self {
        let raw = raw.into().trim().to_string();
        let normalized = if raw == DIRECT || raw.contains("://") {
            raw.clone()
        } else {
            format!("{}://{}", DEFAULT_SCHEME, raw)
        };
        Self { raw, normalized }
    }

    /// The direct sentinel
    pub fn direct() -> Self {
        Self::new(DIRECT)
    }

    /// Whether this is the direct sentinel
    pub fn is_direct(&self) -> bool {
        self.raw == DIRECT
    }

    /// Descriptor as given
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Descriptor with its scheme filled in
    pub fn url(&self) -> &str {
        &self.normalized
    }

    /// Decide the dialing strategy for this descriptor
    pub fn classify(&self) -> Result<TransportAgent> {
        if self.is_direct() {
            return Ok(TransportAgent::Direct);
        }

        let url = Url::parse(&self.normalized)
            .map_err(|e| SessionError::InvalidProxy(format!("{}: {}", self.raw, e)))?;

        let scheme = match url.scheme() {
            "socks5" | "socks5h" => ProxyScheme::Socks5,
            "http" => ProxyScheme::Http,
            "https" => ProxyScheme::Https,
            other => {
                return Err(SessionError::InvalidProxy(format!(
                    "{}: unsupported scheme {}",
                    self.raw, other
                )))
            }
        };

        let host = url
            .host_str()
            .ok_or_else(|| SessionError::InvalidProxy(format!("{}: missing host", self.raw)))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();

        let port = url.port_or_known_default().ok_or_else(|| {
            SessionError::InvalidProxy(format!("{}: missing port", self.raw))
        })?;

        let username = Some(url.username())
            .filter(|u| !u.is_empty())
            .map(str::to_string);
        let password = url.password().map(str::to_string);

        Ok(TransportAgent::Proxy(ProxyEndpoint {
            scheme,
            host,
            port,
            username,
            password,
        }))
    }
}

impl fmt::Display for ProxyDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.raw)
    }
}

/// Forward proxy protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyScheme {
    /// SOCKS5 CONNECT
    Socks5,
    /// HTTP CONNECT over plain TCP
    Http,
    /// HTTP CONNECT over TLS to the proxy
    Https,
}

/// Where and how to reach a forward proxy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyEndpoint {
    /// Proxy protocol
    pub scheme: ProxyScheme,
    /// Proxy host
    pub host: String,
    /// Proxy port
    pub port: u16,
    /// Optional username
    pub username: Option<String>,
    /// Optional password
    pub password: Option<String>,
}

impl ProxyEndpoint {
    /// Whether credentials were supplied
    pub fn has_credentials(&self) -> bool {
        self.username.is_some()
    }
}

/// Transport-layer dialing strategy
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportAgent {
    /// Connect straight to the target
    Direct,
    /// Tunnel through a forward proxy
    Proxy(ProxyEndpoint),
}

/// Body of the address-echo endpoint
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyIpInfo {
    /// Egress address
    #[serde(default)]
    pub ip: Option<String>,
    /// City
    #[serde(default)]
    pub city: Option<String>,
    /// Region
    #[serde(default)]
    pub region: Option<String>,
    /// Country code
    #[serde(default)]
    pub country: Option<String>,
    /// Network operator
    #[serde(default)]
    pub org: Option<String>,
}

impl ProxyIpInfo {
    /// Marker used for direct sessions, which are never probed
    pub fn direct() -> Self {
        Self {
            ip: Some("Direct IP".to_string()),
            ..Default::default()
        }
    }
}

impl fmt::Display for ProxyIpInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.ip.as_deref().unwrap_or("unknown"))?;
        let place: Vec<&str> = [&self.city, &self.region, &self.country]
            .into_iter()
            .filter_map(|p| p.as_deref())
            .collect();
        if !place.is_empty() {
            write!(f, " ({})", place.join(", "))?;
        }
        if let Some(org) = &self.org {
            write!(f, " [{}]", org)?;
        }
        Ok(())
    }
}

/// Out-of-band reachability probe through a proxy
#[derive(Debug, Clone)]
pub struct ProxyProbe {
    ip_check_url: String,
    timeout: Duration,
}

impl ProxyProbe {
    /// Probe `ip_check_url`, giving up after `timeout`
    pub fn new(ip_check_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            ip_check_url: ip_check_url.into(),
            timeout,
        }
    }

    /// Resolve a descriptor into its egress info, or fail as unreachable.
    ///
    /// Direct descriptors are not probed.
    pub async fn resolve(&self, descriptor: &ProxyDescriptor) -> Result<ProxyIpInfo> {
        if descriptor.is_direct() {
            return Ok(ProxyIpInfo::direct());
        }

        // Reject descriptors the dialer could not use anyway
        descriptor.classify()?;

        let unreachable = |reason: String| SessionError::ProxyUnreachable {
            proxy: descriptor.to_string(),
            reason,
        };

        let proxy = reqwest::Proxy::all(descriptor.url()).map_err(|e| unreachable(e.to_string()))?;
        let client = reqwest::Client::builder()
            .proxy(proxy)
            .timeout(self.timeout)
            .build()
            .map_err(|e| unreachable(format!("failed to create HTTP client: {}", e)))?;

        debug!(proxy = %descriptor, url = %self.ip_check_url, "Probing proxy");

        let response = client
            .get(&self.ip_check_url)
            .send()
            .await
            .map_err(|e| unreachable(e.to_string()))?;

        if !response.status().is_success() {
            warn!(proxy = %descriptor, status = %response.status(), "Proxy probe rejected");
            return Err(unreachable(format!("unexpected status {}", response.status())));
        }

        response
            .json::<ProxyIpInfo>()
            .await
            .map_err(|e| unreachable(format!("bad probe response: {}", e)))
    }
}
