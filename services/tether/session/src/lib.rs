//! Proxy-tunneled WebSocket sessions for tether.
//!
//! This crate keeps one authenticated, heartbeating WebSocket connection alive
//! per session key (identity + proxy) and reconnects with exponential backoff
//! when it drops.
//!
//! ## Components
//!
//! - **Proxy resolution**: descriptor normalization, classification, and a
//!   reachability probe through the proxy
//! - **Transport**: TCP, SOCKS5 / HTTP CONNECT tunnels, TLS and WebSocket upgrade
//! - **Handshake**: AUTH challenge / response
//! - **Keepalive**: PING probes with missed-PONG tracking
//! - **Reconnect**: attempt accounting and backoff delays
//! - **Session actor**: the per-key state machine
//! - **Supervisor**: one actor per key, status stream, shutdown
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tether_session::{
//!     plan_sessions, ProxyDescriptor, ProxyMode, SessionConfig, SessionSupervisor,
//! };
//!
//! # async fn example() {
//! let config = SessionConfig::default();
//! let dialer = Arc::new(config.ws_dialer());
//! let mut supervisor = SessionSupervisor::new(Arc::new(config), dialer);
//!
//! let identities = vec!["user-1".to_string()];
//! let proxies = vec![ProxyDescriptor::new("10.0.0.1:1080")];
//! supervisor.spawn(plan_sessions(&identities, &proxies, ProxyMode::Proxied));
//!
//! supervisor.wait_settled().await;
//! println!("{}", supervisor.status_summary());
//!
//! // Runs until every session is exhausted
//! supervisor.run(std::future::pending::<()>()).await;
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod handshake;
pub mod keepalive;
pub mod manager;
pub mod proxy;
pub mod reconnect;
pub mod session;
pub mod transport;

// Re-export main types
pub use error::{Result, SessionError};
pub use handshake::{ClientProfile, Handshake};
pub use keepalive::{build_probe, HeartbeatMonitor, HeartbeatTick};
pub use manager::{plan_sessions, ProxyMode, SessionStatus, SessionSupervisor, StatusSummary};
pub use proxy::{
    ProxyDescriptor, ProxyEndpoint, ProxyIpInfo, ProxyProbe, ProxyScheme, TransportAgent,
};
pub use reconnect::{ReconnectCounter, ReconnectPolicy};
pub use session::{
    default_headers, SessionActor, SessionConfig, SessionEvent, SessionEventKind, SessionKey,
    SessionOutcome, SessionState,
};
pub use transport::{connect_tcp, open_tunnel, Dialer, IoStream, Transport, TransportConfig, WsDialer};
