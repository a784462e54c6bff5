//! Per-key session actor.
//!
//! One [`SessionActor`] owns the whole lifecycle of one [`SessionKey`]: it
//! probes the proxy, dials, answers the AUTH challenge, keeps the connection
//! alive with PING probes, and on failure backs off and dials again until its
//! reconnect budget is used up. The actor owns its state, reconnect counter
//! and heartbeat timer; it only talks to the outside through the event
//! channel and the shutdown signal.

use crate::error::SessionError;
use crate::handshake::{ClientProfile, Handshake};
use crate::keepalive::{build_probe, HeartbeatMonitor, HeartbeatTick};
use crate::proxy::{ProxyDescriptor, ProxyIpInfo, ProxyProbe};
use crate::reconnect::{ReconnectCounter, ReconnectPolicy};
use crate::transport::{Dialer, Transport, TransportConfig, WsDialer};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tether_wire::{parse_inbound, InboundFrame};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// Bound on transport teardown, graceful or forced
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Identity of one session: who authenticates, and through which proxy
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionKey {
    /// Identity sent as `user_id`
    pub identity: String,
    /// Proxy descriptor, or the direct sentinel
    pub proxy: ProxyDescriptor,
}

impl SessionKey {
    /// Key for `identity` through `proxy`
    pub fn new(identity: impl Into<String>, proxy: ProxyDescriptor) -> Self {
        Self {
            identity: identity.into(),
            proxy,
        }
    }

    /// Key for a direct session
    pub fn direct(identity: impl Into<String>) -> Self {
        Self::new(identity, ProxyDescriptor::direct())
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.identity, self.proxy)
    }
}

/// Lifecycle state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Probing the proxy and opening the transport
    Dialing,
    /// Transport open, waiting for the AUTH challenge
    Handshaking,
    /// Authenticated and heartbeating
    Active,
    /// Active, but a probe went a full interval unanswered
    Degraded,
    /// Tearing down the transport
    Closing,
    /// Waiting before the next dial
    Backoff,
    /// Reconnect budget used up; terminal
    Exhausted,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Dialing => "dialing",
            SessionState::Handshaking => "handshaking",
            SessionState::Active => "active",
            SessionState::Degraded => "degraded",
            SessionState::Closing => "closing",
            SessionState::Backoff => "backoff",
            SessionState::Exhausted => "exhausted",
        };
        f.write_str(name)
    }
}

/// Configuration shared by all session actors
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Relay WebSocket URL
    pub endpoint: String,
    /// Headers sent on the WebSocket upgrade
    pub headers: Vec<(String, String)>,
    /// Address-echo URL used to probe proxies
    pub ip_check_url: String,
    /// Bound on the proxy probe
    pub probe_timeout: Duration,
    /// Bound on dial + upgrade
    pub connect_timeout: Duration,
    /// Bound on the wait for the first AUTH challenge
    pub handshake_timeout: Duration,
    /// Interval between PING probes
    pub ping_interval: Duration,
    /// Firings without PONG before the connection is dropped
    pub max_missed_pongs: u32,
    /// Backoff parameters
    pub reconnect: ReconnectPolicy,
    /// Fields reported in AUTH responses
    pub profile: ClientProfile,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            endpoint: "wss://proxy.wynd.network:80".to_string(),
            headers: default_headers(),
            ip_check_url: "https://ipinfo.io/json".to_string(),
            probe_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(60),
            ping_interval: Duration::from_secs(26),
            max_missed_pongs: 3,
            reconnect: ReconnectPolicy::default(),
            profile: ClientProfile::default(),
        }
    }
}

impl SessionConfig {
    /// Network dialer for this configuration
    pub fn ws_dialer(&self) -> WsDialer {
        WsDialer::new(
            TransportConfig {
                endpoint: self.endpoint.clone(),
                headers: self.headers.clone(),
                connect_timeout: self.connect_timeout,
            },
            ProxyProbe::new(self.ip_check_url.clone(), self.probe_timeout),
        )
    }
}

/// Browser-like headers for the WebSocket upgrade
pub fn default_headers() -> Vec<(String, String)> {
    [
        (
            "User-Agent",
            "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:92.0) Gecko/20100101 Firefox/92.0",
        ),
        ("Pragma", "no-cache"),
        ("Accept-Language", "uk-UA,uk;q=0.9,en-US;q=0.8,en;q=0.7"),
        ("Cache-Control", "no-cache"),
        ("OS", "Windows"),
        ("Platform", "Desktop"),
        ("Browser", "Mozilla"),
    ]
    .into_iter()
    .map(|(name, value)| (name.to_string(), value.to_string()))
    .collect()
}

/// Status report from one actor
#[derive(Debug, Clone)]
pub struct SessionEvent {
    /// Reporting session
    pub key: SessionKey,
    /// What happened
    pub kind: SessionEventKind,
}

/// Kinds of session status reports
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEventKind {
    /// State transition
    StateChanged(SessionState),
    /// Transport open; egress info from the probe
    Connected(ProxyIpInfo),
    /// Probe failed; no attempt was consumed
    ProxyUnreachable(String),
    /// AUTH response sent
    AuthSent,
    /// PING probe sent
    PingSent,
    /// PONG received
    PongReceived,
    /// Probes unanswered; carries the missed counter
    Degraded(u32),
    /// Next dial scheduled
    ReconnectScheduled {
        /// Attempt count after this failure
        attempt: u32,
        /// Wait before dialing
        delay: Duration,
    },
    /// Gave up; carries the attempt count
    Exhausted(u32),
    /// Shut down on request
    Stopped,
}

/// Terminal result of an actor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    /// Reconnect budget used up
    Exhausted {
        /// Attempts recorded
        attempts: u32,
    },
    /// Stopped by the shutdown signal
    Stopped,
}

/// How one connection attempt ended
enum Exit {
    Stopped,
    Failed(SessionError),
}

/// Resolve once shutdown is requested, or the supervisor is gone
pub async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// State machine for one session key
pub struct SessionActor {
    key: SessionKey,
    config: Arc<SessionConfig>,
    dialer: Arc<dyn Dialer>,
    events: mpsc::UnboundedSender<SessionEvent>,
    shutdown: watch::Receiver<bool>,
    state: SessionState,
    counter: ReconnectCounter,
}

impl SessionActor {
    /// Create an actor; nothing happens until [`SessionActor::run`]
    pub fn new(
        key: SessionKey,
        config: Arc<SessionConfig>,
        dialer: Arc<dyn Dialer>,
        events: mpsc::UnboundedSender<SessionEvent>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let counter = config.reconnect.counter();
        Self {
            key,
            config,
            dialer,
            events,
            shutdown,
            state: SessionState::Dialing,
            counter,
        }
    }

    /// Key this actor serves
    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    /// Drive the session until it is exhausted or shut down
    pub async fn run(mut self) -> SessionOutcome {
        info!(session = %self.key, "Starting session");

        loop {
            self.transition(SessionState::Dialing);

            let failure = match self.connect_once().await {
                Exit::Stopped => return self.stopped(),
                Exit::Failed(e) => e,
            };

            if failure.is_fatal() {
                return self.abandoned(failure);
            }

            let delay = if failure.counts_toward_retry() {
                let attempts = self.counter.record_failure();
                if !self.counter.should_retry() {
                    return self.exhausted(attempts);
                }
                self.counter.next_delay()
            } else {
                self.counter.uncounted_delay()
            };

            self.transition(SessionState::Backoff);
            info!(
                session = %self.key,
                "Reconnecting in {}s (attempt {}/{})",
                delay.as_secs_f64(),
                self.counter.attempts(),
                self.counter.policy().max_attempts
            );
            self.emit(SessionEventKind::ReconnectScheduled {
                attempt: self.counter.attempts(),
                delay,
            });

            tokio::select! {
                _ = wait_for_shutdown(&mut self.shutdown) => return self.stopped(),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// One dial → handshake → steady-state pass; tears down before returning
    async fn connect_once(&mut self) -> Exit {
        let resolved = tokio::select! {
            _ = wait_for_shutdown(&mut self.shutdown) => return Exit::Stopped,
            resolved = self.dialer.resolve(&self.key.proxy) => resolved,
        };
        let info = match resolved {
            Ok(info) => info,
            Err(e) if e.is_fatal() => {
                warn!(session = %self.key, "Unusable proxy: {}", e);
                return Exit::Failed(e);
            }
            Err(e) => {
                warn!(session = %self.key, "Skipping proxy for now: {}", e);
                self.emit(SessionEventKind::ProxyUnreachable(e.to_string()));
                return Exit::Failed(e);
            }
        };

        let connected = tokio::select! {
            _ = wait_for_shutdown(&mut self.shutdown) => return Exit::Stopped,
            connected = self.dialer.connect(&self.key.proxy) => connected,
        };
        let mut transport = match connected {
            Ok(transport) => transport,
            Err(e) => {
                warn!(session = %self.key, "Failed to connect: {}", e);
                return Exit::Failed(e);
            }
        };

        info!(session = %self.key, "Connected through {}", info);
        self.emit(SessionEventKind::Connected(info));
        self.transition(SessionState::Handshaking);

        let handshake = Handshake::new(self.key.identity.clone(), self.config.profile.clone());
        let exit = match self.await_challenge(transport.as_mut(), &handshake).await {
            Ok(()) => {
                // No acknowledgement follows the AUTH response
                self.counter.record_success();
                self.transition(SessionState::Active);
                self.steady_state(transport.as_mut(), &handshake).await
            }
            Err(exit) => exit,
        };

        self.transition(SessionState::Closing);
        match &exit {
            Exit::Stopped => {
                if tokio::time::timeout(CLOSE_TIMEOUT, transport.close())
                    .await
                    .is_err()
                {
                    debug!(session = %self.key, "Graceful close timed out");
                }
            }
            Exit::Failed(e) => {
                warn!(session = %self.key, "Connection lost: {}", e);
                if tokio::time::timeout(CLOSE_TIMEOUT, transport.terminate())
                    .await
                    .is_err()
                {
                    debug!(session = %self.key, "Socket shutdown timed out");
                }
            }
        }
        exit
    }

    /// Wait for the first AUTH challenge and answer it
    async fn await_challenge(
        &mut self,
        transport: &mut dyn Transport,
        handshake: &Handshake,
    ) -> std::result::Result<(), Exit> {
        let deadline = tokio::time::sleep(self.config.handshake_timeout);
        tokio::pin!(deadline);

        loop {
            let message = tokio::select! {
                _ = wait_for_shutdown(&mut self.shutdown) => return Err(Exit::Stopped),
                _ = &mut deadline => {
                    return Err(Exit::Failed(SessionError::Handshake(format!(
                        "no AUTH challenge within {:?}",
                        self.config.handshake_timeout
                    ))));
                }
                message = transport.next_message() => message,
            };

            match message {
                None => {
                    return Err(Exit::Failed(SessionError::TransportClosed(
                        "closed before AUTH".to_string(),
                    )))
                }
                Some(Err(e)) => return Err(Exit::Failed(e)),
                Some(Ok(text)) => match parse_inbound(&text) {
                    Ok(InboundFrame::AuthChallenge { id }) => {
                        return self
                            .answer_challenge(transport, handshake, &id)
                            .await
                            .map_err(|e| Exit::Failed(SessionError::Handshake(e.to_string())));
                    }
                    Ok(frame) => debug!(session = %self.key, ?frame, "Ignoring frame before AUTH"),
                    Err(e) => warn!(session = %self.key, "Dropping unparsable frame: {}", e),
                },
            }
        }
    }

    /// Active / Degraded loop; returns when the connection must end
    async fn steady_state(&mut self, transport: &mut dyn Transport, handshake: &Handshake) -> Exit {
        let mut heartbeat =
            HeartbeatMonitor::new(self.config.ping_interval, self.config.max_missed_pongs);
        heartbeat.start();

        let exit = loop {
            tokio::select! {
                _ = wait_for_shutdown(&mut self.shutdown) => break Exit::Stopped,

                tick = heartbeat.tick() => match tick {
                    HeartbeatTick::SendProbe { missed } => {
                        if heartbeat.is_degraded() {
                            warn!(session = %self.key, "{} probes without PONG", missed - 1);
                            self.transition(SessionState::Degraded);
                            self.emit(SessionEventKind::Degraded(missed));
                        }

                        let sent = match build_probe() {
                            Ok(probe) => transport.send_text(probe).await,
                            Err(e) => Err(e),
                        };
                        if let Err(e) = sent {
                            break Exit::Failed(e);
                        }
                        debug!(session = %self.key, "Sent PING");
                        self.emit(SessionEventKind::PingSent);
                    }
                    HeartbeatTick::ThresholdReached { missed } => {
                        warn!(session = %self.key, "Too many missed PONGs ({}), reconnecting", missed);
                        break Exit::Failed(SessionError::HeartbeatTimeout { missed });
                    }
                },

                message = transport.next_message() => match message {
                    None => break Exit::Failed(SessionError::TransportClosed("stream ended".to_string())),
                    Some(Err(e)) => break Exit::Failed(e),
                    Some(Ok(text)) => match parse_inbound(&text) {
                        Ok(InboundFrame::LivenessEcho { id }) => {
                            debug!(session = %self.key, ?id, "Received PONG");
                            heartbeat.on_echo();
                            self.emit(SessionEventKind::PongReceived);
                            if self.state == SessionState::Degraded {
                                self.transition(SessionState::Active);
                            }
                        }
                        Ok(InboundFrame::AuthChallenge { id }) => {
                            if let Err(e) = self.answer_challenge(transport, handshake, &id).await {
                                break Exit::Failed(e);
                            }
                        }
                        Ok(InboundFrame::Unrecognized { action }) => {
                            debug!(session = %self.key, "Ignoring {} frame", action);
                        }
                        Err(e) => warn!(session = %self.key, "Dropping unparsable frame: {}", e),
                    },
                },
            }
        };

        heartbeat.stop();
        exit
    }

    async fn answer_challenge(
        &self,
        transport: &mut dyn Transport,
        handshake: &Handshake,
        challenge_id: &str,
    ) -> crate::error::Result<()> {
        let response = handshake.auth_response(challenge_id)?;
        transport.send_text(response).await?;
        info!(session = %self.key, "Sent AUTH response for challenge {}", challenge_id);
        self.emit(SessionEventKind::AuthSent);
        Ok(())
    }

    fn transition(&mut self, next: SessionState) {
        if self.state == next {
            return;
        }
        debug!(session = %self.key, "{} -> {}", self.state, next);
        self.state = next;
        self.emit(SessionEventKind::StateChanged(next));
    }

    fn emit(&self, kind: SessionEventKind) {
        self.events
            .send(SessionEvent {
                key: self.key.clone(),
                kind,
            })
            .ok();
    }

    fn stopped(&mut self) -> SessionOutcome {
        info!(session = %self.key, "Session stopped");
        self.emit(SessionEventKind::Stopped);
        SessionOutcome::Stopped
    }

    fn abandoned(&mut self, cause: SessionError) -> SessionOutcome {
        let attempts = self.counter.attempts();
        self.transition(SessionState::Exhausted);
        error!(session = %self.key, "{}; not reconnecting", cause);
        self.emit(SessionEventKind::Exhausted(attempts));
        SessionOutcome::Exhausted { attempts }
    }

    fn exhausted(&mut self, attempts: u32) -> SessionOutcome {
        self.transition(SessionState::Exhausted);
        error!(
            session = %self.key,
            "{}; not reconnecting",
            SessionError::RetryBudgetExhausted { attempts }
        );
        self.emit(SessionEventKind::Exhausted(attempts));
        SessionOutcome::Exhausted { attempts }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::Result;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use tokio::time::Instant;

    /// In-memory transport driven by a [`Peer`]
    pub(crate) struct ChannelTransport {
        inbound: mpsc::UnboundedReceiver<String>,
        outbound: mpsc::UnboundedSender<String>,
        teardown: Arc<Mutex<Vec<&'static str>>>,
        stall_teardown: bool,
    }

    impl ChannelTransport {
        /// Forced teardown never completes, like a peer that stopped reading
        pub fn stalling(mut self) -> Self {
            self.stall_teardown = true;
            self
        }
    }

    /// Far end of a [`ChannelTransport`]
    pub(crate) struct Peer {
        pub to_client: mpsc::UnboundedSender<String>,
        pub from_client: mpsc::UnboundedReceiver<String>,
        pub teardown: Arc<Mutex<Vec<&'static str>>>,
    }

    impl Peer {
        pub fn challenge(&self, id: &str) {
            self.to_client
                .send(format!(r#"{{"action":"AUTH","id":"{}"}}"#, id))
                .unwrap();
        }

        /// Next outbound frame with the given field value
        pub async fn next_with(&mut self, field: &str, value: &str) -> serde_json::Value {
            loop {
                let text = self.from_client.recv().await.unwrap();
                let frame: serde_json::Value = serde_json::from_str(&text).unwrap();
                if frame[field] == value {
                    return frame;
                }
            }
        }
    }

    pub(crate) fn transport_pair() -> (ChannelTransport, Peer) {
        let (to_client, inbound) = mpsc::unbounded_channel();
        let (outbound, from_client) = mpsc::unbounded_channel();
        let teardown = Arc::new(Mutex::new(Vec::new()));
        (
            ChannelTransport {
                inbound,
                outbound,
                teardown: teardown.clone(),
                stall_teardown: false,
            },
            Peer {
                to_client,
                from_client,
                teardown,
            },
        )
    }

    #[async_trait]
    impl Transport for ChannelTransport {
        async fn send_text(&mut self, text: String) -> Result<()> {
            self.outbound
                .send(text)
                .map_err(|_| SessionError::TransportClosed("peer gone".to_string()))
        }

        async fn next_message(&mut self) -> Option<Result<String>> {
            self.inbound.recv().await.map(Ok)
        }

        async fn close(&mut self) {
            self.teardown.lock().unwrap().push("close");
        }

        async fn terminate(&mut self) {
            self.teardown.lock().unwrap().push("terminate");
            if self.stall_teardown {
                std::future::pending::<()>().await;
            }
        }
    }

    /// Dialer that replays scripted probe and connect results
    #[derive(Default)]
    pub(crate) struct ScriptedDialer {
        probes: Mutex<VecDeque<Result<ProxyIpInfo>>>,
        transports: Mutex<VecDeque<ChannelTransport>>,
        pub connects: AtomicU32,
    }

    impl ScriptedDialer {
        pub fn with_probe(self, probe: Result<ProxyIpInfo>) -> Self {
            self.probes.lock().unwrap().push_back(probe);
            self
        }

        pub fn with_transport(self, transport: ChannelTransport) -> Self {
            self.transports.lock().unwrap().push_back(transport);
            self
        }

        pub fn connects(&self) -> u32 {
            self.connects.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Dialer for ScriptedDialer {
        async fn resolve(&self, _proxy: &ProxyDescriptor) -> Result<ProxyIpInfo> {
            let scripted = self.probes.lock().unwrap().pop_front();
            scripted.unwrap_or_else(|| Ok(ProxyIpInfo::direct()))
        }

        async fn connect(&self, _proxy: &ProxyDescriptor) -> Result<Box<dyn Transport>> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            let scripted = self.transports.lock().unwrap().pop_front();
            match scripted {
                Some(transport) => Ok(Box::new(transport)),
                None => Err(SessionError::Dial("connection refused".to_string())),
            }
        }
    }

    fn test_config() -> SessionConfig {
        SessionConfig {
            ping_interval: Duration::from_secs(3600),
            ..Default::default()
        }
    }

    struct Harness {
        events: mpsc::UnboundedReceiver<SessionEvent>,
        shutdown: watch::Sender<bool>,
        handle: tokio::task::JoinHandle<SessionOutcome>,
    }

    impl Harness {
        fn spawn(key: SessionKey, config: SessionConfig, dialer: Arc<dyn Dialer>) -> Self {
            let (events_tx, events) = mpsc::unbounded_channel();
            let (shutdown, shutdown_rx) = watch::channel(false);
            let actor = SessionActor::new(key, Arc::new(config), dialer, events_tx, shutdown_rx);
            Self {
                events,
                shutdown,
                handle: tokio::spawn(actor.run()),
            }
        }

        /// Collect events up to and including the first one matching `done`
        async fn until(&mut self, done: impl Fn(&SessionEventKind) -> bool) -> Vec<SessionEventKind> {
            let mut seen = Vec::new();
            loop {
                let event = self.events.recv().await.unwrap();
                let finished = done(&event.kind);
                seen.push(event.kind);
                if finished {
                    return seen;
                }
            }
        }

        async fn stop(self) -> SessionOutcome {
            self.shutdown.send(true).unwrap();
            self.handle.await.unwrap()
        }
    }

    fn is_state(state: SessionState) -> impl Fn(&SessionEventKind) -> bool {
        move |kind| *kind == SessionEventKind::StateChanged(state)
    }

    #[test]
    fn test_key_display() {
        let key = SessionKey::new("u1", ProxyDescriptor::new("10.0.0.1:1080"));
        assert_eq!(key.to_string(), "u1@10.0.0.1:1080");
        assert_eq!(SessionKey::direct("u2").to_string(), "u2@direct");
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_probe_does_not_consume_attempt() {
        let (transport, peer) = transport_pair();
        peer.challenge("c1");

        let dialer = Arc::new(
            ScriptedDialer::default()
                .with_probe(Err(SessionError::ProxyUnreachable {
                    proxy: "p1".to_string(),
                    reason: "timed out".to_string(),
                }))
                .with_transport(transport),
        );
        let key = SessionKey::new("u1", ProxyDescriptor::new("p1:1080"));
        let mut harness = Harness::spawn(key, test_config(), dialer.clone());

        let events = harness.until(is_state(SessionState::Active)).await;
        assert!(matches!(events[0], SessionEventKind::ProxyUnreachable(_)));
        assert!(events.contains(&SessionEventKind::ReconnectScheduled {
            attempt: 0,
            delay: Duration::from_secs(5),
        }));
        assert!(events.contains(&SessionEventKind::AuthSent));
        assert_eq!(dialer.connects(), 1);

        assert_eq!(harness.stop().await, SessionOutcome::Stopped);
        assert_eq!(*peer.teardown.lock().unwrap(), vec!["close"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_after_budget() {
        let dialer = Arc::new(ScriptedDialer::default());
        let mut harness = Harness::spawn(SessionKey::direct("u1"), test_config(), dialer.clone());

        let started = Instant::now();
        let events = harness
            .until(|kind| matches!(kind, SessionEventKind::Exhausted(_)))
            .await;

        let delays: Vec<u64> = events
            .iter()
            .filter_map(|kind| match kind {
                SessionEventKind::ReconnectScheduled { delay, .. } => Some(delay.as_secs()),
                _ => None,
            })
            .collect();
        assert_eq!(delays, vec![5, 10, 20, 40]);
        assert_eq!(events.last(), Some(&SessionEventKind::Exhausted(5)));
        assert_eq!(started.elapsed(), Duration::from_secs(75));

        let outcome = harness.handle.await.unwrap();
        assert_eq!(outcome, SessionOutcome::Exhausted { attempts: 5 });

        // No dial after exhaustion
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(dialer.connects(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rechallenge_while_active() {
        let (transport, mut peer) = transport_pair();
        peer.challenge("a");

        let dialer = Arc::new(ScriptedDialer::default().with_transport(transport));
        let mut harness = Harness::spawn(SessionKey::direct("u1"), test_config(), dialer);
        harness.until(is_state(SessionState::Active)).await;

        peer.challenge("x");
        let events = harness
            .until(|kind| *kind == SessionEventKind::AuthSent)
            .await;
        assert!(events
            .iter()
            .all(|kind| !matches!(kind, SessionEventKind::StateChanged(_))));

        let first = peer.next_with("origin_action", "AUTH").await;
        let second = peer.next_with("origin_action", "AUTH").await;
        assert_eq!(first["id"], "a");
        assert_eq!(second["id"], "x");
        for field in ["browser_id", "user_id", "user_agent", "device_type", "version"] {
            assert_eq!(first["result"][field], second["result"][field]);
        }

        assert_eq!(harness.stop().await, SessionOutcome::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missed_pongs_force_termination() {
        let (transport, mut peer) = transport_pair();
        peer.challenge("c1");

        let dialer = Arc::new(ScriptedDialer::default().with_transport(transport));
        let config = SessionConfig {
            ping_interval: Duration::from_secs(26),
            ..Default::default()
        };
        let mut harness = Harness::spawn(SessionKey::direct("u1"), config, dialer.clone());
        harness.until(is_state(SessionState::Active)).await;
        let active_at = Instant::now();

        let events = harness
            .until(|kind| matches!(kind, SessionEventKind::ReconnectScheduled { .. }))
            .await;
        assert_eq!(active_at.elapsed(), Duration::from_secs(78));
        assert_eq!(
            events
                .iter()
                .filter(|kind| **kind == SessionEventKind::PingSent)
                .count(),
            2
        );
        assert!(events.contains(&SessionEventKind::Degraded(2)));
        assert!(events.contains(&SessionEventKind::StateChanged(SessionState::Closing)));
        assert_eq!(
            events.last(),
            Some(&SessionEventKind::ReconnectScheduled {
                attempt: 1,
                delay: Duration::from_secs(5),
            })
        );
        assert_eq!(*peer.teardown.lock().unwrap(), vec!["terminate"]);

        // Probes on the wire
        peer.next_with("action", "PING").await;
        peer.next_with("action", "PING").await;

        assert_eq!(harness.stop().await, SessionOutcome::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_echoes_keep_session_active() {
        let (transport, mut peer) = transport_pair();
        peer.challenge("c1");

        let dialer = Arc::new(ScriptedDialer::default().with_transport(transport));
        let config = SessionConfig {
            ping_interval: Duration::from_secs(26),
            ..Default::default()
        };
        let mut harness = Harness::spawn(SessionKey::direct("u1"), config, dialer);
        harness.until(is_state(SessionState::Active)).await;

        // Answer every probe
        let to_client = peer.to_client.clone();
        let responder = tokio::spawn(async move {
            loop {
                let ping = peer.next_with("action", "PING").await;
                let pong = serde_json::json!({"id": ping["id"], "action": "PONG"});
                to_client.send(pong.to_string()).unwrap();
            }
        });

        tokio::time::sleep(Duration::from_secs(300)).await;
        responder.abort();

        let mut pings = 0;
        let mut pongs = 0;
        while let Ok(event) = harness.events.try_recv() {
            match event.kind {
                SessionEventKind::PingSent => pings += 1,
                SessionEventKind::PongReceived => pongs += 1,
                SessionEventKind::Degraded(_) | SessionEventKind::StateChanged(_) => {
                    panic!("unexpected {:?}", event.kind)
                }
                _ => {}
            }
        }
        assert_eq!(pings, 11);
        assert_eq!(pongs, 11);

        assert_eq!(harness.stop().await, SessionOutcome::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_timeout_counts() {
        let (transport, _peer) = transport_pair();
        let dialer = Arc::new(ScriptedDialer::default().with_transport(transport));
        let mut harness = Harness::spawn(SessionKey::direct("u1"), test_config(), dialer);

        let started = Instant::now();
        let events = harness
            .until(|kind| matches!(kind, SessionEventKind::ReconnectScheduled { .. }))
            .await;
        assert_eq!(started.elapsed(), Duration::from_secs(60));
        assert_eq!(
            events.last(),
            Some(&SessionEventKind::ReconnectScheduled {
                attempt: 1,
                delay: Duration::from_secs(5),
            })
        );

        assert_eq!(harness.stop().await, SessionOutcome::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_during_backoff() {
        let dialer = Arc::new(ScriptedDialer::default());
        let mut harness = Harness::spawn(SessionKey::direct("u1"), test_config(), dialer.clone());

        harness
            .until(|kind| matches!(kind, SessionEventKind::ReconnectScheduled { .. }))
            .await;
        assert_eq!(harness.stop().await, SessionOutcome::Stopped);
        assert_eq!(dialer.connects(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_attempts() {
        let (closed, peer) = transport_pair();
        drop(peer);
        let (accepted, second_peer) = transport_pair();
        second_peer.challenge("c1");

        let dialer = Arc::new(
            ScriptedDialer::default()
                .with_transport(closed)
                .with_transport(accepted),
        );
        let mut harness = Harness::spawn(SessionKey::direct("u1"), test_config(), dialer);
        let retry = |kind: &SessionEventKind| matches!(kind, SessionEventKind::ReconnectScheduled { .. });
        let first_retry = SessionEventKind::ReconnectScheduled {
            attempt: 1,
            delay: Duration::from_secs(5),
        };

        // Closed before AUTH: first counted failure
        let events = harness.until(retry).await;
        assert_eq!(events.last(), Some(&first_retry));

        // Reaching Active resets the count, so the next failure is attempt 1 again
        harness.until(is_state(SessionState::Active)).await;
        drop(second_peer);
        let events = harness.until(retry).await;
        assert_eq!(events.last(), Some(&first_retry));

        assert_eq!(harness.stop().await, SessionOutcome::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_proxy_is_terminal() {
        let config = test_config();
        let dialer = Arc::new(config.ws_dialer());
        // SOCKS has no default port, so this descriptor can never be dialed
        let key = SessionKey::new("u1", ProxyDescriptor::new("proxy.local"));
        let mut harness = Harness::spawn(key, config, dialer);

        let events = harness
            .until(|kind| matches!(kind, SessionEventKind::Exhausted(_)))
            .await;
        assert_eq!(events.last(), Some(&SessionEventKind::Exhausted(0)));
        assert!(!events.iter().any(|kind| matches!(
            kind,
            SessionEventKind::ReconnectScheduled { .. } | SessionEventKind::ProxyUnreachable(_)
        )));
        assert_eq!(
            harness.handle.await.unwrap(),
            SessionOutcome::Exhausted { attempts: 0 }
        );

        // Nothing else is ever scheduled
        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert!(harness.events.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_teardown_is_bounded() {
        let (transport, peer) = transport_pair();
        peer.challenge("c1");

        let dialer = Arc::new(ScriptedDialer::default().with_transport(transport.stalling()));
        let mut harness = Harness::spawn(SessionKey::direct("u1"), test_config(), dialer);
        harness.until(is_state(SessionState::Active)).await;

        let lost_at = Instant::now();
        let teardown = peer.teardown.clone();
        drop(peer);

        harness
            .until(|kind| matches!(kind, SessionEventKind::ReconnectScheduled { .. }))
            .await;
        assert_eq!(lost_at.elapsed(), CLOSE_TIMEOUT);
        assert_eq!(*teardown.lock().unwrap(), vec!["terminate"]);

        assert_eq!(harness.stop().await, SessionOutcome::Stopped);
    }
}
