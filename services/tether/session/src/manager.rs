//! Session supervisor.
//!
//! Plans one session key per (identity, proxy) pair, runs one actor task per
//! key, and consumes the shared status stream. Actors never see each other:
//! an actor that exhausts its budget or panics is logged and its siblings
//! keep running. Shutdown is broadcast over a `watch` channel and the
//! supervisor waits for every actor's teardown.

use crate::proxy::ProxyDescriptor;
use crate::session::{
    SessionActor, SessionConfig, SessionEvent, SessionEventKind, SessionKey, SessionOutcome,
    SessionState,
};
use crate::transport::Dialer;
use futures_util::FutureExt;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};

/// How identities reach the relay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyMode {
    /// No proxies; one direct session per identity
    Direct,
    /// One session per (identity, proxy) pair
    Proxied,
}

/// Expand identities and proxies into session keys, identity-major
pub fn plan_sessions(
    identities: &[String],
    proxies: &[ProxyDescriptor],
    mode: ProxyMode,
) -> Vec<SessionKey> {
    match mode {
        ProxyMode::Direct => identities.iter().map(SessionKey::direct).collect(),
        ProxyMode::Proxied => identities
            .iter()
            .flat_map(|identity| {
                proxies
                    .iter()
                    .map(move |proxy| SessionKey::new(identity.clone(), proxy.clone()))
            })
            .collect(),
    }
}

/// Latest known status of one session
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Dialing or handshaking
    Connecting,
    /// Authenticated and heartbeating
    Active,
    /// Active with unanswered probes
    Degraded,
    /// Waiting to retry
    Reconnecting,
    /// Gave up
    Exhausted,
    /// Shut down
    Stopped,
    /// Actor panicked
    Failed,
}

impl SessionStatus {
    /// Whether the initial startup report can count this session
    pub fn is_settled(&self) -> bool {
        !matches!(self, SessionStatus::Connecting)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionStatus::Connecting => "connecting",
            SessionStatus::Active => "active",
            SessionStatus::Degraded => "degraded",
            SessionStatus::Reconnecting => "reconnecting",
            SessionStatus::Exhausted => "exhausted",
            SessionStatus::Stopped => "stopped",
            SessionStatus::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Session counts per status
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatusSummary {
    /// Count per status; absent statuses have no sessions
    pub counts: BTreeMap<SessionStatus, usize>,
}

impl StatusSummary {
    /// Sessions in `status`
    pub fn count(&self, status: SessionStatus) -> usize {
        self.counts.get(&status).copied().unwrap_or(0)
    }

    /// Total sessions
    pub fn total(&self) -> usize {
        self.counts.values().sum()
    }
}

impl fmt::Display for StatusSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.counts.is_empty() {
            return f.write_str("no sessions");
        }
        let parts: Vec<String> = self
            .counts
            .iter()
            .map(|(status, count)| format!("{} {}", count, status))
            .collect();
        f.write_str(&parts.join(", "))
    }
}

type ActorResult = (SessionKey, Result<SessionOutcome, String>);

/// Runs one actor per session key
pub struct SessionSupervisor {
    config: Arc<SessionConfig>,
    dialer: Arc<dyn Dialer>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    events_rx: mpsc::UnboundedReceiver<SessionEvent>,
    shutdown_tx: watch::Sender<bool>,
    tasks: JoinSet<ActorResult>,
    statuses: HashMap<SessionKey, SessionStatus>,
}

impl SessionSupervisor {
    /// Create a supervisor; actors share `config` and `dialer`
    pub fn new(config: Arc<SessionConfig>, dialer: Arc<dyn Dialer>) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config,
            dialer,
            events_tx,
            events_rx,
            shutdown_tx,
            tasks: JoinSet::new(),
            statuses: HashMap::new(),
        }
    }

    /// Start one actor per key
    pub fn spawn(&mut self, keys: Vec<SessionKey>) {
        for key in keys {
            if self.statuses.contains_key(&key) {
                warn!(session = %key, "Duplicate session key, skipping");
                continue;
            }
            self.statuses.insert(key.clone(), SessionStatus::Connecting);

            let actor = SessionActor::new(
                key.clone(),
                self.config.clone(),
                self.dialer.clone(),
                self.events_tx.clone(),
                self.shutdown_tx.subscribe(),
            );

            self.tasks.spawn(async move {
                let outcome = AssertUnwindSafe(actor.run())
                    .catch_unwind()
                    .await
                    .map_err(|panic| {
                        panic
                            .downcast_ref::<&str>()
                            .map(|s| s.to_string())
                            .or_else(|| panic.downcast_ref::<String>().cloned())
                            .unwrap_or_else(|| "unknown panic".to_string())
                    });
                (key, outcome)
            });
        }
        info!("Spawned {} sessions", self.statuses.len());
    }

    /// Wait until every session has an initial outcome
    pub async fn wait_settled(&mut self) {
        while !self.is_settled() {
            tokio::select! {
                Some(event) = self.events_rx.recv() => self.handle_event(event),
                Some(joined) = self.tasks.join_next() => self.handle_join(joined),
                else => break,
            }
        }
    }

    /// Whether every session has left the initial connecting phase
    pub fn is_settled(&self) -> bool {
        self.statuses.values().all(SessionStatus::is_settled)
    }

    /// Consume the status stream until every actor finishes or `shutdown`
    /// resolves; then stop all actors and wait for their teardown.
    pub async fn run<F>(mut self, shutdown: F) -> StatusSummary
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested, stopping {} sessions", self.tasks.len());
                    break;
                }
                Some(event) = self.events_rx.recv() => self.handle_event(event),
                joined = self.tasks.join_next() => match joined {
                    Some(joined) => self.handle_join(joined),
                    None => {
                        self.drain_events();
                        info!("All sessions finished");
                        return self.status_summary();
                    }
                },
            }
        }

        self.shutdown_tx.send_replace(true);
        while let Some(joined) = self.tasks.join_next().await {
            self.handle_join(joined);
        }
        self.drain_events();

        let summary = self.status_summary();
        info!("All sessions stopped ({})", summary);
        summary
    }

    /// Counts of sessions per latest status
    pub fn status_summary(&self) -> StatusSummary {
        let mut counts = BTreeMap::new();
        for status in self.statuses.values() {
            *counts.entry(*status).or_insert(0) += 1;
        }
        StatusSummary { counts }
    }

    /// Latest status of `key`
    pub fn status(&self, key: &SessionKey) -> Option<SessionStatus> {
        self.statuses.get(key).copied()
    }

    fn handle_event(&mut self, event: SessionEvent) {
        let SessionEvent { key, kind } = event;

        let status = match &kind {
            SessionEventKind::StateChanged(state) => {
                info!(session = %key, "Session {}", state);
                match state {
                    SessionState::Dialing | SessionState::Handshaking => {
                        Some(SessionStatus::Connecting)
                    }
                    SessionState::Active => Some(SessionStatus::Active),
                    SessionState::Degraded => Some(SessionStatus::Degraded),
                    SessionState::Exhausted => Some(SessionStatus::Exhausted),
                    SessionState::Closing | SessionState::Backoff => None,
                }
            }
            SessionEventKind::Connected(ip) => {
                info!(session = %key, "Proxy IP info: {}", ip);
                None
            }
            SessionEventKind::ProxyUnreachable(reason) => {
                debug!(session = %key, "Probe failed: {}", reason);
                None
            }
            SessionEventKind::ReconnectScheduled { attempt, delay } => {
                debug!(session = %key, attempt, ?delay, "Reconnect scheduled");
                Some(SessionStatus::Reconnecting)
            }
            SessionEventKind::Degraded(missed) => {
                debug!(session = %key, missed, "Heartbeat degraded");
                None
            }
            SessionEventKind::Exhausted(_) => Some(SessionStatus::Exhausted),
            SessionEventKind::Stopped => Some(SessionStatus::Stopped),
            SessionEventKind::AuthSent
            | SessionEventKind::PingSent
            | SessionEventKind::PongReceived => None,
        };

        // A panicked actor's late events must not revive it
        if let Some(status) = status {
            if self.statuses.get(&key) != Some(&SessionStatus::Failed) {
                self.statuses.insert(key, status);
            }
        }
    }

    fn drain_events(&mut self) {
        while let Ok(event) = self.events_rx.try_recv() {
            self.handle_event(event);
        }
    }

    fn handle_join(&mut self, joined: Result<ActorResult, JoinError>) {
        match joined {
            Ok((key, Ok(SessionOutcome::Exhausted { attempts }))) => {
                warn!(session = %key, "Session exhausted after {} attempts", attempts);
                self.statuses.insert(key, SessionStatus::Exhausted);
            }
            Ok((key, Ok(SessionOutcome::Stopped))) => {
                debug!(session = %key, "Session task finished");
                self.statuses.insert(key, SessionStatus::Stopped);
            }
            Ok((key, Err(panic))) => {
                error!(session = %key, "Session actor panicked: {}", panic);
                self.statuses.insert(key, SessionStatus::Failed);
            }
            Err(e) => error!("Session task failed: {}", e),
        }
    }
}
