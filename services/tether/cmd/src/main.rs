//! Tether binary.
//!
//! Keeps one authenticated WebSocket session alive per identity and proxy,
//! reports how many came up, and runs until every session gives up or the
//! process receives SIGINT / SIGTERM.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tether_session::{plan_sessions, ProxyMode, SessionStatus, SessionSupervisor};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod config;
mod inputs;
mod logging;

use config::TetherConfig;
use inputs::ProxySource;
use logging::TetherLogFormatter;

/// Proxy-tunneled WebSocket session keeper
#[derive(Parser, Debug)]
#[command(name = "tether", version, about = "Keeps relay sessions alive per identity and proxy")]
struct Args {
    /// File with one identity per line
    #[arg(long, default_value = "uid.txt")]
    uid_file: PathBuf,

    /// File with one proxy per line
    #[arg(long, conflicts_with = "proxy_url")]
    proxy_file: Option<PathBuf>,

    /// URL of a text document with one proxy per line
    #[arg(long)]
    proxy_url: Option<String>,

    /// Configuration file path (YAML)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Ping interval, e.g. 26s
    #[arg(long)]
    ping_interval: Option<humantime::Duration>,

    /// Attempts per session before giving up
    #[arg(long)]
    max_reconnect_attempts: Option<u32>,

    /// Relay WebSocket URL
    #[arg(long)]
    endpoint: Option<String>,
}

impl Args {
    fn proxy_source(&self) -> ProxySource {
        match (&self.proxy_file, &self.proxy_url) {
            (Some(path), _) => ProxySource::File(path.clone()),
            (None, Some(url)) => ProxySource::Url(url.clone()),
            (None, None) => ProxySource::None,
        }
    }

    /// Layer command-line flags over file and environment settings
    fn apply_to(&self, config: &mut TetherConfig) {
        if let Some(interval) = &self.ping_interval {
            config.ping_interval = **interval;
        }
        if let Some(attempts) = self.max_reconnect_attempts {
            config.max_reconnect_attempts = attempts;
        }
        if let Some(endpoint) = &self.endpoint {
            config.endpoint = endpoint.clone();
        }
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() {
    let args = Args::parse();

    if let Err(e) = init_tracing(&args.log_level) {
        eprintln!("Failed to initialize logging: {:#}", e);
        std::process::exit(1);
    }

    if let Err(e) = run(args).await {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

fn init_tracing(log_level: &str) -> Result<()> {
    let env_filter = EnvFilter::new("warn")
        .add_directive(format!("tether={}", log_level).parse()?)
        .add_directive(format!("tether_session={}", log_level).parse()?)
        .add_directive(format!("tether_wire={}", log_level).parse()?);

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .event_format(TetherLogFormatter::new("tether".to_string()))
        .init();
    Ok(())
}

async fn run(args: Args) -> Result<()> {
    info!("Starting tether v{}", env!("CARGO_PKG_VERSION"));

    let mut config = match &args.config {
        Some(path) => TetherConfig::load_from_file(path)?,
        None => TetherConfig::default(),
    };
    args.apply_to(&mut config);
    config.validate().context("Invalid configuration")?;

    let identities = inputs::load_identities(&args.uid_file)?;
    let source = args.proxy_source();
    let proxies = inputs::load_proxies(&source, config.probe_timeout).await?;

    let mode = match source {
        ProxySource::None => {
            info!(component = "inputs", "No proxy source given, running direct");
            ProxyMode::Direct
        }
        _ => ProxyMode::Proxied,
    };
    let keys = plan_sessions(&identities, &proxies, mode);
    info!(
        "Planned {} sessions for {} identities",
        keys.len(),
        identities.len()
    );

    let session_config = Arc::new(config.session_config());
    let dialer = Arc::new(session_config.ws_dialer());
    let mut supervisor = SessionSupervisor::new(session_config, dialer);

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("Failed to install SIGTERM handler")?;
    let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())
        .context("Failed to install SIGINT handler")?;

    supervisor.spawn(keys);

    let interrupted = tokio::select! {
        _ = supervisor.wait_settled() => false,
        _ = sigterm.recv() => {
            info!("Received SIGTERM signal, shutting down");
            true
        }
        _ = sigint.recv() => {
            info!("Received SIGINT signal, shutting down");
            true
        }
    };

    if !interrupted {
        let summary = supervisor.status_summary();
        let up = summary.count(SessionStatus::Active) + summary.count(SessionStatus::Degraded);
        info!("Startup complete: {}/{} sessions up ({})", up, summary.total(), summary);
        if up == 0 {
            warn!("No session reached the relay");
        }
    }

    let summary = if interrupted {
        supervisor.run(std::future::ready(())).await
    } else {
        supervisor
            .run(async move {
                tokio::select! {
                    _ = sigterm.recv() => info!("Received SIGTERM signal, shutting down"),
                    _ = sigint.recv() => info!("Received SIGINT signal, shutting down"),
                }
            })
            .await
    };

    info!("Tether stopped ({})", summary);
    Ok(())
}
