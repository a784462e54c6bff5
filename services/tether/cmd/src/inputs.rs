//! Identity and proxy list loading.

use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tether_session::ProxyDescriptor;
use tracing::info;

/// Where proxies come from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxySource {
    /// Direct mode
    None,
    /// One descriptor per line in a local file
    File(PathBuf),
    /// One descriptor per line in a remote text document
    Url(String),
}

/// Split text into trimmed, non-empty lines
pub fn parse_lines(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

/// Read trimmed, non-empty lines from a file
pub fn read_lines(path: &Path) -> Result<Vec<String>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let lines = parse_lines(&content);
    info!(component = "inputs", "Loaded {} lines from {}", lines.len(), path.display());
    Ok(lines)
}

/// Load the identity list; an empty list is an error
pub fn load_identities(path: &Path) -> Result<Vec<String>> {
    let identities = read_lines(path)?;
    if identities.is_empty() {
        bail!("No identities found in {}", path.display());
    }
    Ok(identities)
}

/// Fetch a remote proxy list
pub async fn fetch_proxies(url: &str, timeout: Duration) -> Result<Vec<String>> {
    let client = reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .context("Failed to create HTTP client")?;

    let body = client
        .get(url)
        .send()
        .await
        .and_then(|response| response.error_for_status())
        .with_context(|| format!("Failed to fetch proxies from {}", url))?
        .text()
        .await
        .with_context(|| format!("Failed to read proxy list from {}", url))?;

    let proxies = parse_lines(&body);
    info!(component = "inputs", "Fetched {} proxies from {}", proxies.len(), url);
    Ok(proxies)
}

/// Load proxies from `source`; a selected source yielding nothing is an error
pub async fn load_proxies(source: &ProxySource, timeout: Duration) -> Result<Vec<ProxyDescriptor>> {
    let lines = match source {
        ProxySource::None => return Ok(Vec::new()),
        ProxySource::File(path) => read_lines(path)?,
        ProxySource::Url(url) => fetch_proxies(url, timeout).await?,
    };

    if lines.is_empty() {
        bail!("No valid proxies found");
    }
    Ok(lines.into_iter().map(ProxyDescriptor::new).collect())
}
