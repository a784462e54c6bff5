//! TCP, proxy tunnel, and WebSocket transport for tether sessions.
//!
//! Dialing happens in three layers: a TCP connection (to the target, or to
//! the forward proxy), an optional SOCKS5 / HTTP CONNECT tunnel through that
//! proxy, and finally the TLS + WebSocket upgrade to the relay endpoint.
//! Sessions only see the resulting [`Transport`].

use crate::error::{Result, SessionError};
use crate::proxy::{ProxyDescriptor, ProxyEndpoint, ProxyIpInfo, ProxyProbe, ProxyScheme, TransportAgent};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use once_cell::sync::Lazy;
use reqwest::Url;
use std::net::IpAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{Connector, WebSocketStream};
use tracing::{debug, trace};

const SOCKS5_VERSION: u8 = 0x05;
const AUTH_NONE: u8 = 0x00;
const AUTH_PASSWORD: u8 = 0x02;
const AUTH_NO_ACCEPTABLE: u8 = 0xFF;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;
const REP_SUCCESS: u8 = 0x00;

/// Upper bound on a CONNECT response header block
const MAX_CONNECT_RESPONSE: usize = 8 * 1024;

/// Unified stream type: plain TCP, or TLS to an https forward proxy
pub enum IoStream {
    /// Plain TCP stream
    Plain(TcpStream),
    /// TLS client stream to the proxy
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl AsyncRead for IoStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            IoStream::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for IoStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::result::Result<usize, std::io::Error>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            IoStream::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<std::result::Result<(), std::io::Error>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_flush(cx),
            IoStream::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<std::result::Result<(), std::io::Error>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            IoStream::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Connect to a TCP address
pub async fn connect_tcp(host: &str, port: u16) -> tokio::io::Result<TcpStream> {
    let stream = TcpStream::connect((host, port)).await?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

static TLS_CONFIG: Lazy<Option<Arc<rustls::ClientConfig>>> = Lazy::new(|| {
    let roots = rustls::RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
    };
    let config = rustls::ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .ok()?
    .with_root_certificates(roots)
    .with_no_client_auth();
    Some(Arc::new(config))
});

/// Shared TLS client configuration (webpki roots, ring provider)
pub fn tls_config() -> Result<Arc<rustls::ClientConfig>> {
    TLS_CONFIG
        .clone()
        .ok_or_else(|| SessionError::Dial("TLS client configuration unavailable".to_string()))
}

/// Open a byte stream to `target_host:target_port` using the given strategy
pub async fn open_tunnel(
    agent: &TransportAgent,
    target_host: &str,
    target_port: u16,
) -> Result<IoStream> {
    match agent {
        TransportAgent::Direct => {
            let tcp = connect_tcp(target_host, target_port)
                .await
                .map_err(|e| SessionError::Dial(format!("{}:{}: {}", target_host, target_port, e)))?;
            Ok(IoStream::Plain(tcp))
        }
        TransportAgent::Proxy(endpoint) => {
            let tcp = connect_tcp(&endpoint.host, endpoint.port).await.map_err(|e| {
                SessionError::Dial(format!("proxy {}:{}: {}", endpoint.host, endpoint.port, e))
            })?;

            let mut stream = match endpoint.scheme {
                ProxyScheme::Https => {
                    let connector = TlsConnector::from(tls_config()?);
                    let server_name = rustls::pki_types::ServerName::try_from(endpoint.host.clone())
                        .map_err(|e| SessionError::Dial(format!("proxy name {}: {}", endpoint.host, e)))?;
                    let tls = connector.connect(server_name, tcp).await.map_err(|e| {
                        SessionError::Dial(format!("proxy TLS handshake with {}: {}", endpoint.host, e))
                    })?;
                    IoStream::Tls(Box::new(tls))
                }
                ProxyScheme::Socks5 | ProxyScheme::Http => IoStream::Plain(tcp),
            };

            match endpoint.scheme {
                ProxyScheme::Socks5 => {
                    socks5_connect(&mut stream, endpoint, target_host, target_port).await?
                }
                ProxyScheme::Http | ProxyScheme::Https => {
                    http_connect(&mut stream, endpoint, target_host, target_port).await?
                }
            }
            Ok(stream)
        }
    }
}

/// Run the client side of a SOCKS5 CONNECT on an open stream
pub async fn socks5_connect<S>(
    stream: &mut S,
    endpoint: &ProxyEndpoint,
    target_host: &str,
    target_port: u16,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let protocol = |msg: &str| SessionError::Dial(format!("socks5 {}: {}", endpoint.host, msg));

    // 1. Greeting
    if endpoint.has_credentials() {
        stream
            .write_all(&[SOCKS5_VERSION, 2, AUTH_NONE, AUTH_PASSWORD])
            .await?;
    } else {
        stream.write_all(&[SOCKS5_VERSION, 1, AUTH_NONE]).await?;
    }

    let mut response = [0u8; 2];
    stream.read_exact(&mut response).await?;
    if response[0] != SOCKS5_VERSION {
        return Err(protocol("invalid version from server"));
    }

    // 2. Authentication
    match response[1] {
        AUTH_NONE => {}
        AUTH_PASSWORD => {
            let username = endpoint.username.as_deref().unwrap_or("");
            let password = endpoint.password.as_deref().unwrap_or("");
            if username.len() > 255 || password.len() > 255 {
                return Err(protocol("credentials too long"));
            }

            let mut auth_request = vec![0x01, username.len() as u8];
            auth_request.extend_from_slice(username.as_bytes());
            auth_request.push(password.len() as u8);
            auth_request.extend_from_slice(password.as_bytes());
            stream.write_all(&auth_request).await?;

            let mut auth_response = [0u8; 2];
            stream.read_exact(&mut auth_response).await?;
            if auth_response[1] != 0x00 {
                return Err(protocol("authentication failed"));
            }
        }
        AUTH_NO_ACCEPTABLE => return Err(protocol("no acceptable auth method")),
        other => return Err(protocol(&format!("unexpected auth method {:#04x}", other))),
    }

    // 3. CONNECT request
    let mut request = vec![SOCKS5_VERSION, CMD_CONNECT, 0x00];
    match target_host.parse::<IpAddr>() {
        Ok(IpAddr::V4(v4)) => {
            request.push(ATYP_IPV4);
            request.extend_from_slice(&v4.octets());
        }
        Ok(IpAddr::V6(v6)) => {
            request.push(ATYP_IPV6);
            request.extend_from_slice(&v6.octets());
        }
        Err(_) => {
            if target_host.len() > 255 {
                return Err(protocol("target host name too long"));
            }
            request.push(ATYP_DOMAIN);
            request.push(target_host.len() as u8);
            request.extend_from_slice(target_host.as_bytes());
        }
    }
    request.extend_from_slice(&target_port.to_be_bytes());
    stream.write_all(&request).await?;

    // 4. Reply
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    if header[0] != SOCKS5_VERSION {
        return Err(protocol("invalid version in reply"));
    }
    if header[1] != REP_SUCCESS {
        return Err(protocol(&format!("connect rejected with code {}", header[1])));
    }

    // Skip the bound address
    let addr_len = match header[3] {
        ATYP_IPV4 => 4,
        ATYP_IPV6 => 16,
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            len[0] as usize
        }
        other => return Err(protocol(&format!("unknown address type {}", other))),
    };
    let mut bound = vec![0u8; addr_len + 2];
    stream.read_exact(&mut bound).await?;

    trace!("SOCKS5 tunnel to {}:{} established", target_host, target_port);
    Ok(())
}

/// Run an HTTP CONNECT on an open stream
pub async fn http_connect<S>(
    stream: &mut S,
    endpoint: &ProxyEndpoint,
    target_host: &str,
    target_port: u16,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let target = if target_host.contains(':') {
        format!("[{}]:{}", target_host, target_port)
    } else {
        format!("{}:{}", target_host, target_port)
    };

    let mut request = format!("CONNECT {} HTTP/1.1\r\nHost: {}\r\n", target, target);
    if endpoint.has_credentials() {
        let auth = format!(
            "{}:{}",
            endpoint.username.as_deref().unwrap_or(""),
            endpoint.password.as_deref().unwrap_or("")
        );
        request.push_str(&format!("Proxy-Authorization: Basic {}\r\n", BASE64.encode(auth)));
    }
    request.push_str("\r\n");
    stream.write_all(request.as_bytes()).await?;

    // Read byte by byte up to the blank line so no tunneled bytes are consumed
    let mut head = Vec::with_capacity(256);
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if head.len() >= MAX_CONNECT_RESPONSE {
            return Err(SessionError::Dial(format!(
                "http proxy {}: response header too large",
                endpoint.host
            )));
        }
        stream.read_exact(&mut byte).await?;
        head.push(byte[0]);
    }

    let head = String::from_utf8_lossy(&head);
    let status_line = head.lines().next().unwrap_or_default();
    let status_code = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse::<u16>().ok())
        .ok_or_else(|| {
            SessionError::Dial(format!(
                "http proxy {}: invalid response {:?}",
                endpoint.host, status_line
            ))
        })?;

    if status_code != 200 {
        return Err(SessionError::Dial(format!(
            "http proxy {}: CONNECT failed: {}",
            endpoint.host, status_line
        )));
    }

    trace!("HTTP CONNECT tunnel to {} established", target);
    Ok(())
}

/// Open, text-framed connection to the relay endpoint
#[async_trait]
pub trait Transport: Send {
    /// Send one text frame
    async fn send_text(&mut self, text: String) -> Result<()>;

    /// Next inbound text frame; `None` once the stream has ended
    async fn next_message(&mut self) -> Option<Result<String>>;

    /// Graceful close handshake
    async fn close(&mut self);

    /// Drop the connection without a close handshake
    async fn terminate(&mut self);
}

/// Establishes transports for a session
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Validate the proxy and report its egress info
    async fn resolve(&self, proxy: &ProxyDescriptor) -> Result<ProxyIpInfo>;

    /// Dial the relay endpoint through the proxy
    async fn connect(&self, proxy: &ProxyDescriptor) -> Result<Box<dyn Transport>>;
}

/// WebSocket transport over any byte stream
pub struct WsTransport<S> {
    inner: WebSocketStream<S>,
}

impl<S> WsTransport<S> {
    /// Wrap an upgraded WebSocket stream
    pub fn new(inner: WebSocketStream<S>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<S> Transport for WsTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send_text(&mut self, text: String) -> Result<()> {
        self.inner
            .send(Message::Text(text))
            .await
            .map_err(|e| SessionError::TransportClosed(e.to_string()))
    }

    async fn next_message(&mut self) -> Option<Result<String>> {
        loop {
            match self.inner.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text)),
                Ok(Message::Binary(data)) => match String::from_utf8(data) {
                    Ok(text) => return Some(Ok(text)),
                    Err(_) => debug!("Dropping non-UTF-8 binary frame"),
                },
                Ok(Message::Close(frame)) => {
                    let reason = match frame {
                        Some(frame) => format!("closed by peer ({}: {})", frame.code, frame.reason),
                        None => "closed by peer".to_string(),
                    };
                    return Some(Err(SessionError::TransportClosed(reason)));
                }
                // Pings are answered by tungstenite itself
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) | Ok(Message::Frame(_)) => {}
                Err(e) => return Some(Err(SessionError::TransportClosed(e.to_string()))),
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.inner.close(None).await {
            debug!("WebSocket close failed: {}", e);
        }
    }

    async fn terminate(&mut self) {
        if let Err(e) = self.inner.get_mut().shutdown().await {
            debug!("Socket shutdown failed: {}", e);
        }
    }
}

/// Transport settings for [`WsDialer`]
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// WebSocket URL of the relay endpoint
    pub endpoint: String,
    /// Extra headers on the upgrade request
    pub headers: Vec<(String, String)>,
    /// Bound on TCP + tunnel + TLS + upgrade
    pub connect_timeout: Duration,
}

/// Network dialer: probe through the proxy, tunnel, then upgrade
#[derive(Debug, Clone)]
pub struct WsDialer {
    config: TransportConfig,
    probe: ProxyProbe,
}

impl WsDialer {
    /// Create a dialer for `config`, probing proxies with `probe`
    pub fn new(config: TransportConfig, probe: ProxyProbe) -> Self {
        Self { config, probe }
    }

    async fn dial(&self, proxy: &ProxyDescriptor) -> Result<Box<dyn Transport>> {
        let url = Url::parse(&self.config.endpoint)
            .map_err(|e| SessionError::Dial(format!("endpoint {}: {}", self.config.endpoint, e)))?;
        let host = url
            .host_str()
            .ok_or_else(|| SessionError::Dial(format!("endpoint {} has no host", url)))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let port = url
            .port_or_known_default()
            .ok_or_else(|| SessionError::Dial(format!("endpoint {} has no port", url)))?;

        let agent = proxy.classify()?;
        let stream = open_tunnel(&agent, &host, port).await?;
        debug!(proxy = %proxy, "Tunnel to {}:{} open", host, port);

        let mut request = self
            .config
            .endpoint
            .as_str()
            .into_client_request()
            .map_err(|e| SessionError::Dial(format!("bad upgrade request: {}", e)))?;
        for (name, value) in &self.config.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| SessionError::Dial(format!("header {}: {}", name, e)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| SessionError::Dial(format!("header {}: {}", name, e)))?;
            request.headers_mut().insert(name, value);
        }

        let connector = Connector::Rustls(tls_config()?);
        let (ws, response) =
            tokio_tungstenite::client_async_tls_with_config(request, stream, None, Some(connector))
                .await
                .map_err(|e| SessionError::Dial(format!("WebSocket handshake failed: {}", e)))?;
        debug!(proxy = %proxy, status = %response.status(), "WebSocket upgraded");

        Ok(Box::new(WsTransport::new(ws)))
    }
}

#[async_trait]
impl Dialer for WsDialer {
    async fn resolve(&self, proxy: &ProxyDescriptor) -> Result<ProxyIpInfo> {
        self.probe.resolve(proxy).await
    }

    async fn connect(&self, proxy: &ProxyDescriptor) -> Result<Box<dyn Transport>> {
        match tokio::time::timeout(self.config.connect_timeout, self.dial(proxy)).await {
            Ok(result) => result,
            Err(_) => Err(SessionError::Dial(format!(
                "timed out after {:?}",
                self.config.connect_timeout
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    fn endpoint(scheme: ProxyScheme, credentials: bool) -> ProxyEndpoint {
        ProxyEndpoint {
            scheme,
            host: "proxy.local".to_string(),
            port: 1080,
            username: credentials.then(|| "user".to_string()),
            password: credentials.then(|| "pw".to_string()),
        }
    }

    #[tokio::test]
    async fn test_socks5_connect_with_password() {
        let (mut client, mut server) = duplex(1024);

        let server_task = tokio::spawn(async move {
            let mut greeting = [0u8; 4];
            server.read_exact(&mut greeting).await.unwrap();
            assert_eq!(greeting, [SOCKS5_VERSION, 2, AUTH_NONE, AUTH_PASSWORD]);
            server.write_all(&[SOCKS5_VERSION, AUTH_PASSWORD]).await.unwrap();

            let mut auth = [0u8; 9];
            server.read_exact(&mut auth).await.unwrap();
            assert_eq!(&auth, b"\x01\x04user\x02pw");
            server.write_all(&[0x01, 0x00]).await.unwrap();

            let mut request = [0u8; 5 + 10 + 2];
            server.read_exact(&mut request).await.unwrap();
            assert_eq!(&request[..5], &[SOCKS5_VERSION, CMD_CONNECT, 0x00, ATYP_DOMAIN, 10]);
            assert_eq!(&request[5..15], b"relay.test");
            assert_eq!(&request[15..], &443u16.to_be_bytes());

            server
                .write_all(&[SOCKS5_VERSION, REP_SUCCESS, 0x00, ATYP_IPV4, 10, 0, 0, 1, 0x01, 0xBB])
                .await
                .unwrap();
        });

        socks5_connect(&mut client, &endpoint(ProxyScheme::Socks5, true), "relay.test", 443)
            .await
            .unwrap();
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_socks5_connect_rejected() {
        let (mut client, mut server) = duplex(1024);

        tokio::spawn(async move {
            let mut greeting = [0u8; 3];
            server.read_exact(&mut greeting).await.unwrap();
            server.write_all(&[SOCKS5_VERSION, AUTH_NONE]).await.unwrap();

            let mut request = [0u8; 10];
            server.read_exact(&mut request).await.unwrap();
            assert_eq!(request[3], ATYP_IPV4);
            // Connection refused
            server
                .write_all(&[SOCKS5_VERSION, 0x05, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();
        });

        let err = socks5_connect(&mut client, &endpoint(ProxyScheme::Socks5, false), "10.1.2.3", 80)
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Dial(_)));
        assert!(err.counts_toward_retry());
    }

    #[tokio::test]
    async fn test_http_connect() {
        let (mut client, mut server) = duplex(4096);

        let server_task = tokio::spawn(async move {
            let mut buf = vec![0u8; 512];
            let n = server.read(&mut buf).await.unwrap();
            let request = String::from_utf8_lossy(&buf[..n]).to_string();
            assert!(request.starts_with("CONNECT relay.test:443 HTTP/1.1\r\n"));
            assert!(request.contains("Proxy-Authorization: Basic dXNlcjpwdw==\r\n"));

            // Tunneled bytes follow the header block immediately
            server
                .write_all(b"HTTP/1.1 200 Connection established\r\nVia: test\r\n\r\nHELLO")
                .await
                .unwrap();
        });

        http_connect(&mut client, &endpoint(ProxyScheme::Http, true), "relay.test", 443)
            .await
            .unwrap();

        let mut tunneled = [0u8; 5];
        client.read_exact(&mut tunneled).await.unwrap();
        assert_eq!(&tunneled, b"HELLO");
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_http_connect_refused() {
        let (mut client, mut server) = duplex(4096);

        tokio::spawn(async move {
            let mut buf = vec![0u8; 512];
            let _ = server.read(&mut buf).await.unwrap();
            server
                .write_all(b"HTTP/1.1 407 Proxy Authentication Required\r\n\r\n")
                .await
                .unwrap();
        });

        let err = http_connect(&mut client, &endpoint(ProxyScheme::Http, false), "relay.test", 443)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("407"));
    }
}
