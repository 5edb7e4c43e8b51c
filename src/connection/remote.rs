//! Server role
//!
//! Terminates the tunnel: optional TLS, then either the cipher stream whose
//! first plaintext is the target address, or (HTTPS fallback) an HTTP
//! CONNECT naming the target. The target is then resolved, connected and
//! relayed.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use bytes::BytesMut;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use super::pump::{pump, PumpStats};
use super::{conclude, fill_buf, ConnectionState};
use crate::config::Config;
use crate::crypto::CipherMethod;
use crate::dns::ResolverSettings;
use crate::protocol::consts::HTTP_CONNECT_ESTABLISHED;
use crate::protocol::{HttpRequestParser, ParseOutcome, ParserOptions, TargetAddr};
use crate::server::ConnectionFactory;
use crate::transport::tls::negotiated_fallback;
use crate::transport::{Connector, Stream, TlsContext};

const HTTP_BAD_REQUEST: &[u8] = b"HTTP/1.1 400 Bad Request\r\nConnection: close\r\n\r\n";

/// Everything a server-side connection needs, built once at startup
pub struct RemoteSettings {
    /// Tunnel cipher
    pub method: CipherMethod,
    /// Tunnel master key
    pub master_key: Zeroizing<Vec<u8>>,
    /// TLS server, when the tunnel is wrapped
    pub tls: Option<TlsContext>,
    /// Whether clients may select HTTPS fallback
    pub https_fallback: bool,
    /// Plain connector for targets
    pub connector: Connector,
    /// Resolver settings for target names
    pub resolver: ResolverSettings,
    /// HTTP parser switches for fallback CONNECT requests
    pub parser: ParserOptions,
    /// Throughput cap on the tunnel side
    pub limit_rate: u64,
}

impl RemoteSettings {
    /// Build from configuration
    pub fn from_config(config: &Config) -> Result<Self> {
        let master_key = config
            .cipher
            .master_key()
            .context("Invalid cipher configuration")?;
        let tls = if config.tls.enabled {
            Some(TlsContext::server(&config.tls).context("Failed to set up TLS server")?)
        } else {
            None
        };

        Ok(RemoteSettings {
            method: config.cipher.method,
            master_key,
            tls,
            https_fallback: config.tls.https_fallback,
            connector: Connector::new(&config.tcp),
            resolver: ResolverSettings::from_config(&config.dns)?,
            parser: ParserOptions::default(),
            limit_rate: config.tcp.limit_rate,
        })
    }
}

impl std::fmt::Debug for RemoteSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteSettings")
            .field("method", &self.method)
            .field("tls", &self.tls.is_some())
            .field("https_fallback", &self.https_fallback)
            .finish()
    }
}

/// One tunnel accepted in the server role
pub struct RemoteConnection {
    id: u64,
    peer: SocketAddr,
    settings: Arc<RemoteSettings>,
    state: ConnectionState,
}

impl RemoteConnection {
    /// Create a connection for an accepted socket
    pub fn new(id: u64, peer: SocketAddr, settings: Arc<RemoteSettings>) -> Self {
        RemoteConnection {
            id,
            peer,
            settings,
            state: ConnectionState::Handshaking,
        }
    }

    /// Current state
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    fn set_state(&mut self, state: ConnectionState) {
        debug!("Tunnel {} {} -> {}", self.id, self.state, state);
        self.state = state;
    }

    /// Run the tunnel to completion
    pub async fn run(mut self, socket: TcpStream) -> Result<PumpStats> {
        let mut tunnel = self
            .accept(socket)
            .await
            .with_context(|| format!("Tunnel handshake with {} failed", self.peer))?;
        let target = self
            .read_target(&mut tunnel)
            .await
            .with_context(|| format!("No target from {}", self.peer))?;
        info!("Tunnel {}: {} -> {}", self.id, self.peer, target);

        let mut outbound = self
            .connect_target(&target)
            .await
            .with_context(|| format!("Failed to connect to {}", target))?;

        self.set_state(ConnectionState::Established);
        let result = pump(self.id, &mut tunnel, &mut outbound).await;
        self.set_state(ConnectionState::Closed);
        tunnel.close();
        outbound.close();
        result.with_context(|| format!("Relay for {} failed", target))
    }

    /// TLS handshake when configured, then the cipher layer unless the
    /// client picked HTTPS fallback
    async fn accept(&mut self, socket: TcpStream) -> io::Result<Stream> {
        let mut stream = match &self.settings.tls {
            None => Stream::plain(socket),
            Some(tls) => {
                let timeout = self.settings.connector.connect_timeout();
                let tls_stream = tokio::time::timeout(timeout, tls.accept(socket))
                    .await
                    .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "TLS handshake timed out"))??;
                tls.confirm_handshake(&tls_stream)?;
                let fallback = self.settings.https_fallback && negotiated_fallback(&tls_stream);
                Stream::tls(tls_stream, fallback)
            }
        };
        stream.set_rate_limit(self.settings.limit_rate);

        if stream.https_fallback() {
            debug!("Tunnel {} uses HTTPS fallback", self.id);
            return Ok(stream);
        }
        stream
            .into_cipher(self.settings.method, &self.settings.master_key)
            .map_err(io::Error::from)
    }

    async fn read_target(&mut self, tunnel: &mut Stream) -> Result<TargetAddr> {
        let mut buf = BytesMut::new();

        if tunnel.https_fallback() {
            let mut parser = HttpRequestParser::new(self.settings.parser);
            let mut fed = 0;
            let rest = loop {
                if buf.len() > fed {
                    match parser.parse(&buf[fed..]) {
                        Ok(ParseOutcome::HeadersDone { body_offset }) => {
                            break buf.split_off(fed + body_offset)
                        }
                        Ok(ParseOutcome::Incomplete) => fed = buf.len(),
                        Ok(ParseOutcome::Body) => bail!("HTTP parser finished twice"),
                        Err(e) => {
                            tunnel.write_all(HTTP_BAD_REQUEST).await?;
                            return Err(e.into());
                        }
                    }
                }
                fill_buf(tunnel, &mut buf).await?;
            };

            let request = parser.into_request();
            if !request.is_connect() {
                tunnel.write_all(HTTP_BAD_REQUEST).await?;
                bail!("Expected CONNECT, got {}", request.method);
            }
            tunnel.write_all(HTTP_CONNECT_ESTABLISHED).await?;
            tunnel.flush().await?;
            tunnel.unread(&rest);
            return Ok(TargetAddr::from_host_port(&request.host, request.port));
        }

        loop {
            if let Some((target, used)) = TargetAddr::decode(&buf)? {
                tunnel.unread(&buf[used..]);
                return Ok(target);
            }
            fill_buf(tunnel, &mut buf).await?;
        }
    }

    async fn connect_target(&mut self, target: &TargetAddr) -> io::Result<Stream> {
        let settings = self.settings.clone();
        let connector = &settings.connector;
        let host = target.host();
        let port = target.port();

        self.set_state(ConnectionState::Resolving);
        let endpoints = match target {
            TargetAddr::Ip(addr) => vec![*addr],
            TargetAddr::Domain(..) => {
                connector
                    .endpoints(&host, port, &[], &settings.resolver)
                    .await?
            }
        };

        self.set_state(ConnectionState::Connecting);
        connector.establish(&host, port, &endpoints).await.inspect_err(|e| {
            warn!("Tunnel {}: connecting to {}:{} failed: {}", self.id, host, port, e);
        })
    }
}

/// Creates a [`RemoteConnection`] per accepted socket
#[derive(Debug, Clone)]
pub struct RemoteFactory {
    settings: Arc<RemoteSettings>,
}

impl RemoteFactory {
    /// Create a factory
    pub fn new(settings: RemoteSettings) -> Self {
        RemoteFactory {
            settings: Arc::new(settings),
        }
    }
}

#[async_trait]
impl ConnectionFactory for RemoteFactory {
    fn name(&self) -> &str {
        "server"
    }

    async fn serve(&self, id: u64, peer: SocketAddr, socket: TcpStream) -> Result<()> {
        let result = RemoteConnection::new(id, peer, self.settings.clone())
            .run(socket)
            .await;
        conclude(id, result)
    }

    fn validate(&self) -> Result<()> {
        if self.settings.https_fallback && self.settings.tls.is_none() {
            warn!("HTTPS fallback has no effect without TLS");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_config;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    fn settings(password: &str) -> RemoteSettings {
        let config = parse_config(&format!(
            r#"
mode = "server"

[server]
host = "127.0.0.1"
port = 0

[cipher]
method = "chacha20-ietf-poly1305"
password = "{password}"
"#
        ))
        .unwrap();
        RemoteSettings::from_config(&config).unwrap()
    }

    async fn spawn_echo() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut r, mut w) = socket.split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
        });
        addr
    }

    async fn spawn_remote(settings: RemoteSettings) -> (SocketAddr, JoinHandle<Result<PumpStats>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let settings = Arc::new(settings);
        let handle = tokio::spawn(async move {
            let (socket, peer) = listener.accept().await.unwrap();
            RemoteConnection::new(7, peer, settings).run(socket).await
        });
        (addr, handle)
    }

    async fn open_tunnel(addr: SocketAddr, password: &str) -> Stream {
        let key = settings(password).master_key;
        let socket = TcpStream::connect(addr).await.unwrap();
        Stream::plain(socket)
            .into_cipher(CipherMethod::ChaCha20IetfPoly1305, &key)
            .unwrap()
    }

    #[tokio::test]
    async fn test_tunnel_to_ip_target() {
        let echo = spawn_echo().await;
        let (addr, handle) = spawn_remote(settings("remote-test")).await;

        let mut tunnel = open_tunnel(addr, "remote-test").await;
        let mut request = TargetAddr::Ip(echo).to_bytes().unwrap();
        request.extend_from_slice(b"hello");
        tunnel.write_all(&request).await.unwrap();
        tunnel.flush().await.unwrap();

        let mut buf = [0u8; 5];
        tunnel.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        tunnel.shutdown().await.unwrap();
        let stats = handle.await.unwrap().unwrap();
        assert_eq!(stats.upstream, 5);
        assert_eq!(stats.downstream, 5);
    }

    #[tokio::test]
    async fn test_tunnel_to_domain_target() {
        let echo = spawn_echo().await;
        let (addr, _handle) = spawn_remote(settings("remote-test")).await;

        let mut tunnel = open_tunnel(addr, "remote-test").await;
        let header = TargetAddr::domain("localhost", echo.port()).to_bytes().unwrap();
        tunnel.write_all(&header).await.unwrap();
        tunnel.flush().await.unwrap();
        tunnel.write_all(b"later").await.unwrap();
        tunnel.flush().await.unwrap();

        let mut buf = [0u8; 5];
        tunnel.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"later");
    }

    #[tokio::test]
    async fn test_wrong_key_is_rejected() {
        let (addr, handle) = spawn_remote(settings("right")).await;

        let mut tunnel = open_tunnel(addr, "wrong").await;
        let header = TargetAddr::domain("example.com", 80).to_bytes().unwrap();
        tunnel.write_all(&header).await.unwrap();
        tunnel.flush().await.unwrap();

        assert!(handle.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_unreachable_target() {
        let dead = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_addr = dead.local_addr().unwrap();
        drop(dead);
        let (addr, handle) = spawn_remote(settings("remote-test")).await;

        let mut tunnel = open_tunnel(addr, "remote-test").await;
        tunnel
            .write_all(&TargetAddr::Ip(dead_addr).to_bytes().unwrap())
            .await
            .unwrap();
        tunnel.flush().await.unwrap();

        let err = handle.await.unwrap().unwrap_err();
        assert!(err.to_string().contains("Failed to connect"));
    }
}
