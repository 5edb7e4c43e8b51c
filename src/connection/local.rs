//! Local role
//!
//! Applications connect here speaking SOCKS5, SOCKS4/4a or HTTP. The target is
//! taken from their request, the connection to the tunnel server is opened,
//! and the target travels to the server either as the first plaintext of the
//! cipher stream or as an HTTP CONNECT inside TLS.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use std::future::Future;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{debug, info};
use zeroize::Zeroizing;

use super::pump::{pump, PumpStats};
use super::{conclude, fill_buf, ConnectionState};
use crate::config::Config;
use crate::crypto::CipherMethod;
use crate::dns::ResolverSettings;
use crate::error::{ProtocolError, Socks5ReplyCode};
use crate::helper::{DEFAULT_BUFFER_SIZE, MAX_PENDING_BYTES};
use crate::protocol::consts::*;
use crate::protocol::{
    socks4, socks5, HttpRequestParser, HttpResponseParser, ParseOutcome, Parsed, ParserOptions,
    ProxyProtocol, SocksCommand, TargetAddr,
};
use crate::server::ConnectionFactory;
use crate::transport::{Connector, Stream, TlsContext};

/// Everything a local connection needs, built once at startup
pub struct LocalSettings {
    /// Tunnel cipher
    pub method: CipherMethod,
    /// Tunnel master key
    pub master_key: Zeroizing<Vec<u8>>,
    /// SOCKS5 username and password, when required
    pub credentials: Option<(String, String)>,
    /// Tunnel server host
    pub upstream_host: String,
    /// Tunnel server port
    pub upstream_port: u16,
    /// Addresses to use instead of resolving the server host
    pub pinned: Vec<IpAddr>,
    /// Connector for the tunnel server (TLS when enabled)
    pub connector: Connector,
    /// Resolver settings for the per-connection resolver
    pub resolver: ResolverSettings,
    /// HTTP parser switches
    pub parser: ParserOptions,
    /// Client-side throughput cap
    pub limit_rate: u64,
}

impl LocalSettings {
    /// Build from configuration
    pub fn from_config(config: &Config) -> Result<Self> {
        let master_key = config
            .cipher
            .master_key()
            .context("Invalid cipher configuration")?;

        let mut connector = Connector::new(&config.tcp);
        if config.tls.enabled {
            let tls = TlsContext::client(&config.tls, &config.server.host)
                .context("Failed to set up TLS client")?;
            connector = connector.with_tls(tls);
        }

        let credentials = match (&config.local.username, &config.local.password) {
            (Some(user), Some(pass)) => Some((user.clone(), pass.clone())),
            _ => None,
        };

        Ok(LocalSettings {
            method: config.cipher.method,
            master_key,
            credentials,
            upstream_host: config.server.host.clone(),
            upstream_port: config.server.port,
            pinned: config.server.pinned_ips(),
            connector,
            resolver: ResolverSettings::from_config(&config.dns)?,
            parser: ParserOptions::default(),
            limit_rate: config.tcp.limit_rate,
        })
    }
}

impl std::fmt::Debug for LocalSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalSettings")
            .field("method", &self.method)
            .field("auth", &self.credentials.is_some())
            .field("upstream", &format_args!("{}:{}", self.upstream_host, self.upstream_port))
            .field("pinned", &self.pinned)
            .finish()
    }
}

/// `host:port` with IPv6 hosts in brackets
fn authority(target: &TargetAddr) -> String {
    match target {
        TargetAddr::Ip(addr) => addr.to_string(),
        TargetAddr::Domain(host, port) => format!("{}:{}", host, port),
    }
}

/// Drive `fut` while buffering whatever the client sends meanwhile
async fn buffer_while<F, T>(
    client: &mut Stream,
    pending: &mut BytesMut,
    client_eof: &mut bool,
    fut: F,
) -> io::Result<T>
where
    F: Future<Output = io::Result<T>>,
{
    tokio::pin!(fut);
    let mut chunk = vec![0u8; DEFAULT_BUFFER_SIZE];
    loop {
        tokio::select! {
            result = &mut fut => return result,
            read = client.read_some(&mut chunk), if !*client_eof => {
                let n = read?;
                if n == 0 {
                    *client_eof = true;
                    continue;
                }
                if pending.len() + n > MAX_PENDING_BYTES {
                    return Err(ProtocolError::BufferOverflow(pending.len() + n).into());
                }
                pending.extend_from_slice(&chunk[..n]);
            }
        }
    }
}

/// One application connection in the local role
pub struct LocalConnection {
    id: u64,
    peer: SocketAddr,
    settings: Arc<LocalSettings>,
    state: ConnectionState,
    client: Stream,
    pending: BytesMut,
    client_eof: bool,
    protocol: Option<ProxyProtocol>,
}

impl LocalConnection {
    /// Wrap an accepted client stream
    pub fn new(id: u64, peer: SocketAddr, mut client: Stream, settings: Arc<LocalSettings>) -> Self {
        client.set_rate_limit(settings.limit_rate);
        LocalConnection {
            id,
            peer,
            settings,
            state: ConnectionState::Handshaking,
            client,
            pending: BytesMut::new(),
            client_eof: false,
            protocol: None,
        }
    }

    /// Current state
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Protocol the client spoke, once detected
    pub fn protocol(&self) -> Option<ProxyProtocol> {
        self.protocol
    }

    fn set_state(&mut self, state: ConnectionState) {
        debug!("Connection {} {} -> {}", self.id, self.state, state);
        self.state = state;
    }

    /// Run the connection to completion
    pub async fn run(mut self) -> Result<PumpStats> {
        let target = self
            .handshake()
            .await
            .with_context(|| format!("Handshake with {} failed", self.peer))?;
        info!(
            "Connection {}: {} request from {} to {}",
            self.id,
            self.protocol.map(|p| p.to_string()).unwrap_or_default(),
            self.peer,
            target
        );

        let upstream = self.connect_upstream().await.with_context(|| {
            format!(
                "Failed to reach tunnel server {}:{}",
                self.settings.upstream_host, self.settings.upstream_port
            )
        })?;
        let mut upstream = self
            .open_tunnel(upstream, &target)
            .await
            .with_context(|| format!("Failed to open tunnel to {}", target))?;

        self.set_state(ConnectionState::Established);
        let result = pump(self.id, &mut self.client, &mut upstream).await;
        self.set_state(ConnectionState::Closed);
        upstream.close();
        self.client.close();
        result.with_context(|| format!("Relay for {} failed", target))
    }

    async fn reply(&mut self, data: &[u8]) -> io::Result<()> {
        self.client.write_all(data).await?;
        self.client.flush().await
    }

    /// Read the proxy request and answer it
    pub async fn handshake(&mut self) -> Result<TargetAddr> {
        let mut buf = BytesMut::new();
        fill_buf(&mut self.client, &mut buf).await?;
        let protocol = ProxyProtocol::detect(buf[0]);
        self.protocol = Some(protocol);
        debug!("Connection {} speaks {}", self.id, protocol);

        match protocol {
            ProxyProtocol::Socks5 => self.socks5_handshake(buf).await,
            ProxyProtocol::Socks4 => self.socks4_handshake(buf).await,
            ProxyProtocol::Http => self.http_handshake(buf).await,
        }
    }

    async fn socks5_handshake(&mut self, mut buf: BytesMut) -> Result<TargetAddr> {
        let methods = loop {
            match socks5::parse_method_request(&buf)? {
                Parsed::Done(methods, used) => {
                    buf.advance(used);
                    break methods;
                }
                Parsed::Incomplete => {
                    fill_buf(&mut self.client, &mut buf).await?;
                }
            }
        };

        let method = methods.select(self.settings.credentials.is_some());
        self.reply(&socks5::method_reply(method)).await?;
        if method == SOCKS5_AUTH_METHOD_NOT_ACCEPTABLE {
            return Err(ProtocolError::NoAcceptableMethod.into());
        }

        if method == SOCKS5_AUTH_METHOD_PASSWORD {
            let auth = loop {
                match socks5::parse_auth_request(&buf)? {
                    Parsed::Done(auth, used) => {
                        buf.advance(used);
                        break auth;
                    }
                    Parsed::Incomplete => {
                        fill_buf(&mut self.client, &mut buf).await?;
                    }
                }
            };
            let accepted = self
                .settings
                .credentials
                .as_ref()
                .is_some_and(|(user, pass)| auth.verify(user, pass));
            self.reply(&socks5::auth_reply(accepted)).await?;
            if !accepted {
                return Err(ProtocolError::AuthFailed.into());
            }
        }

        let request = loop {
            match socks5::parse_request(&buf) {
                Ok(Parsed::Done(request, used)) => {
                    buf.advance(used);
                    break request;
                }
                Ok(Parsed::Incomplete) => {
                    fill_buf(&mut self.client, &mut buf).await?;
                }
                Err(e) => {
                    let code = match e {
                        ProtocolError::CommandNotSupported(_) => {
                            Socks5ReplyCode::CommandNotSupported
                        }
                        ProtocolError::AddressTypeNotSupported(_) => {
                            Socks5ReplyCode::AddressTypeNotSupported
                        }
                        _ => Socks5ReplyCode::GeneralFailure,
                    };
                    self.reply(&socks5::build_reply(code, None)).await?;
                    return Err(e.into());
                }
            }
        };

        if request.command != SocksCommand::Connect {
            self.reply(&socks5::build_reply(Socks5ReplyCode::CommandNotSupported, None))
                .await?;
            return Err(ProtocolError::CommandNotSupported(request.command.to_byte()).into());
        }

        self.reply(&socks5::build_reply(Socks5ReplyCode::Succeeded, None))
            .await?;
        self.pending.extend_from_slice(&buf);
        Ok(request.target)
    }

    async fn socks4_handshake(&mut self, mut buf: BytesMut) -> Result<TargetAddr> {
        let request = loop {
            match socks4::parse_request(&buf) {
                Ok(Parsed::Done(request, used)) => {
                    buf.advance(used);
                    break request;
                }
                Ok(Parsed::Incomplete) => {
                    fill_buf(&mut self.client, &mut buf).await?;
                }
                Err(e) => {
                    self.reply(&socks4::build_reply(false)).await?;
                    return Err(e.into());
                }
            }
        };

        self.reply(&socks4::build_reply(true)).await?;
        self.pending.extend_from_slice(&buf);
        Ok(request.target)
    }

    async fn http_handshake(&mut self, mut buf: BytesMut) -> Result<TargetAddr> {
        let mut parser = HttpRequestParser::new(self.settings.parser);
        let mut fed = 0;
        let rest = loop {
            match parser.parse(&buf[fed..])? {
                ParseOutcome::HeadersDone { body_offset } => break buf.split_off(fed + body_offset),
                ParseOutcome::Incomplete => {
                    fed = buf.len();
                    fill_buf(&mut self.client, &mut buf).await?;
                }
                ParseOutcome::Body => bail!("HTTP parser finished twice"),
            }
        };

        let request = parser.into_request();
        let target = TargetAddr::from_host_port(&request.host, request.port);
        if request.is_connect() {
            self.reply(HTTP_CONNECT_ESTABLISHED).await?;
        } else {
            self.pending.extend_from_slice(request.reforge(&[]).as_bytes());
        }
        self.pending.extend_from_slice(&rest);
        Ok(target)
    }

    /// Resolve and connect to the tunnel server, buffering client data
    async fn connect_upstream(&mut self) -> io::Result<Stream> {
        let settings = self.settings.clone();
        let host = settings.upstream_host.as_str();
        let port = settings.upstream_port;

        self.set_state(ConnectionState::Resolving);
        let endpoints = buffer_while(
            &mut self.client,
            &mut self.pending,
            &mut self.client_eof,
            settings.connector.endpoints(host, port, &settings.pinned, &settings.resolver),
        )
        .await?;

        self.set_state(ConnectionState::Connecting);
        buffer_while(
            &mut self.client,
            &mut self.pending,
            &mut self.client_eof,
            settings.connector.establish(host, port, &endpoints),
        )
        .await
    }

    /// Send the target to the server, followed by buffered client data
    async fn open_tunnel(&mut self, upstream: Stream, target: &TargetAddr) -> Result<Stream> {
        let pending = std::mem::take(&mut self.pending);

        if upstream.https_fallback() {
            let mut upstream = upstream;
            let authority = authority(target);
            let request = format!(
                "CONNECT {0} HTTP/1.1\r\nHost: {0}\r\nProxy-Connection: Keep-Alive\r\n\r\n",
                authority
            );
            upstream.write_all(request.as_bytes()).await?;
            upstream.flush().await?;

            let mut parser = HttpResponseParser::new();
            let mut chunk = vec![0u8; DEFAULT_BUFFER_SIZE];
            loop {
                let n = upstream.read_some(&mut chunk).await?;
                if n == 0 {
                    bail!("Server closed before answering CONNECT");
                }
                match parser.parse(&chunk[..n])? {
                    ParseOutcome::HeadersDone { body_offset } => {
                        upstream.unread(&chunk[body_offset..n]);
                        break;
                    }
                    ParseOutcome::Incomplete => continue,
                    ParseOutcome::Body => bail!("HTTP response parser finished twice"),
                }
            }
            if parser.status_code() != 200 {
                bail!("Server answered CONNECT with {}", parser.status_code());
            }

            if !pending.is_empty() {
                upstream.write_all(&pending).await?;
                upstream.flush().await?;
            }
            return Ok(upstream);
        }

        let mut upstream = upstream.into_cipher(self.settings.method, &self.settings.master_key)?;
        let mut header = BytesMut::with_capacity(target.encoded_len() + pending.len());
        target.write_to(&mut header)?;
        header.extend_from_slice(&pending);
        upstream.write_all(&header).await?;
        upstream.flush().await?;
        Ok(upstream)
    }
}

/// Creates a [`LocalConnection`] per accepted socket
#[derive(Debug, Clone)]
pub struct LocalFactory {
    settings: Arc<LocalSettings>,
}

impl LocalFactory {
    /// Create a factory
    pub fn new(settings: LocalSettings) -> Self {
        LocalFactory {
            settings: Arc::new(settings),
        }
    }
}

#[async_trait]
impl ConnectionFactory for LocalFactory {
    fn name(&self) -> &str {
        "local"
    }

    async fn serve(&self, id: u64, peer: SocketAddr, socket: TcpStream) -> Result<()> {
        let connection = LocalConnection::new(id, peer, Stream::plain(socket), self.settings.clone());
        conclude(id, connection.run().await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_config;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;

    fn settings(port: u16, auth: bool) -> LocalSettings {
        let auth = if auth {
            "username = \"alice\"\npassword = \"wonderland\"\n"
        } else {
            ""
        };
        let config = parse_config(&format!(
            r#"
mode = "local"

[local]
listen = ["127.0.0.1:0"]
{auth}
[server]
host = "127.0.0.1"
port = {port}

[cipher]
method = "aes-128-gcm"
password = "local-test"
"#
        ))
        .unwrap();
        LocalSettings::from_config(&config).unwrap()
    }

    /// Minimal tunnel server: reports the decoded target, then echoes
    async fn spawn_tunnel_echo() -> (u16, oneshot::Receiver<(TargetAddr, Vec<u8>)>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let key = settings(0, false).master_key;
            let mut stream = Stream::plain(socket)
                .into_cipher(CipherMethod::Aes128Gcm, &key)
                .unwrap();
            let mut buf = BytesMut::new();
            let (target, used) = loop {
                if let Some(found) = TargetAddr::decode(&buf).unwrap() {
                    break found;
                }
                let mut chunk = [0u8; 1024];
                let n = stream.read_some(&mut chunk).await.unwrap();
                buf.extend_from_slice(&chunk[..n]);
            };
            let first = buf[used..].to_vec();
            stream.write_all(&first).await.unwrap();
            stream.flush().await.unwrap();
            let _ = tx.send((target, first));

            let mut chunk = [0u8; 1024];
            loop {
                let n = stream.read_some(&mut chunk).await.unwrap_or(0);
                if n == 0 {
                    break;
                }
                stream.write_all(&chunk[..n]).await.unwrap();
                stream.flush().await.unwrap();
            }
        });
        (port, rx)
    }

    async fn spawn_local(settings: LocalSettings) -> (SocketAddr, tokio::task::JoinHandle<Result<PumpStats>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let settings = Arc::new(settings);
        let handle = tokio::spawn(async move {
            let (socket, peer) = listener.accept().await.unwrap();
            LocalConnection::new(1, peer, Stream::plain(socket), settings).run().await
        });
        (addr, handle)
    }

    #[tokio::test]
    async fn test_socks5_connect() {
        let (port, target_rx) = spawn_tunnel_echo().await;
        let (addr, handle) = spawn_local(settings(port, false)).await;

        let mut app = TcpStream::connect(addr).await.unwrap();
        app.write_all(&[5, 1, 0]).await.unwrap();
        let mut reply = [0u8; 2];
        app.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [5, 0]);

        let mut request = vec![5, 1, 0, 3, 11];
        request.extend_from_slice(b"example.com");
        request.extend_from_slice(&443u16.to_be_bytes());
        app.write_all(&request).await.unwrap();
        let mut reply = [0u8; 10];
        app.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], 0);

        app.write_all(b"ping").await.unwrap();
        let mut echo = [0u8; 4];
        app.read_exact(&mut echo).await.unwrap();
        assert_eq!(&echo, b"ping");

        let (target, _) = target_rx.await.unwrap();
        assert_eq!(target, TargetAddr::domain("example.com", 443));

        drop(app);
        let stats = handle.await.unwrap().unwrap();
        assert!(stats.upstream >= 4);
    }

    #[tokio::test]
    async fn test_http_connect() {
        let (port, target_rx) = spawn_tunnel_echo().await;
        let (addr, _handle) = spawn_local(settings(port, false)).await;

        let mut app = TcpStream::connect(addr).await.unwrap();
        app.write_all(b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\nearly")
            .await
            .unwrap();
        let mut reply = vec![0u8; HTTP_CONNECT_ESTABLISHED.len()];
        app.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, HTTP_CONNECT_ESTABLISHED);

        let mut echo = [0u8; 5];
        app.read_exact(&mut echo).await.unwrap();
        assert_eq!(&echo, b"early");

        let (target, first) = target_rx.await.unwrap();
        assert_eq!(target, TargetAddr::domain("example.com", 443));
        assert_eq!(first, b"early");
    }

    #[tokio::test]
    async fn test_plain_http_is_reforged() {
        let (port, target_rx) = spawn_tunnel_echo().await;
        let (addr, _handle) = spawn_local(settings(port, false)).await;

        let mut app = TcpStream::connect(addr).await.unwrap();
        app.write_all(
            b"GET http://example.com/index.html HTTP/1.1\r\nHost: example.com\r\nProxy-Connection: keep-alive\r\n\r\n",
        )
        .await
        .unwrap();

        let (target, first) = target_rx.await.unwrap();
        assert_eq!(target, TargetAddr::domain("example.com", 80));
        let forwarded = String::from_utf8(first).unwrap();
        assert!(forwarded.starts_with("GET /index.html HTTP/1.1\r\n"));
        assert!(forwarded.contains("Host: example.com\r\n"));
        assert!(!forwarded.contains("Proxy-Connection"));
        assert!(forwarded.ends_with("\r\n\r\n"));
    }

    #[tokio::test]
    async fn test_socks4a_connect() {
        let (port, target_rx) = spawn_tunnel_echo().await;
        let (addr, _handle) = spawn_local(settings(port, false)).await;

        let mut app = TcpStream::connect(addr).await.unwrap();
        let mut request = vec![4, 1, 0, 80, 0, 0, 0, 1, 0];
        request.extend_from_slice(b"example.org\0");
        app.write_all(&request).await.unwrap();
        let mut reply = [0u8; 8];
        app.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], SOCKS4_REPLY_GRANTED);

        let (target, _) = target_rx.await.unwrap();
        assert_eq!(target, TargetAddr::domain("example.org", 80));
    }

    #[tokio::test]
    async fn test_socks5_auth_rejected() {
        let (addr, handle) = spawn_local(settings(9, true)).await;

        let mut app = TcpStream::connect(addr).await.unwrap();
        app.write_all(&[5, 1, 2]).await.unwrap();
        let mut reply = [0u8; 2];
        app.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [5, 2]);

        let mut auth = vec![1, 5];
        auth.extend_from_slice(b"alice");
        auth.push(3);
        auth.extend_from_slice(b"bad");
        app.write_all(&auth).await.unwrap();
        app.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [1, 1]);

        assert!(handle.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_socks5_no_acceptable_method() {
        let (addr, handle) = spawn_local(settings(9, true)).await;

        let mut app = TcpStream::connect(addr).await.unwrap();
        app.write_all(&[5, 1, 0]).await.unwrap();
        let mut reply = [0u8; 2];
        app.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [5, 0xFF]);
        assert!(handle.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_socks5_bind_not_supported() {
        let (addr, handle) = spawn_local(settings(9, false)).await;

        let mut app = TcpStream::connect(addr).await.unwrap();
        app.write_all(&[5, 1, 0, 5, 2, 0, 1, 127, 0, 0, 1, 0, 80])
            .await
            .unwrap();
        let mut reply = [0u8; 12];
        app.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], 0);
        assert_eq!(reply[3], 0x07);
        assert!(handle.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_buffering_is_capped() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (app, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let mut app = app.unwrap();
        let mut client = Stream::plain(accepted.unwrap().0);

        let writer = tokio::spawn(async move {
            let data = vec![0u8; MAX_PENDING_BYTES + 4096];
            let _ = app.write_all(&data).await;
            app
        });

        let mut pending = BytesMut::new();
        let mut eof = false;
        let never = std::future::pending::<io::Result<()>>();
        let err = buffer_while(&mut client, &mut pending, &mut eof, never)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert!(pending.len() <= MAX_PENDING_BYTES);
        drop(client);
        let _ = writer.await;
    }

    #[test]
    fn test_authority() {
        assert_eq!(authority(&TargetAddr::domain("example.com", 443)), "example.com:443");
        assert_eq!(
            authority(&TargetAddr::Ip("[::1]:8080".parse().unwrap())),
            "[::1]:8080"
        );
    }
}
