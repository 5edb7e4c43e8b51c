//! Outbound connections
//!
//! The [`Connector`] turns a host and port into a connected [`Stream`]:
//! it picks endpoints, tries each under the connect timeout, applies socket
//! policy and, when configured, runs the TLS handshake.

use super::tls::{negotiated_fallback, TlsContext};
use super::{SocketOpts, Stream};
use crate::config::TcpConfig;
use crate::dns::{AsyncResolver, ResolverSettings};
use crate::helper::duration_from_millis;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, warn};

/// Connection factory for upstream and target sockets
#[derive(Debug, Clone)]
pub struct Connector {
    /// Socket options to apply to connections
    socket_opts: SocketOpts,
    /// Per-endpoint connection timeout
    connect_timeout: Duration,
    /// Per-stream throughput cap
    limit_rate: u64,
    /// TLS client, when the tunnel is wrapped
    tls: Option<TlsContext>,
}

impl Connector {
    /// Create a plain connector from TCP config
    pub fn new(config: &TcpConfig) -> Self {
        Connector {
            socket_opts: SocketOpts::from_tcp_config(config),
            connect_timeout: duration_from_millis(config.connect_timeout_ms),
            limit_rate: config.limit_rate,
            tls: None,
        }
    }

    /// Wrap every connection in TLS
    pub fn with_tls(mut self, tls: TlsContext) -> Self {
        self.tls = Some(tls);
        self
    }

    /// Set connection timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Per-endpoint connect timeout
    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    /// Candidate endpoints for `host:port`
    ///
    /// Pinned addresses win, then an IP literal, then a resolver built from
    /// `resolver` for this lookup only.
    pub async fn endpoints(
        &self,
        host: &str,
        port: u16,
        pinned: &[IpAddr],
        resolver: &ResolverSettings,
    ) -> io::Result<Vec<SocketAddr>> {
        if !pinned.is_empty() {
            return Ok(pinned.iter().map(|ip| SocketAddr::new(*ip, port)).collect());
        }
        let literal = host.trim_start_matches('[').trim_end_matches(']');
        if let Ok(ip) = literal.parse::<IpAddr>() {
            return Ok(vec![SocketAddr::new(ip, port)]);
        }
        let addrs = AsyncResolver::new(resolver).resolve(host, port).await?;
        if addrs.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("No addresses for {}", host),
            ));
        }
        Ok(addrs)
    }

    /// Try each endpoint in turn; the last error is returned if all fail
    pub async fn connect_endpoints(&self, endpoints: &[SocketAddr]) -> io::Result<TcpStream> {
        let mut last_err =
            io::Error::new(io::ErrorKind::AddrNotAvailable, "No endpoints to connect to");

        for endpoint in endpoints {
            match tokio::time::timeout(self.connect_timeout, TcpStream::connect(endpoint)).await {
                Ok(Ok(stream)) => {
                    self.socket_opts.apply_logged(&stream);
                    debug!("TCP connection established to {}", endpoint);
                    return Ok(stream);
                }
                Ok(Err(e)) => {
                    debug!("Failed to connect to {}: {}", endpoint, e);
                    last_err = e;
                }
                Err(_) => {
                    debug!("Connection timeout to {}", endpoint);
                    last_err = io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("Connection timeout to {}", endpoint),
                    );
                }
            }
        }
        Err(last_err)
    }

    /// Resolve, connect and (if configured) run the TLS handshake
    pub async fn connect(
        &self,
        host: &str,
        port: u16,
        pinned: &[IpAddr],
        resolver: &ResolverSettings,
    ) -> io::Result<Stream> {
        let endpoints = self.endpoints(host, port, pinned, resolver).await?;
        self.establish(host, port, &endpoints).await
    }

    /// Connect to one of `endpoints` and run the TLS handshake if configured
    ///
    /// `host` and `port` only label log lines.
    pub async fn establish(&self, host: &str, port: u16, endpoints: &[SocketAddr]) -> io::Result<Stream> {
        let tcp = self.connect_endpoints(endpoints).await?;

        let mut stream = match &self.tls {
            None => Stream::plain(tcp),
            Some(tls) => {
                let tls_stream = tokio::time::timeout(self.connect_timeout, tls.connect(tcp))
                    .await
                    .map_err(|_| {
                        io::Error::new(io::ErrorKind::TimedOut, "TLS handshake timed out")
                    })??;
                tls.confirm_handshake(&tls_stream).inspect_err(|e| {
                    warn!("TLS handshake with {}:{} not confirmed: {}", host, port, e);
                })?;
                let fallback = negotiated_fallback(&tls_stream);
                if fallback {
                    debug!("Peer {}:{} selected HTTPS fallback", host, port);
                }
                Stream::tls(tls_stream, fallback)
            }
        };
        stream.set_rate_limit(self.limit_rate);
        Ok(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::{AddressFamily, EngineOptions};
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    fn resolver() -> ResolverSettings {
        ResolverSettings {
            engine: EngineOptions {
                servers: vec!["127.0.0.1:9".parse().unwrap()],
                attempt_timeout: Duration::from_millis(200),
                tries: 1,
            },
            timeout: Duration::from_secs(1),
            family: AddressFamily::Unspec,
        }
    }

    #[tokio::test]
    async fn test_endpoint_precedence() {
        let connector = Connector::new(&TcpConfig::default());
        let resolver = resolver();
        let pinned: Vec<IpAddr> = vec!["10.0.0.1".parse().unwrap(), "10.0.0.2".parse().unwrap()];

        let endpoints = connector
            .endpoints("example.com", 443, &pinned, &resolver)
            .await
            .unwrap();
        assert_eq!(endpoints.len(), 2);
        assert_eq!(endpoints[1], "10.0.0.2:443".parse().unwrap());

        let endpoints = connector.endpoints("[::1]", 80, &[], &resolver).await.unwrap();
        assert_eq!(endpoints, vec!["[::1]:80".parse().unwrap()]);

        let endpoints = connector.endpoints("localhost", 80, &[], &resolver).await.unwrap();
        assert!(endpoints.contains(&"127.0.0.1:80".parse().unwrap()));
    }

    #[tokio::test]
    async fn test_connect_plain() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(b"hi").await.unwrap();
        });

        let connector = Connector::new(&TcpConfig::default());
        let mut stream = connector
            .connect("127.0.0.1", port, &[], &resolver())
            .await
            .unwrap();
        let mut buf = [0u8; 2];
        tokio::io::AsyncReadExt::read_exact(&mut stream, &mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");
        assert!(!stream.https_fallback());
    }

    #[tokio::test]
    async fn test_falls_through_to_next_endpoint() {
        let dead = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_addr = dead.local_addr().unwrap();
        drop(dead);
        let live = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let live_addr = live.local_addr().unwrap();

        let connector = Connector::new(&TcpConfig::default());
        let stream = connector
            .connect_endpoints(&[dead_addr, live_addr])
            .await
            .unwrap();
        assert_eq!(stream.peer_addr().unwrap(), live_addr);
    }

    #[tokio::test]
    async fn test_last_error_returned() {
        let dead = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_addr = dead.local_addr().unwrap();
        drop(dead);

        let connector = Connector::new(&TcpConfig::default());
        let err = connector.connect_endpoints(&[dead_addr]).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionRefused);

        let err = connector.connect_endpoints(&[]).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AddrNotAvailable);
    }
}
