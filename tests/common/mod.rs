//! Test utilities and mocks for Sockstun
//!
//! This module provides common test utilities used across integration tests.

#![allow(dead_code)]

use hickory_proto::op::{Message, MessageType, OpCode, ResponseCode};
use hickory_proto::rr::rdata::A;
use hickory_proto::rr::{RData, Record, RecordType};
use hickory_proto::serialize::binary::{BinDecodable, BinEncodable};
use sockstun::config::{Config, Mode};
use sockstun::crypto::CipherMethod;
use std::net::{Ipv4Addr, SocketAddr};
use tokio::net::{TcpListener, TcpStream, UdpSocket};

/// Create a test TCP listener on an available port
pub async fn create_test_listener() -> (TcpListener, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, addr)
}

/// Create a connected TCP stream pair for testing
pub async fn create_tcp_stream_pair() -> (TcpStream, TcpStream) {
    let (listener, addr) = create_test_listener().await;

    let connect_fut = TcpStream::connect(addr);
    let accept_fut = listener.accept();

    let (client_stream, accepted) = tokio::join!(connect_fut, accept_fut);

    (client_stream.unwrap(), accepted.unwrap().0)
}

/// Echo server accepting any number of connections
pub async fn spawn_echo_server() -> SocketAddr {
    let (listener, addr) = create_test_listener().await;
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

/// DNS server answering `names` with 127.0.0.1 and anything else with
/// NXDOMAIN; AAAA queries for known names get an empty answer
pub async fn spawn_dns_server(names: &[&str]) -> SocketAddr {
    let names: Vec<String> = names.iter().map(|n| n.to_string()).collect();
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = [0u8; 1500];
        while let Ok((n, peer)) = socket.recv_from(&mut buf).await {
            let Ok(request) = Message::from_bytes(&buf[..n]) else {
                continue;
            };
            let mut response = Message::new();
            response.set_id(request.id());
            response.set_message_type(MessageType::Response);
            response.set_op_code(OpCode::Query);

            let known = request.queries().iter().any(|q| {
                let name = q.name().to_ascii();
                names.iter().any(|n| n == name.trim_end_matches('.'))
            });
            response.set_response_code(if known {
                ResponseCode::NoError
            } else {
                ResponseCode::NXDomain
            });
            for query in request.queries() {
                response.add_query(query.clone());
                if known && query.query_type() == RecordType::A {
                    response.add_answer(Record::from_rdata(
                        query.name().clone(),
                        30,
                        RData::A(A(Ipv4Addr::LOCALHOST)),
                    ));
                }
            }
            let _ = socket.send_to(&response.to_bytes().unwrap(), peer).await;
        }
    });
    addr
}

/// Test configuration builder
pub struct TestConfigBuilder {
    mode: Mode,
    server_port: u16,
    method: CipherMethod,
    password: String,
    credentials: Option<(String, String)>,
    dns_servers: Vec<String>,
    limit_rate: u64,
}

impl Default for TestConfigBuilder {
    fn default() -> Self {
        TestConfigBuilder {
            mode: Mode::Local,
            server_port: 0,
            method: CipherMethod::ChaCha20IetfPoly1305,
            password: "integration-secret".to_string(),
            credentials: None,
            dns_servers: Vec::new(),
            limit_rate: 0,
        }
    }
}

impl TestConfigBuilder {
    /// Create a new test config builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the role
    pub fn mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    /// Tunnel server port (local role) or listen port (server role)
    pub fn server_port(mut self, port: u16) -> Self {
        self.server_port = port;
        self
    }

    /// Set the cipher
    pub fn method(mut self, method: CipherMethod) -> Self {
        self.method = method;
        self
    }

    /// Set the tunnel password
    pub fn password(mut self, password: &str) -> Self {
        self.password = password.to_string();
        self
    }

    /// Require SOCKS5 username/password
    pub fn credentials(mut self, username: &str, password: &str) -> Self {
        self.credentials = Some((username.to_string(), password.to_string()));
        self
    }

    /// Use these name servers
    pub fn dns_server(mut self, addr: SocketAddr) -> Self {
        self.dns_servers.push(addr.to_string());
        self
    }

    /// Cap per-connection throughput
    pub fn limit_rate(mut self, bytes_per_sec: u64) -> Self {
        self.limit_rate = bytes_per_sec;
        self
    }

    /// Build the configuration
    pub fn build(self) -> Config {
        let mut config = Config {
            mode: self.mode,
            ..Config::default()
        };
        config.local.listen = vec!["127.0.0.1:0".to_string()];
        if let Some((username, password)) = self.credentials {
            config.local.username = Some(username);
            config.local.password = Some(password);
        }
        config.server.host = "127.0.0.1".to_string();
        config.server.port = self.server_port;
        config.cipher.method = self.method;
        config.cipher.password = Some(self.password);
        config.dns.servers = self.dns_servers;
        config.dns.timeout_ms = 2000;
        config.tcp.connect_timeout_ms = 2000;
        config.tcp.limit_rate = self.limit_rate;
        config
    }
}

/// Mock SOCKS5 handshake data
pub mod socks5_mock {
    use sockstun::protocol::consts::*;

    /// Create a no-auth method selection request
    pub fn create_auth_request_no_auth() -> Vec<u8> {
        vec![SOCKS5_VERSION, 1, SOCKS5_AUTH_METHOD_NONE]
    }

    /// Create a password auth method selection request
    pub fn create_auth_request_password() -> Vec<u8> {
        vec![SOCKS5_VERSION, 1, SOCKS5_AUTH_METHOD_PASSWORD]
    }

    /// Create a connect command to IPv4 address
    pub fn create_connect_ipv4(ip: [u8; 4], port: u16) -> Vec<u8> {
        let mut cmd = vec![
            SOCKS5_VERSION,
            SOCKS5_CMD_TCP_CONNECT,
            SOCKS5_RESERVED,
            SOCKS5_ADDR_TYPE_IPV4,
        ];
        cmd.extend_from_slice(&ip);
        cmd.extend_from_slice(&port.to_be_bytes());
        cmd
    }

    /// Create a connect command to domain
    pub fn create_connect_domain(domain: &str, port: u16) -> Vec<u8> {
        let mut cmd = vec![
            SOCKS5_VERSION,
            SOCKS5_CMD_TCP_CONNECT,
            SOCKS5_RESERVED,
            SOCKS5_ADDR_TYPE_DOMAIN,
            domain.len() as u8,
        ];
        cmd.extend_from_slice(domain.as_bytes());
        cmd.extend_from_slice(&port.to_be_bytes());
        cmd
    }
}
