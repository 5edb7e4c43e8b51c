//! SOCKS5 message parsing and replies
//!
//! Parsers work on a byte buffer that may hold a partial message: they return
//! [`Parsed::Incomplete`] until enough bytes are present, and report how many
//! bytes the message used once it is complete.

use super::address::TargetAddr;
use super::consts::*;
use crate::error::{ProtocolError, Socks5ReplyCode};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

/// Result of an incremental parse
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Parsed<T> {
    /// More bytes are needed
    Incomplete,
    /// A complete message and the number of bytes it occupied
    Done(T, usize),
}

/// SOCKS5 command types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocksCommand {
    /// TCP CONNECT - establish a TCP connection to target
    Connect,
    /// TCP BIND (not supported)
    Bind,
    /// UDP ASSOCIATE (not supported)
    UdpAssociate,
}

impl SocksCommand {
    /// Parse a command byte into SocksCommand
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            SOCKS5_CMD_TCP_CONNECT => Some(SocksCommand::Connect),
            SOCKS5_CMD_TCP_BIND => Some(SocksCommand::Bind),
            SOCKS5_CMD_UDP_ASSOCIATE => Some(SocksCommand::UdpAssociate),
            _ => None,
        }
    }

    /// Convert SocksCommand to byte
    pub fn to_byte(self) -> u8 {
        match self {
            SocksCommand::Connect => SOCKS5_CMD_TCP_CONNECT,
            SocksCommand::Bind => SOCKS5_CMD_TCP_BIND,
            SocksCommand::UdpAssociate => SOCKS5_CMD_UDP_ASSOCIATE,
        }
    }
}

impl fmt::Display for SocksCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SocksCommand::Connect => write!(f, "CONNECT"),
            SocksCommand::Bind => write!(f, "BIND"),
            SocksCommand::UdpAssociate => write!(f, "UDP ASSOCIATE"),
        }
    }
}

/// Method selection message
///
/// ```text
/// +----+----------+----------+
/// |VER | NMETHODS | METHODS  |
/// +----+----------+----------+
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodRequest {
    /// Offered authentication methods
    pub methods: Vec<u8>,
}

impl MethodRequest {
    /// Pick the method to use given whether credentials are required
    pub fn select(&self, auth_required: bool) -> u8 {
        let wanted = if auth_required {
            SOCKS5_AUTH_METHOD_PASSWORD
        } else {
            SOCKS5_AUTH_METHOD_NONE
        };
        if self.methods.contains(&wanted) {
            wanted
        } else {
            SOCKS5_AUTH_METHOD_NOT_ACCEPTABLE
        }
    }
}

/// Parse the method selection message
pub fn parse_method_request(buf: &[u8]) -> Result<Parsed<MethodRequest>, ProtocolError> {
    if buf.len() < 2 {
        return Ok(Parsed::Incomplete);
    }
    if buf[0] != SOCKS5_VERSION {
        return Err(ProtocolError::UnsupportedVersion(buf[0]));
    }
    let nmethods = buf[1] as usize;
    if nmethods == 0 {
        return Err(ProtocolError::NoAcceptableMethod);
    }
    if buf.len() < 2 + nmethods {
        return Ok(Parsed::Incomplete);
    }
    Ok(Parsed::Done(
        MethodRequest {
            methods: buf[2..2 + nmethods].to_vec(),
        },
        2 + nmethods,
    ))
}

/// Username/password sub-negotiation (RFC 1929)
#[derive(Clone, PartialEq, Eq)]
pub struct AuthRequest {
    /// Username
    pub username: String,
    /// Password
    pub password: String,
}

impl fmt::Debug for AuthRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthRequest")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl AuthRequest {
    /// Check against configured credentials
    pub fn verify(&self, username: &str, password: &str) -> bool {
        self.username == username && self.password == password
    }
}

/// Parse the username/password sub-negotiation
///
/// ```text
/// +----+------+----------+------+----------+
/// |VER | ULEN |  UNAME   | PLEN |  PASSWD  |
/// +----+------+----------+------+----------+
/// ```
pub fn parse_auth_request(buf: &[u8]) -> Result<Parsed<AuthRequest>, ProtocolError> {
    if buf.len() < 2 {
        return Ok(Parsed::Incomplete);
    }
    if buf[0] != SOCKS5_AUTH_VERSION {
        return Err(ProtocolError::UnsupportedVersion(buf[0]));
    }
    let ulen = buf[1] as usize;
    if buf.len() < 2 + ulen + 1 {
        return Ok(Parsed::Incomplete);
    }
    let plen = buf[2 + ulen] as usize;
    let total = 3 + ulen + plen;
    if buf.len() < total {
        return Ok(Parsed::Incomplete);
    }
    let username = String::from_utf8(buf[2..2 + ulen].to_vec()).map_err(|_| ProtocolError::AuthFailed)?;
    let password =
        String::from_utf8(buf[3 + ulen..total].to_vec()).map_err(|_| ProtocolError::AuthFailed)?;
    Ok(Parsed::Done(AuthRequest { username, password }, total))
}

/// A SOCKS5 request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Socks5Request {
    /// Requested command
    pub command: SocksCommand,
    /// Destination
    pub target: TargetAddr,
}

/// Parse a SOCKS5 request
///
/// ```text
/// +----+-----+-------+------+----------+----------+
/// |VER | CMD |  RSV  | ATYP | DST.ADDR | DST.PORT |
/// +----+-----+-------+------+----------+----------+
/// | 1  |  1  | X'00' |  1   | Variable |    2     |
/// +----+-----+-------+------+----------+----------+
/// ```
///
/// Unknown command bytes yield `CommandNotSupported`, which callers answer
/// with reply `0x07`.
pub fn parse_request(buf: &[u8]) -> Result<Parsed<Socks5Request>, ProtocolError> {
    if buf.len() < 4 {
        return Ok(Parsed::Incomplete);
    }
    if buf[0] != SOCKS5_VERSION {
        return Err(ProtocolError::UnsupportedVersion(buf[0]));
    }
    let command =
        SocksCommand::from_byte(buf[1]).ok_or(ProtocolError::CommandNotSupported(buf[1]))?;

    match TargetAddr::decode(&buf[3..])? {
        None => Ok(Parsed::Incomplete),
        Some((target, used)) => {
            tracing::debug!("Parsed SOCKS5 command: {} to {}", command, target);
            Ok(Parsed::Done(Socks5Request { command, target }, 3 + used))
        }
    }
}

/// Method selection reply
pub fn method_reply(method: u8) -> [u8; 2] {
    [SOCKS5_VERSION, method]
}

/// Username/password sub-negotiation reply
pub fn auth_reply(success: bool) -> [u8; 2] {
    let status = if success {
        SOCKS5_AUTH_SUCCESS
    } else {
        SOCKS5_AUTH_FAILURE
    };
    [SOCKS5_AUTH_VERSION, status]
}

/// Build a SOCKS5 reply
///
/// ```text
/// +----+-----+-------+------+----------+----------+
/// |VER | REP |  RSV  | ATYP | BND.ADDR | BND.PORT |
/// +----+-----+-------+------+----------+----------+
/// ```
///
/// The bound address defaults to `0.0.0.0:0`.
pub fn build_reply(code: Socks5ReplyCode, bind_addr: Option<SocketAddr>) -> Vec<u8> {
    let bind_addr =
        bind_addr.unwrap_or_else(|| SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0));

    let mut reply = vec![SOCKS5_VERSION, code.into(), SOCKS5_RESERVED];

    match bind_addr {
        SocketAddr::V4(addr) => {
            reply.push(SOCKS5_ADDR_TYPE_IPV4);
            reply.extend_from_slice(&addr.ip().octets());
            reply.extend_from_slice(&addr.port().to_be_bytes());
        }
        SocketAddr::V6(addr) => {
            reply.push(SOCKS5_ADDR_TYPE_IPV6);
            reply.extend_from_slice(&addr.ip().octets());
            reply.extend_from_slice(&addr.port().to_be_bytes());
        }
    }

    reply
}
