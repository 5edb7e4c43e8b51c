//! Target addresses
//!
//! The same `ATYP | ADDR | PORT` encoding is used by SOCKS5 requests and by
//! the tunnel request header sent from the local side to the server.

use super::consts::*;
use crate::error::ProtocolError;
use bytes::{BufMut, BytesMut};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// Destination of a proxied connection
///
/// Either a socket address or a domain name that still needs resolving.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetAddr {
    /// IP address with port
    Ip(SocketAddr),
    /// Domain name with port
    Domain(String, u16),
}

impl TargetAddr {
    /// Create a new TargetAddr from an IPv4 address and port
    pub fn ipv4(ip: Ipv4Addr, port: u16) -> Self {
        TargetAddr::Ip(SocketAddr::new(IpAddr::V4(ip), port))
    }

    /// Create a new TargetAddr from an IPv6 address and port
    pub fn ipv6(ip: Ipv6Addr, port: u16) -> Self {
        TargetAddr::Ip(SocketAddr::new(IpAddr::V6(ip), port))
    }

    /// Create a new TargetAddr from a domain name and port
    pub fn domain(domain: impl Into<String>, port: u16) -> Self {
        TargetAddr::Domain(domain.into(), port)
    }

    /// Build from a host string, recognizing IP literals
    pub fn from_host_port(host: &str, port: u16) -> Self {
        let trimmed = host.trim_start_matches('[').trim_end_matches(']');
        match trimmed.parse::<IpAddr>() {
            Ok(ip) => TargetAddr::Ip(SocketAddr::new(ip, port)),
            Err(_) => TargetAddr::Domain(host.to_string(), port),
        }
    }

    /// Get the port number
    pub fn port(&self) -> u16 {
        match self {
            TargetAddr::Ip(addr) => addr.port(),
            TargetAddr::Domain(_, port) => *port,
        }
    }

    /// Host part without brackets
    pub fn host(&self) -> String {
        match self {
            TargetAddr::Ip(addr) => addr.ip().to_string(),
            TargetAddr::Domain(domain, _) => domain.clone(),
        }
    }

    /// Get the address type byte
    pub fn addr_type(&self) -> u8 {
        match self {
            TargetAddr::Ip(SocketAddr::V4(_)) => SOCKS5_ADDR_TYPE_IPV4,
            TargetAddr::Ip(SocketAddr::V6(_)) => SOCKS5_ADDR_TYPE_IPV6,
            TargetAddr::Domain(_, _) => SOCKS5_ADDR_TYPE_DOMAIN,
        }
    }

    /// Encoded length in bytes
    pub fn encoded_len(&self) -> usize {
        match self {
            TargetAddr::Ip(SocketAddr::V4(_)) => 1 + 4 + 2,
            TargetAddr::Ip(SocketAddr::V6(_)) => 1 + 16 + 2,
            TargetAddr::Domain(domain, _) => 1 + 1 + domain.len() + 2,
        }
    }

    /// Append the `ATYP | ADDR | PORT` encoding
    pub fn write_to(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        match self {
            TargetAddr::Ip(SocketAddr::V4(addr)) => {
                buf.put_u8(SOCKS5_ADDR_TYPE_IPV4);
                buf.put_slice(&addr.ip().octets());
                buf.put_u16(addr.port());
            }
            TargetAddr::Ip(SocketAddr::V6(addr)) => {
                buf.put_u8(SOCKS5_ADDR_TYPE_IPV6);
                buf.put_slice(&addr.ip().octets());
                buf.put_u16(addr.port());
            }
            TargetAddr::Domain(domain, port) => {
                if domain.is_empty() || domain.len() > MAX_DOMAIN_LEN {
                    return Err(ProtocolError::InvalidDomain(domain.clone()));
                }
                buf.put_u8(SOCKS5_ADDR_TYPE_DOMAIN);
                buf.put_u8(domain.len() as u8);
                buf.put_slice(domain.as_bytes());
                buf.put_u16(*port);
            }
        }
        Ok(())
    }

    /// Serialize the address to bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.write_to(&mut buf)?;
        Ok(buf.to_vec())
    }

    /// Decode an address from the start of `buf`
    ///
    /// Returns `Ok(None)` while `buf` is too short, otherwise the address and
    /// the number of bytes it occupied.
    pub fn decode(buf: &[u8]) -> Result<Option<(TargetAddr, usize)>, ProtocolError> {
        let Some(&atyp) = buf.first() else {
            return Ok(None);
        };

        match atyp {
            SOCKS5_ADDR_TYPE_IPV4 => {
                if buf.len() < 7 {
                    return Ok(None);
                }
                let ip = Ipv4Addr::new(buf[1], buf[2], buf[3], buf[4]);
                let port = u16::from_be_bytes([buf[5], buf[6]]);
                Ok(Some((TargetAddr::ipv4(ip, port), 7)))
            }
            SOCKS5_ADDR_TYPE_IPV6 => {
                if buf.len() < 19 {
                    return Ok(None);
                }
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&buf[1..17]);
                let port = u16::from_be_bytes([buf[17], buf[18]]);
                Ok(Some((TargetAddr::ipv6(Ipv6Addr::from(octets), port), 19)))
            }
            SOCKS5_ADDR_TYPE_DOMAIN => {
                let Some(&len) = buf.get(1) else {
                    return Ok(None);
                };
                let len = len as usize;
                if len == 0 {
                    return Err(ProtocolError::InvalidDomain(String::new()));
                }
                let total = 2 + len + 2;
                if buf.len() < total {
                    return Ok(None);
                }
                let domain = std::str::from_utf8(&buf[2..2 + len])
                    .map_err(|_| {
                        ProtocolError::InvalidDomain(String::from_utf8_lossy(&buf[2..2 + len]).into_owned())
                    })?
                    .to_string();
                let port = u16::from_be_bytes([buf[2 + len], buf[3 + len]]);
                Ok(Some((TargetAddr::Domain(domain, port), total)))
            }
            other => Err(ProtocolError::AddressTypeNotSupported(other)),
        }
    }
}

impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetAddr::Ip(addr) => write!(f, "{}", addr),
            TargetAddr::Domain(domain, port) => write!(f, "{}:{}", domain, port),
        }
    }
}

impl From<SocketAddr> for TargetAddr {
    fn from(addr: SocketAddr) -> Self {
        TargetAddr::Ip(addr)
    }
}

impl Default for TargetAddr {
    fn default() -> Self {
        TargetAddr::Ip(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0))
    }
}
