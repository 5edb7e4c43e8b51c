//! Proxy protocol module for Sockstun
//!
//! Parsers for the requests applications send to the local front end
//! (SOCKS5, SOCKS4/4a, HTTP CONNECT and plain HTTP proxy requests) and the
//! target address codec used for the tunnel request header.

pub mod address;
pub mod consts;
pub mod http;
pub mod socks4;
pub mod socks5;

pub use address::TargetAddr;
pub use http::{
    split_host_port, HttpRequest, HttpRequestParser, HttpResponseParser, ParseOutcome,
    ParserOptions, ParserStatus,
};
pub use socks5::{Parsed, SocksCommand};

/// Proxy protocol spoken by a client, recognized from its first byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyProtocol {
    /// SOCKS version 5
    Socks5,
    /// SOCKS version 4 or 4a
    Socks4,
    /// HTTP CONNECT or plain proxy request
    Http,
}

impl ProxyProtocol {
    /// Detect the protocol from the first byte of a connection
    pub fn detect(first: u8) -> Self {
        match first {
            consts::SOCKS5_VERSION => ProxyProtocol::Socks5,
            consts::SOCKS4_VERSION => ProxyProtocol::Socks4,
            _ => ProxyProtocol::Http,
        }
    }
}

impl std::fmt::Display for ProxyProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProxyProtocol::Socks5 => write!(f, "socks5"),
            ProxyProtocol::Socks4 => write!(f, "socks4"),
            ProxyProtocol::Http => write!(f, "http"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect() {
        assert_eq!(ProxyProtocol::detect(0x05), ProxyProtocol::Socks5);
        assert_eq!(ProxyProtocol::detect(0x04), ProxyProtocol::Socks4);
        assert_eq!(ProxyProtocol::detect(b'G'), ProxyProtocol::Http);
        assert_eq!(ProxyProtocol::detect(b'C'), ProxyProtocol::Http);
    }

    #[test]
    fn test_display() {
        assert_eq!(ProxyProtocol::Socks5.to_string(), "socks5");
        assert_eq!(ProxyProtocol::Http.to_string(), "http");
    }
}
