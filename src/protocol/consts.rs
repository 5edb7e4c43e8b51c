//! Proxy protocol constants
//!
//! SOCKS5 (RFC 1928 / RFC 1929), SOCKS4/4a and HTTP proxy constants.

/// SOCKS5 protocol version
pub const SOCKS5_VERSION: u8 = 0x05;

/// SOCKS5 authentication sub-negotiation version
pub const SOCKS5_AUTH_VERSION: u8 = 0x01;

// Authentication methods
/// No authentication required
pub const SOCKS5_AUTH_METHOD_NONE: u8 = 0x00;
/// Username/password authentication
pub const SOCKS5_AUTH_METHOD_PASSWORD: u8 = 0x02;
/// No acceptable methods
pub const SOCKS5_AUTH_METHOD_NOT_ACCEPTABLE: u8 = 0xFF;

/// Username/password sub-negotiation succeeded
pub const SOCKS5_AUTH_SUCCESS: u8 = 0x00;
/// Username/password sub-negotiation failed
pub const SOCKS5_AUTH_FAILURE: u8 = 0x01;

// Commands
/// TCP CONNECT command
pub const SOCKS5_CMD_TCP_CONNECT: u8 = 0x01;
/// TCP BIND command (not implemented)
pub const SOCKS5_CMD_TCP_BIND: u8 = 0x02;
/// UDP ASSOCIATE command (not implemented)
pub const SOCKS5_CMD_UDP_ASSOCIATE: u8 = 0x03;

// Address types, shared with the tunnel request header
/// IPv4 address
pub const SOCKS5_ADDR_TYPE_IPV4: u8 = 0x01;
/// Domain name
pub const SOCKS5_ADDR_TYPE_DOMAIN: u8 = 0x03;
/// IPv6 address
pub const SOCKS5_ADDR_TYPE_IPV6: u8 = 0x04;

/// Reserved byte value (always 0x00)
pub const SOCKS5_RESERVED: u8 = 0x00;

/// SOCKS4 protocol version
pub const SOCKS4_VERSION: u8 = 0x04;
/// SOCKS4 CONNECT command
pub const SOCKS4_CMD_CONNECT: u8 = 0x01;
/// SOCKS4 reply version byte
pub const SOCKS4_REPLY_VERSION: u8 = 0x00;
/// SOCKS4 request granted
pub const SOCKS4_REPLY_GRANTED: u8 = 0x5A;
/// SOCKS4 request rejected or failed
pub const SOCKS4_REPLY_REJECTED: u8 = 0x5B;

/// Maximum domain name length
pub const MAX_DOMAIN_LEN: usize = 255;

/// Maximum size of an HTTP request or response header block
pub const MAX_HTTP_HEADER_BYTES: usize = 80 * 1024;

/// Default port when an HTTP host carries none
pub const HTTP_DEFAULT_PORT: u16 = 80;

/// Reply sent once a CONNECT tunnel is ready
pub const HTTP_CONNECT_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection established\r\n\r\n";
