//! SOCKS4 and SOCKS4a CONNECT requests
//!
//! ```text
//! +----+----+---------+-------+----------+-----------------+
//! | VN | CD | DSTPORT | DSTIP | USERID\0 | [DOMAIN\0 (4a)] |
//! +----+----+---------+-------+----------+-----------------+
//! ```
//!
//! A DSTIP of `0.0.0.x` with `x != 0` announces the 4a form, where the
//! destination is a domain name following the user id.

use super::address::TargetAddr;
use super::consts::*;
use super::socks5::Parsed;
use crate::error::ProtocolError;
use std::net::Ipv4Addr;

/// A SOCKS4 CONNECT request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Socks4Request {
    /// Destination
    pub target: TargetAddr,
    /// User id field
    pub user_id: String,
}

fn find_nul(buf: &[u8], from: usize) -> Option<usize> {
    buf.get(from..)?.iter().position(|&b| b == 0).map(|i| from + i)
}

/// Parse a SOCKS4 or SOCKS4a request
pub fn parse_request(buf: &[u8]) -> Result<Parsed<Socks4Request>, ProtocolError> {
    if buf.len() < 8 {
        if let Some(&vn) = buf.first() {
            if vn != SOCKS4_VERSION {
                return Err(ProtocolError::UnsupportedVersion(vn));
            }
        }
        return Ok(Parsed::Incomplete);
    }
    if buf[0] != SOCKS4_VERSION {
        return Err(ProtocolError::UnsupportedVersion(buf[0]));
    }
    if buf[1] != SOCKS4_CMD_CONNECT {
        return Err(ProtocolError::CommandNotSupported(buf[1]));
    }

    let port = u16::from_be_bytes([buf[2], buf[3]]);
    let ip = Ipv4Addr::new(buf[4], buf[5], buf[6], buf[7]);

    let Some(user_end) = find_nul(buf, 8) else {
        return Ok(Parsed::Incomplete);
    };
    let user_id = String::from_utf8_lossy(&buf[8..user_end]).into_owned();

    let octets = ip.octets();
    let is_4a = octets[0] == 0 && octets[1] == 0 && octets[2] == 0 && octets[3] != 0;
    if !is_4a {
        return Ok(Parsed::Done(
            Socks4Request {
                target: TargetAddr::ipv4(ip, port),
                user_id,
            },
            user_end + 1,
        ));
    }

    let Some(domain_end) = find_nul(buf, user_end + 1) else {
        if buf.len() - (user_end + 1) > MAX_DOMAIN_LEN {
            return Err(ProtocolError::InvalidDomain("too long".to_string()));
        }
        return Ok(Parsed::Incomplete);
    };
    let domain = std::str::from_utf8(&buf[user_end + 1..domain_end])
        .map_err(|_| ProtocolError::InvalidDomain("not utf-8".to_string()))?;
    if domain.is_empty() || domain.len() > MAX_DOMAIN_LEN {
        return Err(ProtocolError::InvalidDomain(domain.to_string()));
    }

    Ok(Parsed::Done(
        Socks4Request {
            target: TargetAddr::domain(domain, port),
            user_id,
        },
        domain_end + 1,
    ))
}

/// Build a SOCKS4 reply
pub fn build_reply(granted: bool) -> [u8; 8] {
    let code = if granted {
        SOCKS4_REPLY_GRANTED
    } else {
        SOCKS4_REPLY_REJECTED
    };
    [SOCKS4_REPLY_VERSION, code, 0, 0, 0, 0, 0, 0]
}
