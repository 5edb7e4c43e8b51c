//! Tunnel configuration types
//!
//! Defines the root configuration structure and the role specific sections.

use super::{TcpConfig, TlsConfig};
use crate::crypto::{kdf, CipherMethod};
use crate::helper::DEFAULT_RESOLVE_TIMEOUT_MS;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use zeroize::Zeroizing;

/// Which end of the tunnel this process runs
#[derive(Debug, Serialize, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Proxy front end facing applications
    #[default]
    Local,
    /// Tunnel terminator connecting to final targets
    Server,
}

impl std::str::FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "local" => Ok(Mode::Local),
            "server" => Ok(Mode::Server),
            other => Err(format!("unknown mode: {}", other)),
        }
    }
}

/// Root configuration structure
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct Config {
    /// Role of this process
    #[serde(default)]
    pub mode: Mode,

    /// Runtime worker threads (0 = tokio default)
    #[serde(default)]
    pub threads: usize,

    /// Application facing listener
    #[serde(default)]
    pub local: LocalConfig,

    /// Tunnel peer (local role) or tunnel listener (server role)
    #[serde(default)]
    pub server: ServerConfig,

    /// Tunnel cipher
    #[serde(default)]
    pub cipher: CipherConfig,

    /// TLS wrapping of the tunnel
    #[serde(default)]
    pub tls: TlsConfig,

    /// Name resolution
    #[serde(default)]
    pub dns: DnsConfig,

    /// Socket policy
    #[serde(default)]
    pub tcp: TcpConfig,
}

fn default_listen() -> Vec<String> {
    vec!["127.0.0.1:1080".to_string()]
}

/// Local proxy listener configuration
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LocalConfig {
    /// Listen addresses
    #[serde(default = "default_listen")]
    pub listen: Vec<String>,

    /// Username for SOCKS5 auth
    #[serde(default)]
    pub username: Option<String>,

    /// Password for SOCKS5 auth
    #[serde(default)]
    pub password: Option<String>,

    /// Maximum concurrent connections (0 = unlimited)
    #[serde(default)]
    pub parallel_max: usize,
}

impl Default for LocalConfig {
    fn default() -> Self {
        LocalConfig {
            listen: default_listen(),
            username: None,
            password: None,
            parallel_max: 0,
        }
    }
}

impl LocalConfig {
    /// Check if authentication credentials are configured
    pub fn has_credentials(&self) -> bool {
        self.username.is_some() && self.password.is_some()
    }
}

fn default_server_port() -> u16 {
    8443
}

/// Tunnel peer configuration
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ServerConfig {
    /// Peer host name or address
    #[serde(default)]
    pub host: String,

    /// Peer port
    #[serde(default = "default_server_port")]
    pub port: u16,

    /// Pre-resolved addresses for `host`, separated by `;`
    #[serde(default)]
    pub host_ips: Option<String>,

    /// Maximum concurrent tunnels accepted (server role, 0 = unlimited)
    #[serde(default)]
    pub parallel_max: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            host: String::new(),
            port: default_server_port(),
            host_ips: None,
            parallel_max: 0,
        }
    }
}

impl ServerConfig {
    /// Parse `host_ips` into addresses; malformed entries are skipped
    pub fn pinned_ips(&self) -> Vec<IpAddr> {
        self.host_ips
            .as_deref()
            .map(|ips| {
                ips.split(';')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .filter_map(|s| s.parse().ok())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Listen address for the server role
    pub fn listen_addr(&self) -> String {
        match self.host.parse::<IpAddr>() {
            Ok(ip) => SocketAddr::new(ip, self.port).to_string(),
            Err(_) if self.host.is_empty() => format!("0.0.0.0:{}", self.port),
            Err(_) => format!("{}:{}", self.host, self.port),
        }
    }
}

/// Tunnel cipher configuration
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct CipherConfig {
    /// AEAD method
    #[serde(default)]
    pub method: CipherMethod,

    /// Password the master key is derived from
    #[serde(default)]
    pub password: Option<String>,

    /// Explicit base64 master key; takes precedence over `password`
    #[serde(default)]
    pub key: Option<String>,
}

impl CipherConfig {
    /// Derive the master key for the configured method
    pub fn master_key(&self) -> Result<Zeroizing<Vec<u8>>, crate::error::CipherError> {
        kdf::master_key(self.method, self.key.as_deref(), self.password.as_deref())
    }
}

fn default_dns_timeout() -> u64 {
    DEFAULT_RESOLVE_TIMEOUT_MS
}

/// Name resolution configuration
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DnsConfig {
    /// Name servers (`ip` or `ip:port`); empty means system configuration
    #[serde(default)]
    pub servers: Vec<String>,

    /// Resolution timeout in milliseconds (0 = 300 seconds)
    #[serde(default = "default_dns_timeout")]
    pub timeout_ms: u64,
}

impl Default for DnsConfig {
    fn default() -> Self {
        DnsConfig {
            servers: Vec::new(),
            timeout_ms: default_dns_timeout(),
        }
    }
}

impl DnsConfig {
    /// Parse configured name servers, defaulting the port to 53
    pub fn server_addrs(&self) -> Result<Vec<SocketAddr>, String> {
        self.servers
            .iter()
            .map(|s| {
                if let Ok(addr) = s.parse::<SocketAddr>() {
                    return Ok(addr);
                }
                s.parse::<IpAddr>()
                    .map(|ip| SocketAddr::new(ip, 53))
                    .map_err(|_| format!("invalid name server: {}", s))
            })
            .collect()
    }
}

impl Config {
    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.cipher.key.is_none() && self.cipher.password.is_none() {
            return Err("cipher requires either a password or a key".to_string());
        }
        self.cipher.master_key().map_err(|e| e.to_string())?;
        self.dns.server_addrs()?;

        match self.mode {
            Mode::Local => {
                if self.local.listen.is_empty() {
                    return Err("local mode requires at least one listen address".to_string());
                }
                if self.server.host.is_empty() {
                    return Err("local mode requires server.host".to_string());
                }
                if self.local.username.is_some() != self.local.password.is_some() {
                    return Err("SOCKS5 auth requires both username and password".to_string());
                }
            }
            Mode::Server => {
                if self.tls.enabled && (self.tls.cert.is_none() || self.tls.key.is_none()) {
                    return Err("server mode with TLS requires tls.cert and tls.key".to_string());
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_config_default() {
        let config = LocalConfig::default();
        assert_eq!(config.listen, vec!["127.0.0.1:1080"]);
        assert_eq!(config.parallel_max, 0);
        assert!(!config.has_credentials());
    }

    #[test]
    fn test_pinned_ips() {
        let config = ServerConfig {
            host: "example.com".to_string(),
            host_ips: Some("1.2.3.4; 5.6.7.8;bogus;;::1".to_string()),
            ..Default::default()
        };
        let ips = config.pinned_ips();
        assert_eq!(ips.len(), 3);
        assert_eq!(ips[0], "1.2.3.4".parse::<IpAddr>().unwrap());
        assert_eq!(ips[2], "::1".parse::<IpAddr>().unwrap());

        assert!(ServerConfig::default().pinned_ips().is_empty());
    }

    #[test]
    fn test_listen_addr() {
        let mut config = ServerConfig::default();
        assert_eq!(config.listen_addr(), "0.0.0.0:8443");
        config.host = "::1".to_string();
        assert_eq!(config.listen_addr(), "[::1]:8443");
    }

    #[test]
    fn test_dns_server_addrs() {
        let config = DnsConfig {
            servers: vec!["1.1.1.1".to_string(), "127.0.0.1:5353".to_string()],
            ..Default::default()
        };
        let addrs = config.server_addrs().unwrap();
        assert_eq!(addrs[0].port(), 53);
        assert_eq!(addrs[1].port(), 5353);
        assert_eq!(DnsConfig::default().timeout_ms, 5000);

        let bad = DnsConfig {
            servers: vec!["nope".to_string()],
            ..Default::default()
        };
        assert!(bad.server_addrs().is_err());
    }

    #[test]
    fn test_mode_from_str() {
        assert_eq!("LOCAL".parse::<Mode>().unwrap(), Mode::Local);
        assert_eq!("server".parse::<Mode>().unwrap(), Mode::Server);
        assert!("relay".parse::<Mode>().is_err());
    }

    #[test]
    fn test_validate() {
        let mut config = Config::default();
        assert!(config.validate().is_err());

        config.cipher.password = Some("secret".to_string());
        assert!(config.validate().is_err());

        config.server.host = "example.com".to_string();
        assert!(config.validate().is_ok());

        config.local.username = Some("user".to_string());
        assert!(config.validate().is_err());
        config.local.password = Some("pass".to_string());
        assert!(config.validate().is_ok());

        config.mode = Mode::Server;
        config.tls.enabled = true;
        assert!(config.validate().is_err());
    }
}
