//! Transport configuration types
//!
//! Socket policy for every TCP socket and TLS settings for the tunnel.

use crate::helper::DEFAULT_CONNECT_TIMEOUT_MS;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Default keepalive seconds
fn default_keepalive_secs() -> u64 {
    20
}

/// Default keepalive interval
fn default_keepalive_interval() -> u64 {
    8
}

fn default_nodelay() -> bool {
    true
}

fn default_connect_timeout_ms() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_MS
}

/// TCP socket policy
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct TcpConfig {
    /// Enable TCP_NODELAY
    #[serde(default = "default_nodelay")]
    pub nodelay: bool,

    /// TCP keepalive timeout in seconds (0 disables keepalive)
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,

    /// TCP keepalive interval in seconds
    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval: u64,

    /// Congestion control algorithm (Linux only)
    #[serde(default)]
    pub congestion: Option<String>,

    /// TCP fast open on listeners
    #[serde(default)]
    pub fast_open: bool,

    /// SO_REUSEPORT on listeners
    #[serde(default)]
    pub reuse_port: bool,

    /// Per-endpoint connect timeout in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Per-stream bytes-per-second cap (0 = unlimited)
    #[serde(default)]
    pub limit_rate: u64,
}

impl Default for TcpConfig {
    fn default() -> Self {
        TcpConfig {
            nodelay: default_nodelay(),
            keepalive_secs: default_keepalive_secs(),
            keepalive_interval: default_keepalive_interval(),
            congestion: None,
            fast_open: false,
            reuse_port: false,
            connect_timeout_ms: default_connect_timeout_ms(),
            limit_rate: 0,
        }
    }
}

fn default_https_fallback() -> bool {
    true
}

/// TLS configuration
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct TlsConfig {
    /// Wrap the tunnel in TLS
    #[serde(default)]
    pub enabled: bool,

    /// Server name for SNI and verification (defaults to server.host)
    #[serde(default)]
    pub sni: Option<String>,

    /// Skip certificate verification
    #[serde(default)]
    pub insecure: bool,

    /// CA bundle file
    #[serde(default)]
    pub ca_bundle: Option<PathBuf>,

    /// Directory of CA certificates
    #[serde(default)]
    pub ca_dir: Option<PathBuf>,

    /// Bundle used when neither of the above is set and before the OS store
    #[serde(default)]
    pub fallback_bundle: Option<PathBuf>,

    /// Certificate chain (server role)
    #[serde(default)]
    pub cert: Option<PathBuf>,

    /// Private key (server role)
    #[serde(default)]
    pub key: Option<PathBuf>,

    /// Allow HTTP/1.1 CONNECT inside TLS when ALPN selects http/1.1
    #[serde(default = "default_https_fallback")]
    pub https_fallback: bool,
}

impl Default for TlsConfig {
    fn default() -> Self {
        TlsConfig {
            enabled: false,
            sni: None,
            insecure: false,
            ca_bundle: None,
            ca_dir: None,
            fallback_bundle: None,
            cert: None,
            key: None,
            https_fallback: default_https_fallback(),
        }
    }
}
