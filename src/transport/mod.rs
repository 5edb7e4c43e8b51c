//! Transport module for Sockstun
//!
//! Socket policy, the polymorphic [`Stream`] (plain, TLS or cipher-framed)
//! and the upstream [`Connector`].

mod cipher;
mod stream;
pub mod tcp;
pub mod tls;

pub use cipher::CipherStream;
pub use stream::{Stream, StreamKind};
pub use tcp::Connector;
pub use tls::TlsContext;

use crate::config::TcpConfig;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tracing::warn;

/// Listen backlog for every acceptor
pub const LISTEN_BACKLOG: i32 = 1024;

/// Pending fast-open connection queue length
#[cfg(target_os = "linux")]
const FAST_OPEN_QUEUE: libc::c_int = 256;

/// Socket options applied to every TCP socket
#[derive(Debug, Clone)]
pub struct SocketOpts {
    /// Enable TCP_NODELAY
    pub nodelay: bool,
    /// TCP keepalive timeout
    pub keepalive_secs: Option<u64>,
    /// TCP keepalive interval
    pub keepalive_interval: Option<u64>,
    /// Congestion control algorithm
    pub congestion: Option<String>,
    /// TCP fast open on listeners
    pub fast_open: bool,
    /// SO_REUSEPORT on listeners
    pub reuse_port: bool,
}

impl Default for SocketOpts {
    fn default() -> Self {
        SocketOpts {
            nodelay: true,
            keepalive_secs: Some(20),
            keepalive_interval: Some(8),
            congestion: None,
            fast_open: false,
            reuse_port: false,
        }
    }
}

impl SocketOpts {
    /// Create socket options from TCP config
    pub fn from_tcp_config(config: &TcpConfig) -> Self {
        let keepalive = config.keepalive_secs > 0;
        SocketOpts {
            nodelay: config.nodelay,
            keepalive_secs: keepalive.then_some(config.keepalive_secs),
            keepalive_interval: keepalive.then_some(config.keepalive_interval.max(1)),
            congestion: config.congestion.clone().filter(|c| !c.is_empty()),
            fast_open: config.fast_open,
            reuse_port: config.reuse_port,
        }
    }

    /// Apply socket options to a TCP stream
    pub fn apply(&self, stream: &TcpStream) -> std::io::Result<()> {
        stream.set_nodelay(self.nodelay)?;

        let socket = socket2::SockRef::from(stream);
        if let (Some(timeout), Some(interval)) = (self.keepalive_secs, self.keepalive_interval) {
            let keepalive = socket2::TcpKeepalive::new()
                .with_time(Duration::from_secs(timeout))
                .with_interval(Duration::from_secs(interval));
            socket.set_tcp_keepalive(&keepalive)?;
        }

        #[cfg(target_os = "linux")]
        if let Some(algorithm) = &self.congestion {
            socket.set_tcp_congestion(algorithm.as_bytes())?;
        }

        Ok(())
    }

    /// Apply socket options, logging instead of failing
    pub fn apply_logged(&self, stream: &TcpStream) {
        if let Err(e) = self.apply(stream) {
            warn!("Failed to apply socket options: {}", e);
        }
    }

    /// Bind a listener with reuse-port and fast-open as configured
    pub fn bind_listener(&self, addr: SocketAddr) -> std::io::Result<TcpListener> {
        let domain = socket2::Domain::for_address(addr);
        let socket =
            socket2::Socket::new(domain, socket2::Type::STREAM, Some(socket2::Protocol::TCP))?;
        socket.set_reuse_address(true)?;

        #[cfg(unix)]
        if self.reuse_port {
            if let Err(e) = socket.set_reuse_port(true) {
                warn!("Failed to set SO_REUSEPORT on {}: {}", addr, e);
            }
        }

        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;

        if self.fast_open {
            if let Err(e) = set_fast_open(&socket) {
                warn!("Failed to enable TCP fast open on {}: {}", addr, e);
            }
        }

        socket.listen(LISTEN_BACKLOG)?;
        TcpListener::from_std(socket.into())
    }
}

#[cfg(target_os = "linux")]
fn set_fast_open(socket: &socket2::Socket) -> std::io::Result<()> {
    use std::os::fd::AsRawFd;

    let value: libc::c_int = FAST_OPEN_QUEUE;
    // SAFETY: `value` outlives the call and its size is passed alongside.
    let ret = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::IPPROTO_TCP,
            libc::TCP_FASTOPEN,
            &value as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        Err(std::io::Error::last_os_error())
    } else {
        Ok(())
    }
}

#[cfg(not(target_os = "linux"))]
fn set_fast_open(_socket: &socket2::Socket) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "TCP fast open is only supported on Linux",
    ))
}
