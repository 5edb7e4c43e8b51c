//! Per-client connections
//!
//! A connection owns the client-facing [`Stream`](crate::transport::Stream)
//! and, once established, the server-facing one, and pumps bytes between
//! them. [`local::LocalConnection`] speaks SOCKS/HTTP to applications and
//! the tunnel to the server; [`remote::RemoteConnection`] terminates the
//! tunnel and connects to the real target.

pub mod local;
pub mod pump;
pub mod remote;

pub use local::{LocalConnection, LocalFactory, LocalSettings};
pub use pump::{pump, PumpStats};
pub use remote::{RemoteConnection, RemoteFactory, RemoteSettings};

use bytes::BytesMut;
use std::fmt;
use std::io;
use tracing::debug;

use crate::error::{is_resolve_aborted, ProtocolError};
use crate::helper::{DEFAULT_BUFFER_SIZE, MAX_PENDING_BYTES};
use crate::transport::Stream;

/// Connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Reading the proxy or tunnel request
    Handshaking,
    /// Looking up the peer address
    Resolving,
    /// Connecting to the peer
    Connecting,
    /// Both legs connected, pumping
    Established,
    /// One direction finished
    HalfClosed,
    /// Both directions finished
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Handshaking => "handshaking",
            ConnectionState::Resolving => "resolving",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Established => "established",
            ConnectionState::HalfClosed => "half-closed",
            ConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Read more bytes from `stream` into `buf`, failing on EOF or overflow
pub(crate) async fn fill_buf(stream: &mut Stream, buf: &mut BytesMut) -> io::Result<usize> {
    if buf.len() >= MAX_PENDING_BYTES {
        return Err(ProtocolError::BufferOverflow(buf.len()).into());
    }
    let mut chunk = [0u8; DEFAULT_BUFFER_SIZE];
    let n = stream.read_some(&mut chunk).await?;
    if n == 0 {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "peer closed during handshake",
        ));
    }
    buf.extend_from_slice(&chunk[..n]);
    Ok(n)
}

/// Final outcome of a connection; lookups aborted by teardown end quietly
pub(crate) fn conclude(id: u64, result: anyhow::Result<PumpStats>) -> anyhow::Result<()> {
    match result {
        Ok(_) => Ok(()),
        Err(e) if is_resolve_aborted(&e) => {
            debug!("Connection {} closed while its lookup was aborted", id);
            Ok(())
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ResolveError;

    #[test]
    fn test_conclude_swallows_aborted_lookup() {
        let aborted = anyhow::Error::from(io::Error::from(ResolveError::OperationAborted))
            .context("Failed to resolve");
        assert!(conclude(1, Err(aborted)).is_ok());

        let not_found = anyhow::Error::from(io::Error::from(ResolveError::HostNotFound))
            .context("Failed to resolve");
        assert!(conclude(2, Err(not_found)).is_err());
        assert!(conclude(3, Ok(PumpStats::default())).is_ok());
    }

    #[test]
    fn test_state_display() {
        assert_eq!(ConnectionState::Handshaking.to_string(), "handshaking");
        assert_eq!(ConnectionState::HalfClosed.to_string(), "half-closed");
        assert_eq!(ConnectionState::Closed.to_string(), "closed");
    }
}
