//! Bidirectional relay between two streams
//!
//! Each direction reads into its own buffer and only reads again once the
//! previous write has completed. The end of one direction shuts down the
//! peer's write side; an error in either direction ends both.

use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

use super::ConnectionState;
use crate::helper::DEFAULT_BUFFER_SIZE;
use crate::stats::{self, TrafficCounters};
use crate::transport::Stream;

/// Bytes moved by one pump
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PumpStats {
    /// Client to remote
    pub upstream: u64,
    /// Remote to client
    pub downstream: u64,
}

/// Which way a half copies, seen from the client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    /// Client to remote; reads count as received
    Upstream,
    /// Remote to client; writes count as sent
    Downstream,
}

async fn copy_half<R, W>(
    reader: &mut R,
    writer: &mut W,
    direction: Direction,
    counters: &TrafficCounters,
) -> io::Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = vec![0u8; DEFAULT_BUFFER_SIZE];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            if let Err(e) = writer.shutdown().await {
                trace!("Write shutdown failed: {}", e);
            }
            return Ok(total);
        }
        if direction == Direction::Upstream {
            counters.record_received(n as u64);
        }

        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;
        if direction == Direction::Downstream {
            counters.record_sent(n as u64);
        }
        total += n as u64;
    }
}

/// Relay until both directions end or either fails
pub async fn pump(id: u64, client: &mut Stream, remote: &mut Stream) -> io::Result<PumpStats> {
    pump_counted(id, client, remote, stats::global()).await
}

/// [`pump`] publishing its traffic to `counters`
pub async fn pump_counted(
    id: u64,
    client: &mut Stream,
    remote: &mut Stream,
    counters: &TrafficCounters,
) -> io::Result<PumpStats> {
    let (mut client_read, mut client_write) = tokio::io::split(&mut *client);
    let (mut remote_read, mut remote_write) = tokio::io::split(&mut *remote);

    let up = copy_half(&mut client_read, &mut remote_write, Direction::Upstream, counters);
    let down = copy_half(&mut remote_read, &mut client_write, Direction::Downstream, counters);
    tokio::pin!(up, down);

    let mut state = ConnectionState::Established;
    let mut upstream = None;
    let mut downstream = None;

    while upstream.is_none() || downstream.is_none() {
        tokio::select! {
            result = &mut up, if upstream.is_none() => {
                upstream = Some(result?);
                trace!("Connection {}: client finished sending", id);
            }
            result = &mut down, if downstream.is_none() => {
                downstream = Some(result?);
                trace!("Connection {}: remote finished sending", id);
            }
        }
        if state == ConnectionState::Established {
            state = ConnectionState::HalfClosed;
            debug!("Connection {} {}", id, state);
        }
    }

    let stats = PumpStats {
        upstream: upstream.unwrap_or_default(),
        downstream: downstream.unwrap_or_default(),
    };
    debug!(
        "Connection {} {}: {} bytes up, {} bytes down",
        id,
        ConnectionState::Closed,
        stats.upstream,
        stats.downstream
    );
    Ok(stats)
}
