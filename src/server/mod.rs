//! Acceptor and dispatcher
//!
//! [`ContentServer`] owns the listening sockets. Every accepted socket gets
//! socket policy applied, a fresh connection id, and is handed to the
//! injected [`ConnectionFactory`] on its own task.
//!
//! # Adding a Role
//!
//! Implement [`ConnectionFactory`] and hand it to [`ContentServer::new`]:
//!
//! ```rust,ignore
//! #[derive(Debug)]
//! struct Discard;
//!
//! #[async_trait::async_trait]
//! impl ConnectionFactory for Discard {
//!     fn name(&self) -> &str { "discard" }
//!
//!     async fn serve(&self, _id: u64, _peer: SocketAddr, _socket: TcpStream) -> anyhow::Result<()> {
//!         Ok(())
//!     }
//! }
//! ```

use anyhow::{anyhow, bail, Context, Result};
use std::fmt::Debug;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, watch, Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::config::{Config, Mode};
use crate::connection::{LocalFactory, LocalSettings, RemoteFactory, RemoteSettings};
use crate::stats;
use crate::transport::SocketOpts;

/// Back-off after a failed `accept`, e.g. when out of file descriptors
const ACCEPT_ERROR_DELAY: Duration = Duration::from_millis(100);

/// How long a graceful shutdown may take before connections are aborted
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Builds and runs one connection per accepted socket.
///
/// # Required Methods
///
/// [`name`](ConnectionFactory::name) and [`serve`](ConnectionFactory::serve).
#[async_trait::async_trait]
pub trait ConnectionFactory: Send + Sync + Debug {
    /// Human-readable role name (e.g., "local", "server")
    fn name(&self) -> &str;

    /// Run the connection for an accepted socket to completion.
    ///
    /// Socket policy has already been applied.
    async fn serve(&self, id: u64, peer: SocketAddr, socket: TcpStream) -> Result<()>;

    /// Check the factory before listening starts.
    ///
    /// Default implementation accepts everything.
    fn validate(&self) -> Result<()> {
        Ok(())
    }
}

/// Observer of connection lifecycle
pub trait ServerDelegate: Send + Sync {
    /// A socket was accepted; return `false` to close it right away
    fn on_connect(&self, id: u64, peer: SocketAddr) -> bool;

    /// A connection accepted by `on_connect` ended (or was aborted)
    fn on_disconnect(&self, id: u64);
}

struct Inner {
    factory: Arc<dyn ConnectionFactory>,
    delegate: Option<Arc<dyn ServerDelegate>>,
    socket_opts: SocketOpts,
    limiter: Option<Arc<Semaphore>>,
    next_id: AtomicU64,
    active: Arc<AtomicUsize>,
    connections: Mutex<JoinSet<()>>,
}

/// Decrements the active count and notifies the delegate, also when the
/// connection task is aborted
struct DisconnectGuard {
    id: u64,
    active: Arc<AtomicUsize>,
    delegate: Option<Arc<dyn ServerDelegate>>,
}

impl Drop for DisconnectGuard {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::Relaxed);
        if let Some(delegate) = &self.delegate {
            delegate.on_disconnect(self.id);
        }
    }
}

impl Inner {
    async fn dispatch(&self, socket: TcpStream, peer: SocketAddr, permit: Option<OwnedSemaphorePermit>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.socket_opts.apply_logged(&socket);

        if let Some(delegate) = &self.delegate {
            if !delegate.on_connect(id, peer) {
                debug!("Connection {} from {} rejected by delegate", id, peer);
                return;
            }
        }
        stats::record_connection();
        self.active.fetch_add(1, Ordering::Relaxed);
        debug!("Connection {} accepted from {}", id, peer);

        let factory = self.factory.clone();
        let guard = DisconnectGuard {
            id,
            active: self.active.clone(),
            delegate: self.delegate.clone(),
        };

        let mut connections = self.connections.lock().await;
        connections.spawn(async move {
            let _permit = permit;
            let _guard = guard;
            match factory.serve(id, peer, socket).await {
                Ok(()) => debug!("Connection {} from {} finished", id, peer),
                Err(e) => warn!("Connection {} from {}: {:#}", id, peer, e),
            }
        });
        // Reap finished tasks so the set does not grow without bound
        while connections.try_join_next().is_some() {}
    }
}

/// Resolves once the stop flag is raised; the borrowed value is released here
/// so callers stay `Send`
async fn stopped(stop: &mut watch::Receiver<bool>) {
    let _ = stop.wait_for(|stopped| *stopped).await;
}

async fn accept_loop(inner: Arc<Inner>, listener: TcpListener, mut stop: watch::Receiver<bool>) {
    let local = listener
        .local_addr()
        .map(|a| a.to_string())
        .unwrap_or_default();

    loop {
        let permit = match &inner.limiter {
            Some(limiter) => tokio::select! {
                permit = limiter.clone().acquire_owned() => match permit {
                    Ok(permit) => Some(permit),
                    Err(_) => break,
                },
                _ = stopped(&mut stop) => break,
            },
            None => None,
        };

        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            _ = stopped(&mut stop) => break,
        };
        let (socket, peer) = match accepted {
            Ok(pair) => pair,
            Err(e) => {
                error!("Accept on {} failed: {}", local, e);
                tokio::time::sleep(ACCEPT_ERROR_DELAY).await;
                continue;
            }
        };

        inner.dispatch(socket, peer, permit).await;
    }
    debug!("Stopped accepting on {}", local);
}

struct Running {
    inner: Arc<Inner>,
    stop_tx: watch::Sender<bool>,
    accept_tasks: Vec<JoinHandle<()>>,
    local_addrs: Vec<SocketAddr>,
}

/// Listens on one or more addresses and dispatches accepted sockets
pub struct ContentServer {
    factory: Arc<dyn ConnectionFactory>,
    delegate: Option<Arc<dyn ServerDelegate>>,
    socket_opts: SocketOpts,
    parallel_max: usize,
    running: Option<Running>,
}

async fn resolve_listen_addr(addr: &str) -> Result<SocketAddr> {
    if let Ok(addr) = addr.parse::<SocketAddr>() {
        return Ok(addr);
    }
    tokio::net::lookup_host(addr)
        .await
        .with_context(|| format!("Failed to resolve listen address {}", addr))?
        .next()
        .with_context(|| format!("No address for {}", addr))
}

impl ContentServer {
    /// Create a server; `parallel_max` of 0 means unlimited
    pub fn new(factory: Arc<dyn ConnectionFactory>, socket_opts: SocketOpts, parallel_max: usize) -> Self {
        ContentServer {
            factory,
            delegate: None,
            socket_opts,
            parallel_max,
            running: None,
        }
    }

    /// Observe connection lifecycle
    pub fn with_delegate(mut self, delegate: Arc<dyn ServerDelegate>) -> Self {
        self.delegate = Some(delegate);
        self
    }

    /// Bind every address and start accepting
    ///
    /// Returns the bound addresses, useful when listening on port 0.
    pub async fn listen(&mut self, addrs: &[String]) -> Result<Vec<SocketAddr>> {
        if self.running.is_some() {
            bail!("Server is already listening");
        }
        if addrs.is_empty() {
            bail!("No listen addresses");
        }
        self.factory
            .validate()
            .with_context(|| format!("Invalid {} configuration", self.factory.name()))?;

        let mut listeners = Vec::with_capacity(addrs.len());
        for addr in addrs {
            let addr = resolve_listen_addr(addr).await?;
            let listener = self
                .socket_opts
                .bind_listener(addr)
                .with_context(|| format!("Failed to listen on {}", addr))?;
            listeners.push(listener);
        }

        let inner = Arc::new(Inner {
            factory: self.factory.clone(),
            delegate: self.delegate.clone(),
            socket_opts: self.socket_opts.clone(),
            limiter: (self.parallel_max > 0).then(|| Arc::new(Semaphore::new(self.parallel_max))),
            next_id: AtomicU64::new(1),
            active: Arc::new(AtomicUsize::new(0)),
            connections: Mutex::new(JoinSet::new()),
        });
        let (stop_tx, stop_rx) = watch::channel(false);

        let mut local_addrs = Vec::with_capacity(listeners.len());
        let mut accept_tasks = Vec::with_capacity(listeners.len());
        for listener in listeners {
            let local = listener.local_addr()?;
            info!("{} listening on {}", self.factory.name(), local);
            local_addrs.push(local);
            accept_tasks.push(tokio::spawn(accept_loop(
                inner.clone(),
                listener,
                stop_rx.clone(),
            )));
        }

        self.running = Some(Running {
            inner,
            stop_tx,
            accept_tasks,
            local_addrs,
        });
        Ok(self.local_addrs())
    }

    /// Addresses being listened on
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.running
            .as_ref()
            .map(|r| r.local_addrs.clone())
            .unwrap_or_default()
    }

    /// Connections currently being served
    pub fn active_connections(&self) -> usize {
        self.running
            .as_ref()
            .map_or(0, |r| r.inner.active.load(Ordering::Relaxed))
    }

    async fn stop_accepting(running: &mut Running) {
        let _ = running.stop_tx.send(true);
        for task in running.accept_tasks.drain(..) {
            if let Err(e) = task.await {
                warn!("Accept task ended abnormally: {}", e);
            }
        }
    }

    /// Stop accepting and wait for active connections to finish
    pub async fn shutdown(&mut self) {
        let Some(running) = self.running.as_mut() else {
            return;
        };
        Self::stop_accepting(running).await;
        info!(
            "Waiting for {} connections to finish",
            running.inner.active.load(Ordering::Relaxed)
        );
        let mut connections = running.inner.connections.lock().await;
        while connections.join_next().await.is_some() {}
        drop(connections);
        self.running = None;
        info!("{} server stopped", self.factory.name());
    }

    /// Stop accepting and abort active connections
    pub async fn stop(&mut self) {
        let Some(running) = self.running.as_mut() else {
            return;
        };
        Self::stop_accepting(running).await;
        let mut connections = running.inner.connections.lock().await;
        connections.abort_all();
        while connections.join_next().await.is_some() {}
        drop(connections);
        self.running = None;
        info!("{} server aborted", self.factory.name());
    }
}

impl Drop for ContentServer {
    fn drop(&mut self) {
        if let Some(running) = &self.running {
            let _ = running.stop_tx.send(true);
            for task in &running.accept_tasks {
                task.abort();
            }
        }
    }
}

/// Run the configured role until shutdown
pub async fn run_server(config: Config, mut shutdown_rx: broadcast::Receiver<bool>) -> Result<()> {
    config.validate().map_err(|e| anyhow!("Invalid configuration: {}", e))?;

    let socket_opts = SocketOpts::from_tcp_config(&config.tcp);
    let (factory, addrs, parallel_max): (Arc<dyn ConnectionFactory>, Vec<String>, usize) =
        match config.mode {
            Mode::Local => {
                info!(
                    "Tunnel server: {}:{} ({:?}{})",
                    config.server.host,
                    config.server.port,
                    config.cipher.method,
                    if config.tls.enabled { ", tls" } else { "" }
                );
                (
                    Arc::new(LocalFactory::new(LocalSettings::from_config(&config)?)),
                    config.local.listen.clone(),
                    config.local.parallel_max,
                )
            }
            Mode::Server => (
                Arc::new(RemoteFactory::new(RemoteSettings::from_config(&config)?)),
                vec![config.server.listen_addr()],
                config.server.parallel_max,
            ),
        };

    let mut server = ContentServer::new(factory, socket_opts, parallel_max);
    server.listen(&addrs).await?;

    let _ = shutdown_rx.recv().await;
    info!("Shutdown signal received, draining connections");
    if tokio::time::timeout(SHUTDOWN_GRACE, server.shutdown())
        .await
        .is_err()
    {
        warn!(
            "{} connections still active after {:?}, aborting",
            server.active_connections(),
            SHUTDOWN_GRACE
        );
        server.stop().await;
    }

    let totals = stats::snapshot();
    info!(
        "Served {} connections: {} bytes received, {} bytes sent",
        totals.connections, totals.received, totals.sent
    );
    Ok(())
}
