//! Reactor bridge for the resolution engine
//!
//! The engine announces interest in its sockets through a callback. For every
//! descriptor it names, the bridge duplicates the handle and waits on the
//! duplicate with [`AsyncFd`], so the engine stays free to close its own
//! descriptor at any moment. One task per direction loops while that interest
//! is set and feeds readiness back through `process_fd`.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::os::fd::{BorrowedFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak};
use std::time::Duration;
use tokio::io::unix::AsyncFd;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use super::engine::{
    system_nameservers, AddrInfoCallback, AddressFamily, DnsEngine, EngineOptions,
    DEFAULT_ATTEMPT_TIMEOUT, DEFAULT_TRIES,
};
use crate::config::DnsConfig;
use crate::error::{ResolveError, SockstunError};
use crate::helper::resolve_timeout;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Settings shared by every resolver a process creates
#[derive(Debug, Clone)]
pub struct ResolverSettings {
    /// Engine tuning
    pub engine: EngineOptions,
    /// Upper bound for one `resolve` call
    pub timeout: Duration,
    /// Address family filter
    pub family: AddressFamily,
}

impl ResolverSettings {
    /// Build settings from the `[dns]` section
    ///
    /// With no servers configured the system list is read here, once, so
    /// engines created per lookup never touch the filesystem.
    pub fn from_config(config: &DnsConfig) -> Result<Self, SockstunError> {
        let mut servers = config.server_addrs().map_err(SockstunError::Config)?;
        if servers.is_empty() {
            servers = system_nameservers();
        }
        Ok(ResolverSettings {
            engine: EngineOptions {
                servers,
                attempt_timeout: DEFAULT_ATTEMPT_TIMEOUT,
                tries: DEFAULT_TRIES,
            },
            timeout: resolve_timeout(config.timeout_ms),
            family: AddressFamily::Unspec,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Read,
    Write,
}

/// Per-descriptor wait state
pub struct ResolverContext {
    fd: RawFd,
    dup: AsyncFd<OwnedFd>,
    read: AtomicBool,
    write: AtomicBool,
    read_task: Mutex<Option<JoinHandle<()>>>,
    write_task: Mutex<Option<JoinHandle<()>>>,
    live_handles: Arc<AtomicUsize>,
}

impl ResolverContext {
    fn new(fd: RawFd, live_handles: Arc<AtomicUsize>) -> std::io::Result<Self> {
        // SAFETY: the engine reports `fd` while its socket is open, and the
        // callback runs synchronously inside the engine call that owns it.
        let dup = unsafe { BorrowedFd::borrow_raw(fd) }.try_clone_to_owned()?;
        let dup = AsyncFd::new(dup)?;
        live_handles.fetch_add(1, Ordering::SeqCst);
        Ok(ResolverContext {
            fd,
            dup,
            read: AtomicBool::new(false),
            write: AtomicBool::new(false),
            read_task: Mutex::new(None),
            write_task: Mutex::new(None),
            live_handles,
        })
    }

    fn flag(&self, dir: Direction) -> &AtomicBool {
        match dir {
            Direction::Read => &self.read,
            Direction::Write => &self.write,
        }
    }

    fn task(&self, dir: Direction) -> &Mutex<Option<JoinHandle<()>>> {
        match dir {
            Direction::Read => &self.read_task,
            Direction::Write => &self.write_task,
        }
    }

    fn abort(&self, dir: Direction) {
        if let Some(task) = lock(self.task(dir)).take() {
            task.abort();
        }
    }

    /// Whether read interest is set
    pub fn wants_read(&self) -> bool {
        self.read.load(Ordering::Acquire)
    }

    /// Whether write interest is set
    pub fn wants_write(&self) -> bool {
        self.write.load(Ordering::Acquire)
    }
}

impl Drop for ResolverContext {
    fn drop(&mut self) {
        self.live_handles.fetch_sub(1, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for ResolverContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolverContext")
            .field("fd", &self.fd)
            .field("read", &self.wants_read())
            .field("write", &self.wants_write())
            .finish()
    }
}

struct Shared {
    contexts: Mutex<HashMap<RawFd, Arc<ResolverContext>>>,
    engine: OnceLock<Weak<Mutex<DnsEngine>>>,
    live_handles: Arc<AtomicUsize>,
    cancel_requested: AtomicBool,
}

impl Shared {
    /// Run `f` against the engine, then honour a cancel requested from inside
    /// the engine's own callback
    fn drive<R>(&self, f: impl FnOnce(&mut DnsEngine) -> R) -> Option<R> {
        let engine = self.engine.get()?.upgrade()?;
        let mut engine = lock(&engine);
        let out = f(&mut engine);
        if self.cancel_requested.swap(false, Ordering::AcqRel) {
            engine.cancel();
        }
        Some(out)
    }

    fn on_sock_state(self: &Arc<Self>, fd: RawFd, readable: bool, writable: bool) {
        let mut contexts = lock(&self.contexts);

        if !readable && !writable {
            if let Some(ctx) = contexts.remove(&fd) {
                trace!("Dropping resolver context for fd {}", fd);
                ctx.read.store(false, Ordering::Release);
                ctx.write.store(false, Ordering::Release);
                ctx.abort(Direction::Read);
                ctx.abort(Direction::Write);
            }
            return;
        }

        let ctx = match contexts.get(&fd) {
            Some(ctx) => ctx.clone(),
            None => match ResolverContext::new(fd, self.live_handles.clone()) {
                Ok(ctx) => {
                    let ctx = Arc::new(ctx);
                    contexts.insert(fd, ctx.clone());
                    ctx
                }
                Err(e) => {
                    warn!("Failed to duplicate resolver socket {}: {}", fd, e);
                    self.cancel_requested.store(true, Ordering::Release);
                    return;
                }
            },
        };
        drop(contexts);

        self.set_interest(&ctx, Direction::Read, readable);
        self.set_interest(&ctx, Direction::Write, writable);
    }

    fn set_interest(self: &Arc<Self>, ctx: &Arc<ResolverContext>, dir: Direction, wanted: bool) {
        let flag = ctx.flag(dir);
        if wanted {
            if !flag.swap(true, Ordering::AcqRel) {
                let task = tokio::spawn(wait_loop(ctx.clone(), dir, Arc::downgrade(self)));
                *lock(ctx.task(dir)) = Some(task);
            }
        } else if flag.swap(false, Ordering::AcqRel) {
            ctx.abort(dir);
        }
    }
}

async fn wait_loop(ctx: Arc<ResolverContext>, dir: Direction, shared: Weak<Shared>) {
    while ctx.flag(dir).load(Ordering::Acquire) {
        let ready = match dir {
            Direction::Read => ctx.dup.readable().await,
            Direction::Write => ctx.dup.writable().await,
        };
        match ready {
            Ok(mut guard) => guard.clear_ready(),
            Err(e) if e.raw_os_error() == Some(libc::EBADF) => {
                tokio::task::yield_now().await;
                continue;
            }
            Err(e) => {
                debug!("Resolver wait on fd {} failed: {}", ctx.fd, e);
                ctx.flag(dir).store(false, Ordering::Release);
                break;
            }
        }
        if !ctx.flag(dir).load(Ordering::Acquire) {
            break;
        }

        let Some(shared) = shared.upgrade() else {
            break;
        };
        let (read_fd, write_fd) = match dir {
            Direction::Read => (Some(ctx.fd), None),
            Direction::Write => (None, Some(ctx.fd)),
        };
        shared.drive(|engine| engine.process_fd(read_fd, write_fd));
    }
}

/// Asynchronous resolver owned by one connection
pub struct AsyncResolver {
    engine: Arc<Mutex<DnsEngine>>,
    shared: Arc<Shared>,
    timeout: Duration,
    family: AddressFamily,
}

impl AsyncResolver {
    /// Create a resolver; must be called inside a tokio runtime
    pub fn new(settings: &ResolverSettings) -> Self {
        let shared = Arc::new(Shared {
            contexts: Mutex::new(HashMap::new()),
            engine: OnceLock::new(),
            live_handles: Arc::new(AtomicUsize::new(0)),
            cancel_requested: AtomicBool::new(false),
        });

        let mut engine = DnsEngine::new(settings.engine.clone());
        let weak = Arc::downgrade(&shared);
        engine.set_socket_state_callback(Box::new(move |fd, readable, writable| {
            if let Some(shared) = weak.upgrade() {
                shared.on_sock_state(fd, readable, writable);
            }
        }));

        let engine = Arc::new(Mutex::new(engine));
        let _ = shared.engine.set(Arc::downgrade(&engine));

        AsyncResolver {
            engine,
            shared,
            timeout: settings.timeout,
            family: settings.family,
        }
    }

    /// Resolve `host` to socket addresses with `port`
    ///
    /// Returns `TimedOut` when no answer arrives within the configured
    /// timeout, and `OperationAborted` when the resolver is torn down first.
    pub async fn resolve(&self, host: &str, port: u16) -> Result<Vec<SocketAddr>, ResolveError> {
        let (tx, mut rx) = oneshot::channel();
        let expired = Arc::new(AtomicBool::new(false));

        let flag = expired.clone();
        let cb: AddrInfoCallback = Box::new(move |status, addrs| {
            let result = match status.to_error() {
                None => Ok(addrs),
                Some(_) if flag.load(Ordering::Acquire) => Err(ResolveError::TimedOut),
                Some(e) if e.is_aborted() => return,
                Some(e) => Err(e),
            };
            let _ = tx.send(result);
        });

        let family = self.family;
        self.shared
            .drive(|engine| engine.getaddrinfo(host, port, family, cb))
            .ok_or(ResolveError::OperationAborted)?;

        let deadline = Instant::now() + self.timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let wait = self
                .shared
                .drive(|engine| engine.timeout(Some(remaining)))
                .flatten()
                .unwrap_or(remaining);

            tokio::select! {
                result = &mut rx => {
                    return result.unwrap_or(Err(ResolveError::OperationAborted));
                }
                _ = tokio::time::sleep(wait) => {
                    if Instant::now() >= deadline {
                        debug!("Resolving {} timed out after {:?}", host, self.timeout);
                        expired.store(true, Ordering::Release);
                        self.shared.drive(|engine| engine.cancel());
                    } else {
                        self.shared.drive(|engine| engine.process_fd(None, None));
                    }
                }
            }
        }
    }

    /// Cancel every pending lookup
    pub fn cancel(&self) {
        self.shared.drive(|engine| engine.cancel());
    }

    /// Number of duplicated handles still open
    pub fn open_handles(&self) -> usize {
        self.shared.live_handles.load(Ordering::SeqCst)
    }

    /// Number of descriptors the engine currently has interest in
    pub fn registered_fds(&self) -> usize {
        lock(&self.shared.contexts).len()
    }

    /// Configured overall timeout
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl Drop for AsyncResolver {
    fn drop(&mut self) {
        lock(&self.engine).destroy();
        for (_, ctx) in lock(&self.shared.contexts).drain() {
            ctx.abort(Direction::Read);
            ctx.abort(Direction::Write);
        }
    }
}

impl std::fmt::Debug for AsyncResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncResolver")
            .field("timeout", &self.timeout)
            .field("registered_fds", &self.registered_fds())
            .finish()
    }
}
