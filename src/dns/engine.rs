//! Callback-driven resolution engine
//!
//! The engine owns its UDP sockets and never waits on them itself. It reports
//! which descriptors it wants polled through the socket-state callback, and
//! expects the caller to feed readiness back with [`DnsEngine::process_fd`]
//! and to poll it again after [`DnsEngine::timeout`] even without socket
//! activity. It is not reentrant: callbacks must not call back into it.

use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::{Name, RData, RecordType};
use hickory_proto::serialize::binary::{BinDecodable, BinEncodable};
use ring::rand::{SecureRandom, SystemRandom};
use socket2::{Domain, Protocol, Socket, Type};
use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::os::fd::{AsRawFd, RawFd};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

use crate::error::ResolveError;

/// Default name server when nothing else is configured
pub const FALLBACK_NAMESERVER: SocketAddr =
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 53);

/// Time allowed for one attempt unless configured otherwise
pub const DEFAULT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(2);

/// Attempts per server unless configured otherwise
pub const DEFAULT_TRIES: usize = 2;

/// Status codes reported to completion callbacks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineStatus {
    /// Addresses found
    Success,
    /// Name exists but has no records of the requested type
    NoData,
    /// Server rejected the query format
    FormErr,
    /// Server failure
    ServFail,
    /// Name does not exist
    NotFound,
    /// Server does not implement the query
    NotImp,
    /// Server refused the query
    Refused,
    /// Malformed query
    BadQuery,
    /// Malformed host name
    BadName,
    /// Unsupported address family
    BadFamily,
    /// Malformed response
    BadResp,
    /// Could not reach any name server
    ConnRefused,
    /// Every attempt timed out
    Timeout,
    /// Unexpected end of file
    Eof,
    /// Socket could not be created
    File,
    /// Allocation failure
    NoMem,
    /// Engine destroyed while the query was pending
    Destruction,
    /// Query cancelled
    Cancelled,
    /// Host name has no usable form
    NoName,
}

impl EngineStatus {
    /// Map to the crate error taxonomy; `None` on success
    pub fn to_error(self) -> Option<ResolveError> {
        use EngineStatus::*;
        match self {
            Success => None,
            NoData | FormErr | ServFail | NotFound | NotImp | BadResp | NoName => {
                Some(ResolveError::HostNotFound)
            }
            Refused | ConnRefused => Some(ResolveError::ConnectionRefused),
            Timeout => Some(ResolveError::TimedOut),
            Eof => Some(ResolveError::Eof),
            File => Some(ResolveError::BadDescriptor),
            NoMem => Some(ResolveError::NoMemory),
            Cancelled | Destruction => Some(ResolveError::OperationAborted),
            BadQuery | BadName | BadFamily => Some(ResolveError::InvalidArgument),
        }
    }
}

impl fmt::Display for EngineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Address family filter for lookups
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AddressFamily {
    /// IPv4 and IPv6
    #[default]
    Unspec,
    /// IPv4 only
    Ipv4,
    /// IPv6 only
    Ipv6,
}

impl AddressFamily {
    fn record_types(self) -> &'static [RecordType] {
        match self {
            AddressFamily::Unspec => &[RecordType::A, RecordType::AAAA],
            AddressFamily::Ipv4 => &[RecordType::A],
            AddressFamily::Ipv6 => &[RecordType::AAAA],
        }
    }

    fn accepts(self, ip: &IpAddr) -> bool {
        match self {
            AddressFamily::Unspec => true,
            AddressFamily::Ipv4 => ip.is_ipv4(),
            AddressFamily::Ipv6 => ip.is_ipv6(),
        }
    }
}

/// `(fd, readable, writable)`; both false means the engine lost interest
pub type SocketStateCallback = Box<dyn FnMut(RawFd, bool, bool) + Send>;

/// Completion of one lookup
pub type AddrInfoCallback = Box<dyn FnOnce(EngineStatus, Vec<SocketAddr>) + Send>;

/// Engine tuning
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Name servers, tried in order
    pub servers: Vec<SocketAddr>,
    /// Time allowed for one attempt against one server
    pub attempt_timeout: Duration,
    /// Attempts per server
    pub tries: usize,
}

impl Default for EngineOptions {
    fn default() -> Self {
        EngineOptions {
            servers: system_nameservers(),
            attempt_timeout: DEFAULT_ATTEMPT_TIMEOUT,
            tries: DEFAULT_TRIES,
        }
    }
}

/// Extract `nameserver` entries from resolv.conf content
pub fn parse_resolv_conf(content: &str) -> Vec<SocketAddr> {
    content
        .lines()
        .map(|line| line.split(['#', ';']).next().unwrap_or_default().trim())
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            match (parts.next(), parts.next()) {
                (Some("nameserver"), Some(addr)) => {
                    // Strip a zone id such as fe80::1%eth0
                    let addr = addr.split('%').next().unwrap_or(addr);
                    addr.parse::<IpAddr>().ok().map(|ip| SocketAddr::new(ip, 53))
                }
                _ => None,
            }
        })
        .collect()
}

/// Name servers from /etc/resolv.conf, or the loopback fallback
pub fn system_nameservers() -> Vec<SocketAddr> {
    let servers = std::fs::read_to_string("/etc/resolv.conf")
        .map(|content| parse_resolv_conf(&content))
        .unwrap_or_default();
    if servers.is_empty() {
        vec![FALLBACK_NAMESERVER]
    } else {
        servers
    }
}

#[derive(Debug)]
struct PendingQuery {
    record_type: RecordType,
    id: u16,
    wire: Vec<u8>,
    sent: bool,
    status: Option<EngineStatus>,
}

struct Lookup {
    host: String,
    name: Name,
    port: u16,
    family: AddressFamily,
    server_idx: usize,
    attempts: usize,
    socket: Option<UdpSocket>,
    fd: Option<RawFd>,
    writable_wanted: bool,
    queries: Vec<PendingQuery>,
    addrs: Vec<SocketAddr>,
    deadline: Instant,
    callback: Option<AddrInfoCallback>,
}

impl Lookup {
    fn finished(&self) -> bool {
        self.queries.iter().all(|q| q.status.is_some())
    }

    fn final_status(&self) -> EngineStatus {
        if !self.addrs.is_empty() {
            return EngineStatus::Success;
        }
        self.queries
            .iter()
            .filter_map(|q| q.status)
            .find(|s| *s != EngineStatus::NoData && *s != EngineStatus::Success)
            .unwrap_or(EngineStatus::NoData)
    }
}

/// The resolution engine
pub struct DnsEngine {
    options: EngineOptions,
    lookups: Vec<Lookup>,
    sock_state_cb: Option<SocketStateCallback>,
    rng: SystemRandom,
    fallback_id: u16,
    destroyed: bool,
}

impl fmt::Debug for DnsEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DnsEngine")
            .field("servers", &self.options.servers)
            .field("pending", &self.lookups.len())
            .field("destroyed", &self.destroyed)
            .finish()
    }
}

impl DnsEngine {
    /// Create an engine
    pub fn new(mut options: EngineOptions) -> Self {
        if options.servers.is_empty() {
            options.servers = system_nameservers();
        }
        options.tries = options.tries.max(1);
        DnsEngine {
            options,
            lookups: Vec::new(),
            sock_state_cb: None,
            rng: SystemRandom::new(),
            fallback_id: 0,
            destroyed: false,
        }
    }

    /// Configured name servers
    pub fn servers(&self) -> &[SocketAddr] {
        &self.options.servers
    }

    /// Number of lookups in flight
    pub fn pending(&self) -> usize {
        self.lookups.len()
    }

    /// Install the socket-state callback
    pub fn set_socket_state_callback(&mut self, cb: SocketStateCallback) {
        self.sock_state_cb = Some(cb);
    }

    fn notify(&mut self, fd: RawFd, readable: bool, writable: bool) {
        trace!("dns socket {} readable={} writable={}", fd, readable, writable);
        if let Some(cb) = self.sock_state_cb.as_mut() {
            cb(fd, readable, writable);
        }
    }

    fn next_id(&mut self) -> u16 {
        let mut bytes = [0u8; 2];
        match self.rng.fill(&mut bytes) {
            Ok(()) => u16::from_ne_bytes(bytes),
            Err(_) => {
                self.fallback_id = self.fallback_id.wrapping_add(1);
                self.fallback_id
            }
        }
    }

    fn build_query(&mut self, name: &Name, record_type: RecordType) -> Option<PendingQuery> {
        let id = self.next_id();
        let mut message = Message::new();
        message.set_id(id);
        message.set_message_type(MessageType::Query);
        message.set_op_code(OpCode::Query);
        message.set_recursion_desired(true);
        message.add_query(Query::query(name.clone(), record_type));
        let wire = message.to_bytes().ok()?;
        Some(PendingQuery {
            record_type,
            id,
            wire,
            sent: false,
            status: None,
        })
    }

    /// Start resolving `host`; `cb` runs exactly once
    ///
    /// IP literals and `localhost` complete before this returns.
    pub fn getaddrinfo(
        &mut self,
        host: &str,
        port: u16,
        family: AddressFamily,
        cb: AddrInfoCallback,
    ) {
        if self.destroyed {
            cb(EngineStatus::Destruction, Vec::new());
            return;
        }

        let literal = host.trim_start_matches('[').trim_end_matches(']');
        if let Ok(ip) = literal.parse::<IpAddr>() {
            if family.accepts(&ip) {
                cb(EngineStatus::Success, vec![SocketAddr::new(ip, port)]);
            } else {
                cb(EngineStatus::BadFamily, Vec::new());
            }
            return;
        }

        if host.eq_ignore_ascii_case("localhost") {
            let addrs = [IpAddr::V4(Ipv4Addr::LOCALHOST), IpAddr::V6(Ipv6Addr::LOCALHOST)]
                .into_iter()
                .filter(|ip| family.accepts(ip))
                .map(|ip| SocketAddr::new(ip, port))
                .collect();
            cb(EngineStatus::Success, addrs);
            return;
        }

        if host.is_empty() || host.len() > 253 {
            cb(EngineStatus::BadName, Vec::new());
            return;
        }
        let mut name = match Name::from_ascii(host) {
            Ok(name) => name,
            Err(e) => {
                debug!("Rejecting host name {:?}: {}", host, e);
                cb(EngineStatus::BadName, Vec::new());
                return;
            }
        };
        name.set_fqdn(true);

        let mut queries = Vec::new();
        for record_type in family.record_types() {
            match self.build_query(&name, *record_type) {
                Some(query) => queries.push(query),
                None => {
                    cb(EngineStatus::BadQuery, Vec::new());
                    return;
                }
            }
        }

        let lookup = Lookup {
            host: host.to_string(),
            name,
            port,
            family,
            server_idx: 0,
            attempts: 0,
            socket: None,
            fd: None,
            writable_wanted: false,
            queries,
            addrs: Vec::new(),
            deadline: Instant::now(),
            callback: Some(cb),
        };
        let idx = self.lookups.len();
        self.lookups.push(lookup);
        self.start_attempt(idx);
        self.complete_finished();
    }

    /// Open a fresh socket for the lookup's current server and send, moving
    /// on to the next server while attempts remain
    fn start_attempt(&mut self, idx: usize) {
        loop {
            match self.try_attempt(idx) {
                Ok(()) => return,
                Err(status) => {
                    if !self.rotate_server(idx, status) {
                        return;
                    }
                }
            }
        }
    }

    fn try_attempt(&mut self, idx: usize) -> Result<(), EngineStatus> {
        self.close_socket(idx);

        let server = self.options.servers[self.lookups[idx].server_idx];
        // Counted up front so a server that cannot be opened still uses up a try
        self.lookups[idx].attempts += 1;
        let socket = open_socket(server).map_err(|e| {
            warn!("Failed to open DNS socket to {}: {}", server, e);
            EngineStatus::File
        })?;
        let fd = socket.as_raw_fd();

        // Fresh ids per attempt so late answers to an earlier attempt are ignored
        let name = self.lookups[idx].name.clone();
        let unanswered: Vec<usize> = self.lookups[idx]
            .queries
            .iter()
            .enumerate()
            .filter(|(_, q)| q.status.is_none())
            .map(|(i, _)| i)
            .collect();
        for qi in unanswered {
            let record_type = self.lookups[idx].queries[qi].record_type;
            if let Some(query) = self.build_query(&name, record_type) {
                self.lookups[idx].queries[qi] = query;
            }
        }

        let lookup = &mut self.lookups[idx];
        lookup.socket = Some(socket);
        lookup.fd = Some(fd);
        lookup.deadline = Instant::now() + self.options.attempt_timeout;
        debug!(
            "Resolving {} via {} (attempt {})",
            lookup.host, server, lookup.attempts
        );

        let blocked = self.flush(idx)?;
        self.lookups[idx].writable_wanted = blocked;
        self.notify(fd, true, blocked);
        Ok(())
    }

    /// Send unsent queries; `Ok(true)` when the socket would block
    fn flush(&mut self, idx: usize) -> Result<bool, EngineStatus> {
        let lookup = &mut self.lookups[idx];
        let Some(socket) = lookup.socket.as_ref() else {
            return Err(EngineStatus::File);
        };
        for query in lookup.queries.iter_mut().filter(|q| !q.sent && q.status.is_none()) {
            match socket.send(&query.wire) {
                Ok(_) => query.sent = true,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(true),
                Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => {
                    return Err(EngineStatus::ConnRefused)
                }
                Err(e) => {
                    debug!("DNS send failed: {}", e);
                    return Err(EngineStatus::ConnRefused);
                }
            }
        }
        Ok(false)
    }

    fn close_socket(&mut self, idx: usize) {
        let fd = self.lookups[idx].fd.take();
        self.lookups[idx].writable_wanted = false;
        if let Some(fd) = fd {
            self.notify(fd, false, false);
        }
        self.lookups[idx].socket = None;
    }

    /// Point the lookup at the next server; once every try is used up, close
    /// it out with `status` and return false
    fn rotate_server(&mut self, idx: usize, status: EngineStatus) -> bool {
        let max_attempts = self.options.tries * self.options.servers.len();
        if self.lookups[idx].attempts >= max_attempts {
            self.close_socket(idx);
            for query in self.lookups[idx].queries.iter_mut() {
                if query.status.is_none() {
                    query.status = Some(status);
                }
            }
            return false;
        }
        let servers = self.options.servers.len();
        let lookup = &mut self.lookups[idx];
        lookup.server_idx = (lookup.server_idx + 1) % servers;
        true
    }

    /// Move to the next server or give up with `status`
    fn fail_attempt(&mut self, idx: usize, status: EngineStatus) {
        if self.rotate_server(idx, status) {
            self.start_attempt(idx);
        }
    }

    /// Feed readiness for descriptors; `(None, None)` only processes deadlines
    pub fn process_fd(&mut self, read_fd: Option<RawFd>, write_fd: Option<RawFd>) {
        if let Some(fd) = write_fd {
            if let Some(idx) = self.lookups.iter().position(|l| l.fd == Some(fd)) {
                match self.flush(idx) {
                    Ok(blocked) => {
                        if self.lookups[idx].writable_wanted != blocked {
                            self.lookups[idx].writable_wanted = blocked;
                            self.notify(fd, true, blocked);
                        }
                    }
                    Err(status) => self.fail_attempt(idx, status),
                }
            }
        }

        if let Some(fd) = read_fd {
            if let Some(idx) = self.lookups.iter().position(|l| l.fd == Some(fd)) {
                self.read_responses(idx);
            }
        }

        let now = Instant::now();
        let expired: Vec<usize> = self
            .lookups
            .iter()
            .enumerate()
            .filter(|(_, l)| !l.finished() && l.fd.is_some() && l.deadline <= now)
            .map(|(i, _)| i)
            .collect();
        for idx in expired {
            debug!("DNS attempt for {} timed out", self.lookups[idx].host);
            self.fail_attempt(idx, EngineStatus::Timeout);
        }

        self.complete_finished();
    }

    fn read_responses(&mut self, idx: usize) {
        let mut buf = [0u8; 4096];
        loop {
            let received = {
                let Some(socket) = self.lookups[idx].socket.as_ref() else {
                    return;
                };
                socket.recv(&mut buf)
            };
            match received {
                Ok(n) => {
                    self.handle_response(idx, &buf[..n]);
                    if self.lookups[idx].finished() {
                        return;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!("DNS receive failed: {}", e);
                    let status = if e.kind() == io::ErrorKind::ConnectionRefused {
                        EngineStatus::ConnRefused
                    } else {
                        EngineStatus::Eof
                    };
                    self.fail_attempt(idx, status);
                    return;
                }
            }
        }
    }

    fn handle_response(&mut self, idx: usize, data: &[u8]) {
        let message = match Message::from_bytes(data) {
            Ok(message) => message,
            Err(e) => {
                debug!("Ignoring malformed DNS response: {}", e);
                return;
            }
        };
        if message.message_type() != MessageType::Response {
            return;
        }

        let lookup = &mut self.lookups[idx];
        let port = lookup.port;
        let family = lookup.family;
        let Some(query) = lookup
            .queries
            .iter_mut()
            .find(|q| q.id == message.id() && q.status.is_none())
        else {
            trace!("Ignoring DNS response with unknown id {}", message.id());
            return;
        };

        let status = match message.response_code() {
            ResponseCode::NoError => {
                let mut found = 0;
                for answer in message.answers() {
                    let ip = match answer.data() {
                        RData::A(a) => IpAddr::V4(a.0),
                        RData::AAAA(aaaa) => IpAddr::V6(aaaa.0),
                        _ => continue,
                    };
                    if family.accepts(&ip) {
                        lookup.addrs.push(SocketAddr::new(ip, port));
                        found += 1;
                    }
                }
                if found > 0 {
                    EngineStatus::Success
                } else {
                    EngineStatus::NoData
                }
            }
            ResponseCode::NXDomain => EngineStatus::NotFound,
            ResponseCode::ServFail => EngineStatus::ServFail,
            ResponseCode::Refused => EngineStatus::Refused,
            ResponseCode::FormErr => EngineStatus::FormErr,
            ResponseCode::NotImp => EngineStatus::NotImp,
            _ => EngineStatus::BadResp,
        };
        query.status = Some(status);
    }

    fn complete_finished(&mut self) {
        let mut idx = 0;
        while idx < self.lookups.len() {
            if !self.lookups[idx].finished() {
                idx += 1;
                continue;
            }
            self.close_socket(idx);
            let mut lookup = self.lookups.remove(idx);
            let status = lookup.final_status();
            debug!(
                "Resolved {}: {} ({} addresses)",
                lookup.host,
                status,
                lookup.addrs.len()
            );
            if let Some(cb) = lookup.callback.take() {
                cb(status, std::mem::take(&mut lookup.addrs));
            }
        }
    }

    /// How long the caller may wait before polling again
    ///
    /// With nothing pending this is `max`, which may be `None`.
    pub fn timeout(&self, max: Option<Duration>) -> Option<Duration> {
        let now = Instant::now();
        let next = self
            .lookups
            .iter()
            .filter(|l| l.fd.is_some())
            .map(|l| l.deadline.saturating_duration_since(now))
            .min();
        match (next, max) {
            (Some(next), Some(max)) => Some(next.min(max)),
            (Some(next), None) => Some(next),
            (None, max) => max,
        }
    }

    fn abort_all(&mut self, status: EngineStatus) {
        while !self.lookups.is_empty() {
            self.close_socket(0);
            let mut lookup = self.lookups.remove(0);
            if let Some(cb) = lookup.callback.take() {
                cb(status, Vec::new());
            }
        }
    }

    /// Complete every pending lookup with `Cancelled`
    pub fn cancel(&mut self) {
        self.abort_all(EngineStatus::Cancelled);
    }

    /// Complete every pending lookup with `Destruction`; later lookups fail
    /// immediately
    pub fn destroy(&mut self) {
        self.destroyed = true;
        self.abort_all(EngineStatus::Destruction);
    }
}

impl Drop for DnsEngine {
    fn drop(&mut self) {
        self.destroy();
    }
}

fn open_socket(server: SocketAddr) -> io::Result<UdpSocket> {
    let domain = if server.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_nonblocking(true)?;
    socket.connect(&server.into())?;
    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::rr::rdata::A;
    use hickory_proto::rr::Record;
    use std::sync::mpsc;
    use std::sync::{Arc, Mutex};

    fn engine_with(servers: Vec<SocketAddr>, attempt_timeout: Duration) -> DnsEngine {
        DnsEngine::new(EngineOptions {
            servers,
            attempt_timeout,
            tries: 1,
        })
    }

    fn capture() -> (AddrInfoCallback, mpsc::Receiver<(EngineStatus, Vec<SocketAddr>)>) {
        let (tx, rx) = mpsc::channel();
        (
            Box::new(move |status, addrs| {
                let _ = tx.send((status, addrs));
            }),
            rx,
        )
    }

    /// Answers every A query with 10.1.2.3 and every other type with no data
    fn spawn_answering_server() -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let addr = socket.local_addr().unwrap();
        std::thread::spawn(move || {
            let mut buf = [0u8; 1500];
            while let Ok((n, peer)) = socket.recv_from(&mut buf) {
                let request = Message::from_bytes(&buf[..n]).unwrap();
                let mut response = Message::new();
                response.set_id(request.id());
                response.set_message_type(MessageType::Response);
                response.set_op_code(OpCode::Query);
                response.set_response_code(ResponseCode::NoError);
                for query in request.queries() {
                    response.add_query(query.clone());
                    if query.query_type() == RecordType::A {
                        response.add_answer(Record::from_rdata(
                            query.name().clone(),
                            60,
                            RData::A(A(Ipv4Addr::new(10, 1, 2, 3))),
                        ));
                    }
                }
                let _ = socket.send_to(&response.to_bytes().unwrap(), peer);
            }
        });
        addr
    }

    #[test]
    fn test_status_mapping() {
        use EngineStatus::*;
        for status in [NoData, FormErr, ServFail, NotFound, NotImp, BadResp, NoName] {
            assert_eq!(status.to_error(), Some(ResolveError::HostNotFound));
        }
        for status in [Refused, ConnRefused] {
            assert_eq!(status.to_error(), Some(ResolveError::ConnectionRefused));
        }
        assert_eq!(Timeout.to_error(), Some(ResolveError::TimedOut));
        assert_eq!(Eof.to_error(), Some(ResolveError::Eof));
        assert_eq!(File.to_error(), Some(ResolveError::BadDescriptor));
        assert_eq!(NoMem.to_error(), Some(ResolveError::NoMemory));
        assert_eq!(Cancelled.to_error(), Some(ResolveError::OperationAborted));
        assert_eq!(Destruction.to_error(), Some(ResolveError::OperationAborted));
        for status in [BadQuery, BadName, BadFamily] {
            assert_eq!(status.to_error(), Some(ResolveError::InvalidArgument));
        }
        assert_eq!(Success.to_error(), None);
    }

    #[test]
    fn test_parse_resolv_conf() {
        let content = "# comment\nnameserver 1.1.1.1\nsearch example.com\nnameserver ::1 # v6\nnameserver fe80::1%eth0\nnameserver bogus\n";
        let servers = parse_resolv_conf(content);
        assert_eq!(servers.len(), 3);
        assert_eq!(servers[0], "1.1.1.1:53".parse().unwrap());
        assert_eq!(servers[1], "[::1]:53".parse().unwrap());
    }

    #[test]
    fn test_literal_completes_immediately() {
        let mut engine = engine_with(vec![FALLBACK_NAMESERVER], Duration::from_secs(1));
        let (cb, rx) = capture();
        engine.getaddrinfo("192.0.2.7", 443, AddressFamily::Unspec, cb);
        let (status, addrs) = rx.try_recv().unwrap();
        assert_eq!(status, EngineStatus::Success);
        assert_eq!(addrs, vec!["192.0.2.7:443".parse().unwrap()]);

        let (cb, rx) = capture();
        engine.getaddrinfo("[::1]", 80, AddressFamily::Ipv4, cb);
        assert_eq!(rx.try_recv().unwrap().0, EngineStatus::BadFamily);
        assert_eq!(engine.pending(), 0);
    }

    #[test]
    fn test_localhost() {
        let mut engine = engine_with(vec![FALLBACK_NAMESERVER], Duration::from_secs(1));
        let (cb, rx) = capture();
        engine.getaddrinfo("LocalHost", 8080, AddressFamily::Ipv4, cb);
        let (status, addrs) = rx.try_recv().unwrap();
        assert_eq!(status, EngineStatus::Success);
        assert_eq!(addrs, vec!["127.0.0.1:8080".parse().unwrap()]);
    }

    #[test]
    fn test_bad_name() {
        let mut engine = engine_with(vec![FALLBACK_NAMESERVER], Duration::from_secs(1));
        let (cb, rx) = capture();
        engine.getaddrinfo("", 80, AddressFamily::Unspec, cb);
        assert_eq!(rx.try_recv().unwrap().0, EngineStatus::BadName);

        let (cb, rx) = capture();
        engine.getaddrinfo(&"a".repeat(300), 80, AddressFamily::Unspec, cb);
        assert_eq!(rx.try_recv().unwrap().0, EngineStatus::BadName);
    }

    #[test]
    fn test_resolve_against_server() {
        let server = spawn_answering_server();
        let mut engine = engine_with(vec![server], Duration::from_secs(5));

        let interest: Arc<Mutex<Vec<(RawFd, bool, bool)>>> = Arc::default();
        let log = interest.clone();
        engine.set_socket_state_callback(Box::new(move |fd, r, w| {
            log.lock().unwrap().push((fd, r, w));
        }));

        let (cb, rx) = capture();
        engine.getaddrinfo("example.test", 443, AddressFamily::Unspec, cb);
        let fd = interest.lock().unwrap()[0].0;
        assert!(interest.lock().unwrap()[0].1);

        let mut result = None;
        for _ in 0..200 {
            engine.process_fd(Some(fd), None);
            if let Ok(r) = rx.try_recv() {
                result = Some(r);
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        let (status, addrs) = result.expect("lookup did not complete");
        assert_eq!(status, EngineStatus::Success);
        assert_eq!(addrs, vec!["10.1.2.3:443".parse().unwrap()]);
        assert_eq!(engine.pending(), 0);
        assert_eq!(*interest.lock().unwrap().last().unwrap(), (fd, false, false));
    }

    #[test]
    fn test_attempt_timeout() {
        // Bound but never answering
        let silent = UdpSocket::bind("127.0.0.1:0").unwrap();
        let mut engine = engine_with(vec![silent.local_addr().unwrap()], Duration::from_millis(20));
        let (cb, rx) = capture();
        engine.getaddrinfo("example.test", 80, AddressFamily::Ipv4, cb);
        assert!(engine.timeout(Some(Duration::from_secs(10))).unwrap() <= Duration::from_millis(20));

        std::thread::sleep(Duration::from_millis(30));
        engine.process_fd(None, None);
        assert_eq!(rx.try_recv().unwrap().0, EngineStatus::Timeout);
    }

    #[test]
    fn test_cancel_and_destroy() {
        let silent = UdpSocket::bind("127.0.0.1:0").unwrap();
        let mut engine = engine_with(vec![silent.local_addr().unwrap()], Duration::from_secs(5));
        let (cb, rx) = capture();
        engine.getaddrinfo("example.test", 80, AddressFamily::Unspec, cb);
        assert_eq!(engine.pending(), 1);
        engine.cancel();
        assert_eq!(rx.try_recv().unwrap().0, EngineStatus::Cancelled);
        assert_eq!(engine.timeout(None), None);

        let (cb, rx) = capture();
        engine.getaddrinfo("example.test", 80, AddressFamily::Unspec, cb);
        engine.destroy();
        assert_eq!(rx.try_recv().unwrap().0, EngineStatus::Destruction);

        let (cb, rx) = capture();
        engine.getaddrinfo("example.test", 80, AddressFamily::Unspec, cb);
        assert_eq!(rx.try_recv().unwrap().0, EngineStatus::Destruction);
    }

    #[test]
    fn test_unopenable_servers_fail_lookup() {
        // Connecting a UDP socket to the broadcast address is refused
        let broadcast: SocketAddr = "255.255.255.255:53".parse().unwrap();
        let mut engine = DnsEngine::new(EngineOptions {
            servers: vec![broadcast, broadcast],
            attempt_timeout: Duration::from_secs(1),
            tries: 2,
        });
        let (cb, rx) = capture();
        engine.getaddrinfo("example.test", 80, AddressFamily::Unspec, cb);
        let (status, addrs) = rx.try_recv().unwrap();
        assert_eq!(status, EngineStatus::File);
        assert!(addrs.is_empty());
        assert_eq!(engine.pending(), 0);
        assert_eq!(engine.timeout(None), None);
    }

    #[test]
    fn test_unopenable_server_skipped() {
        let broadcast: SocketAddr = "255.255.255.255:53".parse().unwrap();
        let server = spawn_answering_server();
        let mut engine = engine_with(vec![broadcast, server], Duration::from_secs(5));

        let fds: Arc<Mutex<Vec<RawFd>>> = Arc::default();
        let log = fds.clone();
        engine.set_socket_state_callback(Box::new(move |fd, r, _| {
            if r {
                log.lock().unwrap().push(fd);
            }
        }));

        let (cb, rx) = capture();
        engine.getaddrinfo("example.test", 53, AddressFamily::Ipv4, cb);
        assert_eq!(engine.pending(), 1);
        let fd = fds.lock().unwrap()[0];

        let mut result = None;
        for _ in 0..200 {
            engine.process_fd(Some(fd), None);
            if let Ok(r) = rx.try_recv() {
                result = Some(r);
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        let (status, addrs) = result.expect("lookup did not complete");
        assert_eq!(status, EngineStatus::Success);
        assert_eq!(addrs, vec!["10.1.2.3:53".parse().unwrap()]);
    }

    #[test]
    fn test_timeout_without_lookups() {
        let engine = engine_with(vec![FALLBACK_NAMESERVER], Duration::from_secs(1));
        assert_eq!(
            engine.timeout(Some(Duration::from_secs(3))),
            Some(Duration::from_secs(3))
        );
    }
}
