//! HTTP proxy request parsing
//!
//! The parser consumes a request line and header block incrementally and
//! stops at the end of the headers. Everything after the header block is
//! treated as an opaque byte stream, whether the request was a CONNECT or a
//! plain proxied request; bodies are never framed here.
//!
//! State machine:
//!
//! ```text
//! Pending (request line, headers) -> HeadersDone -> MessageDone
//!        \__________________________________________-> Error (absorbing)
//! ```

use super::consts::{HTTP_DEFAULT_PORT, MAX_HTTP_HEADER_BYTES};
use crate::error::ProtocolError;

/// Sentinel returned by [`ParseOutcome::code`] once the header block is done:
/// the rest of the connection is an upgraded byte stream
pub const PARSE_UPGRADE: i32 = 2;

/// Methods accepted when the parser is not lenient
pub const ALLOWED_METHODS: &[&str] = &[
    "ACL",
    "BIND",
    "CHECKOUT",
    "CONNECT",
    "COPY",
    "DELETE",
    "GET",
    "HEAD",
    "LINK",
    "LOCK",
    "MERGE",
    "MKACTIVITY",
    "MKCALENDAR",
    "MKCOL",
    "MOVE",
    "MSEARCH",
    "NOTIFY",
    "OPTIONS",
    "PATCH",
    "POST",
    "PROPFIND",
    "PROPPATCH",
    "PURGE",
    "PUT",
    "REBIND",
    "REPORT",
    "SEARCH",
    "SOURCE",
    "SUBSCRIBE",
    "TRACE",
    "UNBIND",
    "UNLINK",
    "UNLOCK",
    "UNSUBSCRIBE",
];

/// Parser lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParserStatus {
    /// Still reading the request line or headers
    Pending,
    /// Header block complete
    HeadersDone,
    /// Bytes after the header block have been handed back as opaque data
    MessageDone,
    /// Malformed input; permanent
    Error,
}

/// Result of feeding bytes to a parser
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseOutcome {
    /// All input consumed, header block not finished yet
    Incomplete,
    /// Header block finished; bytes of the last input from `body_offset` on
    /// belong to the upgraded stream
    HeadersDone {
        /// Index of the first byte after the header block
        body_offset: usize,
    },
    /// Headers were already complete; the whole input is opaque data
    Body,
}

impl ParseOutcome {
    /// Numeric form: `0` while pending, [`PARSE_UPGRADE`] once headers are done
    pub fn code(&self) -> i32 {
        match self {
            ParseOutcome::Incomplete => 0,
            ParseOutcome::HeadersDone { .. } | ParseOutcome::Body => PARSE_UPGRADE,
        }
    }
}

/// Parser switches
#[derive(Debug, Clone, Copy, Default)]
pub struct ParserOptions {
    /// Accept any RFC token as method instead of the fixed list
    pub lenient_methods: bool,
    /// Require `HTTP/DIGIT.DIGIT` as version
    pub strict_version: bool,
}

/// RFC 7230 `tchar`
fn is_token_char(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
}

fn is_url_char(b: u8) -> bool {
    b == b'\t' || b == 0x0C || (0x21..=0x7E).contains(&b)
}

fn is_authority_char(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b"!$%&'()*+,-.:;=@[]_~".contains(&b)
}

/// Validate a method token
pub fn validate_method(method: &str, lenient: bool) -> Result<(), ProtocolError> {
    if method.is_empty() || method.contains(' ') {
        return Err(ProtocolError::InvalidMethod);
    }
    if lenient {
        if method.bytes().all(is_token_char) {
            return Ok(());
        }
        return Err(ProtocolError::InvalidMethod);
    }
    if ALLOWED_METHODS.contains(&method) {
        Ok(())
    } else {
        Err(ProtocolError::InvalidMethod)
    }
}

fn validate_authority(authority: &str) -> Result<(), ProtocolError> {
    if authority.is_empty() || authority.contains("@@") {
        return Err(ProtocolError::InvalidUrl);
    }
    if authority.bytes().all(is_authority_char) {
        Ok(())
    } else {
        Err(ProtocolError::InvalidUrl)
    }
}

/// Split an absolute URI into `(authority, path_and_query)`
fn split_absolute(url: &str) -> Result<(&str, &str), ProtocolError> {
    let scheme_end = url.find("://").ok_or(ProtocolError::InvalidUrl)?;
    let scheme = &url[..scheme_end];
    let mut chars = scheme.bytes();
    match chars.next() {
        Some(b) if b.is_ascii_alphabetic() => {}
        _ => return Err(ProtocolError::InvalidUrl),
    }
    if !chars.all(|b| b.is_ascii_alphanumeric() || b == b'+' || b == b'-' || b == b'.') {
        return Err(ProtocolError::InvalidUrl);
    }

    let rest = &url[scheme_end + 3..];
    let authority_end = rest.find(['/', '?']).unwrap_or(rest.len());
    Ok((&rest[..authority_end], &rest[authority_end..]))
}

/// Validate a request target
pub fn validate_url(url: &str, is_connect: bool) -> Result<(), ProtocolError> {
    if url.is_empty() {
        return Err(ProtocolError::InvalidUrl);
    }
    if is_connect {
        return validate_authority(url);
    }
    if url.starts_with('/') || url.starts_with('*') {
        if url.bytes().all(is_url_char) {
            return Ok(());
        }
        return Err(ProtocolError::InvalidUrl);
    }
    let (authority, path) = split_absolute(url)?;
    validate_authority(authority)?;
    if path.bytes().all(is_url_char) {
        Ok(())
    } else {
        Err(ProtocolError::InvalidUrl)
    }
}

/// An empty version is a version-less HTTP/0.9 request line and passes
fn validate_version(version: &str, strict: bool) -> Result<(), ProtocolError> {
    if version.is_empty() {
        return Ok(());
    }
    if version.bytes().any(|b| b.is_ascii_whitespace() || b.is_ascii_control()) {
        return Err(ProtocolError::InvalidVersion);
    }
    if !strict {
        return Ok(());
    }
    match version.as_bytes() {
        [b'H', b'T', b'T', b'P', b'/', major, b'.', minor]
            if major.is_ascii_digit() && minor.is_ascii_digit() =>
        {
            Ok(())
        }
        _ => Err(ProtocolError::InvalidVersion),
    }
}

/// Split `host[:port]` into its parts
///
/// The last `:` separates the port unless the last `]` comes after it, so a
/// bare bracketed IPv6 literal keeps its colons. Brackets are stripped. A
/// missing port defaults to 80; a present port must be a full decimal number
/// no larger than 65535.
pub fn split_host_port(input: &str) -> Result<(String, u16), ProtocolError> {
    let colon = input.rfind(':');
    let bracket = input.rfind(']');

    let (host, port) = match colon {
        Some(c) if bracket.map_or(true, |b| b < c) => {
            let port_str = &input[c + 1..];
            if port_str.is_empty() || !port_str.bytes().all(|b| b.is_ascii_digit()) {
                return Err(ProtocolError::InvalidPort(port_str.to_string()));
            }
            let port = port_str
                .parse::<u16>()
                .map_err(|_| ProtocolError::InvalidPort(port_str.to_string()))?;
            (&input[..c], port)
        }
        _ => (input, HTTP_DEFAULT_PORT),
    };

    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    if host.is_empty() {
        return Err(ProtocolError::InvalidHost(input.to_string()));
    }
    Ok((host.to_string(), port))
}

/// Header fields with unique, case-insensitive names
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderMap {
    entries: Vec<(String, String)>,
}

impl HeaderMap {
    /// Insert or replace a header
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self
            .entries
            .iter_mut()
            .find(|(k, _)| k.eq_ignore_ascii_case(&name))
        {
            Some(entry) => entry.1 = value,
            None => self.entries.push((name, value)),
        }
    }

    /// Case-insensitive lookup
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Whether a header is present
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Number of headers
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether there are no headers
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate over `(name, value)` pairs
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// A parsed proxy request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HttpRequest {
    /// Request method
    pub method: String,
    /// Request target as received
    pub url: String,
    /// Protocol version token
    pub version: String,
    /// Target host
    pub host: String,
    /// Target port
    pub port: u16,
    /// Header fields
    pub headers: HeaderMap,
}

impl HttpRequest {
    /// Whether this is a CONNECT request
    pub fn is_connect(&self) -> bool {
        self.method == "CONNECT"
    }

    /// Request target reduced to origin-form
    pub fn origin_form(&self) -> String {
        if self.url.starts_with('/') || self.url.starts_with('*') {
            return self.url.clone();
        }
        match split_absolute(&self.url) {
            Ok((_, path)) if path.starts_with('/') => path.to_string(),
            Ok((_, path)) if !path.is_empty() => format!("/{}", path),
            _ => "/".to_string(),
        }
    }

    /// Rewrite the request header for sending to an origin server
    ///
    /// The request line uses origin-form and `HTTP/1.1`; `Proxy-Connection`
    /// is dropped and `extra` headers are appended.
    pub fn reforge(&self, extra: &[(&str, &str)]) -> String {
        let mut out = format!("{} {} HTTP/1.1\r\n", self.method, self.origin_form());
        for (name, value) in self.headers.iter() {
            if name.eq_ignore_ascii_case("Proxy-Connection") {
                continue;
            }
            out.push_str(name);
            out.push_str(": ");
            out.push_str(value);
            out.push_str("\r\n");
        }
        for (name, value) in extra {
            out.push_str(name);
            out.push_str(": ");
            out.push_str(value);
            out.push_str("\r\n");
        }
        out.push_str("\r\n");
        out
    }
}

/// Incremental line splitter shared by the request and response parsers
#[derive(Debug, Default)]
struct HeadBuffer {
    buf: Vec<u8>,
    pos: usize,
}

impl HeadBuffer {
    /// Next complete line without its terminator, plus the offset just past it
    fn next_line(&mut self) -> Result<Option<(String, usize)>, ProtocolError> {
        let Some(rel) = self.buf[self.pos..].iter().position(|&b| b == b'\n') else {
            if self.buf.len() > MAX_HTTP_HEADER_BYTES {
                return Err(ProtocolError::HeaderOverflow);
            }
            return Ok(None);
        };
        let end = self.pos + rel;
        let next = end + 1;
        if next > MAX_HTTP_HEADER_BYTES {
            return Err(ProtocolError::HeaderOverflow);
        }
        let mut line = &self.buf[self.pos..end];
        if line.last() == Some(&b'\r') {
            line = &line[..line.len() - 1];
        }
        let line = String::from_utf8(line.to_vec()).map_err(|_| ProtocolError::InvalidHeader)?;
        self.pos = next;
        Ok(Some((line, next)))
    }
}

/// Obsolete line folding is refused rather than joined
fn parse_header_line(line: &str, headers: &mut HeaderMap) -> Result<(), ProtocolError> {
    if line.starts_with(' ') || line.starts_with('\t') {
        return Err(ProtocolError::InvalidHeader);
    }
    let colon = line.find(':').ok_or(ProtocolError::InvalidHeader)?;
    let name = &line[..colon];
    if name.is_empty() || !name.bytes().all(is_token_char) {
        return Err(ProtocolError::InvalidHeader);
    }
    let value = line[colon + 1..].trim_matches([' ', '\t']);
    if value.bytes().any(|b| b.is_ascii_control() && b != b'\t') {
        return Err(ProtocolError::InvalidHeader);
    }
    headers.insert(name, value);
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    StartLine,
    Headers,
}

/// Incremental HTTP request parser
#[derive(Debug)]
pub struct HttpRequestParser {
    options: ParserOptions,
    head: HeadBuffer,
    stage: Stage,
    status: ParserStatus,
    error: Option<ProtocolError>,
    request: HttpRequest,
}

impl Default for HttpRequestParser {
    fn default() -> Self {
        Self::new(ParserOptions::default())
    }
}

impl HttpRequestParser {
    /// Create a parser
    pub fn new(options: ParserOptions) -> Self {
        HttpRequestParser {
            options,
            head: HeadBuffer::default(),
            stage: Stage::StartLine,
            status: ParserStatus::Pending,
            error: None,
            request: HttpRequest::default(),
        }
    }

    /// Current status
    pub fn status(&self) -> ParserStatus {
        self.status
    }

    /// Error detail once the parser failed
    pub fn error(&self) -> Option<&ProtocolError> {
        self.error.as_ref()
    }

    /// Parsed request; complete once the status is `HeadersDone`
    pub fn request(&self) -> &HttpRequest {
        &self.request
    }

    /// Take the parsed request out of the parser
    pub fn into_request(self) -> HttpRequest {
        self.request
    }

    /// Feed bytes
    ///
    /// Split input yields the same request as contiguous input. After an
    /// error every call fails with the same error.
    pub fn parse(&mut self, data: &[u8]) -> Result<ParseOutcome, ProtocolError> {
        match self.status {
            ParserStatus::Error => {
                return Err(self.error.clone().unwrap_or(ProtocolError::InvalidHeader))
            }
            ParserStatus::HeadersDone | ParserStatus::MessageDone => {
                self.status = ParserStatus::MessageDone;
                return Ok(ParseOutcome::Body);
            }
            ParserStatus::Pending => {}
        }

        let prior = self.head.buf.len();
        self.head.buf.extend_from_slice(data);

        match self.advance() {
            Ok(Some(end)) => {
                self.status = ParserStatus::HeadersDone;
                self.head = HeadBuffer::default();
                Ok(ParseOutcome::HeadersDone {
                    body_offset: end - prior,
                })
            }
            Ok(None) => Ok(ParseOutcome::Incomplete),
            Err(err) => {
                tracing::debug!("HTTP request rejected: {}", err);
                self.status = ParserStatus::Error;
                self.error = Some(err.clone());
                Err(err)
            }
        }
    }

    fn advance(&mut self) -> Result<Option<usize>, ProtocolError> {
        while let Some((line, next)) = self.head.next_line()? {
            match self.stage {
                Stage::StartLine => {
                    // Leading empty lines are tolerated
                    if line.is_empty() {
                        continue;
                    }
                    self.parse_request_line(&line)?;
                    self.stage = Stage::Headers;
                }
                Stage::Headers => {
                    if line.is_empty() {
                        self.finish()?;
                        return Ok(Some(next));
                    }
                    parse_header_line(&line, &mut self.request.headers)?;
                }
            }
        }
        Ok(None)
    }

    fn parse_request_line(&mut self, line: &str) -> Result<(), ProtocolError> {
        let first_sp = line.find(' ').ok_or(ProtocolError::InvalidMethod)?;
        let method = &line[..first_sp];
        validate_method(method, self.options.lenient_methods)?;

        let rest = &line[first_sp + 1..];
        let (url, version) = match rest.rfind(' ') {
            Some(last_sp) => (&rest[..last_sp], &rest[last_sp + 1..]),
            None => (rest, ""),
        };

        let is_connect = method == "CONNECT";
        validate_url(url, is_connect)?;
        validate_version(version, self.options.strict_version)?;

        self.request.method = method.to_string();
        self.request.url = url.to_string();
        self.request.version = version.to_string();
        Ok(())
    }

    fn finish(&mut self) -> Result<(), ProtocolError> {
        let authority = if self.request.is_connect() {
            self.request.url.clone()
        } else if let Some(host) = self.request.headers.get("Host") {
            host.to_string()
        } else if !self.request.url.starts_with('/') && !self.request.url.starts_with('*') {
            let (authority, _) = split_absolute(&self.request.url)?;
            authority
                .rsplit_once('@')
                .map_or(authority, |(_, host)| host)
                .to_string()
        } else {
            return Err(ProtocolError::InvalidHost("missing Host header".to_string()));
        };

        let (host, port) = split_host_port(&authority)?;
        self.request.host = host;
        self.request.port = port;
        Ok(())
    }
}

/// Incremental HTTP response parser, used to read the reply to a CONNECT
/// sent through an HTTPS fallback tunnel
#[derive(Debug)]
pub struct HttpResponseParser {
    head: HeadBuffer,
    stage: Stage,
    status: ParserStatus,
    status_code: u16,
    headers: HeaderMap,
}

impl Default for HttpResponseParser {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpResponseParser {
    /// Create a parser
    pub fn new() -> Self {
        HttpResponseParser {
            head: HeadBuffer::default(),
            stage: Stage::StartLine,
            status: ParserStatus::Pending,
            status_code: 0,
            headers: HeaderMap::default(),
        }
    }

    /// Current status
    pub fn status(&self) -> ParserStatus {
        self.status
    }

    /// Response status code, valid once headers are done
    pub fn status_code(&self) -> u16 {
        self.status_code
    }

    /// Response headers
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Feed bytes; same contract as [`HttpRequestParser::parse`]
    pub fn parse(&mut self, data: &[u8]) -> Result<ParseOutcome, ProtocolError> {
        match self.status {
            ParserStatus::Error => return Err(ProtocolError::InvalidVersion),
            ParserStatus::HeadersDone | ParserStatus::MessageDone => {
                self.status = ParserStatus::MessageDone;
                return Ok(ParseOutcome::Body);
            }
            ParserStatus::Pending => {}
        }

        let prior = self.head.buf.len();
        self.head.buf.extend_from_slice(data);
        match self.advance() {
            Ok(Some(end)) => {
                self.status = ParserStatus::HeadersDone;
                self.head = HeadBuffer::default();
                Ok(ParseOutcome::HeadersDone {
                    body_offset: end - prior,
                })
            }
            Ok(None) => Ok(ParseOutcome::Incomplete),
            Err(err) => {
                self.status = ParserStatus::Error;
                Err(err)
            }
        }
    }

    fn advance(&mut self) -> Result<Option<usize>, ProtocolError> {
        while let Some((line, next)) = self.head.next_line()? {
            match self.stage {
                Stage::StartLine => {
                    if line.is_empty() {
                        continue;
                    }
                    self.status_code = parse_status_line(&line)?;
                    self.stage = Stage::Headers;
                }
                Stage::Headers => {
                    if line.is_empty() {
                        return Ok(Some(next));
                    }
                    parse_header_line(&line, &mut self.headers)?;
                }
            }
        }
        Ok(None)
    }
}

/// `HTTP/x.y SP 3DIGIT [SP reason]`
fn parse_status_line(line: &str) -> Result<u16, ProtocolError> {
    let mut parts = line.splitn(3, ' ');
    let version = parts.next().unwrap_or_default();
    if !version.starts_with("HTTP/") {
        return Err(ProtocolError::InvalidVersion);
    }
    let code = parts.next().unwrap_or_default();
    if code.len() != 3 || !code.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ProtocolError::InvalidHeader);
    }
    code.parse().map_err(|_| ProtocolError::InvalidHeader)
}
