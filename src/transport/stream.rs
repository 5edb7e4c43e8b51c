//! Polymorphic byte stream
//!
//! A [`Stream`] owns exactly one transport: a plain socket, a TLS session or
//! an AEAD-framed wrapper around either. It counts the bytes moved in each
//! direction and carries the HTTPS fallback flag negotiated during TLS setup.

use bytes::{Buf, BytesMut};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::Sleep;
use tokio_rustls::TlsStream;
use tracing::trace;

use super::cipher::CipherStream;
use crate::crypto::{AeadCipher, CipherMethod};
use crate::error::CipherError;
use crate::helper::RateLimiter;

/// Transport variants
pub enum StreamKind {
    /// Plain TCP
    Plain(TcpStream),
    /// TLS over TCP
    Tls(Box<TlsStream<TcpStream>>),
    /// AEAD framing over a plain or TLS stream
    Cipher(Box<CipherStream<StreamKind>>),
}

impl StreamKind {
    /// The socket at the bottom of the stack
    pub fn tcp(&self) -> &TcpStream {
        match self {
            StreamKind::Plain(tcp) => tcp,
            StreamKind::Tls(tls) => tls.get_ref().0,
            StreamKind::Cipher(cipher) => cipher.get_ref().tcp(),
        }
    }

    /// Whether decrypted bytes are queued above the socket
    fn has_buffered(&self) -> bool {
        match self {
            StreamKind::Plain(_) => false,
            // rustls stops asking for socket data while plaintext is queued
            // or after close_notify, and a read makes progress in both cases
            StreamKind::Tls(tls) => !tls.get_ref().1.wants_read(),
            StreamKind::Cipher(cipher) => {
                cipher.buffered_plaintext() > 0 || cipher.get_ref().has_buffered()
            }
        }
    }

    fn name(&self) -> &'static str {
        match self {
            StreamKind::Plain(_) => "plain",
            StreamKind::Tls(_) => "tls",
            StreamKind::Cipher(_) => "cipher",
        }
    }
}

impl AsyncRead for StreamKind {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            StreamKind::Plain(s) => Pin::new(s).poll_read(cx, buf),
            StreamKind::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
            StreamKind::Cipher(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for StreamKind {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            StreamKind::Plain(s) => Pin::new(s).poll_write(cx, buf),
            StreamKind::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
            StreamKind::Cipher(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            StreamKind::Plain(s) => Pin::new(s).poll_flush(cx),
            StreamKind::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
            StreamKind::Cipher(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            StreamKind::Plain(s) => Pin::new(s).poll_shutdown(cx),
            StreamKind::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
            StreamKind::Cipher(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// A bidirectional byte channel owned by one connection
pub struct Stream {
    kind: StreamKind,
    pending: BytesMut,
    rbytes: u64,
    wbytes: u64,
    https_fallback: bool,
    limiter: Option<RateLimiter>,
    read_delay: Option<Pin<Box<Sleep>>>,
    write_delay: Option<Pin<Box<Sleep>>>,
    closed: bool,
}

impl Stream {
    fn from_kind(kind: StreamKind) -> Self {
        Stream {
            kind,
            pending: BytesMut::new(),
            rbytes: 0,
            wbytes: 0,
            https_fallback: false,
            limiter: None,
            read_delay: None,
            write_delay: None,
            closed: false,
        }
    }

    /// Wrap a plain socket
    pub fn plain(tcp: TcpStream) -> Self {
        Self::from_kind(StreamKind::Plain(tcp))
    }

    /// Wrap a TLS session; `https_fallback` records the negotiated ALPN
    pub fn tls(tls: TlsStream<TcpStream>, https_fallback: bool) -> Self {
        let mut stream = Self::from_kind(StreamKind::Tls(Box::new(tls)));
        stream.https_fallback = https_fallback;
        stream
    }

    /// Add AEAD framing on top of the current transport
    ///
    /// Bytes already read ahead are treated as ciphertext. Counters and the
    /// rate limit carry over.
    pub fn into_cipher(self, method: CipherMethod, master_key: &[u8]) -> Result<Self, CipherError> {
        let encryptor = AeadCipher::encryptor(method, master_key)?;
        let decryptor = AeadCipher::decryptor(method, master_key)?;
        self.wrap_cipher(encryptor, decryptor)
    }

    /// Like [`Stream::into_cipher`] with prepared ciphers
    pub fn wrap_cipher(mut self, encryptor: AeadCipher, decryptor: AeadCipher) -> Result<Self, CipherError> {
        let pending = std::mem::take(&mut self.pending);
        let Stream {
            kind,
            rbytes,
            wbytes,
            https_fallback,
            limiter,
            ..
        } = self;

        let mut cipher = CipherStream::with_ciphers(kind, encryptor, decryptor);
        if !pending.is_empty() {
            cipher.feed(&pending)?;
        }

        let mut stream = Self::from_kind(StreamKind::Cipher(Box::new(cipher)));
        stream.rbytes = rbytes;
        stream.wbytes = wbytes;
        stream.https_fallback = https_fallback;
        stream.limiter = limiter;
        Ok(stream)
    }

    /// Cap throughput at `bytes_per_sec` (0 = unlimited)
    pub fn set_rate_limit(&mut self, bytes_per_sec: u64) {
        self.limiter = RateLimiter::new(bytes_per_sec);
    }

    /// Return bytes to the front of the read side
    pub fn unread(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let mut merged = BytesMut::with_capacity(data.len() + self.pending.len());
        merged.extend_from_slice(data);
        merged.extend_from_slice(&self.pending);
        self.pending = merged;
    }

    /// The transport variant
    pub fn kind(&self) -> &StreamKind {
        &self.kind
    }

    /// Bytes read so far
    pub fn rbytes(&self) -> u64 {
        self.rbytes
    }

    /// Bytes written so far
    pub fn wbytes(&self) -> u64 {
        self.wbytes
    }

    /// Whether TLS negotiated HTTP/1.1 instead of cipher framing
    pub fn https_fallback(&self) -> bool {
        self.https_fallback
    }

    /// Whether `close` has been called
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Remote address of the underlying socket
    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.kind.tcp().peer_addr()
    }

    /// Local address of the underlying socket
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.kind.tcp().local_addr()
    }

    fn ensure_open(&self) -> io::Result<()> {
        if self.closed {
            Err(io::Error::new(io::ErrorKind::NotConnected, "stream closed"))
        } else {
            Ok(())
        }
    }

    fn has_buffered(&self) -> bool {
        !self.pending.is_empty() || self.kind.has_buffered()
    }

    /// Wait until a read can make progress
    pub async fn wait_readable(&self) -> io::Result<()> {
        self.ensure_open()?;
        if self.has_buffered() {
            return Ok(());
        }
        self.kind.tcp().readable().await
    }

    /// Read whatever is available, at most `buf.len()` bytes; 0 means EOF
    pub async fn read_some(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read(buf).await
    }

    /// Wait until a write can make progress
    pub async fn wait_writable(&self) -> io::Result<()> {
        self.ensure_open()?;
        self.kind.tcp().writable().await
    }

    /// Write part of `buf` and push it onto the wire
    pub async fn write_some(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.write(buf).await?;
        self.flush().await?;
        Ok(n)
    }

    /// Close the write direction gracefully
    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.ensure_open()?;
        AsyncWriteExt::shutdown(self).await
    }

    /// Tear down both directions immediately
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let socket = socket2::SockRef::from(self.kind.tcp());
        if let Err(e) = socket.shutdown(std::net::Shutdown::Both) {
            trace!("Shutdown on close failed: {}", e);
        }
    }

    fn poll_rate_limit(
        limiter: &mut Option<RateLimiter>,
        delay: &mut Option<Pin<Box<Sleep>>>,
        cx: &mut Context<'_>,
    ) -> Poll<()> {
        loop {
            if let Some(sleep) = delay.as_mut() {
                ready!(sleep.as_mut().poll(cx));
                *delay = None;
            }
            let Some(wait) = limiter.as_mut().and_then(|l| l.delay()) else {
                return Poll::Ready(());
            };
            *delay = Some(Box::pin(tokio::time::sleep(wait)));
        }
    }
}

impl AsyncRead for Stream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        this.ensure_open()?;
        ready!(Self::poll_rate_limit(&mut this.limiter, &mut this.read_delay, cx));

        let n = if !this.pending.is_empty() {
            let n = this.pending.len().min(buf.remaining());
            buf.put_slice(&this.pending[..n]);
            this.pending.advance(n);
            n
        } else {
            let before = buf.filled().len();
            ready!(Pin::new(&mut this.kind).poll_read(cx, buf))?;
            buf.filled().len() - before
        };

        this.rbytes += n as u64;
        if let Some(limiter) = this.limiter.as_mut() {
            limiter.consume(n);
        }
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        this.ensure_open()?;
        ready!(Self::poll_rate_limit(&mut this.limiter, &mut this.write_delay, cx));

        let n = ready!(Pin::new(&mut this.kind).poll_write(cx, buf))?;
        this.wbytes += n as u64;
        if let Some(limiter) = this.limiter.as_mut() {
            limiter.consume(n);
        }
        Poll::Ready(Ok(n))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.ensure_open()?;
        Pin::new(&mut self.kind).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if self.closed {
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.kind).poll_shutdown(cx)
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("kind", &self.kind.name())
            .field("rbytes", &self.rbytes)
            .field("wbytes", &self.wbytes)
            .field("https_fallback", &self.https_fallback)
            .field("closed", &self.closed)
            .finish()
    }
}
