//! Cipher-framed stream
//!
//! Wraps any byte stream with one [`AeadCipher`] per direction. Writes are
//! encrypted into an internal buffer that is drained before new data is
//! accepted, so a pending write always completes before the next one starts.

use bytes::{Buf, BytesMut};
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::crypto::{AeadCipher, CipherMethod, FRAME_PAYLOAD_SIZE};
use crate::error::CipherError;
use crate::helper::DEFAULT_BUFFER_SIZE;

/// Largest plaintext accepted by one write call
const MAX_WRITE_BATCH: usize = FRAME_PAYLOAD_SIZE * 4;

/// AEAD chunk framing over an inner stream
pub struct CipherStream<S> {
    inner: S,
    encryptor: AeadCipher,
    decryptor: AeadCipher,
    scratch: Vec<u8>,
    plain: BytesMut,
    out: BytesMut,
    read_eof: bool,
    failed: bool,
}

impl<S> CipherStream<S> {
    /// Wrap `inner`, deriving both directions from `master_key`
    pub fn new(inner: S, method: CipherMethod, master_key: &[u8]) -> Result<Self, CipherError> {
        Ok(Self::with_ciphers(
            inner,
            AeadCipher::encryptor(method, master_key)?,
            AeadCipher::decryptor(method, master_key)?,
        ))
    }

    /// Wrap `inner` with prepared ciphers
    pub fn with_ciphers(inner: S, encryptor: AeadCipher, decryptor: AeadCipher) -> Self {
        CipherStream {
            inner,
            encryptor,
            decryptor,
            scratch: vec![0u8; DEFAULT_BUFFER_SIZE * 2],
            plain: BytesMut::new(),
            out: BytesMut::new(),
            read_eof: false,
            failed: false,
        }
    }

    /// Borrow the inner stream
    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    /// Mutably borrow the inner stream
    pub fn get_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    /// Cipher method in use
    pub fn method(&self) -> CipherMethod {
        self.encryptor.method()
    }

    /// Packets sealed so far
    pub fn packets_sent(&self) -> u64 {
        self.encryptor.counter()
    }

    /// Packets opened so far
    pub fn packets_received(&self) -> u64 {
        self.decryptor.counter()
    }

    /// Decrypted bytes waiting to be read
    pub fn buffered_plaintext(&self) -> usize {
        self.plain.len()
    }

    /// Decrypt ciphertext that was read from the inner stream before wrapping
    pub fn feed(&mut self, ciphertext: &[u8]) -> Result<(), CipherError> {
        self.decryptor.decrypt(ciphertext, &mut self.plain).inspect_err(|_| {
            self.failed = true;
        })
    }

    fn fail(&mut self, err: CipherError) -> io::Error {
        self.failed = true;
        err.into()
    }
}

impl<S: AsyncWrite + Unpin> CipherStream<S> {
    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while !self.out.is_empty() {
            let n = ready!(Pin::new(&mut self.inner).poll_write(cx, &self.out))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.out.advance(n);
        }
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for CipherStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        loop {
            if !this.plain.is_empty() {
                let n = this.plain.len().min(buf.remaining());
                buf.put_slice(&this.plain[..n]);
                this.plain.advance(n);
                return Poll::Ready(Ok(()));
            }
            if this.failed {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "cipher stream failed",
                )));
            }
            if this.read_eof {
                if this.decryptor.buffered() > 0 {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "stream ended inside a cipher chunk",
                    )));
                }
                return Poll::Ready(Ok(()));
            }

            let mut read_buf = ReadBuf::new(&mut this.scratch);
            ready!(Pin::new(&mut this.inner).poll_read(cx, &mut read_buf))?;
            let filled = read_buf.filled().len();
            if filled == 0 {
                this.read_eof = true;
                continue;
            }
            if let Err(e) = this.decryptor.decrypt(&this.scratch[..filled], &mut this.plain) {
                return Poll::Ready(Err(this.fail(e)));
            }
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for CipherStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        if this.failed {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "cipher stream failed",
            )));
        }
        ready!(this.poll_drain(cx))?;
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        let n = buf.len().min(MAX_WRITE_BATCH);
        if let Err(e) = this.encryptor.encrypt(&buf[..n], &mut this.out) {
            return Poll::Ready(Err(this.fail(e)));
        }
        // The batch is accepted; anything not yet on the wire goes out on the
        // next write or flush
        if let Poll::Ready(Err(e)) = this.poll_drain(cx) {
            return Poll::Ready(Err(e));
        }
        Poll::Ready(Ok(n))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        ready!(self.poll_drain(cx))?;
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        ready!(self.poll_drain(cx))?;
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

impl<S> std::fmt::Debug for CipherStream<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CipherStream")
            .field("method", &self.encryptor.method())
            .field("sent", &self.encryptor.counter())
            .field("received", &self.decryptor.counter())
            .finish()
    }
}
