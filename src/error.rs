//! Error types for Sockstun
//!
//! This module defines the error taxonomy used throughout the tunnel engine:
//! protocol, cipher, resolution, transport and configuration failures.

use std::io;
use thiserror::Error;

/// Main error type for Sockstun operations
#[derive(Error, Debug)]
pub enum SockstunError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed proxy request
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Cipher setup or authentication failure
    #[error("Cipher error: {0}")]
    Cipher(#[from] CipherError),

    /// Name resolution failure
    #[error("Resolve error: {0}")]
    Resolve(#[from] ResolveError),

    /// Transport error (TLS, socket policy)
    #[error("Transport error: {0}")]
    Transport(String),

    /// Timeout error
    #[error("Timeout: {0}")]
    Timeout(String),
}

/// Errors raised while parsing untrusted proxy requests
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// HTTP method token rejected
    #[error("HPE_INVALID_METHOD")]
    InvalidMethod,

    /// HTTP request target rejected
    #[error("HPE_INVALID_URL")]
    InvalidUrl,

    /// HTTP version rejected
    #[error("HPE_INVALID_VERSION")]
    InvalidVersion,

    /// Malformed header line
    #[error("HPE_INVALID_HEADER_TOKEN")]
    InvalidHeader,

    /// Header block larger than the allowed maximum
    #[error("HPE_HEADER_OVERFLOW")]
    HeaderOverflow,

    /// Host could not be derived from the request
    #[error("Invalid host: {0}")]
    InvalidHost(String),

    /// Port is not a full decimal number in range
    #[error("Invalid port: {0}")]
    InvalidPort(String),

    /// Unsupported SOCKS version
    #[error("Unsupported SOCKS version: {0}")]
    UnsupportedVersion(u8),

    /// No acceptable authentication method
    #[error("No acceptable authentication method")]
    NoAcceptableMethod,

    /// Authentication failed
    #[error("Authentication failed")]
    AuthFailed,

    /// Command not supported
    #[error("Command not supported: {0}")]
    CommandNotSupported(u8),

    /// Address type not supported
    #[error("Address type not supported: {0}")]
    AddressTypeNotSupported(u8),

    /// Invalid domain name
    #[error("Invalid domain name: {0}")]
    InvalidDomain(String),

    /// Buffered data exceeded the per-connection limit
    #[error("Pending buffer overflow: {0} bytes")]
    BufferOverflow(usize),
}

/// Errors raised by the AEAD crypters and the tunnel framing
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CipherError {
    /// Key length does not match the method
    #[error("Invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength {
        /// Required length
        expected: usize,
        /// Supplied length
        actual: usize,
    },

    /// IV length does not match the method
    #[error("Invalid IV length: expected {expected}, got {actual}")]
    InvalidIvLength {
        /// Required length
        expected: usize,
        /// Supplied length
        actual: usize,
    },

    /// Nonce prefix length does not match the method
    #[error("Invalid nonce prefix length: expected {expected}, got {actual}")]
    InvalidNoncePrefixLength {
        /// Required length
        expected: usize,
        /// Supplied length
        actual: usize,
    },

    /// Key was never set
    #[error("Key not set")]
    KeyNotSet,

    /// Packet counter would wrap and reuse a nonce
    #[error("Nonce space exhausted")]
    NonceExhausted,

    /// Encryption failed
    #[error("Encryption failed")]
    EncryptFailed,

    /// Authentication tag mismatch
    #[error("Decryption failed: authentication tag mismatch")]
    DecryptFailed,

    /// Unknown cipher method name
    #[error("Unsupported cipher method: {0}")]
    UnsupportedMethod(String),

    /// Tunnel chunk announced an impossible length
    #[error("Invalid chunk length: {0}")]
    InvalidChunkLength(usize),

    /// Key derivation failed
    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),
}

/// Resolution errors, mapped from the resolver engine status codes
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveError {
    /// No data, malformed response or NXDOMAIN-class answers
    #[error("Host not found")]
    HostNotFound,

    /// Name server refused the query
    #[error("Connection refused")]
    ConnectionRefused,

    /// Resolution did not finish in time
    #[error("Timed out")]
    TimedOut,

    /// Unexpected end of file from the name server
    #[error("End of file")]
    Eof,

    /// Descriptor could not be used
    #[error("Bad file descriptor")]
    BadDescriptor,

    /// Allocation failure
    #[error("Out of memory")]
    NoMemory,

    /// Operation cancelled or resolver destroyed
    #[error("Operation aborted")]
    OperationAborted,

    /// Malformed query
    #[error("Invalid argument")]
    InvalidArgument,
}

impl ResolveError {
    /// Whether the error is a teardown artifact that must not reach the caller
    pub fn is_aborted(&self) -> bool {
        matches!(self, ResolveError::OperationAborted)
    }
}

/// Whether `err` stems from a lookup aborted by resolver teardown
///
/// Such failures close the connection without being reported.
pub fn is_resolve_aborted(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        if let Some(resolve) = cause.downcast_ref::<ResolveError>() {
            return resolve.is_aborted();
        }
        cause
            .downcast_ref::<io::Error>()
            .and_then(|io| io.get_ref())
            .and_then(|inner| inner.downcast_ref::<ResolveError>())
            .is_some_and(|resolve| resolve.is_aborted())
    })
}

impl From<ResolveError> for io::Error {
    fn from(err: ResolveError) -> Self {
        let kind = match err {
            ResolveError::HostNotFound => io::ErrorKind::NotFound,
            ResolveError::ConnectionRefused => io::ErrorKind::ConnectionRefused,
            ResolveError::TimedOut => io::ErrorKind::TimedOut,
            ResolveError::Eof => io::ErrorKind::UnexpectedEof,
            ResolveError::BadDescriptor => io::ErrorKind::InvalidInput,
            ResolveError::NoMemory => io::ErrorKind::OutOfMemory,
            ResolveError::OperationAborted => io::ErrorKind::Interrupted,
            ResolveError::InvalidArgument => io::ErrorKind::InvalidInput,
        };
        io::Error::new(kind, err)
    }
}

impl From<CipherError> for io::Error {
    fn from(err: CipherError) -> Self {
        io::Error::new(io::ErrorKind::InvalidData, err)
    }
}

impl From<ProtocolError> for io::Error {
    fn from(err: ProtocolError) -> Self {
        io::Error::new(io::ErrorKind::InvalidData, err)
    }
}

/// Reply codes for SOCKS5 protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Socks5ReplyCode {
    /// Command succeeded
    Succeeded = 0x00,
    /// General SOCKS server failure
    GeneralFailure = 0x01,
    /// Connection not allowed by ruleset
    ConnectionNotAllowed = 0x02,
    /// Network unreachable
    NetworkUnreachable = 0x03,
    /// Host unreachable
    HostUnreachable = 0x04,
    /// Connection refused
    ConnectionRefused = 0x05,
    /// TTL expired
    TtlExpired = 0x06,
    /// Command not supported
    CommandNotSupported = 0x07,
    /// Address type not supported
    AddressTypeNotSupported = 0x08,
}

impl From<Socks5ReplyCode> for u8 {
    fn from(code: Socks5ReplyCode) -> Self {
        code as u8
    }
}

impl From<&io::Error> for Socks5ReplyCode {
    fn from(err: &io::Error) -> Self {
        if let Some(resolve) = err
            .get_ref()
            .and_then(|inner| inner.downcast_ref::<ResolveError>())
        {
            return Socks5ReplyCode::from(*resolve);
        }
        match err.kind() {
            io::ErrorKind::ConnectionRefused => Socks5ReplyCode::ConnectionRefused,
            io::ErrorKind::TimedOut => Socks5ReplyCode::HostUnreachable,
            io::ErrorKind::AddrNotAvailable => Socks5ReplyCode::HostUnreachable,
            io::ErrorKind::NotFound => Socks5ReplyCode::HostUnreachable,
            io::ErrorKind::PermissionDenied => Socks5ReplyCode::ConnectionNotAllowed,
            _ => Socks5ReplyCode::GeneralFailure,
        }
    }
}

impl From<ResolveError> for Socks5ReplyCode {
    fn from(err: ResolveError) -> Self {
        match err {
            ResolveError::HostNotFound | ResolveError::TimedOut => Socks5ReplyCode::HostUnreachable,
            ResolveError::ConnectionRefused => Socks5ReplyCode::ConnectionRefused,
            _ => Socks5ReplyCode::GeneralFailure,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_aborted_detection() {
        let aborted = anyhow::Error::from(io::Error::from(ResolveError::OperationAborted))
            .context("Failed to connect");
        assert!(is_resolve_aborted(&aborted));

        let direct = anyhow::Error::from(ResolveError::OperationAborted);
        assert!(is_resolve_aborted(&direct));

        let timed_out = anyhow::Error::from(io::Error::from(ResolveError::TimedOut))
            .context("Failed to connect");
        assert!(!is_resolve_aborted(&timed_out));
        assert!(!is_resolve_aborted(&anyhow::anyhow!("plain failure")));
    }

    #[test]
    fn test_socks5_reply_code_to_u8() {
        assert_eq!(u8::from(Socks5ReplyCode::Succeeded), 0x00);
        assert_eq!(u8::from(Socks5ReplyCode::GeneralFailure), 0x01);
        assert_eq!(u8::from(Socks5ReplyCode::HostUnreachable), 0x04);
        assert_eq!(u8::from(Socks5ReplyCode::ConnectionRefused), 0x05);
        assert_eq!(u8::from(Socks5ReplyCode::CommandNotSupported), 0x07);
        assert_eq!(u8::from(Socks5ReplyCode::AddressTypeNotSupported), 0x08);
    }

    #[test]
    fn test_socks5_reply_code_from_io_error() {
        let err = io::Error::new(io::ErrorKind::ConnectionRefused, "refused");
        assert_eq!(
            Socks5ReplyCode::from(&err),
            Socks5ReplyCode::ConnectionRefused
        );

        let err = io::Error::new(io::ErrorKind::TimedOut, "timeout");
        assert_eq!(
            Socks5ReplyCode::from(&err),
            Socks5ReplyCode::HostUnreachable
        );

        let err = io::Error::new(io::ErrorKind::Other, "other");
        assert_eq!(Socks5ReplyCode::from(&err), Socks5ReplyCode::GeneralFailure);
    }

    #[test]
    fn test_socks5_reply_code_from_wrapped_resolve_error() {
        let err: io::Error = ResolveError::HostNotFound.into();
        assert_eq!(
            Socks5ReplyCode::from(&err),
            Socks5ReplyCode::HostUnreachable
        );

        let err: io::Error = ResolveError::ConnectionRefused.into();
        assert_eq!(
            Socks5ReplyCode::from(&err),
            Socks5ReplyCode::ConnectionRefused
        );
    }

    #[test]
    fn test_protocol_error_display() {
        assert_eq!(ProtocolError::InvalidMethod.to_string(), "HPE_INVALID_METHOD");
        assert_eq!(ProtocolError::InvalidUrl.to_string(), "HPE_INVALID_URL");
        assert_eq!(
            ProtocolError::InvalidVersion.to_string(),
            "HPE_INVALID_VERSION"
        );
        assert_eq!(
            ProtocolError::InvalidPort("80x".to_string()).to_string(),
            "Invalid port: 80x"
        );
        assert_eq!(
            ProtocolError::UnsupportedVersion(4).to_string(),
            "Unsupported SOCKS version: 4"
        );
    }

    #[test]
    fn test_cipher_error_display() {
        let err = CipherError::InvalidKeyLength {
            expected: 32,
            actual: 16,
        };
        assert_eq!(err.to_string(), "Invalid key length: expected 32, got 16");
        assert_eq!(
            CipherError::DecryptFailed.to_string(),
            "Decryption failed: authentication tag mismatch"
        );
    }

    #[test]
    fn test_resolve_error_into_io() {
        let err: io::Error = ResolveError::TimedOut.into();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);

        let err: io::Error = ResolveError::HostNotFound.into();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
        assert_eq!(err.to_string(), "Host not found");
    }

    #[test]
    fn test_resolve_error_is_aborted() {
        assert!(ResolveError::OperationAborted.is_aborted());
        assert!(!ResolveError::TimedOut.is_aborted());
    }

    #[test]
    fn test_sockstun_error_from_variants() {
        let err: SockstunError = io::Error::new(io::ErrorKind::Other, "io").into();
        assert!(matches!(err, SockstunError::Io(_)));

        let err: SockstunError = ProtocolError::AuthFailed.into();
        assert_eq!(err.to_string(), "Protocol error: Authentication failed");

        let err: SockstunError = CipherError::NonceExhausted.into();
        assert_eq!(err.to_string(), "Cipher error: Nonce space exhausted");

        let err: SockstunError = ResolveError::TimedOut.into();
        assert_eq!(err.to_string(), "Resolve error: Timed out");

        let err = SockstunError::Config("bad".to_string());
        assert_eq!(err.to_string(), "Configuration error: bad");
    }
}
