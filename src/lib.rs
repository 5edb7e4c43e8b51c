//! # Sockstun - SOCKS5/HTTP proxy with an encrypted tunnel
//!
//! Sockstun runs in one of two roles. The **local** role accepts SOCKS5,
//! SOCKS4/4a and HTTP proxy requests from applications and forwards each
//! connection through an AEAD-framed, optionally TLS-wrapped tunnel. The
//! **server** role terminates the tunnel and connects to the real target.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use sockstun::config::load_config;
//! use sockstun::server::run_server;
//! use tokio::sync::broadcast;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config("config.toml")?;
//!     let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
//!
//!     run_server(config, shutdown_rx).await
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! Application -> local (SOCKS/HTTP) == tunnel ==> server -> Target
//! ```
//!
//! The tunnel is either a cipher stream whose first plaintext is the target
//! address, or, when TLS negotiates ALPN `http/1.1`, an HTTP CONNECT inside
//! TLS.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod config;
pub mod connection;
pub mod crypto;
pub mod dns;
pub mod error;
pub mod helper;
pub mod protocol;
pub mod server;
pub mod stats;
pub mod transport;

// Re-export commonly used items
pub use config::{load_config, Config};
pub use error::{SockstunError, Socks5ReplyCode};
pub use server::{run_server, ContentServer};

/// Version of the Sockstun library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Name of the application
pub const NAME: &str = env!("CARGO_PKG_NAME");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_name() {
        assert_eq!(NAME, "sockstun");
    }
}
