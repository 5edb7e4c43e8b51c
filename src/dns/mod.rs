//! Asynchronous name resolution
//!
//! [`DnsEngine`] is a callback-driven resolver that never blocks;
//! [`AsyncResolver`] drives it from tokio readiness and timers.

pub mod engine;
pub mod resolver;

pub use engine::{AddressFamily, DnsEngine, EngineOptions, EngineStatus};
pub use resolver::{AsyncResolver, ResolverContext, ResolverSettings};
