//! A single-threaded SOCKS5 proxy
//!
//! ## SOCKS5 Implementation
//!
//! - Features:
//!     - CONNECT to IPv4 literals and domain names
//!     - No Authentication
//!     - Domain names resolved out-of-band over one persistent UDP socket
//!       to an upstream recursive resolver
//!     - One task multiplexing every socket by readiness, no per-client tasks
//!     - Per-connection write queues with read throttling when a peer backs up
//!     - Optional DNS and idle timeouts
//! - [SOCKS5 (RFC 1928)](https://datatracker.ietf.org/doc/html/rfc1928)
//!
//! # Example
//! ```no_run
//! use minisocks::Socks5Server;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut server = Socks5Server::new("0.0.0.0:1080").with_dns("8.8.8.8:53");
//!     server.run().await
//! }
//! ```

pub mod address;
pub mod auth;
pub mod commands;
pub mod dns;
pub mod error;
pub mod protocol;
pub mod server;
pub mod session;
pub mod state;

// Re-export main types at crate root for convenience
pub use address::Destination;
pub use error::{DecodeError, DnsError, SessionError};
pub use protocol::{AuthMethod, Command, ReplyCode, Version};
pub use server::Socks5Server;
