//! # usocks
//!
//! An encrypted, multiplexed local tunnel client. Every TCP connection
//! accepted on a local port is forwarded as its own stream through one
//! shared, encrypted connection to a remote peer.
//!
//! ## Features
//!
//! - **Authenticated encryption** with ChaCha20-Poly1305 and keys derived
//!   from a pre-shared secret
//! - **Stream multiplexing** with graceful (FIN) and abortive (RST) closes
//! - **Single-threaded reactor** on mio with backpressure and clean draining
//! - **Pluggable backends** behind a small non-blocking trait
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                  Client Reactor                      │
//! │      (listener, local connections, readiness)        │
//! ├─────────────────────────────────────────────────────┤
//! │                   Tunnel Layer                       │
//! │        (stream ids, DAT/FIN/RST packets)             │
//! ├─────────────────────────────────────────────────────┤
//! │                   Record Layer                       │
//! │     (length framing, encryption, authentication)     │
//! ├─────────────────────────────────────────────────────┤
//! │                  Backend Transport                   │
//! │                 (TCP, pluggable)                     │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod client;
pub mod config;
pub mod crypto;
pub mod frontend;
pub mod record;
pub mod transport;
pub mod tunnel;

pub use config::Config;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Crypto error: {0}")]
    Crypto(#[from] crypto::CryptoError),

    #[error("Transport error: {0}")]
    Transport(#[from] transport::TransportError),

    #[error("Record error: {0}")]
    Record(#[from] record::RecordError),

    #[error("Tunnel error: {0}")]
    Tunnel(#[from] tunnel::TunnelError),

    #[error("Configuration error: {0}")]
    Config(String),
}
