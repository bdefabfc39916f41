//! Record layer - encrypted framing over a backend
//!
//! Record format:
//! ```text
//! +--------+--------+----------------------------+
//! |  Length (2B BE) |  Ciphertext || Tag (16B)  |
//! +--------+--------+----------------------------+
//! ```
//!
//! The length counts ciphertext plus tag and doubles as the AEAD associated
//! data, so a record whose header was altered fails authentication.

mod codec;
mod connection;

pub use codec::RecordCodec;
pub use connection::{RecordConnection, RecordState};

use crate::crypto::{CryptoError, TAG_LEN};
use thiserror::Error;

/// Record header size in bytes
pub const RECORD_HEADER_LEN: usize = 2;

/// Maximum ciphertext (including tag) carried by one record
pub const MAX_RECORD_LEN: usize = u16::MAX as usize;

/// Maximum plaintext carried by one record
pub const MAX_RECORD_PAYLOAD: usize = MAX_RECORD_LEN - TAG_LEN;

/// Which end of the tunnel this record stream belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// Record layer errors
#[derive(Debug, Error)]
pub enum RecordError {
    #[error("Connection closed")]
    Closed,

    #[error("Record too large: {0} > {1}")]
    TooLarge(usize, usize),

    #[error("Malformed record: {0}")]
    Malformed(String),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RecordError {
    /// Whether this is the orderly end-of-stream condition
    pub fn is_closed(&self) -> bool {
        matches!(self, RecordError::Closed)
    }
}
