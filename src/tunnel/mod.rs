//! Tunnel layer - stream multiplexing over the record layer
//!
//! Provides:
//! - Packet encoding/decoding
//! - Stream id allocation and lifecycle
//! - Packet reassembly across records

mod connection;
mod packet;
mod stream;

pub use connection::TunnelConnection;
pub use packet::{Control, Packet, PacketDecoder, MAX_PACKET_DATA, PACKET_HEADER_SIZE};
pub use stream::{StreamState, TunnelStream};

use crate::record::RecordError;
use std::time::Duration;
use thiserror::Error;

/// Tunnel layer errors
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("Packet too large: {0} > {1}")]
    PacketTooLarge(usize, usize),

    #[error("Invalid packet: {0}")]
    InvalidPacket(String),

    #[error("Stream not found: {0}")]
    StreamNotFound(u32),

    #[error("Stream closed: {0}")]
    StreamClosed(u32),

    #[error("Tunnel not available")]
    Unavailable,

    #[error("Stream ids exhausted")]
    StreamIdsExhausted,

    #[error("Record error: {0}")]
    Record(#[from] RecordError),
}

impl TunnelError {
    /// Whether the underlying record connection reached end-of-stream
    pub fn is_closed(&self) -> bool {
        matches!(self, TunnelError::Record(e) if e.is_closed())
    }

    /// Whether the error ends the whole tunnel rather than one stream
    pub fn is_fatal(&self) -> bool {
        matches!(self, TunnelError::Record(_) | TunnelError::InvalidPacket(_))
    }
}

/// When the id of a stream we sent FIN for stops being tracked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReclaimPolicy {
    /// Keep the id until the peer's FIN or RST arrives
    #[default]
    OnPeerClose,
    /// Forget the id as soon as our FIN is sent
    Immediate,
    /// Keep the id until the peer closes or the timeout elapses
    After(Duration),
}

impl ReclaimPolicy {
    /// Build from a `fin_timeout_secs` setting
    pub fn from_timeout(secs: Option<u64>) -> Self {
        match secs {
            None => ReclaimPolicy::OnPeerClose,
            Some(0) => ReclaimPolicy::Immediate,
            Some(n) => ReclaimPolicy::After(Duration::from_secs(n)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reclaim_policy_from_timeout() {
        assert_eq!(ReclaimPolicy::from_timeout(None), ReclaimPolicy::OnPeerClose);
        assert_eq!(ReclaimPolicy::from_timeout(Some(0)), ReclaimPolicy::Immediate);
        assert_eq!(
            ReclaimPolicy::from_timeout(Some(30)),
            ReclaimPolicy::After(Duration::from_secs(30))
        );
    }

    #[test]
    fn test_error_classification() {
        assert!(TunnelError::Record(RecordError::Closed).is_closed());
        assert!(TunnelError::Record(RecordError::Closed).is_fatal());
        assert!(TunnelError::InvalidPacket("x".into()).is_fatal());
        assert!(!TunnelError::StreamClosed(1).is_fatal());
    }
}
