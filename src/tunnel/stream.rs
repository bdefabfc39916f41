//! Per-stream bookkeeping

use std::time::Instant;

/// Stream state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Stream is open and active
    Open,
    /// Local side has sent FIN
    HalfClosedLocal,
    /// Remote side has sent FIN
    HalfClosedRemote,
    /// Both sides have sent FIN
    Closed,
}

/// A multiplexed stream within the tunnel
#[derive(Debug)]
pub struct TunnelStream {
    /// Stream ID
    id: u32,
    /// Current state
    state: StreamState,
    /// When our FIN went out (for timed reclamation)
    fin_sent_at: Option<Instant>,
}

impl TunnelStream {
    /// Create a new stream
    pub fn new(id: u32) -> Self {
        Self {
            id,
            state: StreamState::Open,
            fin_sent_at: None,
        }
    }

    /// Get stream ID
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Get current state
    pub fn state(&self) -> StreamState {
        self.state
    }

    /// Check if stream can send data
    pub fn can_send(&self) -> bool {
        matches!(self.state, StreamState::Open | StreamState::HalfClosedRemote)
    }

    /// Check if stream can receive data
    pub fn can_recv(&self) -> bool {
        matches!(self.state, StreamState::Open | StreamState::HalfClosedLocal)
    }

    /// Close local side
    pub fn close_local(&mut self, now: Instant) {
        self.fin_sent_at = Some(now);
        self.state = match self.state {
            StreamState::Open => StreamState::HalfClosedLocal,
            StreamState::HalfClosedRemote => StreamState::Closed,
            _ => self.state,
        };
    }

    /// Close remote side
    pub fn close_remote(&mut self) {
        self.state = match self.state {
            StreamState::Open => StreamState::HalfClosedRemote,
            StreamState::HalfClosedLocal => StreamState::Closed,
            _ => self.state,
        };
    }

    /// Check if stream is fully closed
    pub fn is_closed(&self) -> bool {
        self.state == StreamState::Closed
    }

    /// When the local FIN was sent
    pub fn fin_sent_at(&self) -> Option<Instant> {
        self.fin_sent_at
    }
}
