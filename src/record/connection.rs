//! Record connection: queued sends and accumulating receives over a backend

use super::{RecordCodec, RecordError, Role};
use crate::transport::Backend;
use bytes::{Buf, Bytes, BytesMut};
use mio::event::Source;
use std::io;
use tracing::{debug, trace, warn};

/// Read buffer size for backend reads
const READ_CHUNK: usize = 64 * 1024;

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordState {
    /// Sending and receiving
    Open,
    /// Closed by the application; queued bytes may still be flushed
    Closing,
    /// End-of-stream, fatal error, or backend closed
    Closed,
}

/// An encrypted record stream over one backend
pub struct RecordConnection<B: Backend> {
    backend: B,
    codec: RecordCodec,
    state: RecordState,
    /// Framed records not yet accepted by the backend
    send_buf: BytesMut,
    /// Bytes of a partially received record
    recv_buf: BytesMut,
}

impl<B: Backend> RecordConnection<B> {
    /// Create a record connection over a connected backend
    pub fn new(shared_key: &[u8], backend: B, role: Role) -> Result<Self, RecordError> {
        Ok(Self {
            backend,
            codec: RecordCodec::new(shared_key, role)?,
            state: RecordState::Open,
            send_buf: BytesMut::new(),
            recv_buf: BytesMut::with_capacity(READ_CHUNK),
        })
    }

    /// Current connection state
    pub fn state(&self) -> RecordState {
        self.state
    }

    /// Check if the connection accepts new records
    pub fn is_open(&self) -> bool {
        self.state == RecordState::Open
    }

    /// Queue one record carrying `data`; never blocks
    pub fn send(&mut self, data: &[u8]) -> Result<(), RecordError> {
        if self.state != RecordState::Open {
            return Err(RecordError::Closed);
        }
        self.codec.encode(data, &mut self.send_buf)?;
        trace!("Queued record: {} bytes plaintext, {} queued", data.len(), self.send_buf.len());
        Ok(())
    }

    /// Flush as much of the outbound queue as the backend accepts
    ///
    /// Would-block leaves the remainder queued; other transport errors
    /// propagate.
    pub fn continue_sending(&mut self) -> Result<(), RecordError> {
        while !self.send_buf.is_empty() {
            match self.backend.write(&self.send_buf) {
                Ok(0) => {
                    return Err(RecordError::Io(io::ErrorKind::WriteZero.into()));
                }
                Ok(n) => {
                    trace!("Backend accepted {} bytes", n);
                    self.send_buf.advance(n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Whether queued bytes are waiting for backend writability
    pub fn wants_write(&self) -> bool {
        !self.send_buf.is_empty() && self.state != RecordState::Closed
    }

    /// Number of queued outbound bytes
    pub fn pending_bytes(&self) -> usize {
        self.send_buf.len()
    }

    /// Read everything the backend has and return decrypted payloads in order
    ///
    /// Reads until the backend would block. End-of-stream yields
    /// `RecordError::Closed`, unless complete records arrived in the same
    /// call: those are returned first and the state is already `Closed`, so
    /// the next call reports it. A record failing authentication is fatal
    /// and also moves the connection to `Closed`.
    pub fn receive_packets(&mut self) -> Result<Vec<Bytes>, RecordError> {
        if self.state != RecordState::Open {
            return Err(RecordError::Closed);
        }

        let mut payloads = Vec::new();
        let mut chunk = vec![0u8; READ_CHUNK];
        loop {
            match self.backend.read(&mut chunk) {
                Ok(0) => {
                    debug!("Backend reached end of stream");
                    self.state = RecordState::Closed;
                    if !self.recv_buf.is_empty() {
                        warn!("Discarding {} bytes of a truncated record", self.recv_buf.len());
                    }
                    if payloads.is_empty() {
                        return Err(RecordError::Closed);
                    }
                    return Ok(payloads);
                }
                Ok(n) => {
                    trace!("Backend delivered {} bytes", n);
                    self.recv_buf.extend_from_slice(&chunk[..n]);
                    self.decode_records(&mut payloads)?;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.state = RecordState::Closed;
                    return Err(e.into());
                }
            }
        }

        Ok(payloads)
    }

    fn decode_records(&mut self, payloads: &mut Vec<Bytes>) -> Result<(), RecordError> {
        loop {
            match self.codec.decode(&mut self.recv_buf) {
                Ok(Some(payload)) => payloads.push(payload),
                Ok(None) => return Ok(()),
                Err(e) => {
                    warn!("Rejecting inbound record: {}", e);
                    self.state = RecordState::Closed;
                    return Err(e);
                }
            }
        }
    }

    /// Stop receiving and refuse new records; queued bytes stay flushable
    pub fn close(&mut self) {
        if self.state == RecordState::Open {
            debug!("Closing record connection, {} bytes still queued", self.send_buf.len());
            self.state = RecordState::Closing;
            if let Err(e) = self.backend.shutdown_read() {
                debug!("Backend read shutdown failed: {}", e);
            }
        }
    }

    /// Close the backend; anything still queued is dropped
    pub fn shutdown(&mut self) -> io::Result<()> {
        self.state = RecordState::Closed;
        if !self.send_buf.is_empty() {
            warn!("Dropping {} queued bytes on shutdown", self.send_buf.len());
            self.send_buf.clear();
        }
        self.backend.close()
    }

    /// Pollable handle of the backend
    pub fn source(&mut self) -> &mut dyn Source {
        self.backend.source()
    }

    /// Access the backend
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Mutable access to the backend
    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }
}
