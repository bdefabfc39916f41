//! Wrapper around one accepted local socket

use super::{Pollable, Readiness};
use bytes::{Buf, Bytes, BytesMut};
use mio::event::Source;
use mio::net::TcpStream;
use socket2::SockRef;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::time::Duration;
use tracing::{debug, trace};

/// Result of one bounded read from a local socket
#[derive(Debug)]
pub enum ReadOutcome {
    /// Bytes to forward
    Data(Bytes),
    /// Orderly end-of-stream from the local peer
    Eof,
    /// Nothing available right now
    WouldBlock,
    /// The socket failed; treated as an abortive close
    Reset(io::Error),
}

/// One local TCP connection paired with a tunnel stream
pub struct LocalConnection {
    stream: TcpStream,
    stream_id: u32,
    peer: Option<SocketAddr>,
    /// Bytes received from the tunnel not yet written to the socket
    out_buf: BytesMut,
    /// Close once `out_buf` drains (peer sent FIN)
    close_after_flush: bool,
    ready: Readiness,
}

impl LocalConnection {
    pub fn new(stream: TcpStream, stream_id: u32) -> Self {
        let peer = stream.peer_addr().ok();
        Self {
            stream,
            stream_id,
            peer,
            out_buf: BytesMut::new(),
            close_after_flush: false,
            ready: Readiness::assume_ready(),
        }
    }

    pub fn stream_id(&self) -> u32 {
        self.stream_id
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Queue `data` and write as much as the socket takes
    pub fn send(&mut self, data: &[u8]) -> io::Result<()> {
        self.out_buf.extend_from_slice(data);
        self.flush()
    }

    /// Write buffered output until done or the socket would block
    pub fn flush(&mut self) -> io::Result<()> {
        while !self.out_buf.is_empty() {
            match self.stream.write(&self.out_buf) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    trace!("Local {}: wrote {} bytes", self.stream_id, n);
                    self.out_buf.advance(n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.ready.writable = false;
                    break;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Read at most `max` bytes
    pub fn read_chunk(&mut self, max: usize) -> ReadOutcome {
        let mut buf = vec![0u8; max];
        loop {
            return match self.stream.read(&mut buf) {
                Ok(0) => ReadOutcome::Eof,
                Ok(n) => {
                    buf.truncate(n);
                    ReadOutcome::Data(Bytes::from(buf))
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.ready.readable = false;
                    ReadOutcome::WouldBlock
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => ReadOutcome::Reset(e),
            };
        }
    }

    /// Close once all buffered output is written
    pub fn close_after_flush(&mut self) {
        self.close_after_flush = true;
    }

    /// Whether the connection is due for its orderly close
    pub fn should_close(&self) -> bool {
        self.close_after_flush && self.out_buf.is_empty()
    }

    /// Bytes waiting to be written
    pub fn pending_bytes(&self) -> usize {
        self.out_buf.len()
    }

    /// Orderly shutdown of both directions
    pub fn close(&mut self) {
        debug!("Local {}: closing", self.stream_id);
        if let Err(e) = self.stream.shutdown(Shutdown::Both) {
            if e.kind() != io::ErrorKind::NotConnected {
                debug!("Local {}: shutdown failed: {}", self.stream_id, e);
            }
        }
    }

    /// Abortive close: discard buffered output and send RST on drop
    pub fn reset(&mut self) {
        debug!(
            "Local {}: reset, discarding {} bytes",
            self.stream_id,
            self.out_buf.len()
        );
        self.out_buf.clear();
        if let Err(e) = SockRef::from(&self.stream).set_linger(Some(Duration::ZERO)) {
            debug!("Local {}: cannot set linger: {}", self.stream_id, e);
        }
    }
}

impl Pollable for LocalConnection {
    fn source(&mut self) -> &mut dyn Source {
        &mut self.stream
    }

    fn wants_read(&self) -> bool {
        !self.close_after_flush
    }

    fn wants_write(&self) -> bool {
        !self.out_buf.is_empty()
    }

    fn readiness(&mut self) -> &mut Readiness {
        &mut self.ready
    }
}
