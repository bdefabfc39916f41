//! Backend transports
//!
//! A backend is the duplex byte channel that carries the encrypted record
//! stream. Every backend is non-blocking: reads and writes report
//! `ErrorKind::WouldBlock` instead of stalling, and each backend exposes a
//! mio source so the reactor can wait on it.
//!
//! Provided backends:
//! - TCP (plain socket)

mod tcp;

#[cfg(test)]
pub(crate) mod memory;

pub use tcp::TcpBackend;

use mio::event::Source;
use std::io;
use thiserror::Error;

/// Transport layer errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Cannot resolve {0}")]
    Resolve(String),
}

/// A non-blocking duplex byte channel
///
/// `read` follows `std::io::Read`: `Ok(0)` is end-of-stream and
/// `WouldBlock` means no data yet. `write` returns the number of bytes
/// accepted or `WouldBlock` when none were.
pub trait Backend {
    /// Read available bytes
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write as much of `buf` as the channel accepts right now
    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Pollable handle for readiness registration
    fn source(&mut self) -> &mut dyn Source;

    /// Stop receiving; pending outbound bytes may still be written
    fn shutdown_read(&mut self) -> io::Result<()> {
        Ok(())
    }

    /// Close the channel in both directions
    fn close(&mut self) -> io::Result<()>;
}

impl<B: Backend + ?Sized> Backend for Box<B> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        (**self).read(buf)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        (**self).write(buf)
    }

    fn source(&mut self) -> &mut dyn Source {
        (**self).source()
    }

    fn shutdown_read(&mut self) -> io::Result<()> {
        (**self).shutdown_read()
    }

    fn close(&mut self) -> io::Result<()> {
        (**self).close()
    }
}

/// Transport configuration
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Connection timeout in seconds
    pub connect_timeout: u64,
    /// Disable Nagle's algorithm
    pub nodelay: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: 10,
            nodelay: true,
        }
    }
}
