//! In-memory backend pair for unit tests

use super::Backend;
use mio::event::Source;
use mio::{Interest, Registry, Token};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::io;
use std::rc::Rc;

#[derive(Default)]
struct Pipe {
    buf: VecDeque<u8>,
    closed: bool,
}

/// One end of an in-memory duplex channel
pub(crate) struct MemoryBackend {
    inbound: Rc<RefCell<Pipe>>,
    outbound: Rc<RefCell<Pipe>>,
    /// Maximum bytes the outbound pipe holds before writes would block
    capacity: Option<usize>,
}

impl MemoryBackend {
    pub(crate) fn pair() -> (Self, Self) {
        let a = Rc::new(RefCell::new(Pipe::default()));
        let b = Rc::new(RefCell::new(Pipe::default()));
        (
            Self {
                inbound: Rc::clone(&a),
                outbound: Rc::clone(&b),
                capacity: None,
            },
            Self {
                inbound: b,
                outbound: a,
                capacity: None,
            },
        )
    }

    /// Limit how many unread bytes this end may have in flight
    pub(crate) fn set_capacity(&mut self, capacity: Option<usize>) {
        self.capacity = capacity;
    }

    /// Bytes written by this end that the peer has not read yet
    pub(crate) fn in_flight(&self) -> usize {
        self.outbound.borrow().buf.len()
    }
}

impl Backend for MemoryBackend {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut pipe = self.inbound.borrow_mut();
        if pipe.buf.is_empty() {
            return if pipe.closed {
                Ok(0)
            } else {
                Err(io::ErrorKind::WouldBlock.into())
            };
        }
        let n = buf.len().min(pipe.buf.len());
        for (dst, src) in buf.iter_mut().zip(pipe.buf.drain(..n)) {
            *dst = src;
        }
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut pipe = self.outbound.borrow_mut();
        if pipe.closed {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        let room = match self.capacity {
            Some(cap) => cap.saturating_sub(pipe.buf.len()),
            None => buf.len(),
        };
        let n = room.min(buf.len());
        if n == 0 && !buf.is_empty() {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        pipe.buf.extend(&buf[..n]);
        Ok(n)
    }

    fn source(&mut self) -> &mut dyn Source {
        self
    }

    fn close(&mut self) -> io::Result<()> {
        self.outbound.borrow_mut().closed = true;
        self.inbound.borrow_mut().closed = true;
        Ok(())
    }
}

impl Source for MemoryBackend {
    fn register(&mut self, _: &Registry, _: Token, _: Interest) -> io::Result<()> {
        Ok(())
    }

    fn reregister(&mut self, _: &Registry, _: Token, _: Interest) -> io::Result<()> {
        Ok(())
    }

    fn deregister(&mut self, _: &Registry) -> io::Result<()> {
        Ok(())
    }
}
