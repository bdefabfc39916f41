//! Relay to a fixed upstream server

use crate::client::{Pollable, Readiness};
use bytes::{Buf, Bytes, BytesMut};
use mio::event::Source;
use mio::net::TcpStream;
use serde::{Deserialize, Serialize};
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};
use tracing::{debug, trace};

const RECV_CHUNK: usize = 4096;

/// Upstream address of a redirect
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedirectConfig {
    #[serde(default = "default_server")]
    pub server: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_server() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    80
}

impl Default for RedirectConfig {
    fn default() -> Self {
        Self {
            server: default_server(),
            port: default_port(),
        }
    }
}

/// Non-blocking connection to the redirect upstream with buffered output
pub struct RedirectUpstream {
    stream: TcpStream,
    peer: SocketAddr,
    send_buf: BytesMut,
    ready: Readiness,
}

impl RedirectUpstream {
    /// Connect to the upstream; the connect itself blocks
    pub fn connect(config: &RedirectConfig) -> io::Result<Self> {
        let stream = std::net::TcpStream::connect((config.server.as_str(), config.port))?;
        let peer = stream.peer_addr()?;
        stream.set_nonblocking(true)?;
        debug!("Redirect upstream connected to {}", peer);
        Ok(Self {
            stream: TcpStream::from_std(stream),
            peer,
            send_buf: BytesMut::new(),
            ready: Readiness::assume_ready(),
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Queue `data` and flush; `true` once nothing is left buffered
    pub fn send(&mut self, data: &[u8]) -> io::Result<bool> {
        self.send_buf.extend_from_slice(data);
        while !self.send_buf.is_empty() {
            match self.stream.write(&self.send_buf) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => self.send_buf.advance(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.ready.writable = false;
                    break;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        trace!("Redirect: {} bytes still buffered", self.send_buf.len());
        Ok(self.send_buf.is_empty())
    }

    /// Read what the upstream sent; `None` once it closed
    ///
    /// Nothing available yet is reported as `ErrorKind::WouldBlock`.
    pub fn recv(&mut self) -> io::Result<Option<Bytes>> {
        let mut buf = vec![0u8; RECV_CHUNK];
        loop {
            match self.stream.read(&mut buf) {
                Ok(0) => return Ok(None),
                Ok(n) => {
                    buf.truncate(n);
                    return Ok(Some(Bytes::from(buf)));
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    if e.kind() == io::ErrorKind::WouldBlock {
                        self.ready.readable = false;
                    }
                    return Err(e);
                }
            }
        }
    }

    pub fn close(&mut self) {
        if let Err(e) = self.stream.shutdown(Shutdown::Both) {
            trace!("Redirect shutdown: {}", e);
        }
    }
}

impl Pollable for RedirectUpstream {
    fn source(&mut self) -> &mut dyn Source {
        &mut self.stream
    }

    fn wants_read(&self) -> bool {
        true
    }

    fn wants_write(&self) -> bool {
        !self.send_buf.is_empty()
    }

    fn readiness(&mut self) -> &mut Readiness {
        &mut self.ready
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;
    use std::time::Duration;

    fn recv_blocking(upstream: &mut RedirectUpstream) -> Option<Bytes> {
        for _ in 0..500 {
            match upstream.recv() {
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(5))
                }
                other => return other.unwrap(),
            }
        }
        panic!("upstream never answered");
    }

    #[test]
    fn test_default_upstream() {
        let config: RedirectConfig = toml::from_str("").unwrap();
        assert_eq!(config, RedirectConfig::default());
        assert_eq!(config.server, "localhost");
        assert_eq!(config.port, 80);
    }

    #[test]
    fn test_relay_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            let mut buf = [0u8; 5];
            conn.read_exact(&mut buf).unwrap();
            conn.write_all(&buf).unwrap();
        });

        let mut upstream = RedirectUpstream::connect(&RedirectConfig {
            server: "127.0.0.1".into(),
            port,
        })
        .unwrap();
        assert_eq!(upstream.peer_addr().port(), port);
        assert!(upstream.send(b"hello").unwrap());
        assert!(!upstream.wants_write());

        assert_eq!(recv_blocking(&mut upstream), Some(Bytes::from_static(b"hello")));
        server.join().unwrap();
        assert_eq!(recv_blocking(&mut upstream), None);
        upstream.close();
    }

    #[test]
    fn test_nothing_to_read_would_block() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut upstream = RedirectUpstream::connect(&RedirectConfig {
            server: "127.0.0.1".into(),
            port,
        })
        .unwrap();

        let err = upstream.recv().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
        assert!(!upstream.readiness().readable);
        drop(listener);
    }
}
