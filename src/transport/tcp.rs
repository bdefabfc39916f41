//! Plain TCP backend

use super::{Backend, TransportConfig, TransportError};
use mio::event::Source;
use mio::net::TcpStream;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, ToSocketAddrs};
use std::time::Duration;
use tracing::{debug, info};

/// Raw TCP backend
pub struct TcpBackend {
    stream: TcpStream,
    peer: SocketAddr,
}

impl TcpBackend {
    /// Connect to `host:port`
    ///
    /// The connect itself blocks (bounded by the configured timeout) so the
    /// backend is fully established before the reactor starts; after that
    /// the socket is switched to non-blocking mode.
    pub fn connect(
        host: &str,
        port: u16,
        config: &TransportConfig,
    ) -> Result<Self, TransportError> {
        let timeout = Duration::from_secs(config.connect_timeout);
        let addrs: Vec<SocketAddr> = (host, port)
            .to_socket_addrs()
            .map_err(|_| TransportError::Resolve(format!("{}:{}", host, port)))?
            .collect();

        let mut last_err = None;
        for addr in addrs {
            debug!("Connecting backend to {}", addr);
            match std::net::TcpStream::connect_timeout(&addr, timeout) {
                Ok(stream) => {
                    if config.nodelay {
                        stream.set_nodelay(true).ok();
                    }
                    let backend = Self::from_std(stream)?;
                    info!("Backend connected to {}", backend.peer);
                    return Ok(backend);
                }
                Err(e) => last_err = Some(e),
            }
        }

        Err(match last_err {
            Some(e) => TransportError::ConnectionFailed(format!("{}:{}: {}", host, port, e)),
            None => TransportError::Resolve(format!("{}:{}", host, port)),
        })
    }

    /// Wrap an already connected std stream
    pub fn from_std(stream: std::net::TcpStream) -> Result<Self, TransportError> {
        let peer = stream.peer_addr()?;
        stream.set_nonblocking(true)?;
        Ok(Self {
            stream: TcpStream::from_std(stream),
            peer,
        })
    }

    /// Remote address of the backend connection
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }
}

impl Backend for TcpBackend {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.write(buf)
    }

    fn source(&mut self) -> &mut dyn Source {
        &mut self.stream
    }

    fn shutdown_read(&mut self) -> io::Result<()> {
        match self.stream.shutdown(Shutdown::Read) {
            Err(e) if e.kind() != io::ErrorKind::NotConnected => Err(e),
            _ => Ok(()),
        }
    }

    fn close(&mut self) -> io::Result<()> {
        match self.stream.shutdown(Shutdown::Both) {
            Err(e) if e.kind() != io::ErrorKind::NotConnected => Err(e),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn test_tcp_backend() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = std::thread::spawn(move || {
            let (mut socket, _) = listener.accept().unwrap();
            let mut buf = [0u8; 16];
            let n = socket.read(&mut buf).unwrap();
            socket.write_all(&buf[..n]).unwrap();
        });

        let mut backend =
            TcpBackend::connect("127.0.0.1", addr.port(), &TransportConfig::default()).unwrap();
        assert_eq!(backend.peer_addr(), addr);

        let mut sent = 0;
        while sent < 11 {
            match backend.write(&b"Hello, TCP!"[sent..]) {
                Ok(n) => sent += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => panic!("write failed: {}", e),
            }
        }
        server.join().unwrap();

        let mut received = Vec::new();
        let mut buf = [0u8; 16];
        loop {
            match backend.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => received.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(5))
                }
                Err(e) => panic!("read failed: {}", e),
            }
        }
        assert_eq!(received, b"Hello, TCP!");
        backend.close().unwrap();
    }

    #[test]
    fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let result = TcpBackend::connect("127.0.0.1", port, &TransportConfig::default());
        assert!(matches!(result, Err(TransportError::ConnectionFailed(_))));
    }
}
