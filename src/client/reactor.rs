//! Single-threaded readiness loop of the client
//!
//! The reactor runs `RUNNING -> DRAINING -> STOPPED`. While running it moves
//! bytes between accepted local sockets and the tunnel; on the shutdown
//! flag it stops accepting, closes every local connection and keeps
//! flushing the tunnel until no encrypted byte is left queued.

use super::{
    ConnectionTable, LocalConnection, Pollable, ReadOutcome, Readiness, UnknownStreamPolicy,
    DEFAULT_CHUNK_SIZE, HIGH_WATER_MARK,
};
use crate::config::{BackendConfig, ClientConfig};
use crate::record::{RecordConnection, Role};
use crate::transport::{Backend, TcpBackend, TransportConfig};
use crate::tunnel::{Control, Packet, ReclaimPolicy, TunnelConnection, TunnelError};
use crate::{Error, Result};
use mio::event::Source;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Registry, Token};
use socket2::{Domain, Protocol, Socket, Type};
use std::collections::HashSet;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

const TUNNEL: Token = Token(0);
const LISTENER: Token = Token(1);
/// Local connection tokens are `FIRST_LOCAL + stream_id`
const FIRST_LOCAL: usize = 2;

/// Upper bound of one readiness wait, so the shutdown flag is seen promptly
const MAX_WAIT: Duration = Duration::from_millis(250);

const LISTEN_BACKLOG: i32 = 128;

fn local_token(stream_id: u32) -> Token {
    Token(FIRST_LOCAL + stream_id as usize)
}

fn stream_of(token: Token) -> Option<u32> {
    token
        .0
        .checked_sub(FIRST_LOCAL)
        .and_then(|id| u32::try_from(id).ok())
}

/// How a run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Shutdown was requested and the tunnel drained
    Shutdown,
    /// The backend reached end-of-stream
    TunnelClosed,
}

impl Outcome {
    /// Process exit status for this outcome
    pub fn exit_code(self) -> u8 {
        match self {
            Outcome::Shutdown => 0,
            Outcome::TunnelClosed => 1,
        }
    }
}

/// Counters kept by the reactor
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReactorStats {
    /// Local connections accepted and paired with a stream
    pub accepted: u64,
    /// Inbound packets for streams without a local connection
    pub ignored_packets: u64,
    /// Local connections torn down abortively
    pub resets: u64,
}

/// Tunables of the reactor
#[derive(Debug, Clone)]
pub struct ReactorOptions {
    /// Maximum bytes read from a local socket at once
    pub chunk_size: usize,
    /// Handling of packets for unknown streams
    pub unknown_streams: UnknownStreamPolicy,
    /// Reclamation of stream ids after our FIN
    pub reclaim: ReclaimPolicy,
}

impl Default for ReactorOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            unknown_streams: UnknownStreamPolicy::default(),
            reclaim: ReclaimPolicy::default(),
        }
    }
}

struct Tunnel<B: Backend> {
    conn: TunnelConnection<B>,
    ready: Readiness,
}

impl<B: Backend> Pollable for Tunnel<B> {
    fn source(&mut self) -> &mut dyn Source {
        self.conn.source()
    }

    fn wants_read(&self) -> bool {
        self.conn.available()
    }

    fn wants_write(&self) -> bool {
        self.conn.wants_write()
    }

    fn readiness(&mut self) -> &mut Readiness {
        &mut self.ready
    }
}

struct Listener {
    socket: TcpListener,
    ready: Readiness,
}

impl Pollable for Listener {
    fn source(&mut self) -> &mut dyn Source {
        &mut self.socket
    }

    fn wants_read(&self) -> bool {
        true
    }

    fn wants_write(&self) -> bool {
        false
    }

    fn readiness(&mut self) -> &mut Readiness {
        &mut self.ready
    }
}

fn bind_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    socket.set_nonblocking(true)?;
    Ok(TcpListener::from_std(socket.into()))
}

/// First IPv4 address for `host`, else whatever it resolves to first
fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    let addrs: Vec<SocketAddr> = (host, port).to_socket_addrs()?.collect();
    addrs
        .iter()
        .find(|addr| addr.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| Error::Config(format!("cannot resolve {}:{}", host, port)))
}

fn deregister(registry: &Registry, source: &mut dyn Source) {
    if let Err(e) = registry.deregister(source) {
        trace!("Deregister failed: {}", e);
    }
}

/// The client event loop
pub struct Reactor<B: Backend> {
    poll: Poll,
    events: Events,
    tunnel: Tunnel<B>,
    listener: Option<Listener>,
    local_addr: SocketAddr,
    locals: ConnectionTable<LocalConnection>,
    options: ReactorOptions,
    shutdown: Arc<AtomicBool>,
    /// Unknown streams answered with RST and not yet closed by the peer
    reset_sent: HashSet<u32>,
    stats: ReactorStats,
}

impl Reactor<TcpBackend> {
    /// Connect the configured backend and bind the local listener
    pub fn connect(config: &ClientConfig, shutdown: Arc<AtomicBool>) -> Result<Self> {
        let backend = match &config.backend {
            BackendConfig::Tcp {
                server,
                port,
                connect_timeout_secs,
            } => {
                let transport = TransportConfig {
                    connect_timeout: *connect_timeout_secs,
                    ..TransportConfig::default()
                };
                TcpBackend::connect(server, *port, &transport)?
            }
        };

        let listen = resolve(&config.address, config.port)?;
        Self::with_backend(
            listen,
            config.key.as_bytes(),
            backend,
            config.reactor_options(),
            shutdown,
        )
    }
}

impl<B: Backend> Reactor<B> {
    /// Build a reactor over an already connected backend
    pub fn with_backend(
        listen: SocketAddr,
        key: &[u8],
        backend: B,
        options: ReactorOptions,
        shutdown: Arc<AtomicBool>,
    ) -> Result<Self> {
        let record = RecordConnection::new(key, backend, Role::Client)?;
        let mut tunnel = Tunnel {
            conn: TunnelConnection::new(record).with_reclaim_policy(options.reclaim),
            ready: Readiness::assume_ready(),
        };

        let poll = Poll::new()?;
        poll.registry().register(
            tunnel.source(),
            TUNNEL,
            Interest::READABLE | Interest::WRITABLE,
        )?;

        let mut listener = Listener {
            socket: bind_listener(listen)?,
            ready: Readiness::assume_ready(),
        };
        let local_addr = listener.socket.local_addr()?;
        poll.registry()
            .register(listener.source(), LISTENER, Interest::READABLE)?;

        Ok(Self {
            poll,
            events: Events::with_capacity(1024),
            tunnel,
            listener: Some(listener),
            local_addr,
            locals: ConnectionTable::new(),
            options,
            shutdown,
            reset_sent: HashSet::new(),
            stats: ReactorStats::default(),
        })
    }

    /// Address the local listener is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stats(&self) -> ReactorStats {
        self.stats
    }

    /// Number of live local connections
    pub fn connection_count(&self) -> usize {
        self.locals.len()
    }

    pub fn tunnel(&self) -> &TunnelConnection<B> {
        &self.tunnel.conn
    }

    /// Run until shutdown is requested or the tunnel ends
    pub fn run(&mut self) -> Result<Outcome> {
        info!("Listening on {}", self.local_addr);

        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                self.drain()?;
                return Ok(Outcome::Shutdown);
            }

            self.wait()?;

            if let Err(e) = self.step() {
                return self.fail(e);
            }

            if self.tunnel.conn.is_closed() {
                info!("Backend closed the tunnel");
                self.abort_locals();
                self.release_tunnel();
                return Ok(Outcome::TunnelClosed);
            }
        }
    }

    fn can_read_locals(&self) -> bool {
        self.tunnel.conn.available() && self.tunnel.conn.pending_bytes() <= HIGH_WATER_MARK
    }

    fn any_actionable(&mut self) -> bool {
        if self.tunnel.actionable() {
            return true;
        }
        if let Some(listener) = self.listener.as_mut() {
            if listener.actionable() {
                return true;
            }
        }
        let read_locals = self.can_read_locals();
        self.locals.iter_mut().any(|(_, local)| {
            let ready = *local.readiness();
            (ready.readable && read_locals && local.wants_read())
                || (ready.writable && local.wants_write())
        })
    }

    /// Wait for readiness and fold events into the cached flags
    fn wait(&mut self) -> Result<()> {
        let timeout = if self.any_actionable() {
            Duration::ZERO
        } else {
            MAX_WAIT
        };

        match self.poll.poll(&mut self.events, Some(timeout)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(e.into()),
        }

        for event in self.events.iter() {
            match event.token() {
                TUNNEL => self.tunnel.ready.update(event),
                LISTENER => {
                    if let Some(listener) = self.listener.as_mut() {
                        listener.ready.update(event);
                    }
                }
                token => match stream_of(token).and_then(|id| self.locals.get_mut(id)) {
                    Some(local) => local.readiness().update(event),
                    None => trace!("Event for stale token {:?}", token),
                },
            }
        }
        Ok(())
    }

    /// One pass over every entity
    fn step(&mut self) -> std::result::Result<(), TunnelError> {
        if self.tunnel.ready.readable && self.tunnel.wants_read() {
            self.process_tunnel()?;
        }
        self.accept_one();
        self.process_locals()?;
        self.flush_all()?;
        let reclaimed = self.tunnel.conn.reap_expired(Instant::now());
        if reclaimed > 0 {
            debug!("Reclaimed {} stream ids", reclaimed);
        }
        Ok(())
    }

    fn process_tunnel(&mut self) -> std::result::Result<(), TunnelError> {
        let packets = self.tunnel.conn.receive_packets()?;
        self.tunnel.ready.readable = false;
        for packet in packets {
            self.dispatch(packet)?;
        }
        Ok(())
    }

    fn dispatch(&mut self, packet: Packet) -> std::result::Result<(), TunnelError> {
        let id = packet.stream_id;
        if !self.locals.contains(id) {
            return self.unknown_stream(&packet);
        }

        if packet.control.contains(Control::RST) {
            debug!("Stream {}: reset by peer", id);
            self.reset_local(id);
            return Ok(());
        }
        if packet.control.contains(Control::DAT) {
            let sent = match self.locals.get_mut(id) {
                Some(local) => local.send(&packet.data),
                None => Ok(()),
            };
            if let Err(e) = sent {
                debug!("Stream {}: local write failed: {}", id, e);
                return self.abort_stream(id);
            }
        }
        if packet.control.contains(Control::FIN) {
            if let Some(local) = self.locals.get_mut(id) {
                local.close_after_flush();
            }
        }
        Ok(())
    }

    fn unknown_stream(&mut self, packet: &Packet) -> std::result::Result<(), TunnelError> {
        let id = packet.stream_id;
        self.stats.ignored_packets += 1;
        match self.options.unknown_streams {
            UnknownStreamPolicy::Drop => {
                trace!("Dropping {:?} for unknown stream {}", packet.control, id);
            }
            UnknownStreamPolicy::Log => {
                warn!("Ignoring {:?} for unknown stream {}", packet.control, id);
            }
            UnknownStreamPolicy::Reset => {
                let data = packet.control.contains(Control::DAT)
                    && !packet.control.contains(Control::RST);
                if data && self.reset_sent.insert(id) {
                    debug!("Resetting unknown stream {}", id);
                    self.tunnel.conn.reset_connection(id)?;
                }
            }
        }
        if packet.control.contains(Control::FIN) || packet.control.contains(Control::RST) {
            self.reset_sent.remove(&id);
        }
        Ok(())
    }

    fn accept_one(&mut self) {
        let Some(listener) = self.listener.as_mut() else {
            return;
        };
        if !listener.ready.readable {
            return;
        }

        match listener.socket.accept() {
            Ok((stream, addr)) => self.open_stream(stream, addr),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => listener.ready.readable = false,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                warn!("Accept failed: {}", e);
                listener.ready.readable = false;
            }
        }
    }

    fn open_stream(&mut self, stream: TcpStream, addr: SocketAddr) {
        if !self.tunnel.conn.available() {
            debug!("Tunnel unavailable, dropping connection from {}", addr);
            return;
        }
        let id = match self.tunnel.conn.new_connection() {
            Ok(id) => id,
            Err(e) => {
                warn!("Cannot open a stream for {}: {}", addr, e);
                return;
            }
        };

        let mut local = LocalConnection::new(stream, id);
        if let Err(e) = self.poll.registry().register(
            local.source(),
            local_token(id),
            Interest::READABLE | Interest::WRITABLE,
        ) {
            warn!("Cannot register connection from {}: {}", addr, e);
            if let Err(e) = self.tunnel.conn.reset_connection(id) {
                debug!("Stream {}: {}", id, e);
            }
            return;
        }

        if self.locals.insert(id, local).is_none() {
            self.stats.accepted += 1;
            debug!("Accepted {} as stream {}", addr, id);
        }
    }

    fn process_locals(&mut self) -> std::result::Result<(), TunnelError> {
        let chunk_size = self.options.chunk_size;
        for id in self.locals.ids() {
            if !self.can_read_locals() {
                break;
            }
            let Some(local) = self.locals.get_mut(id) else {
                continue;
            };
            if !(local.readiness().readable && local.wants_read()) {
                continue;
            }
            let outcome = local.read_chunk(chunk_size);

            match outcome {
                ReadOutcome::WouldBlock => {}
                ReadOutcome::Data(data) => {
                    if let Err(e) = self.tunnel.conn.send_packet(id, &data) {
                        if e.is_fatal() {
                            return Err(e);
                        }
                        debug!("Stream {}: {}", id, e);
                        self.abort_stream(id)?;
                    }
                }
                ReadOutcome::Eof => {
                    debug!("Stream {}: local end closed", id);
                    self.finish_stream(id)?;
                }
                ReadOutcome::Reset(e) => {
                    debug!("Stream {}: local end failed: {}", id, e);
                    self.abort_stream(id)?;
                }
            }
        }
        Ok(())
    }

    /// Flush the tunnel and every local connection, each at most once
    fn flush_all(&mut self) -> std::result::Result<(), TunnelError> {
        if self.tunnel.ready.writable && self.tunnel.conn.wants_write() {
            self.tunnel.conn.continue_sending()?;
            if self.tunnel.conn.wants_write() {
                self.tunnel.ready.writable = false;
            }
        }

        for id in self.locals.ids() {
            let (flushed, should_close) = match self.locals.get_mut(id) {
                Some(local) => {
                    let flushed = if local.readiness().writable && local.wants_write() {
                        local.flush()
                    } else {
                        Ok(())
                    };
                    (flushed, local.should_close())
                }
                None => continue,
            };

            if let Err(e) = flushed {
                debug!("Stream {}: local write failed: {}", id, e);
                self.abort_stream(id)?;
            } else if should_close {
                self.finish_stream(id)?;
            }
        }
        Ok(())
    }

    /// Orderly end of a stream: FIN upstream and close the local socket
    fn finish_stream(&mut self, id: u32) -> std::result::Result<(), TunnelError> {
        match self.tunnel.conn.close_connection(id) {
            Ok(()) => {}
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => debug!("Stream {}: {}", id, e),
        }
        if let Some(mut local) = self.locals.remove(id) {
            deregister(self.poll.registry(), local.source());
            local.close();
        }
        Ok(())
    }

    /// Abortive end of a stream: RST upstream and reset the local socket
    fn abort_stream(&mut self, id: u32) -> std::result::Result<(), TunnelError> {
        match self.tunnel.conn.reset_connection(id) {
            Ok(()) => {}
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => debug!("Stream {}: {}", id, e),
        }
        self.reset_local(id);
        Ok(())
    }

    fn reset_local(&mut self, id: u32) {
        if let Some(mut local) = self.locals.remove(id) {
            deregister(self.poll.registry(), local.source());
            local.reset();
            self.stats.resets += 1;
        }
    }

    fn close_listener(&mut self) {
        if let Some(mut listener) = self.listener.take() {
            deregister(self.poll.registry(), listener.source());
            debug!("Listener closed");
        }
    }

    /// Reset every local connection; the tunnel cannot carry their close
    fn abort_locals(&mut self) {
        self.close_listener();
        let locals = self.locals.drain();
        if !locals.is_empty() {
            info!("Resetting {} local connections", locals.len());
        }
        for (_, mut local) in locals {
            deregister(self.poll.registry(), local.source());
            local.reset();
            self.stats.resets += 1;
        }
    }

    fn release_tunnel(&mut self) {
        deregister(self.poll.registry(), self.tunnel.source());
        if let Err(e) = self.tunnel.conn.shutdown() {
            debug!("Backend close failed: {}", e);
        }
    }

    /// Tear down after a fatal tunnel error
    fn fail(&mut self, e: TunnelError) -> Result<Outcome> {
        self.abort_locals();

        if e.is_closed() {
            info!("Backend closed the tunnel");
            self.release_tunnel();
            return Ok(Outcome::TunnelClosed);
        }

        error!("Tunnel failed: {}", e);
        self.tunnel.conn.close();
        if let Err(e) = self.tunnel.conn.continue_sending() {
            debug!("Final flush failed: {}", e);
        }
        self.release_tunnel();
        Err(e.into())
    }

    /// Close everything local and flush the tunnel before closing the backend
    fn drain(&mut self) -> Result<()> {
        info!(
            "Shutting down: {} local connections, {} bytes queued",
            self.locals.len(),
            self.tunnel.conn.pending_bytes()
        );

        self.close_listener();
        for (_, mut local) in self.locals.drain() {
            deregister(self.poll.registry(), local.source());
            local.close();
        }
        self.tunnel.conn.close();

        while self.tunnel.conn.wants_write() {
            if self.tunnel.ready.writable {
                if let Err(e) = self.tunnel.conn.continue_sending() {
                    warn!("Drain stopped: {}", e);
                    break;
                }
                if self.tunnel.conn.wants_write() {
                    self.tunnel.ready.writable = false;
                }
                continue;
            }

            match self.poll.poll(&mut self.events, Some(MAX_WAIT)) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
            for event in self.events.iter() {
                if event.token() == TUNNEL {
                    self.tunnel.ready.update(event);
                }
            }
        }

        self.release_tunnel();
        info!("Tunnel drained");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::RecordCodec;
    use crate::transport::memory::MemoryBackend;
    use crate::tunnel::PacketDecoder;
    use bytes::{Bytes, BytesMut};
    use std::io::{Read, Write};

    const KEY: &[u8] = b"reactor test key";

    /// Server half of the tunnel, driven by hand
    struct Peer {
        backend: MemoryBackend,
        codec: RecordCodec,
        decoder: PacketDecoder,
        inbound: BytesMut,
    }

    impl Peer {
        fn send(&mut self, packet: Packet) {
            let mut wire = BytesMut::new();
            packet.encode(&mut wire).unwrap();
            let mut record = BytesMut::new();
            self.codec.encode(&wire, &mut record).unwrap();
            assert_eq!(self.backend.write(&record).unwrap(), record.len());
        }

        fn packets(&mut self) -> Vec<Packet> {
            let mut buf = [0u8; 4096];
            while let Ok(n) = self.backend.read(&mut buf) {
                if n == 0 {
                    break;
                }
                self.inbound.extend_from_slice(&buf[..n]);
            }
            while let Some(payload) = self.codec.decode(&mut self.inbound).unwrap() {
                self.decoder.extend(&payload);
            }
            let mut packets = Vec::new();
            while let Some(packet) = self.decoder.next_packet().unwrap() {
                packets.push(packet);
            }
            packets
        }
    }

    fn setup(options: ReactorOptions) -> (Reactor<MemoryBackend>, Peer, Arc<AtomicBool>) {
        let (client, server) = MemoryBackend::pair();
        let shutdown = Arc::new(AtomicBool::new(false));
        let reactor = Reactor::with_backend(
            "127.0.0.1:0".parse().unwrap(),
            KEY,
            client,
            options,
            Arc::clone(&shutdown),
        )
        .unwrap();
        let peer = Peer {
            backend: server,
            codec: RecordCodec::new(KEY, Role::Server).unwrap(),
            decoder: PacketDecoder::new(),
            inbound: BytesMut::new(),
        };
        (reactor, peer, shutdown)
    }

    /// The memory backend raises no poll events, so its readiness is forced
    fn force_tunnel_ready(reactor: &mut Reactor<MemoryBackend>) {
        reactor.tunnel.ready = Readiness::assume_ready();
    }

    fn spin(reactor: &mut Reactor<MemoryBackend>, rounds: usize) {
        for _ in 0..rounds {
            force_tunnel_ready(reactor);
            reactor.wait().unwrap();
            reactor.step().unwrap();
        }
    }

    fn connect(reactor: &mut Reactor<MemoryBackend>) -> std::net::TcpStream {
        let before = reactor.stats().accepted;
        let stream = std::net::TcpStream::connect(reactor.local_addr()).unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        for _ in 0..100 {
            spin(reactor, 1);
            if reactor.stats().accepted > before {
                return stream;
            }
        }
        panic!("connection was not accepted");
    }

    #[test]
    fn test_token_mapping() {
        assert_eq!(local_token(1), Token(3));
        assert_eq!(stream_of(local_token(42)), Some(42));
        assert_eq!(stream_of(TUNNEL), None);
        assert_eq!(stream_of(LISTENER), None);
    }

    #[test]
    fn test_outcome_exit_codes() {
        assert_eq!(Outcome::Shutdown.exit_code(), 0);
        assert_eq!(Outcome::TunnelClosed.exit_code(), 1);
    }

    #[test]
    fn test_local_data_becomes_dat_packet() {
        let (mut reactor, mut peer, _) = setup(ReactorOptions::default());
        let mut local = connect(&mut reactor);
        local.write_all(b"GET / HTTP/1.0\r\n\r\n").unwrap();

        let mut packets = Vec::new();
        for _ in 0..100 {
            spin(&mut reactor, 1);
            packets.extend(peer.packets());
            if !packets.is_empty() {
                break;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        assert_eq!(
            packets,
            vec![Packet::data(1, Bytes::from_static(b"GET / HTTP/1.0\r\n\r\n"))]
        );
    }

    #[test]
    fn test_peer_data_and_fin_reach_local() {
        let (mut reactor, mut peer, _) = setup(ReactorOptions::default());
        let mut local = connect(&mut reactor);

        peer.send(Packet::data(1, Bytes::from_static(b"HTTP/1.0 200 OK\r\n\r\n")));
        peer.send(Packet::fin(1));
        spin(&mut reactor, 3);

        let mut received = Vec::new();
        local.read_to_end(&mut received).unwrap();
        assert_eq!(received, b"HTTP/1.0 200 OK\r\n\r\n");
        assert_eq!(reactor.connection_count(), 0);
        assert_eq!(peer.packets(), vec![Packet::fin(1)]);
    }

    #[test]
    fn test_unknown_stream_reset_once() {
        let options = ReactorOptions {
            unknown_streams: UnknownStreamPolicy::Reset,
            ..ReactorOptions::default()
        };
        let (mut reactor, mut peer, _) = setup(options);
        peer.send(Packet::data(9, Bytes::from_static(b"a")));
        peer.send(Packet::data(9, Bytes::from_static(b"b")));
        peer.send(Packet::fin(9));
        spin(&mut reactor, 2);

        assert_eq!(reactor.stats().ignored_packets, 3);
        assert_eq!(peer.packets(), vec![Packet::rst(9)]);
        assert!(reactor.reset_sent.is_empty());
    }

    #[test]
    fn test_reset_memory_released_when_peer_closes() {
        let options = ReactorOptions {
            unknown_streams: UnknownStreamPolicy::Reset,
            ..ReactorOptions::default()
        };
        let (mut reactor, mut peer, _) = setup(options);
        for id in 10..20 {
            peer.send(Packet::data(id, Bytes::from_static(b"stray")));
        }
        spin(&mut reactor, 2);
        assert_eq!(reactor.reset_sent.len(), 10);
        assert_eq!(peer.packets().len(), 10);

        for id in 10..15 {
            peer.send(Packet::rst(id));
        }
        for id in 15..20 {
            peer.send(Packet::fin(id));
        }
        spin(&mut reactor, 2);
        assert!(reactor.reset_sent.is_empty());
        assert!(peer.packets().is_empty());
        assert_eq!(reactor.stats().ignored_packets, 20);
    }

    #[test]
    fn test_peer_reset_discards_unsent_data() {
        let (mut reactor, mut peer, _) = setup(ReactorOptions::default());
        let mut local = connect(&mut reactor);

        // Far more than the local socket buffers hold; nothing reads yet
        let chunk = Bytes::from(vec![0x5au8; 60_000]);
        let sent = 400 * chunk.len();
        for _ in 0..400 {
            peer.send(Packet::data(1, chunk.clone()));
        }
        peer.send(Packet::rst(1));
        spin(&mut reactor, 3);
        assert_eq!(reactor.connection_count(), 0);
        assert_eq!(reactor.stats().resets, 1);

        let mut received = 0;
        let mut buf = vec![0u8; 64 * 1024];
        let end = loop {
            match local.read(&mut buf) {
                Ok(0) => break None,
                Ok(n) => received += n,
                Err(e) => break Some(e.kind()),
            }
        };
        assert_eq!(end, Some(std::io::ErrorKind::ConnectionReset));
        assert!(received < sent);
    }

    #[test]
    fn test_resolve_prefers_ipv4() {
        let addr = resolve("localhost", 8000).unwrap();
        assert!(addr.is_ipv4());
        assert_eq!(addr.port(), 8000);
        let v6: SocketAddr = "[::1]:80".parse().unwrap();
        assert_eq!(resolve("::1", 80).unwrap(), v6);
    }

    #[test]
    fn test_unknown_stream_dropped_by_default() {
        let (mut reactor, mut peer, _) = setup(ReactorOptions::default());
        peer.send(Packet::data(5, Bytes::from_static(b"stray")));
        spin(&mut reactor, 2);

        assert_eq!(reactor.stats().ignored_packets, 1);
        assert!(peer.packets().is_empty());
    }

    #[test]
    fn test_backend_eof_resets_locals() {
        let (mut reactor, mut peer, _) = setup(ReactorOptions::default());
        let _a = connect(&mut reactor);
        let _b = connect(&mut reactor);

        peer.backend.close().unwrap();
        force_tunnel_ready(&mut reactor);
        assert_eq!(reactor.run().unwrap(), Outcome::TunnelClosed);
        assert_eq!(reactor.stats().resets, 2);
        assert_eq!(reactor.connection_count(), 0);
    }

    #[test]
    fn test_shutdown_drains_queue() {
        let (mut reactor, mut peer, shutdown) = setup(ReactorOptions::default());
        let mut local = connect(&mut reactor);
        reactor.tunnel.conn.record_mut().backend_mut().set_capacity(Some(64));

        let payload = vec![7u8; 20_000];
        local.write_all(&payload).unwrap();
        for _ in 0..100 {
            spin(&mut reactor, 1);
            if reactor.tunnel().pending_bytes() > 0 {
                break;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        assert!(reactor.tunnel().pending_bytes() > 0);

        // Reopen the pipe and let the drain loop flush everything
        reactor.tunnel.conn.record_mut().backend_mut().set_capacity(None);
        force_tunnel_ready(&mut reactor);
        shutdown.store(true, Ordering::SeqCst);
        assert_eq!(reactor.run().unwrap(), Outcome::Shutdown);
        assert_eq!(reactor.tunnel().pending_bytes(), 0);

        let received: Vec<u8> = peer
            .packets()
            .into_iter()
            .flat_map(|p| p.data.to_vec())
            .collect();
        assert!(!received.is_empty());
        assert!(payload.starts_with(&received));
    }
}
