//! Stream multiplexer for the tunnel
//!
//! Manages multiple logical streams over a single record connection.

use super::{
    Control, Packet, PacketDecoder, ReclaimPolicy, StreamState, TunnelError, TunnelStream,
    MAX_PACKET_DATA,
};
use crate::record::{RecordConnection, RecordState, MAX_RECORD_PAYLOAD};
use crate::transport::Backend;
use bytes::{Bytes, BytesMut};
use mio::event::Source;
use std::collections::HashMap;
use std::time::Instant;
use tracing::{debug, trace};

/// Multiplexed tunnel over one record connection
pub struct TunnelConnection<B: Backend> {
    record: RecordConnection<B>,
    /// Next stream id; kept wider than u32 so exhaustion is detectable
    next_stream_id: u64,
    /// Streams whose id is still reserved
    streams: HashMap<u32, TunnelStream>,
    decoder: PacketDecoder,
    reclaim: ReclaimPolicy,
    max_record_payload: usize,
    unknown_packets: u64,
    encode_buf: BytesMut,
}

impl<B: Backend> TunnelConnection<B> {
    /// Create a tunnel over an established record connection
    pub fn new(record: RecordConnection<B>) -> Self {
        Self {
            record,
            next_stream_id: 1,
            streams: HashMap::new(),
            decoder: PacketDecoder::new(),
            reclaim: ReclaimPolicy::default(),
            max_record_payload: MAX_RECORD_PAYLOAD,
            unknown_packets: 0,
            encode_buf: BytesMut::new(),
        }
    }

    /// Set the reclamation policy for FIN'd stream ids
    pub fn with_reclaim_policy(mut self, reclaim: ReclaimPolicy) -> Self {
        self.reclaim = reclaim;
        self
    }

    /// Lower the plaintext size of outbound records
    pub fn with_max_record_payload(mut self, max: usize) -> Self {
        self.max_record_payload = max.clamp(1, MAX_RECORD_PAYLOAD);
        self
    }

    /// Whether new streams and data can be carried
    pub fn available(&self) -> bool {
        self.record.is_open()
    }

    /// Whether the record connection is gone for good
    pub fn is_closed(&self) -> bool {
        self.record.state() == RecordState::Closed
    }

    /// Allocate a fresh stream id
    pub fn new_connection(&mut self) -> Result<u32, TunnelError> {
        if !self.available() {
            return Err(TunnelError::Unavailable);
        }
        let stream_id =
            u32::try_from(self.next_stream_id).map_err(|_| TunnelError::StreamIdsExhausted)?;
        self.next_stream_id += 1;

        self.streams.insert(stream_id, TunnelStream::new(stream_id));
        debug!("Opened stream {}", stream_id);
        Ok(stream_id)
    }

    /// Send `data` on an open stream as one or more DAT packets
    pub fn send_packet(&mut self, stream_id: u32, data: &[u8]) -> Result<(), TunnelError> {
        self.check_can_send(stream_id)?;
        if data.is_empty() {
            return Ok(());
        }

        for chunk in data.chunks(MAX_PACKET_DATA) {
            Packet::data(stream_id, Bytes::copy_from_slice(chunk)).encode(&mut self.encode_buf)?;
        }
        trace!("Stream {}: sending {} bytes", stream_id, data.len());
        self.flush_encoded()
    }

    /// Send FIN for a stream
    pub fn close_connection(&mut self, stream_id: u32) -> Result<(), TunnelError> {
        self.check_can_send(stream_id)?;
        Packet::fin(stream_id).encode(&mut self.encode_buf)?;
        self.flush_encoded()?;

        let now = Instant::now();
        if let Some(stream) = self.streams.get_mut(&stream_id) {
            stream.close_local(now);
            if stream.is_closed() || self.reclaim == ReclaimPolicy::Immediate {
                self.streams.remove(&stream_id);
            }
        }
        debug!("Stream {}: FIN sent", stream_id);
        Ok(())
    }

    /// Send RST for a stream and forget it immediately
    ///
    /// Allowed for ids the tunnel no longer tracks, so a peer can be told
    /// to stop sending on a stream that is gone here.
    pub fn reset_connection(&mut self, stream_id: u32) -> Result<(), TunnelError> {
        self.streams.remove(&stream_id);
        Packet::rst(stream_id).encode(&mut self.encode_buf)?;
        self.flush_encoded()?;
        debug!("Stream {}: RST sent", stream_id);
        Ok(())
    }

    fn check_can_send(&self, stream_id: u32) -> Result<(), TunnelError> {
        if !self.available() {
            return Err(TunnelError::Unavailable);
        }
        match self.streams.get(&stream_id) {
            None => Err(TunnelError::StreamNotFound(stream_id)),
            Some(stream) if !stream.can_send() => Err(TunnelError::StreamClosed(stream_id)),
            Some(_) => Ok(()),
        }
    }

    /// Hand encoded packet bytes to the record layer in record-sized chunks
    fn flush_encoded(&mut self) -> Result<(), TunnelError> {
        let encoded = self.encode_buf.split();
        for chunk in encoded.chunks(self.max_record_payload) {
            self.record.send(chunk)?;
        }
        Ok(())
    }

    /// Decode every packet available from the record layer
    ///
    /// Packets for ids the tunnel does not track are still returned and
    /// counted; the caller decides what to do with them.
    pub fn receive_packets(&mut self) -> Result<Vec<Packet>, TunnelError> {
        let payloads = self.record.receive_packets()?;

        let mut packets = Vec::new();
        for payload in payloads {
            self.decoder.extend(&payload);
            while let Some(packet) = self.decoder.next_packet()? {
                self.track_inbound(&packet);
                packets.push(packet);
            }
        }
        Ok(packets)
    }

    fn track_inbound(&mut self, packet: &Packet) {
        let stream_id = packet.stream_id;
        let Some(stream) = self.streams.get_mut(&stream_id) else {
            self.unknown_packets += 1;
            trace!("Packet {:?} for untracked stream {}", packet.control, stream_id);
            return;
        };

        if packet.control.contains(Control::RST) {
            debug!("Stream {}: RST received", stream_id);
            self.streams.remove(&stream_id);
            return;
        }
        if packet.control.contains(Control::DAT) && !stream.can_recv() {
            debug!("Stream {}: data after remote FIN", stream_id);
        }
        if packet.control.contains(Control::FIN) {
            debug!("Stream {}: FIN received", stream_id);
            stream.close_remote();
            if stream.is_closed() {
                self.streams.remove(&stream_id);
            }
        }
    }

    /// Forget FIN'd streams whose reclamation timeout elapsed
    pub fn reap_expired(&mut self, now: Instant) -> usize {
        let ReclaimPolicy::After(timeout) = self.reclaim else {
            return 0;
        };

        let before = self.streams.len();
        self.streams.retain(|id, stream| {
            let expired = stream.state() == StreamState::HalfClosedLocal
                && stream
                    .fin_sent_at()
                    .is_some_and(|sent| now.saturating_duration_since(sent) >= timeout);
            if expired {
                trace!("Stream {}: reclaimed after FIN timeout", id);
            }
            !expired
        });
        before - self.streams.len()
    }

    /// State of a tracked stream
    pub fn stream_state(&self, stream_id: u32) -> Option<StreamState> {
        self.streams.get(&stream_id).map(|s| s.state())
    }

    /// Number of stream ids currently reserved
    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    /// Packets received for ids the tunnel did not track
    pub fn unknown_packets(&self) -> u64 {
        self.unknown_packets
    }

    /// Flush queued records
    pub fn continue_sending(&mut self) -> Result<(), TunnelError> {
        Ok(self.record.continue_sending()?)
    }

    /// Whether queued records are waiting for writability
    pub fn wants_write(&self) -> bool {
        self.record.wants_write()
    }

    /// Queued outbound bytes
    pub fn pending_bytes(&self) -> usize {
        self.record.pending_bytes()
    }

    /// Stop receiving and refuse new packets; queued records stay flushable
    pub fn close(&mut self) {
        self.record.close();
    }

    /// Close the backend
    pub fn shutdown(&mut self) -> std::io::Result<()> {
        self.record.shutdown()
    }

    /// Pollable handle of the backend
    pub fn source(&mut self) -> &mut dyn Source {
        self.record.source()
    }

    /// Access the record connection
    pub fn record(&self) -> &RecordConnection<B> {
        &self.record
    }

    /// Mutable access to the record connection
    pub fn record_mut(&mut self) -> &mut RecordConnection<B> {
        &mut self.record
    }
}
