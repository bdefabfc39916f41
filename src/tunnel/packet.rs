//! Packet encoding/decoding for the tunnel protocol
//!
//! Packet format:
//! ```text
//! +--------+--------+--------+--------+
//! |          Stream ID (4B)           |
//! +--------+--------+--------+--------+
//! | Flags  |   Length (2B)   |
//! +--------+--------+--------+
//! |              Data               |
//! +--------+--------+--------+--------+
//! ```
//!
//! Packets are carried as a byte stream inside records, so one record may
//! hold several packets and one packet may span several records.

use super::TunnelError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;
use std::ops::BitOr;

/// Packet header size in bytes
pub const PACKET_HEADER_SIZE: usize = 7;

/// Maximum data carried by one packet
pub const MAX_PACKET_DATA: usize = u16::MAX as usize;

/// Control flags of a packet
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Control(u8);

impl Control {
    /// Carries stream data
    pub const DAT: Control = Control(0x01);
    /// Graceful close
    pub const FIN: Control = Control(0x02);
    /// Abortive reset
    pub const RST: Control = Control(0x04);

    const ALL: u8 = 0x07;

    /// Parse flag bits, rejecting unknown bits
    pub fn from_bits(bits: u8) -> Option<Self> {
        if bits & !Self::ALL == 0 {
            Some(Control(bits))
        } else {
            None
        }
    }

    /// Raw flag bits
    pub fn bits(self) -> u8 {
        self.0
    }

    /// Check whether all flags of `other` are set
    pub fn contains(self, other: Control) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for Control {
    type Output = Control;

    fn bitor(self, rhs: Control) -> Control {
        Control(self.0 | rhs.0)
    }
}

impl fmt::Debug for Control {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = [(Self::DAT, "DAT"), (Self::FIN, "FIN"), (Self::RST, "RST")]
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        if names.is_empty() {
            f.write_str("Control(empty)")
        } else {
            write!(f, "{}", names.join("|"))
        }
    }
}

/// A tunnel packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Stream the packet belongs to
    pub stream_id: u32,
    /// Control flags
    pub control: Control,
    /// Stream data (non-empty exactly when DAT is set)
    pub data: Bytes,
}

impl Packet {
    /// Create a data packet
    pub fn data(stream_id: u32, data: Bytes) -> Self {
        Self {
            stream_id,
            control: Control::DAT,
            data,
        }
    }

    /// Create a FIN packet
    pub fn fin(stream_id: u32) -> Self {
        Self {
            stream_id,
            control: Control::FIN,
            data: Bytes::new(),
        }
    }

    /// Create a RST packet
    pub fn rst(stream_id: u32) -> Self {
        Self {
            stream_id,
            control: Control::RST,
            data: Bytes::new(),
        }
    }

    /// Check the flag/length pairing
    pub fn validate(&self) -> Result<(), TunnelError> {
        validate(self.stream_id, self.control, self.data.len())
    }

    /// Encode packet to bytes
    pub fn encode(&self, dst: &mut BytesMut) -> Result<(), TunnelError> {
        self.validate()?;
        if self.data.len() > MAX_PACKET_DATA {
            return Err(TunnelError::PacketTooLarge(self.data.len(), MAX_PACKET_DATA));
        }

        dst.reserve(PACKET_HEADER_SIZE + self.data.len());
        dst.put_u32(self.stream_id);
        dst.put_u8(self.control.bits());
        dst.put_u16(self.data.len() as u16);
        dst.put_slice(&self.data);
        Ok(())
    }

    /// Decode one packet from the front of `src`
    ///
    /// Returns `Ok(None)` until the whole packet is buffered.
    pub fn decode(src: &mut BytesMut) -> Result<Option<Self>, TunnelError> {
        if src.len() < PACKET_HEADER_SIZE {
            return Ok(None);
        }

        let stream_id = u32::from_be_bytes([src[0], src[1], src[2], src[3]]);
        let control = Control::from_bits(src[4]).ok_or_else(|| {
            TunnelError::InvalidPacket(format!("unknown control bits {:#04x}", src[4]))
        })?;
        let len = u16::from_be_bytes([src[5], src[6]]) as usize;
        validate(stream_id, control, len)?;

        if src.len() < PACKET_HEADER_SIZE + len {
            return Ok(None);
        }

        src.advance(PACKET_HEADER_SIZE);
        let data = src.split_to(len).freeze();

        Ok(Some(Self {
            stream_id,
            control,
            data,
        }))
    }

    /// Get the total encoded size of this packet
    pub fn encoded_size(&self) -> usize {
        PACKET_HEADER_SIZE + self.data.len()
    }
}

fn validate(stream_id: u32, control: Control, len: usize) -> Result<(), TunnelError> {
    if control.is_empty() {
        return Err(TunnelError::InvalidPacket(format!(
            "stream {}: no control flags",
            stream_id
        )));
    }
    let dat = control.contains(Control::DAT);
    if dat && len == 0 {
        return Err(TunnelError::InvalidPacket(format!(
            "stream {}: DAT without data",
            stream_id
        )));
    }
    if !dat && len != 0 {
        return Err(TunnelError::InvalidPacket(format!(
            "stream {}: {:?} carrying {} bytes",
            stream_id, control, len
        )));
    }
    Ok(())
}

/// Reassembles packets from record payloads
#[derive(Debug, Default)]
pub struct PacketDecoder {
    buf: BytesMut,
}

impl PacketDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one record payload
    pub fn extend(&mut self, payload: &[u8]) {
        self.buf.extend_from_slice(payload);
    }

    /// Next complete packet, if any
    pub fn next_packet(&mut self) -> Result<Option<Packet>, TunnelError> {
        Packet::decode(&mut self.buf)
    }

    /// Bytes of an incomplete packet
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}
