//! # Datagram Wire Format
//!
//! Framing for every UDP datagram exchanged between two endpoints. The
//! transport speaks exactly two datagram shapes:
//!
//! ```text
//!  0                   1
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 ...
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-----------------------------+
//! |V=1|K|  rsvd   |  Ack (varint)  | Seq (varint) | message ... |  K=0 payload
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-----------------------------+
//! |V=1|K|  rsvd   |  Ack (varint)  |                               K=1 pure ACK
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! `Ack` is the highest contiguous sequence received from the destination
//! endpoint and rides on every datagram, so any traffic in one direction
//! acknowledges the other. `Seq` is endpoint-local and starts at 1; the
//! message bytes run to the end of the datagram, the codec above this layer
//! is responsible for their shape.

use bytes::{Buf, BufMut, Bytes, BytesMut};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Wire format version.
pub const PROTOCOL_VERSION: u8 = 1;

/// Smallest valid datagram: 1 flags byte + 1-byte ack varint.
pub const MIN_DATAGRAM_SIZE: usize = 2;

/// Largest datagram the transport will read from the socket.
pub const MAX_DATAGRAM_SIZE: usize = 65_535;

// ─── Message trait ───────────────────────────────────────────────────────────

/// A message the transport can carry.
///
/// The transport is generic over the message type; it only needs a symmetric
/// byte codec. `decode` must consume exactly the bytes `encode` produced and
/// return `None` on truncated or malformed input.
pub trait Wire: Sized + Clone + Send + 'static {
    fn encode(&self, buf: &mut BytesMut);
    fn decode(buf: &mut impl Buf) -> Option<Self>;
}

/// Opaque length-prefixed blob. Convenient for payloads the transport and
/// codec treat as a black box.
impl Wire for Bytes {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(self.len() as u32);
        buf.extend_from_slice(self);
    }

    fn decode(buf: &mut impl Buf) -> Option<Self> {
        if buf.remaining() < 4 {
            return None;
        }
        let len = buf.get_u32() as usize;
        if buf.remaining() < len {
            return None;
        }
        Some(buf.copy_to_bytes(len))
    }
}

// ─── Variable-length integers ───────────────────────────────────────────────

/// Largest value a wire varint can carry (62 usable bits).
pub const VARINT_MAX: u64 = (1 << 62) - 1;

/// Encoded width of `value` in bytes: 1, 2, 4, or 8.
///
/// Panics if `value` exceeds [`VARINT_MAX`]; sequence and ack counters stay
/// far below that for any realistic session.
pub fn varint_len(value: u64) -> usize {
    assert!(value <= VARINT_MAX, "varint overflow: {value}");
    if value < 1 << 6 {
        1
    } else if value < 1 << 14 {
        2
    } else if value < 1 << 30 {
        4
    } else {
        8
    }
}

/// Append `value` as a variable-length integer. The top two bits of the
/// first byte carry log2 of the width; the remaining bits hold the value in
/// network order.
pub fn put_varint(buf: &mut impl BufMut, value: u64) {
    match varint_len(value) {
        1 => buf.put_u8(value as u8),
        2 => buf.put_u16(value as u16 | 0x4000),
        4 => buf.put_u32(value as u32 | 0x8000_0000),
        _ => buf.put_u64(value | 0xC000_0000_0000_0000),
    }
}

/// Read one variable-length integer, or `None` when the buffer ends before
/// the width announced by the first byte.
pub fn get_varint(buf: &mut impl Buf) -> Option<u64> {
    if !buf.has_remaining() {
        return None;
    }
    let width = 1usize << (buf.chunk()[0] >> 6);
    if buf.remaining() < width {
        return None;
    }
    let value = match width {
        1 => u64::from(buf.get_u8()),
        2 => u64::from(buf.get_u16() & 0x3FFF),
        4 => u64::from(buf.get_u32() & 0x3FFF_FFFF),
        _ => buf.get_u64() & VARINT_MAX,
    };
    Some(value)
}

// ─── Datagram ───────────────────────────────────────────────────────────────

/// Whether the datagram carries a message or only an acknowledgment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DatagramKind {
    Payload = 0,
    Ack = 1,
}

/// One decoded UDP datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    /// Highest contiguous sequence received from the destination endpoint.
    pub ack: u64,
    /// Sequence number and message bytes; `None` for a pure ACK.
    pub payload: Option<(u64, Bytes)>,
}

impl Datagram {
    /// Build a payload datagram.
    pub fn payload(seq: u64, ack: u64, message: Bytes) -> Self {
        Datagram {
            ack,
            payload: Some((seq, message)),
        }
    }

    /// Build a pure ACK datagram.
    pub fn ack(ack: u64) -> Self {
        Datagram { ack, payload: None }
    }

    pub fn kind(&self) -> DatagramKind {
        if self.payload.is_some() {
            DatagramKind::Payload
        } else {
            DatagramKind::Ack
        }
    }

    /// Serialize into a freshly allocated buffer.
    pub fn encode(&self) -> Bytes {
        let body_len = self
            .payload
            .as_ref()
            .map(|(seq, msg)| varint_len(*seq) + msg.len())
            .unwrap_or(0);
        let mut buf = BytesMut::with_capacity(1 + varint_len(self.ack) + body_len);

        // Flags byte: VV K xxxxx
        let flags: u8 = ((PROTOCOL_VERSION & 0x03) << 6) | ((self.kind() as u8) << 5);
        buf.put_u8(flags);
        put_varint(&mut buf, self.ack);

        if let Some((seq, msg)) = &self.payload {
            put_varint(&mut buf, *seq);
            buf.extend_from_slice(msg);
        }
        buf.freeze()
    }

    /// Decode from raw datagram bytes. Returns `None` on truncation or
    /// version mismatch.
    pub fn decode(data: &mut impl Buf) -> Option<Self> {
        if data.remaining() < MIN_DATAGRAM_SIZE {
            return None;
        }

        let flags = data.get_u8();
        let version = (flags >> 6) & 0x03;
        if version != PROTOCOL_VERSION {
            return None;
        }
        let is_ack = (flags >> 5) & 1 == 1;

        let ack = get_varint(data)?;
        if is_ack {
            return Some(Datagram { ack, payload: None });
        }

        let seq = get_varint(data)?;
        let message = data.copy_to_bytes(data.remaining());
        Some(Datagram {
            ack,
            payload: Some((seq, message)),
        })
    }
}
