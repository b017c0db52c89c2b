//! # Session Message Codec
//!
//! The eleven message kinds exchanged between lockstep peers, and their
//! compact wire form. The first byte packs the kind tag with the
//! originating side:
//!
//! ```text
//! +-----+-----+-----+-----+-----+-----+-----+-----+
//! | side (3 bits)   |        kind (5 bits)        |
//! +-----+-----+-----+-----+-----+-----+-----+-----+
//! ```
//!
//! `Frame` carries its tick number as 24 bits little-endian — at 60 ticks a
//! second that is a little over three days of session time. Every other
//! multi-byte integer is big-endian. Each kind has exactly one codec branch;
//! in particular `Data` carries nothing after its payload bytes and `Delay`
//! carries only the delay byte.
//!
//! The user's frame and state types ride through opaquely via their
//! [`Wire`] impls.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::net::{Ipv4Addr, SocketAddrV4};
use tandem_transport::{Endpoint, Wire};

/// Largest tick number representable on the wire (24 bits).
pub const MAX_FRAME_ID: u64 = (1 << 24) - 1;

/// Largest roster a session supports (one host + seven joiners).
pub const MAX_PLAYERS: usize = 8;

/// Longest username carried on the wire, in bytes.
pub const MAX_USERNAME_LEN: usize = 256;

// ─── Kind tags ──────────────────────────────────────────────────────────────

/// Wire tag of each message kind. Values are part of the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Kind {
    None = 0,
    Frame = 1,
    Data = 2,
    Ping = 3,
    Join = 4,
    Deny = 5,
    Info = 6,
    Wait = 7,
    Delay = 8,
    Ready = 9,
    EndSession = 10,
}

impl Kind {
    fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(Kind::None),
            1 => Some(Kind::Frame),
            2 => Some(Kind::Data),
            3 => Some(Kind::Ping),
            4 => Some(Kind::Join),
            5 => Some(Kind::Deny),
            6 => Some(Kind::Info),
            7 => Some(Kind::Wait),
            8 => Some(Kind::Delay),
            9 => Some(Kind::Ready),
            10 => Some(Kind::EndSession),
            _ => None,
        }
    }

    /// Fixed-width name for trace output.
    pub fn name(&self) -> &'static str {
        match self {
            Kind::None => "None  ",
            Kind::Frame => "Frame ",
            Kind::Data => "Data  ",
            Kind::Ping => "Ping  ",
            Kind::Join => "Join  ",
            Kind::Deny => "Deny  ",
            Kind::Info => "Info  ",
            Kind::Wait => "Wait  ",
            Kind::Delay => "Delay ",
            Kind::Ready => "Ready ",
            Kind::EndSession => "EndSn ",
        }
    }
}

// ─── Message ────────────────────────────────────────────────────────────────

/// One session-layer message, tagged with the side it originated from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message<F, S> {
    /// Originating side (0 = host). Three bits on the wire.
    pub side: u8,
    pub body: Body<F, S>,
}

/// Per-kind payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body<F, S> {
    /// Keepalive / ping response; no payload.
    None,
    /// One tick of input from `side`, stored at `frame_id`.
    Frame { frame_id: u64, frame: F },
    /// Out-of-band blob on the ordered side channel.
    Data { index: u64, data: Bytes },
    /// RTT priming probe.
    Ping,
    /// Joiner → host: request to enter the session.
    Join {
        state: S,
        host_ep: Endpoint,
        username: String,
    },
    /// Host → joiner: compatibility check rejected you.
    Deny { state: S },
    /// Host → joiner: full roster, your side, and the shared seed.
    Info {
        rand_seed: u32,
        assigned_side: u8,
        roster: Vec<(Endpoint, String)>,
        state: S,
    },
    /// Host → joiner: still collecting players.
    Wait { peers_needed: u8, peers_count: u8 },
    /// Negotiated (or re-announced) input delay in ticks.
    Delay { delay: u8 },
    /// Handshake completion echo.
    Ready,
    /// Request to wind the session down.
    EndSession,
}

impl<F, S> Message<F, S> {
    pub fn new(side: u8, body: Body<F, S>) -> Self {
        Message { side, body }
    }

    pub fn kind(&self) -> Kind {
        match &self.body {
            Body::None => Kind::None,
            Body::Frame { .. } => Kind::Frame,
            Body::Data { .. } => Kind::Data,
            Body::Ping => Kind::Ping,
            Body::Join { .. } => Kind::Join,
            Body::Deny { .. } => Kind::Deny,
            Body::Info { .. } => Kind::Info,
            Body::Wait { .. } => Kind::Wait,
            Body::Delay { .. } => Kind::Delay,
            Body::Ready => Kind::Ready,
            Body::EndSession => Kind::EndSession,
        }
    }

    /// Frame id for trace output; zero for kinds that carry none.
    pub fn trace_frame_id(&self) -> u64 {
        match &self.body {
            Body::Frame { frame_id, .. } => *frame_id,
            Body::Data { index, .. } => *index,
            _ => 0,
        }
    }
}

// ─── Field helpers ──────────────────────────────────────────────────────────

fn encode_endpoint(ep: &Endpoint, buf: &mut BytesMut) {
    buf.put_u32(u32::from(*ep.ip()));
    buf.put_u16(ep.port());
}

fn decode_endpoint(buf: &mut impl Buf) -> Option<Endpoint> {
    if buf.remaining() < 6 {
        return None;
    }
    let addr = Ipv4Addr::from(buf.get_u32());
    let port = buf.get_u16();
    Some(SocketAddrV4::new(addr, port))
}

fn encode_str(s: &str, buf: &mut BytesMut) {
    buf.put_u16(s.len() as u16);
    buf.extend_from_slice(s.as_bytes());
}

fn decode_str(buf: &mut impl Buf) -> Option<String> {
    if buf.remaining() < 2 {
        return None;
    }
    let len = buf.get_u16() as usize;
    if len > MAX_USERNAME_LEN || buf.remaining() < len {
        return None;
    }
    let raw = buf.copy_to_bytes(len);
    String::from_utf8(raw.to_vec()).ok()
}

// ─── Codec ──────────────────────────────────────────────────────────────────

impl<F: Wire, S: Wire> Wire for Message<F, S> {
    fn encode(&self, buf: &mut BytesMut) {
        let tag = (self.kind() as u8 & 0x1F) | ((self.side & 0x07) << 5);
        buf.put_u8(tag);

        match &self.body {
            Body::None | Body::Ping | Body::Ready | Body::EndSession => {}
            Body::Frame { frame_id, frame } => {
                buf.put_u8((frame_id & 0xFF) as u8);
                buf.put_u8(((frame_id >> 8) & 0xFF) as u8);
                buf.put_u8(((frame_id >> 16) & 0xFF) as u8);
                frame.encode(buf);
            }
            Body::Data { index, data } => {
                buf.put_i64(*index as i64);
                buf.put_u32(data.len() as u32);
                buf.extend_from_slice(data);
            }
            Body::Join {
                state,
                host_ep,
                username,
            } => {
                state.encode(buf);
                encode_endpoint(host_ep, buf);
                encode_str(username, buf);
            }
            Body::Deny { state } => {
                state.encode(buf);
            }
            Body::Info {
                rand_seed,
                assigned_side,
                roster,
                state,
            } => {
                buf.put_u32(*rand_seed);
                buf.put_u8(*assigned_side);
                buf.put_u8(roster.len() as u8);
                for (ep, username) in roster {
                    encode_endpoint(ep, buf);
                    encode_str(username, buf);
                }
                state.encode(buf);
            }
            Body::Wait {
                peers_needed,
                peers_count,
            } => {
                buf.put_u8(*peers_needed);
                buf.put_u8(*peers_count);
            }
            Body::Delay { delay } => {
                buf.put_u8(*delay);
            }
        }
    }

    fn decode(buf: &mut impl Buf) -> Option<Self> {
        if !buf.has_remaining() {
            return None;
        }
        let tag = buf.get_u8();
        let kind = Kind::from_byte(tag & 0x1F)?;
        let side = tag >> 5;

        let body = match kind {
            Kind::None => Body::None,
            Kind::Ping => Body::Ping,
            Kind::Ready => Body::Ready,
            Kind::EndSession => Body::EndSession,
            Kind::Frame => {
                if buf.remaining() < 3 {
                    return None;
                }
                // Widen before shifting so the 24-bit rebuild can never
                // sign-extend.
                let b0 = u64::from(buf.get_u8());
                let b1 = u64::from(buf.get_u8());
                let b2 = u64::from(buf.get_u8());
                let frame_id = b0 | (b1 << 8) | (b2 << 16);
                let frame = F::decode(buf)?;
                Body::Frame { frame_id, frame }
            }
            Kind::Data => {
                if buf.remaining() < 12 {
                    return None;
                }
                let index = buf.get_i64();
                if index < 0 {
                    return None;
                }
                let len = buf.get_u32() as usize;
                if buf.remaining() < len {
                    return None;
                }
                let data = buf.copy_to_bytes(len);
                Body::Data {
                    index: index as u64,
                    data,
                }
            }
            Kind::Join => {
                let state = S::decode(buf)?;
                let host_ep = decode_endpoint(buf)?;
                let username = decode_str(buf)?;
                Body::Join {
                    state,
                    host_ep,
                    username,
                }
            }
            Kind::Deny => {
                let state = S::decode(buf)?;
                Body::Deny { state }
            }
            Kind::Info => {
                if buf.remaining() < 6 {
                    return None;
                }
                let rand_seed = buf.get_u32();
                let assigned_side = buf.get_u8();
                let count = buf.get_u8() as usize;
                if count > MAX_PLAYERS {
                    return None;
                }
                let mut roster = Vec::with_capacity(count);
                for _ in 0..count {
                    let ep = decode_endpoint(buf)?;
                    let username = decode_str(buf)?;
                    roster.push((ep, username));
                }
                let state = S::decode(buf)?;
                Body::Info {
                    rand_seed,
                    assigned_side,
                    roster,
                    state,
                }
            }
            Kind::Wait => {
                if buf.remaining() < 2 {
                    return None;
                }
                Body::Wait {
                    peers_needed: buf.get_u8(),
                    peers_count: buf.get_u8(),
                }
            }
            Kind::Delay => {
                if !buf.has_remaining() {
                    return None;
                }
                Body::Delay {
                    delay: buf.get_u8(),
                }
            }
        };

        Some(Message { side, body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Msg = Message<Bytes, Bytes>;

    fn roundtrip(msg: &Msg) -> Msg {
        let mut buf = BytesMut::new();
        msg.encode(&mut buf);
        Msg::decode(&mut buf.freeze()).expect("roundtrip decode")
    }

    fn ep(port: u16) -> Endpoint {
        SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), port)
    }

    #[test]
    fn empty_kinds_roundtrip_on_every_side() {
        for side in 0..=7u8 {
            for body in [Body::None, Body::Ping, Body::Ready, Body::EndSession] {
                let msg = Msg::new(side, body);
                let decoded = roundtrip(&msg);
                assert_eq!(decoded, msg);
            }
        }
    }

    #[test]
    fn empty_kinds_encode_to_one_byte() {
        let msg = Msg::new(3, Body::Ready);
        let mut buf = BytesMut::new();
        msg.encode(&mut buf);
        assert_eq!(buf.len(), 1);
        assert_eq!(buf[0], (Kind::Ready as u8) | (3 << 5));
    }

    #[test]
    fn frame_roundtrip_at_24_bit_boundaries() {
        for frame_id in [0u64, 1, 0xFF, 0x100, 0xFFFF, 0x10000, MAX_FRAME_ID] {
            let msg = Msg::new(
                2,
                Body::Frame {
                    frame_id,
                    frame: Bytes::from_static(b"\x42"),
                },
            );
            let decoded = roundtrip(&msg);
            assert_eq!(decoded, msg, "frame_id {frame_id}");
        }
    }

    #[test]
    fn frame_id_is_little_endian_on_wire() {
        let msg = Msg::new(
            0,
            Body::Frame {
                frame_id: 0x0A0B0C,
                frame: Bytes::new(),
            },
        );
        let mut buf = BytesMut::new();
        msg.encode(&mut buf);
        assert_eq!(&buf[1..4], &[0x0C, 0x0B, 0x0A]);
    }

    #[test]
    fn data_roundtrip() {
        let msg = Msg::new(
            1,
            Body::Data {
                index: 77,
                data: Bytes::from_static(b"memory card block"),
            },
        );
        assert_eq!(roundtrip(&msg), msg);
    }

    #[test]
    fn data_carries_no_state() {
        // The layout is index + length + bytes, nothing after the payload.
        let payload = b"blob";
        let msg = Msg::new(
            1,
            Body::Data {
                index: 5,
                data: Bytes::from_static(payload),
            },
        );
        let mut buf = BytesMut::new();
        msg.encode(&mut buf);
        assert_eq!(buf.len(), 1 + 8 + 4 + payload.len());
    }

    #[test]
    fn delay_carries_only_the_delay_byte() {
        let msg = Msg::new(0, Body::Delay { delay: 4 });
        let mut buf = BytesMut::new();
        msg.encode(&mut buf);
        assert_eq!(buf.len(), 2);
        assert_eq!(roundtrip(&msg), msg);
    }

    #[test]
    fn join_roundtrip() {
        let msg = Msg::new(
            0,
            Body::Join {
                state: Bytes::from_static(b"v1.2+rom9f"),
                host_ep: ep(7000),
                username: "kestrel".to_string(),
            },
        );
        assert_eq!(roundtrip(&msg), msg);
    }

    #[test]
    fn join_with_empty_username() {
        let msg = Msg::new(
            0,
            Body::Join {
                state: Bytes::new(),
                host_ep: ep(7000),
                username: String::new(),
            },
        );
        assert_eq!(roundtrip(&msg), msg);
    }

    #[test]
    fn deny_roundtrip() {
        let msg = Msg::new(
            0,
            Body::Deny {
                state: Bytes::from_static(b"v1.3"),
            },
        );
        assert_eq!(roundtrip(&msg), msg);
    }

    #[test]
    fn info_roundtrip_full_roster() {
        let roster: Vec<(Endpoint, String)> = (0..MAX_PLAYERS)
            .map(|i| (ep(7000 + i as u16), format!("player-{i}")))
            .collect();
        let msg = Msg::new(
            0,
            Body::Info {
                rand_seed: 0xDEAD_BEEF,
                assigned_side: 5,
                roster,
                state: Bytes::from_static(b"v1.2"),
            },
        );
        assert_eq!(roundtrip(&msg), msg);
    }

    #[test]
    fn info_oversized_roster_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u8(Kind::Info as u8);
        buf.put_u32(1);
        buf.put_u8(0);
        buf.put_u8(MAX_PLAYERS as u8 + 1); // roster count over the cap
        assert!(Msg::decode(&mut buf.freeze()).is_none());
    }

    #[test]
    fn wait_roundtrip() {
        let msg = Msg::new(
            0,
            Body::Wait {
                peers_needed: 3,
                peers_count: 1,
            },
        );
        assert_eq!(roundtrip(&msg), msg);
    }

    #[test]
    fn unknown_kind_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u8(0x1F); // kind 31, side 0
        assert!(Msg::decode(&mut buf.freeze()).is_none());
    }

    #[test]
    fn truncated_frame_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u8(Kind::Frame as u8);
        buf.put_u8(0x01); // only one of three frame-id bytes
        assert!(Msg::decode(&mut buf.freeze()).is_none());
    }

    #[test]
    fn truncated_data_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u8(Kind::Data as u8);
        buf.put_i64(0);
        buf.put_u32(100); // claims 100 payload bytes, provides none
        assert!(Msg::decode(&mut buf.freeze()).is_none());
    }

    #[test]
    fn negative_data_index_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u8(Kind::Data as u8);
        buf.put_i64(-1);
        buf.put_u32(0);
        assert!(Msg::decode(&mut buf.freeze()).is_none());
    }
}
