//! # tandem-transport
//!
//! Reliable-ordered message delivery over a single UDP socket, for small
//! fixed groups of peers.
//!
//! Each remote endpoint gets an independent reliable stream: an ordered
//! outgoing queue with sequence numbers, an unacked retransmit buffer, a
//! cumulative piggybacked ACK, in-order duplicate-suppressing delivery, and
//! a smoothed RTT estimate. Artificial delay and loss injection are built in
//! for protocol tests.
//!
//! ## Crate structure
//!
//! - [`wire`] — datagram framing, varint helpers, the [`Wire`](wire::Wire) message trait
//! - [`peer`] — per-endpoint reliability state machine
//! - [`transport`] — socket ownership, I/O worker threads, the public API
//! - [`stats`] — per-peer statistics and the EWMA helper
//! - [`clock`] — monotonic millisecond clock

pub mod clock;
pub mod peer;
pub mod stats;
pub mod transport;
pub mod wire;

pub use clock::time_ms;
pub use peer::Endpoint;
pub use stats::PeerStats;
pub use transport::{AsyncTransport, TransportConfig, TransportError};
pub use wire::Wire;
