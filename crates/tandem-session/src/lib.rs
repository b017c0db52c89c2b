//! # tandem-session
//!
//! Peer-to-peer deterministic lockstep sessions for small groups (2–8
//! participants) over UDP: one designated host, joiners in a star around
//! it, a uniform input delay negotiated from measured round trips, and
//! per-tick input frames exchanged with reliable ordered semantics.
//!
//! The simulator drives the session with a simple loop:
//!
//! ```ignore
//! session.set(local_input)?;
//! for side in 0..session.endpoints().len() {
//!     let input = session.get(side, session.frame(), timeout)?;
//!     sim.apply(side, input);
//! }
//! session.next_frame();
//! ```
//!
//! Every peer's tick `n` consumes every peer's input for tick `n` before
//! advancing; the negotiated delay is what keeps the network round trip out
//! of the critical path.
//!
//! ## Crate structure
//!
//! - [`message`] — the eleven-kind session message codec
//! - [`session`] — handshake, frame/data tables, the public API
//! - [`config`] — tunable cadences and the host input-lead flag
//!
//! User types plug in through [`tandem_transport::Wire`]: an input `Frame`
//! type (with a `Default` neutral value) and an opaque `State` blob compared
//! by the compatibility check at join time.

pub mod config;
pub mod message;
pub mod session;

mod sync;
mod trace;

pub use config::SessionConfig;
pub use message::{Body, Kind, Message, MAX_FRAME_ID, MAX_PLAYERS};
pub use session::{Session, SessionError, SessionState, StateCheck};
pub use tandem_transport::{Endpoint, PeerStats, TransportConfig, Wire};
