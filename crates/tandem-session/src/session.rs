//! # Lockstep Session
//!
//! The top-level session object: one reliable UDP transport, per-side frame
//! and data tables, the connection handshake, and the negotiated input
//! delay. The session state machine is:
//!
//! ```text
//!   host:   Idle ──create──▶ Waiting ──Info sent──▶ Pinging ──delays in──▶ Ready
//!   joiner: Idle ──join────▶ Waiting ──Info──▶ Accepted ──Delay──▶ Ready
//!                                   └──Deny──▶ Denied (terminal)
//! ```
//!
//! Traffic is a star: joiners talk only to the host, the host echoes joiner
//! traffic to every other joiner. Sequence numbers are per-endpoint, so each
//! echoed stream is independently reliable.
//!
//! ## Locking
//!
//! Two mutexes, acquired in a fixed order: the handshake lock (join
//! bookkeeping, roster assembly) before the steady lock (tables, counters,
//! negotiated delay). The transport's receive callbacks hold a weak
//! reference to the session internals; the transport is stopped before the
//! session is dropped.

use bytes::Bytes;
use quanta::Instant;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;
use thiserror::Error;

use tandem_transport::{time_ms, AsyncTransport, Endpoint, PeerStats, TransportError, Wire};

use crate::config::SessionConfig;
use crate::message::{Body, Message, MAX_PLAYERS, MAX_USERNAME_LEN};
use crate::sync::Semaphore;
use crate::trace::WireTrace;

// ─── Errors ─────────────────────────────────────────────────────────────────

/// Session-level failures.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The call requires a connected session (or the session was shut down
    /// under a blocked caller).
    #[error("session is not connected")]
    InvalidState,
    /// The compatibility check rejected the two parties' states.
    #[error("peer state rejected by compatibility check")]
    StateMismatch,
    /// The handshake did not reach `Ready` within the caller's timeout.
    #[error("handshake timed out")]
    HandshakeTimeout,
    /// A frame did not arrive in time. Benign; retry or roll back.
    #[error("timed out waiting for a frame")]
    GetTimeout,
    /// A data blob did not arrive in time. Benign.
    #[error("timed out waiting for a data blob")]
    GetDataTimeout,
    #[error(transparent)]
    Transport(#[from] TransportError),
}

// ─── Session state ──────────────────────────────────────────────────────────

/// Where the session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Not connected.
    Idle,
    /// Handshake started, roster not settled.
    Waiting,
    /// Host only: roster announced, collecting delay proposals.
    Pinging,
    /// Joiner only: roster received, negotiating delay.
    Accepted,
    /// Compatibility check failed. Terminal for this attempt.
    Denied,
    /// Delay agreed; lockstep traffic may flow.
    Ready,
}

/// Compatibility predicate over the user's opaque state blobs.
pub type StateCheck<S> = Arc<dyn Fn(&S, &S) -> bool + Send + Sync>;

// Receive dispatch modes. The transport callback is installed once at bind
// and routes on the current mode, which avoids swapping handlers mid-flight.
const MODE_IDLE: u8 = 0;
const MODE_HOST: u8 = 1;
const MODE_JOINER: u8 = 2;
const MODE_STEADY: u8 = 3;

/// Delay rule: one tick per 32 ms of round trip, never less than one tick.
fn delay_for_rtt(rtt_ms: u64) -> u8 {
    (rtt_ms / 32 + 1).clamp(1, 255) as u8
}

// ─── Shared state ───────────────────────────────────────────────────────────

/// Steady-state variables, guarded by one mutex together with the frame and
/// data condvars.
struct Steady<F> {
    state: SessionState,
    side: u8,
    delay: u64,
    frame: u64,
    /// Roster, self included at index `side`; index 0 is the host.
    eps: Vec<Endpoint>,
    usernames: HashMap<Endpoint, String>,
    frame_table: Vec<HashMap<u64, F>>,
    data_table: Vec<HashMap<u64, Bytes>>,
    /// Next outgoing blob index.
    data_out: u64,
    /// Next blob index to consume, per side.
    data_in: Vec<u64>,
    first_received: Option<u64>,
    last_received: Option<u64>,
    end_session_request: bool,
    random_seed: u32,
}

impl<F: Clone> Steady<F> {
    fn new() -> Self {
        Steady {
            state: SessionState::Idle,
            side: 0,
            delay: 0,
            frame: 0,
            eps: Vec::new(),
            usernames: HashMap::new(),
            frame_table: Vec::new(),
            data_table: Vec::new(),
            data_out: 0,
            data_in: Vec::new(),
            first_received: None,
            last_received: None,
            end_session_request: false,
            random_seed: 0,
        }
    }

    fn clear(&mut self) {
        *self = Steady::new();
    }

    /// Size the per-side tables to the roster. Idempotent: tables already
    /// holding early-arriving frames are left alone.
    fn size_tables(&mut self) {
        let n = self.eps.len();
        if self.frame_table.len() != n {
            self.frame_table = vec![HashMap::new(); n];
            self.data_table = vec![HashMap::new(); n];
            self.data_in = vec![0; n];
        }
    }

    /// Flush targets under star routing: joiners flush the host, the host
    /// flushes every joiner.
    fn targets(&self) -> Vec<Endpoint> {
        if self.eps.is_empty() {
            return Vec::new();
        }
        if self.side == 0 {
            self.eps[1..].to_vec()
        } else {
            vec![self.eps[0]]
        }
    }
}

/// Handshake-only bookkeeping, guarded by its own mutex (taken before the
/// steady lock when both are needed).
struct Handshake<S> {
    players_needed: usize,
    host_ep: Option<Endpoint>,
    local_state: Option<S>,
    check: Option<StateCheck<S>>,
    /// Local display name, sent in `Join` and distributed via `Info`.
    username: String,
    /// Join arrival order; kept so sides are assigned deterministically.
    join_order: Vec<Endpoint>,
    /// Last `Join` seen per endpoint, monotonic ms.
    last_join_ms: HashMap<Endpoint, u64>,
    /// Usernames announced in `Join`, before the roster exists.
    usernames: HashMap<Endpoint, String>,
    /// Delay proposals per joiner.
    delays: HashMap<Endpoint, u8>,
    /// Joiners that echoed `Ready` (host readiness barrier).
    ready_echoed: HashSet<Endpoint>,
    /// Fixed roster, once `Info` has been sent.
    roster: Vec<Endpoint>,
    /// Set when the averaged delay has been broadcast.
    delay_broadcast: bool,
}

impl<S> Handshake<S> {
    fn new() -> Self {
        Handshake {
            players_needed: 0,
            host_ep: None,
            local_state: None,
            check: None,
            username: String::new(),
            join_order: Vec::new(),
            last_join_ms: HashMap::new(),
            usernames: HashMap::new(),
            delays: HashMap::new(),
            ready_echoed: HashSet::new(),
            roster: Vec::new(),
            delay_broadcast: false,
        }
    }

    fn clear(&mut self) {
        let username = std::mem::take(&mut self.username);
        *self = Handshake::new();
        self.username = username;
    }
}

struct Inner<F: Wire, S: Wire> {
    cfg: SessionConfig,
    transport: AsyncTransport<Message<F, S>>,
    steady: Mutex<Steady<F>>,
    frame_cond: Condvar,
    data_cond: Condvar,
    handshake: Mutex<Handshake<S>>,
    sem: Semaphore,
    mode: AtomicU8,
    shutdown: AtomicBool,
    last_error: Mutex<String>,
    trace: WireTrace,
}

// ─── Session ────────────────────────────────────────────────────────────────

/// A lockstep session endpoint.
///
/// Generic over the user's input frame type `F` (its `Default` is the
/// neutral input used for the prologue ticks before the delay window fills)
/// and opaque state blob `S` compared by the compatibility check.
///
/// All methods take `&self` and are safe to call from any thread; `get`,
/// `get_data`, `create` and `join` block.
pub struct Session<F: Wire + Default, S: Wire> {
    inner: Arc<Inner<F, S>>,
}

impl<F: Wire + Default, S: Wire> Default for Session<F, S> {
    fn default() -> Self {
        Self::new(SessionConfig::default())
    }
}

impl<F: Wire + Default, S: Wire> Session<F, S> {
    pub fn new(cfg: SessionConfig) -> Self {
        let transport = AsyncTransport::new(cfg.transport.clone());
        Session {
            inner: Arc::new(Inner {
                cfg,
                transport,
                steady: Mutex::new(Steady::new()),
                frame_cond: Condvar::new(),
                data_cond: Condvar::new(),
                handshake: Mutex::new(Handshake::new()),
                sem: Semaphore::new(),
                mode: AtomicU8::new(MODE_IDLE),
                shutdown: AtomicBool::new(false),
                last_error: Mutex::new(String::new()),
                trace: WireTrace::new(),
            }),
        }
    }

    // ─── Lifecycle ──────────────────────────────────────────────────────

    /// Bind the UDP socket and start the transport workers.
    pub fn bind(&self, port: u16) -> Result<(), SessionError> {
        let weak = Arc::downgrade(&self.inner);
        self.inner.transport.receive_handler(move |ep, msg| {
            if let Some(inner) = weak.upgrade() {
                Inner::on_receive(&inner, ep, msg);
            }
        });
        let weak = Arc::downgrade(&self.inner);
        self.inner.transport.error_handler(move |err| {
            if let Some(inner) = weak.upgrade() {
                *inner.last_error.lock().unwrap() = err.to_string();
            }
        });
        self.inner
            .transport
            .start(port, self.inner.cfg.worker_threads)?;
        self.inner.trace.open();
        Ok(())
    }

    /// Stop the transport. Aborts anything still blocked.
    pub fn unbind(&self) {
        self.shutdown();
        self.inner.transport.stop();
    }

    /// Abort all waits and clear session state. Idempotent. Subsequent
    /// blocking calls fail with [`SessionError::InvalidState`].
    pub fn shutdown(&self) {
        let inner = &self.inner;
        inner.shutdown.store(true, Ordering::Release);
        inner.mode.store(MODE_IDLE, Ordering::Release);
        inner.steady.lock().unwrap().clear();
        inner.handshake.lock().unwrap().clear();
        inner.frame_cond.notify_all();
        inner.data_cond.notify_all();
        inner.sem.post();
    }

    // ─── Handshake ──────────────────────────────────────────────────────

    /// Act as host: wait until `players - 1` compatible joiners have
    /// arrived, distribute the roster, and negotiate the shared delay.
    /// `timeout` of zero waits forever.
    pub fn create(
        &self,
        players: usize,
        state: S,
        check: impl Fn(&S, &S) -> bool + Send + Sync + 'static,
        timeout: Duration,
    ) -> Result<(), SessionError> {
        if !(2..=MAX_PLAYERS).contains(&players) {
            return Err(SessionError::InvalidState);
        }
        self.reset();
        {
            let mut hs = self.inner.handshake.lock().unwrap();
            hs.players_needed = players;
            hs.local_state = Some(state);
            hs.check = Some(Arc::new(check));
        }
        {
            let mut st = self.inner.steady.lock().unwrap();
            st.state = SessionState::Waiting;
            st.side = 0;
        }
        self.inner.mode.store(MODE_HOST, Ordering::Release);

        let result = self.host_handshake(timeout);
        match result {
            Ok(()) => {
                Inner::connection_established(&self.inner);
                Ok(())
            }
            Err(e) => {
                self.abort_handshake();
                Err(e)
            }
        }
    }

    fn host_handshake(&self, timeout: Duration) -> Result<(), SessionError> {
        let inner = &self.inner;
        let deadline = deadline_after(timeout);

        let signaled = if timeout.is_zero() {
            inner.sem.wait();
            true
        } else {
            inner.sem.wait_timeout(timeout)
        };
        if !signaled {
            return Err(SessionError::HandshakeTimeout);
        }
        if inner.shutdown.load(Ordering::Acquire) {
            return Err(SessionError::InvalidState);
        }
        match inner.steady.lock().unwrap().state {
            SessionState::Ready => {}
            SessionState::Denied => return Err(SessionError::StateMismatch),
            _ => return Err(SessionError::HandshakeTimeout),
        }

        // Readiness barrier: every joiner must have fully ACKed the
        // handshake traffic *and* echoed Ready. Queue emptiness alone can
        // read true in the tick between a write and loss detection.
        loop {
            if inner.shutdown.load(Ordering::Acquire) {
                return Err(SessionError::InvalidState);
            }
            if past(deadline) {
                return Err(SessionError::HandshakeTimeout);
            }
            let joiners: Vec<Endpoint> = {
                let st = inner.steady.lock().unwrap();
                st.eps.iter().skip(1).copied().collect()
            };
            let all_echoed = {
                let hs = inner.handshake.lock().unwrap();
                joiners.iter().all(|ep| hs.ready_echoed.contains(ep))
            };
            let outstanding: usize = joiners.iter().map(|ep| inner.transport.send(*ep)).sum();
            if all_echoed && outstanding == 0 {
                return Ok(());
            }
            thread::sleep(inner.cfg.readiness_poll);
        }
    }

    /// Act as joiner: announce to the host, adopt the roster, prime RTT
    /// estimates, and propose a delay. `timeout` of zero waits forever.
    pub fn join(
        &self,
        host_ep: Endpoint,
        state: S,
        check: impl Fn(&S, &S) -> bool + Send + Sync + 'static,
        timeout: Duration,
    ) -> Result<(), SessionError> {
        self.reset();
        {
            let mut hs = self.inner.handshake.lock().unwrap();
            hs.host_ep = Some(host_ep);
            hs.local_state = Some(state);
            hs.check = Some(Arc::new(check));
        }
        self.inner.steady.lock().unwrap().state = SessionState::Waiting;
        self.inner.mode.store(MODE_JOINER, Ordering::Release);

        let result = self.join_handshake(host_ep, timeout);
        match result {
            Ok(()) => {
                Inner::connection_established(&self.inner);
                Ok(())
            }
            Err(e) => {
                self.abort_handshake();
                Err(e)
            }
        }
    }

    fn join_handshake(&self, host_ep: Endpoint, timeout: Duration) -> Result<(), SessionError> {
        let inner = &self.inner;
        let deadline = deadline_after(timeout);

        // Announce every half second until the host answers.
        loop {
            if inner.shutdown.load(Ordering::Acquire) {
                return Err(SessionError::InvalidState);
            }
            if past(deadline) {
                return Err(SessionError::HandshakeTimeout);
            }
            let join = {
                let hs = inner.handshake.lock().unwrap();
                let Some(local) = hs.local_state.clone() else {
                    return Err(SessionError::InvalidState);
                };
                Message::new(
                    0,
                    Body::Join {
                        state: local,
                        host_ep,
                        username: hs.username.clone(),
                    },
                )
            };
            inner.transport.queue(host_ep, &join);
            inner.transport.send(host_ep);
            if inner.sem.wait_timeout(inner.cfg.join_resend_interval) {
                break;
            }
        }
        if inner.shutdown.load(Ordering::Acquire) {
            return Err(SessionError::InvalidState);
        }
        if inner.steady.lock().unwrap().state == SessionState::Denied {
            return Err(SessionError::StateMismatch);
        }

        // Ping every peer so the transport's RTT estimates settle before we
        // propose a delay. Replies are not needed; the peers' ACKs carry
        // the timing.
        for _ in 0..inner.cfg.ping_iterations {
            if inner.shutdown.load(Ordering::Acquire) {
                return Err(SessionError::InvalidState);
            }
            if past(deadline) {
                return Err(SessionError::HandshakeTimeout);
            }
            let (side, peers) = {
                let st = inner.steady.lock().unwrap();
                (st.side, peers_without_self(&st.eps, st.side))
            };
            for ep in peers {
                inner.transport.queue(ep, &Message::new(side, Body::Ping));
                inner.transport.send(ep);
            }
            thread::sleep(inner.cfg.ping_interval);
        }

        let (side, peers) = {
            let st = inner.steady.lock().unwrap();
            (st.side, peers_without_self(&st.eps, st.side))
        };
        let worst_rtt = peers
            .iter()
            .map(|ep| inner.transport.peer(*ep).rtt_avg)
            .max()
            .unwrap_or(0);
        let proposed = delay_for_rtt(worst_rtt);
        inner
            .transport
            .queue(host_ep, &Message::new(side, Body::Delay { delay: proposed }));

        // Wait until the host both echoed the averaged delay and ACKed our
        // proposal.
        let mut proposal_acked = false;
        loop {
            if !proposal_acked {
                proposal_acked = inner.transport.send(host_ep) == 0;
            }
            if inner.shutdown.load(Ordering::Acquire) {
                return Err(SessionError::InvalidState);
            }
            if past(deadline) {
                return Err(SessionError::HandshakeTimeout);
            }
            if proposal_acked && inner.steady.lock().unwrap().state == SessionState::Ready {
                break;
            }
            inner.sem.wait_timeout(Duration::from_millis(50));
        }

        // Tell the host we are done and pump the queue dry.
        inner
            .transport
            .queue(host_ep, &Message::new(side, Body::Ready));
        let delay = inner.steady.lock().unwrap().delay;
        for _ in 0..delay.max(1) {
            if inner.transport.send(host_ep) == 0 {
                break;
            }
            thread::sleep(inner.cfg.drain_tick);
        }
        Ok(())
    }

    fn reset(&self) {
        let inner = &self.inner;
        inner.shutdown.store(false, Ordering::Release);
        inner.mode.store(MODE_IDLE, Ordering::Release);
        inner.sem.reset();
        inner.steady.lock().unwrap().clear();
        inner.handshake.lock().unwrap().clear();
        inner.last_error.lock().unwrap().clear();
    }

    fn abort_handshake(&self) {
        self.inner.mode.store(MODE_IDLE, Ordering::Release);
        self.inner.steady.lock().unwrap().state = SessionState::Idle;
    }

    // ─── Frames ─────────────────────────────────────────────────────────

    /// Publish the local input for the current tick. The input lands at
    /// `frame + delay` — or `frame + 1` on the host when the single-tick
    /// lead is configured — and is flushed to the peers immediately.
    pub fn set(&self, frame: F) -> Result<(), SessionError> {
        self.ensure_connected()?;
        let msg = {
            let mut st = self.inner.steady.lock().unwrap();
            let lead = if st.side == 0 && self.inner.cfg.host_single_tick_lead {
                1
            } else {
                st.delay
            };
            let dest = st.frame + lead;
            let side = usize::from(st.side);
            st.frame_table[side].insert(dest, frame.clone());
            Message::new(
                st.side,
                Body::Frame {
                    frame_id: dest,
                    frame,
                },
            )
        };
        self.queue_to_targets(&msg);
        self.flush();
        Ok(())
    }

    /// Block until `side`'s input for `frame_id` is available. Ticks before
    /// the delay window are a prologue and resolve immediately to the
    /// neutral input. On success the entry for `frame_id - 1` is evicted.
    /// `timeout` of zero waits forever.
    pub fn get(&self, side: usize, frame_id: u64, timeout: Duration) -> Result<F, SessionError> {
        self.ensure_connected()?;
        let inner = &self.inner;
        let deadline = deadline_after(timeout);

        let mut st = inner.steady.lock().unwrap();
        if frame_id < st.delay {
            return Ok(F::default());
        }
        loop {
            if inner.shutdown.load(Ordering::Acquire) || st.state != SessionState::Ready {
                return Err(SessionError::InvalidState);
            }
            if side >= st.frame_table.len() {
                return Err(SessionError::InvalidState);
            }
            if let Some(frame) = st.frame_table[side].get(&frame_id).cloned() {
                st.frame_table[side].remove(&frame_id.saturating_sub(1));
                return Ok(frame);
            }
            st = match deadline {
                None => inner.frame_cond.wait(st).unwrap(),
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        return Err(SessionError::GetTimeout);
                    }
                    inner.frame_cond.wait_timeout(st, d - now).unwrap().0
                }
            };
        }
    }

    /// [`get`](Self::get) at the current local tick.
    pub fn get_current(&self, side: usize, timeout: Duration) -> Result<F, SessionError> {
        let frame = self.inner.steady.lock().unwrap().frame;
        self.get(side, frame, timeout)
    }

    /// Advance the local tick counter.
    pub fn next_frame(&self) {
        self.inner.steady.lock().unwrap().frame += 1;
    }

    pub fn frame(&self) -> u64 {
        self.inner.steady.lock().unwrap().frame
    }

    /// Rewind or fast-forward the local tick counter (resync).
    pub fn set_frame(&self, frame: u64) {
        self.inner.steady.lock().unwrap().frame = frame;
    }

    // ─── Data side channel ──────────────────────────────────────────────

    /// Queue a blob on the reliable-ordered side channel and flush.
    pub fn queue_data(&self, data: Bytes) -> Result<(), SessionError> {
        self.ensure_connected()?;
        let msg = {
            let mut st = self.inner.steady.lock().unwrap();
            let index = st.data_out;
            st.data_out += 1;
            Message::new(st.side, Body::Data { index, data })
        };
        self.queue_to_targets(&msg);
        self.flush();
        Ok(())
    }

    /// Block until the next blob from `side` is available; consumed blobs
    /// are erased. Strictly ordered per side. `timeout` of zero waits
    /// forever.
    pub fn get_data(&self, side: usize, timeout: Duration) -> Result<Bytes, SessionError> {
        self.ensure_connected()?;
        let inner = &self.inner;
        let deadline = deadline_after(timeout);

        let mut st = inner.steady.lock().unwrap();
        loop {
            if inner.shutdown.load(Ordering::Acquire) || st.state != SessionState::Ready {
                return Err(SessionError::InvalidState);
            }
            if side >= st.data_table.len() {
                return Err(SessionError::InvalidState);
            }
            let index = st.data_in[side];
            if let Some(blob) = st.data_table[side].remove(&index) {
                st.data_in[side] += 1;
                return Ok(blob);
            }
            st = match deadline {
                None => inner.data_cond.wait(st).unwrap(),
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        return Err(SessionError::GetDataTimeout);
                    }
                    inner.data_cond.wait_timeout(st, d - now).unwrap().0
                }
            };
        }
    }

    // ─── Control ────────────────────────────────────────────────────────

    /// Broadcast the current delay (after renegotiating it locally).
    pub fn reannounce_delay(&self) -> Result<(), SessionError> {
        self.ensure_connected()?;
        let msg = {
            let st = self.inner.steady.lock().unwrap();
            Message::new(
                st.side,
                Body::Delay {
                    delay: st.delay.clamp(1, 255) as u8,
                },
            )
        };
        self.queue_to_targets(&msg);
        self.flush();
        Ok(())
    }

    /// Ask every peer to wind the session down; also sets the local flag.
    pub fn send_end_session_request(&self) -> Result<(), SessionError> {
        self.ensure_connected()?;
        let msg = {
            let mut st = self.inner.steady.lock().unwrap();
            st.end_session_request = true;
            Message::new(st.side, Body::EndSession)
        };
        self.queue_to_targets(&msg);
        self.flush();
        Ok(())
    }

    /// Polled by the simulator to exit its loop.
    pub fn end_session_request(&self) -> bool {
        self.inner.steady.lock().unwrap().end_session_request
    }

    /// Drop every peer's outstanding transport queue.
    pub fn clear_queue(&self) -> Result<(), SessionError> {
        self.ensure_connected()?;
        let eps = self.inner.steady.lock().unwrap().eps.clone();
        for ep in eps {
            self.inner.transport.clear_queue(ep);
        }
        Ok(())
    }

    /// Flush queued messages to the star targets. Returns the number of
    /// messages still unacknowledged across those targets.
    pub fn flush(&self) -> usize {
        let targets = self.inner.steady.lock().unwrap().targets();
        targets
            .into_iter()
            .map(|ep| self.inner.transport.send(ep))
            .sum()
    }

    /// Flush and block until every target has acknowledged, within the
    /// transport's sync window. Returns the remaining unacked count.
    pub fn flush_sync(&self) -> usize {
        let targets = self.inner.steady.lock().unwrap().targets();
        targets
            .into_iter()
            .map(|ep| self.inner.transport.send_sync(ep))
            .sum()
    }

    // ─── Getters & knobs ────────────────────────────────────────────────

    pub fn state(&self) -> SessionState {
        self.inner.steady.lock().unwrap().state
    }

    pub fn side(&self) -> u8 {
        self.inner.steady.lock().unwrap().side
    }

    /// Negotiated input delay in ticks.
    pub fn delay(&self) -> u64 {
        self.inner.steady.lock().unwrap().delay
    }

    /// Override the delay locally; follow with
    /// [`reannounce_delay`](Self::reannounce_delay) to propagate it.
    pub fn set_delay(&self, ticks: u64) {
        self.inner.steady.lock().unwrap().delay = ticks.clamp(1, 255);
    }

    /// Full roster, self included at index [`side`](Self::side).
    pub fn endpoints(&self) -> Vec<Endpoint> {
        self.inner.steady.lock().unwrap().eps.clone()
    }

    pub fn first_received_frame(&self) -> Option<u64> {
        self.inner.steady.lock().unwrap().first_received
    }

    pub fn last_received_frame(&self) -> Option<u64> {
        self.inner.steady.lock().unwrap().last_received
    }

    /// Seed the host picked for this session; identical on every peer, so
    /// simulators can seed their RNGs deterministically.
    pub fn random_seed(&self) -> u32 {
        self.inner.steady.lock().unwrap().random_seed
    }

    /// Local UDP port, once bound.
    pub fn port(&self) -> Option<u16> {
        self.inner.transport.port()
    }

    /// Last transport error text; empty if none.
    pub fn last_error(&self) -> String {
        self.inner.last_error.lock().unwrap().clone()
    }

    pub fn username(&self) -> String {
        self.inner.handshake.lock().unwrap().username.clone()
    }

    /// Set the display name sent with `Join`. Call before the handshake.
    /// Truncated to the wire limit.
    pub fn set_username(&self, name: impl Into<String>) {
        let mut name = name.into();
        while name.len() > MAX_USERNAME_LEN {
            name.pop();
        }
        self.inner.handshake.lock().unwrap().username = name;
    }

    /// Display name a peer announced, if known.
    pub fn peer_username(&self, ep: Endpoint) -> Option<String> {
        self.inner.steady.lock().unwrap().usernames.get(&ep).cloned()
    }

    /// Transport statistics for one peer.
    pub fn peer_stats(&self, ep: Endpoint) -> PeerStats {
        self.inner.transport.peer(ep)
    }

    /// Artificial Bernoulli loss (percent) applied to everything this
    /// session sends, ACKs included.
    pub fn set_packet_loss(&self, pct: u8) {
        self.inner.transport.set_packet_loss(pct);
    }

    /// Artificial delay range applied to everything this session sends.
    pub fn set_send_delay(&self, min: Duration, max: Duration) {
        self.inner.transport.set_send_delay(min, max);
    }

    // ─── Internals ──────────────────────────────────────────────────────

    fn ensure_connected(&self) -> Result<(), SessionError> {
        let connected = self.inner.mode.load(Ordering::Acquire) == MODE_STEADY
            && !self.inner.shutdown.load(Ordering::Acquire);
        if connected {
            Ok(())
        } else {
            Err(SessionError::InvalidState)
        }
    }

    fn queue_to_targets(&self, msg: &Message<F, S>) {
        let (targets, side) = {
            let st = self.inner.steady.lock().unwrap();
            (st.targets(), st.side)
        };
        for (i, ep) in targets.iter().enumerate() {
            let peer_side = if side == 0 { (i + 1) as u8 } else { 0 };
            self.inner.trace.message(
                msg.kind().name(),
                msg.trace_frame_id(),
                side,
                "--^",
                peer_side,
                *ep,
            );
            self.inner.transport.queue(*ep, msg);
        }
    }
}

impl<F: Wire + Default, S: Wire> Drop for Session<F, S> {
    fn drop(&mut self) {
        self.shutdown();
        self.inner.transport.stop();
    }
}

// ─── Receive handlers (run on transport workers) ────────────────────────────

impl<F: Wire + Default, S: Wire> Inner<F, S> {
    fn on_receive(inner: &Arc<Self>, ep: Endpoint, msg: Message<F, S>) {
        match inner.mode.load(Ordering::Acquire) {
            MODE_HOST => Self::host_recv(inner, ep, msg),
            MODE_JOINER => Self::joiner_recv(inner, ep, msg),
            MODE_STEADY => Self::steady_recv(inner, ep, msg),
            _ => {}
        }
    }

    fn connection_established(inner: &Arc<Self>) {
        {
            let mut st = inner.steady.lock().unwrap();
            st.size_tables();
            inner.trace.note(&format!(
                "established side={} delay={} peers={:?}",
                st.side, st.delay, st.eps
            ));
        }
        inner.mode.store(MODE_STEADY, Ordering::Release);
        tracing::debug!("session established");
    }

    // ── Host handshake ──────────────────────────────────────────────────

    fn host_recv(inner: &Arc<Self>, ep: Endpoint, msg: Message<F, S>) {
        // A joiner that finished its handshake first may already be
        // publishing; route lockstep traffic to the steady logic so nothing
        // is lost in the window before create() returns.
        if matches!(msg.body, Body::Frame { .. } | Body::Data { .. } | Body::EndSession) {
            return Self::steady_recv(inner, ep, msg);
        }
        inner
            .trace
            .message(msg.kind().name(), msg.trace_frame_id(), 0, "<--", msg.side, ep);
        match msg.body {
            Body::Join {
                state,
                host_ep,
                username,
            } => Self::host_on_join(inner, ep, state, host_ep, username),
            Body::Ping => {
                inner.transport.queue(ep, &Message::new(0, Body::None));
                inner.transport.send(ep);
            }
            Body::Delay { delay } => Self::host_on_delay(inner, ep, delay),
            Body::Ready => {
                inner.handshake.lock().unwrap().ready_echoed.insert(ep);
            }
            _ => {}
        }
    }

    fn host_on_join(inner: &Arc<Self>, ep: Endpoint, state: S, host_ep: Endpoint, username: String) {
        let mut hs = inner.handshake.lock().unwrap();
        let compatible = match (&hs.check, &hs.local_state) {
            (Some(check), Some(local)) => check(local, &state),
            _ => return,
        };
        if !compatible {
            let deny = Message::new(
                0,
                Body::Deny {
                    state: hs.local_state.clone().expect("checked above"),
                },
            );
            drop(hs);
            tracing::debug!(%ep, "rejecting joiner: state mismatch");
            inner.transport.queue(ep, &deny);
            inner.transport.send(ep);
            Self::spawn_deny_resend(inner, ep);
            inner.steady.lock().unwrap().state = SessionState::Denied;
            inner.sem.post();
            return;
        }

        let now = time_ms();
        if !hs.last_join_ms.contains_key(&ep) {
            hs.join_order.push(ep);
        }
        hs.last_join_ms.insert(ep, now);
        hs.usernames.insert(ep, username);

        let players_needed = hs.players_needed;
        let window = inner.cfg.join_fresh_window.as_millis() as u64;
        let fresh: Vec<Endpoint> = hs
            .join_order
            .iter()
            .filter(|e| now.saturating_sub(hs.last_join_ms[*e]) < window)
            .copied()
            .take(players_needed.saturating_sub(1))
            .collect();

        let waiting = inner.steady.lock().unwrap().state == SessionState::Waiting;
        if waiting && fresh.len() + 1 >= players_needed {
            // Roster complete: host at side 0 (its address as the joiners
            // see it), joiners in arrival order.
            let mut roster = vec![host_ep];
            roster.extend(fresh.iter().copied());
            let rand_seed: u32 = rand::random();
            hs.roster = roster.clone();

            let named: Vec<(Endpoint, String)> = roster
                .iter()
                .enumerate()
                .map(|(i, e)| {
                    let name = if i == 0 {
                        hs.username.clone()
                    } else {
                        hs.usernames.get(e).cloned().unwrap_or_default()
                    };
                    (*e, name)
                })
                .collect();
            let local_state = hs.local_state.clone().expect("checked above");
            drop(hs);

            {
                let mut st = inner.steady.lock().unwrap();
                st.eps = roster.clone();
                st.side = 0;
                st.random_seed = rand_seed;
                st.usernames = named.iter().cloned().collect();
                st.state = SessionState::Pinging;
                st.size_tables();
            }
            for (i, target) in roster.iter().enumerate().skip(1) {
                let info = Message::new(
                    0,
                    Body::Info {
                        rand_seed,
                        assigned_side: i as u8,
                        roster: named.clone(),
                        state: local_state.clone(),
                    },
                );
                inner.transport.queue(*target, &info);
                inner.transport.send(*target);
            }
        } else if waiting {
            let wait = Message::new(
                0,
                Body::Wait {
                    peers_needed: players_needed as u8,
                    peers_count: fresh.len() as u8,
                },
            );
            drop(hs);
            inner.transport.queue(ep, &wait);
            inner.transport.send(ep);
        } else {
            // Roster already announced; flush so any unacked Info goes out
            // again.
            let joiners: Vec<Endpoint> = hs.roster.iter().skip(1).copied().collect();
            drop(hs);
            for j in joiners {
                inner.transport.send(j);
            }
        }
    }

    fn host_on_delay(inner: &Arc<Self>, ep: Endpoint, delay: u8) {
        let broadcast = {
            let mut hs = inner.handshake.lock().unwrap();
            if hs.roster.is_empty() || !hs.roster[1..].contains(&ep) {
                return;
            }
            hs.delays.insert(ep, delay.max(1));
            let joiners = hs.roster.len() - 1;
            if hs.delay_broadcast || hs.delays.len() < joiners {
                None
            } else {
                hs.delay_broadcast = true;
                let mean = hs.delays.values().map(|d| u64::from(*d)).sum::<u64>() / joiners as u64;
                Some((mean.clamp(1, 255) as u8, hs.roster[1..].to_vec()))
            }
        };

        let Some((mean, joiners)) = broadcast else {
            return;
        };
        {
            let mut st = inner.steady.lock().unwrap();
            st.delay = u64::from(mean);
            st.state = SessionState::Ready;
        }
        for j in &joiners {
            inner
                .transport
                .queue(*j, &Message::new(0, Body::Delay { delay: mean }));
            inner.transport.send(*j);
        }
        inner.sem.post();
    }

    fn spawn_deny_resend(inner: &Arc<Self>, ep: Endpoint) {
        let transport = inner.transport.clone();
        let resends = inner.cfg.deny_resends;
        let gap = inner.cfg.deny_resend_interval;
        thread::Builder::new()
            .name("tandem-deny".into())
            .spawn(move || {
                for _ in 0..resends {
                    transport.send(ep);
                    thread::sleep(gap);
                }
            })
            .ok();
    }

    // ── Joiner handshake ────────────────────────────────────────────────

    fn joiner_recv(inner: &Arc<Self>, ep: Endpoint, msg: Message<F, S>) {
        if inner.handshake.lock().unwrap().host_ep != Some(ep) {
            return;
        }
        // The host (or a peer relayed through it) may reach Ready and start
        // publishing before our join() returns; buffer instead of dropping.
        if matches!(msg.body, Body::Frame { .. } | Body::Data { .. } | Body::EndSession) {
            return Self::steady_recv(inner, ep, msg);
        }
        let my_side = inner.steady.lock().unwrap().side;
        inner.trace.message(
            msg.kind().name(),
            msg.trace_frame_id(),
            my_side,
            "<--",
            msg.side,
            ep,
        );
        match msg.body {
            Body::Info {
                rand_seed,
                assigned_side,
                roster,
                state,
            } => {
                let compatible = {
                    let hs = inner.handshake.lock().unwrap();
                    match (&hs.check, &hs.local_state) {
                        (Some(check), Some(local)) => check(local, &state),
                        _ => return,
                    }
                };
                {
                    let mut st = inner.steady.lock().unwrap();
                    st.side = assigned_side;
                    st.eps = roster.iter().map(|(e, _)| *e).collect();
                    st.usernames = roster.into_iter().collect();
                    st.random_seed = rand_seed;
                    st.state = if compatible {
                        SessionState::Accepted
                    } else {
                        SessionState::Denied
                    };
                    st.size_tables();
                }
                inner.sem.post();
            }
            Body::Deny { state } => {
                // Run the check for its side effects — the caller may want
                // to surface what the host was running.
                let hs = inner.handshake.lock().unwrap();
                if let (Some(check), Some(local)) = (&hs.check, &hs.local_state) {
                    let _ = check(local, &state);
                }
                drop(hs);
                inner.steady.lock().unwrap().state = SessionState::Denied;
                inner.sem.post();
            }
            Body::Delay { delay } => {
                let side = {
                    let mut st = inner.steady.lock().unwrap();
                    st.delay = u64::from(delay.max(1));
                    st.state = SessionState::Ready;
                    st.side
                };
                inner.transport.queue(ep, &Message::new(side, Body::Ready));
                inner.transport.send(ep);
                inner.sem.post();
            }
            Body::Ping => {
                inner.transport.queue(ep, &Message::new(my_side, Body::None));
                inner.transport.send(ep);
            }
            Body::Wait {
                peers_needed,
                peers_count,
            } => {
                tracing::debug!(peers_needed, peers_count, "host still collecting players");
            }
            _ => {}
        }
    }

    // ── Steady state ────────────────────────────────────────────────────

    fn steady_recv(inner: &Arc<Self>, ep: Endpoint, msg: Message<F, S>) {
        let (my_side, eps) = {
            let st = inner.steady.lock().unwrap();
            (st.side, st.eps.clone())
        };
        // Star routing means our own messages never come back; drop any
        // that somehow do.
        if msg.side == my_side {
            return;
        }
        inner.trace.message(
            msg.kind().name(),
            msg.trace_frame_id(),
            my_side,
            "<--",
            msg.side,
            ep,
        );

        // The host relays joiner traffic to every other joiner; each relay
        // leg is its own reliable stream.
        if my_side == 0 && msg.side != 0 {
            for (i, other) in eps.iter().enumerate().skip(1) {
                if i == usize::from(msg.side) {
                    continue;
                }
                inner.transport.queue(*other, &msg);
                inner.transport.send(*other);
            }
        }

        let side = usize::from(msg.side);
        match msg.body {
            Body::Frame { frame_id, frame } => {
                {
                    let mut st = inner.steady.lock().unwrap();
                    if side >= st.frame_table.len() {
                        return;
                    }
                    st.frame_table[side].insert(frame_id, frame);
                    st.first_received = Some(st.first_received.map_or(frame_id, |f| f.min(frame_id)));
                    st.last_received = Some(st.last_received.map_or(frame_id, |l| l.max(frame_id)));
                }
                inner.frame_cond.notify_all();
            }
            Body::Data { index, data } => {
                {
                    let mut st = inner.steady.lock().unwrap();
                    if side >= st.data_table.len() {
                        return;
                    }
                    st.data_table[side].insert(index, data);
                }
                inner.data_cond.notify_all();
            }
            Body::Delay { delay } => {
                inner.steady.lock().unwrap().delay = u64::from(delay.max(1));
            }
            Body::EndSession => {
                inner.steady.lock().unwrap().end_session_request = true;
            }
            _ => {}
        }
    }
}

// ─── Helpers ────────────────────────────────────────────────────────────────

fn deadline_after(timeout: Duration) -> Option<Instant> {
    (!timeout.is_zero()).then(|| Instant::now() + timeout)
}

fn past(deadline: Option<Instant>) -> bool {
    deadline.is_some_and(|d| Instant::now() >= d)
}

fn peers_without_self(eps: &[Endpoint], side: u8) -> Vec<Endpoint> {
    eps.iter()
        .enumerate()
        .filter(|(i, _)| *i != usize::from(side))
        .map(|(_, ep)| *ep)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_rule_floors_at_one_tick() {
        assert_eq!(delay_for_rtt(0), 1);
        assert_eq!(delay_for_rtt(31), 1);
        assert_eq!(delay_for_rtt(32), 2);
        assert_eq!(delay_for_rtt(320), 11);
        assert_eq!(delay_for_rtt(u64::MAX), 255);
    }

    #[test]
    fn blocking_calls_fail_before_handshake() {
        let session: Session<Bytes, Bytes> = Session::default();
        assert!(matches!(
            session.get(0, 5, Duration::from_millis(10)),
            Err(SessionError::InvalidState)
        ));
        assert!(matches!(
            session.get_data(0, Duration::from_millis(10)),
            Err(SessionError::InvalidState)
        ));
        assert!(matches!(
            session.set(Bytes::new()),
            Err(SessionError::InvalidState)
        ));
        assert!(matches!(
            session.queue_data(Bytes::new()),
            Err(SessionError::InvalidState)
        ));
        assert!(matches!(
            session.reannounce_delay(),
            Err(SessionError::InvalidState)
        ));
    }

    #[test]
    fn create_rejects_degenerate_player_counts() {
        let session: Session<Bytes, Bytes> = Session::default();
        for players in [0, 1, MAX_PLAYERS + 1] {
            assert!(matches!(
                session.create(players, Bytes::new(), |a, b| a == b, Duration::from_millis(1)),
                Err(SessionError::InvalidState)
            ));
        }
    }

    #[test]
    fn shutdown_is_idempotent() {
        let session: Session<Bytes, Bytes> = Session::default();
        session.shutdown();
        session.shutdown();
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[test]
    fn peers_without_self_skips_own_slot() {
        let eps: Vec<Endpoint> = (0..3)
            .map(|i| "127.0.0.1:0".parse::<std::net::SocketAddrV4>().map(|mut e| {
                e.set_port(7000 + i);
                e
            }).unwrap())
            .collect();
        let peers = peers_without_self(&eps, 1);
        assert_eq!(peers, vec![eps[0], eps[2]]);
    }
}
