//! # Per-Endpoint Reliability State
//!
//! Everything the transport tracks about one remote endpoint: the outgoing
//! queue, the unacked retransmit buffer, the in-order delivery window, and
//! the RTT estimate. This module is pure state machine — no sockets, no
//! clocks of its own; callers pass `Instant`s in, which keeps the retransmit
//! and RTT logic deterministic under test.

use bytes::Bytes;
use quanta::Instant;
use std::collections::{BTreeMap, VecDeque};
use std::net::SocketAddrV4;
use std::time::Duration;

use crate::stats::{Ewma, PeerStats};
use crate::wire::Datagram;

/// A remote peer address. IPv4 only; hashes by the binary (addr, port) pair.
pub type Endpoint = SocketAddrV4;

/// RTT smoothing factor (RFC 6298 α).
const RTT_ALPHA: f64 = 0.125;

// ─── Outgoing entries ───────────────────────────────────────────────────────

/// A message that has been sent at least once and awaits acknowledgment.
#[derive(Debug, Clone)]
struct UnackedEntry {
    message: Bytes,
    first_sent: Instant,
    last_sent: Instant,
}

// ─── Accept outcome ─────────────────────────────────────────────────────────

/// Result of accepting one inbound payload datagram.
#[derive(Debug)]
pub(crate) enum Accept<M> {
    /// Sequence already delivered (or already buffered); re-ACK only.
    Duplicate,
    /// Out of order; buffered until the gap fills.
    Buffered,
    /// In order: this message plus any buffered successors, delivery order.
    Delivered(Vec<M>),
}

// ─── Peer state ─────────────────────────────────────────────────────────────

/// Reliability state for one endpoint.
pub(crate) struct PeerState<M> {
    /// Next sequence number to assign (starts at 1; 0 means "nothing").
    next_seq: u64,
    /// Queued messages that have never been sent: (seq, encoded message).
    outgoing: VecDeque<(u64, Bytes)>,
    /// Sent messages awaiting acknowledgment, keyed by sequence.
    unacked: BTreeMap<u64, UnackedEntry>,
    /// Highest contiguous inbound sequence delivered to the application.
    last_delivered: u64,
    /// Inbound messages received ahead of the contiguous point.
    reorder: BTreeMap<u64, M>,
    /// Smoothed ACK latency in milliseconds.
    rtt: Ewma,
    rto_floor: Duration,
    rto_cap: Duration,
    packets_sent: u64,
    packets_received: u64,
    retransmissions: u64,
    duplicates: u64,
}

impl<M> PeerState<M> {
    pub(crate) fn new(rto_floor: Duration, rto_cap: Duration) -> Self {
        PeerState {
            next_seq: 1,
            outgoing: VecDeque::new(),
            unacked: BTreeMap::new(),
            last_delivered: 0,
            reorder: BTreeMap::new(),
            rtt: Ewma::new(RTT_ALPHA),
            rto_floor,
            rto_cap,
            packets_sent: 0,
            packets_received: 0,
            retransmissions: 0,
            duplicates: 0,
        }
    }

    /// Append an encoded message to the outgoing queue.
    pub(crate) fn queue(&mut self, message: Bytes) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.outgoing.push_back((seq, message));
        seq
    }

    /// Drop everything queued or in flight.
    pub(crate) fn clear_queue(&mut self) {
        self.outgoing.clear();
        self.unacked.clear();
    }

    /// Current retransmission timeout: `2 × rtt_avg` clamped to the
    /// configured floor and cap. Before the first RTT sample, the floor.
    pub(crate) fn rto(&self) -> Duration {
        if !self.rtt.is_initialized() {
            return self.rto_floor;
        }
        let rto = Duration::from_millis((2.0 * self.rtt.value()) as u64);
        rto.clamp(self.rto_floor, self.rto_cap)
    }

    /// Collect every datagram due for the wire at `now`: all queued messages
    /// (first transmission) plus any unacked message whose retransmit timer
    /// has elapsed. The piggybacked ACK reflects the current inbound state.
    pub(crate) fn flush(&mut self, now: Instant) -> Vec<Bytes> {
        let ack = self.last_delivered;
        let mut out = Vec::new();

        while let Some((seq, message)) = self.outgoing.pop_front() {
            out.push(Datagram::payload(seq, ack, message.clone()).encode());
            self.unacked.insert(
                seq,
                UnackedEntry {
                    message,
                    first_sent: now,
                    last_sent: now,
                },
            );
            self.packets_sent += 1;
        }

        let rto = self.rto();
        for (&seq, entry) in self.unacked.iter_mut() {
            // Entries just moved off the queue have last_sent == now, so
            // the elapsed check skips them.
            if now.saturating_duration_since(entry.last_sent) >= rto {
                entry.last_sent = now;
                out.push(Datagram::payload(seq, ack, entry.message.clone()).encode());
                self.packets_sent += 1;
                self.retransmissions += 1;
            }
        }
        out
    }

    /// Process a cumulative ACK: drop covered entries and feed the RTT
    /// estimator. Latency is measured from the first transmission; on a
    /// retransmitted entry that overestimates, which only ever raises the
    /// negotiated delay.
    pub(crate) fn process_ack(&mut self, ack: u64, now: Instant) -> bool {
        let mut any = false;
        while let Some((&seq, _)) = self.unacked.first_key_value() {
            if seq > ack {
                break;
            }
            let entry = self.unacked.remove(&seq).expect("first key exists");
            let sample_ms =
                now.saturating_duration_since(entry.first_sent).as_secs_f64() * 1_000.0;
            self.rtt.update(sample_ms);
            any = true;
        }
        any
    }

    /// Accept one inbound payload. The caller always replies with an ACK
    /// regardless of the outcome.
    pub(crate) fn accept(&mut self, seq: u64, message: M) -> Accept<M> {
        self.packets_received += 1;

        if seq <= self.last_delivered || self.reorder.contains_key(&seq) {
            self.duplicates += 1;
            return Accept::Duplicate;
        }

        if seq != self.last_delivered + 1 {
            self.reorder.insert(seq, message);
            return Accept::Buffered;
        }

        self.last_delivered = seq;
        let mut delivered = vec![message];
        while let Some(next) = self.reorder.remove(&(self.last_delivered + 1)) {
            self.last_delivered += 1;
            delivered.push(next);
        }
        Accept::Delivered(delivered)
    }

    /// ACK value to piggyback on outgoing datagrams.
    pub(crate) fn ack_value(&self) -> u64 {
        self.last_delivered
    }

    pub(crate) fn unacked_len(&self) -> usize {
        self.unacked.len()
    }

    /// Unsent plus unacked — the "not yet caught up" count `send` reports.
    pub(crate) fn outstanding(&self) -> usize {
        self.outgoing.len() + self.unacked.len()
    }

    pub(crate) fn stats(&self) -> PeerStats {
        PeerStats {
            rtt_avg: self.rtt.value() as u64,
            unacked: self.unacked.len(),
            queued: self.outgoing.len(),
            packets_sent: self.packets_sent,
            packets_received: self.packets_received,
            retransmissions: self.retransmissions,
            duplicates: self.duplicates,
        }
    }
}
