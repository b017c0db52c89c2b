//! # Per-Peer Statistics
//!
//! Counters and RTT estimate for one remote endpoint, snapshotted for
//! diagnostics and JSON export.

use serde::Serialize;

// ─── Peer Stats ─────────────────────────────────────────────────────────────

/// Snapshot of one endpoint's transport state.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PeerStats {
    /// Smoothed round-trip time in milliseconds.
    pub rtt_avg: u64,
    /// Messages sent but not yet acknowledged.
    pub unacked: usize,
    /// Messages queued but never sent.
    pub queued: usize,
    /// Datagrams emitted to this endpoint (including retransmissions).
    pub packets_sent: u64,
    /// Payload datagrams received from this endpoint.
    pub packets_received: u64,
    /// Retransmissions of timed-out unacked messages.
    pub retransmissions: u64,
    /// Duplicate payloads received (re-ACKed, not re-delivered).
    pub duplicates: u64,
}

impl PeerStats {
    /// Retransmission overhead ratio.
    pub fn retransmit_ratio(&self) -> f64 {
        if self.packets_sent == 0 {
            0.0
        } else {
            self.retransmissions as f64 / self.packets_sent as f64
        }
    }
}

// ─── EWMA ───────────────────────────────────────────────────────────────────

/// Exponentially weighted moving average over an intermittent sample
/// stream, used for the per-peer RTT estimate.
#[derive(Debug, Clone)]
pub struct Ewma {
    /// Weight a fresh sample gets against the running average.
    weight: f64,
    /// Running average; `None` until the first sample seeds it.
    current: Option<f64>,
}

impl Ewma {
    /// `weight` must be a fraction in `[0, 1]`; 1 would track the last
    /// sample exactly, 0 would never move off the seed.
    pub fn new(weight: f64) -> Self {
        assert!((0.0..=1.0).contains(&weight), "weight must be a fraction");
        Ewma {
            weight,
            current: None,
        }
    }

    /// Fold one sample in and return the new average. The first sample
    /// seeds the average directly.
    pub fn update(&mut self, sample: f64) -> f64 {
        let next = match self.current {
            None => sample,
            Some(avg) => avg + self.weight * (sample - avg),
        };
        self.current = Some(next);
        next
    }

    /// Current average; zero before any sample.
    pub fn value(&self) -> f64 {
        self.current.unwrap_or(0.0)
    }

    /// Whether any sample has been applied yet.
    pub fn is_initialized(&self) -> bool {
        self.current.is_some()
    }
}
