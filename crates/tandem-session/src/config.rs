//! Session tunables.

use std::time::Duration;
use tandem_transport::TransportConfig;

/// Knobs for the handshake cadence and steady-state behavior. The defaults
/// are the protocol's canonical timings; tests shrink the ping phase to
/// keep wall-clock time down.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub transport: TransportConfig,
    /// I/O worker threads for the underlying transport.
    pub worker_threads: usize,
    /// How often a joiner re-sends `Join` while waiting for the host.
    pub join_resend_interval: Duration,
    /// A collected `Join` counts toward the roster only while younger than
    /// this.
    pub join_fresh_window: Duration,
    /// RTT priming: number of ping rounds a joiner runs before proposing a
    /// delay.
    pub ping_iterations: u32,
    /// Gap between ping rounds.
    pub ping_interval: Duration,
    /// Host poll interval for the readiness barrier.
    pub readiness_poll: Duration,
    /// Tick used while draining the final handshake queue.
    pub drain_tick: Duration,
    /// How many times a `Deny` is re-sent before the host gives up on the
    /// rejected peer.
    pub deny_resends: u32,
    /// Gap between `Deny` re-sends.
    pub deny_resend_interval: Duration,
    /// When set, the host stores its own input at `frame + 1` instead of
    /// `frame + delay`. The host then runs one tick ahead of the uniform
    /// delay: its inputs arrive early at joiners, and it must consume its
    /// own input one tick after publishing.
    pub host_single_tick_lead: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            transport: TransportConfig::default(),
            worker_threads: 2,
            join_resend_interval: Duration::from_millis(500),
            join_fresh_window: Duration::from_millis(1_000),
            ping_iterations: 150,
            ping_interval: Duration::from_millis(50),
            readiness_poll: Duration::from_millis(50),
            drain_tick: Duration::from_millis(17),
            deny_resends: 5,
            deny_resend_interval: Duration::from_millis(50),
            host_single_tick_lead: true,
        }
    }
}
