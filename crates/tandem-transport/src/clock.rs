//! Monotonic millisecond clock, anchored at first use.
//!
//! Handshake freshness windows and trace timestamps only ever compare these
//! values to each other, so the process-local anchor is all that is needed.

use quanta::Instant;
use std::sync::OnceLock;

static ANCHOR: OnceLock<Instant> = OnceLock::new();

/// Milliseconds elapsed since the first call in this process.
pub fn time_ms() -> u64 {
    ANCHOR.get_or_init(Instant::now).elapsed().as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic() {
        let a = time_ms();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let b = time_ms();
        assert!(b >= a + 4);
    }
}
