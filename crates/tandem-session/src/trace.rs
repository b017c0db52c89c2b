//! Per-session wire trace.
//!
//! When the `wire-trace` feature is enabled, every message the session sends
//! or receives is appended to `tandem.<ms>.log` (truncated on open) in the
//! form:
//!
//! ```text
//! [<ms>] <Kind> <frame_id> (<side>) <direction> (<peer_side>) <addr>:<port>
//! ```
//!
//! Without the feature this module compiles to no-ops, keeping the hot path
//! free of the formatting cost.

#[cfg(feature = "wire-trace")]
mod imp {
    use std::fs::File;
    use std::io::{BufWriter, Write};
    use std::sync::Mutex;
    use tandem_transport::{time_ms, Endpoint};

    pub(crate) struct WireTrace {
        file: Mutex<Option<BufWriter<File>>>,
    }

    impl WireTrace {
        pub(crate) fn new() -> Self {
            WireTrace {
                file: Mutex::new(None),
            }
        }

        pub(crate) fn open(&self) {
            let name = format!("tandem.{}.log", time_ms());
            match File::create(&name) {
                Ok(f) => *self.file.lock().unwrap() = Some(BufWriter::new(f)),
                Err(e) => tracing::warn!(error = %e, file = %name, "wire trace unavailable"),
            }
        }

        pub(crate) fn message(
            &self,
            kind: &str,
            frame_id: u64,
            side: u8,
            direction: &str,
            peer_side: u8,
            ep: Endpoint,
        ) {
            if let Some(f) = self.file.lock().unwrap().as_mut() {
                let _ = writeln!(
                    f,
                    "[{:>12}] {kind} {frame_id:>7} ({side}) {direction} ({peer_side}) {}:{}",
                    time_ms(),
                    ep.ip(),
                    ep.port(),
                );
            }
        }

        pub(crate) fn note(&self, text: &str) {
            if let Some(f) = self.file.lock().unwrap().as_mut() {
                let _ = writeln!(f, "[{:>12}] {text}", time_ms());
                let _ = f.flush();
            }
        }
    }
}

#[cfg(not(feature = "wire-trace"))]
mod imp {
    use tandem_transport::Endpoint;

    pub(crate) struct WireTrace;

    impl WireTrace {
        #[inline]
        pub(crate) fn new() -> Self {
            WireTrace
        }

        #[inline]
        pub(crate) fn open(&self) {}

        #[inline]
        pub(crate) fn message(
            &self,
            _kind: &str,
            _frame_id: u64,
            _side: u8,
            _direction: &str,
            _peer_side: u8,
            _ep: Endpoint,
        ) {
        }

        #[inline]
        pub(crate) fn note(&self, _text: &str) {}
    }
}

pub(crate) use imp::WireTrace;
