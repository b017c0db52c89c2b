//! Counting semaphore for the handshake.
//!
//! Each significant handshake transition (`Info`, `Deny`, `Delay`→`Ready`,
//! shutdown) posts once; the thread driving the handshake consumes permits
//! with timed waits. `std::sync` has no semaphore, so this is the classic
//! mutex-plus-condvar construction.

use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

pub(crate) struct Semaphore {
    permits: Mutex<usize>,
    cond: Condvar,
}

impl Semaphore {
    pub(crate) fn new() -> Self {
        Semaphore {
            permits: Mutex::new(0),
            cond: Condvar::new(),
        }
    }

    /// Release one permit and wake a waiter.
    pub(crate) fn post(&self) {
        *self.permits.lock().unwrap() += 1;
        self.cond.notify_one();
    }

    /// Acquire one permit, waiting forever.
    pub(crate) fn wait(&self) {
        let mut permits = self.permits.lock().unwrap();
        while *permits == 0 {
            permits = self.cond.wait(permits).unwrap();
        }
        *permits -= 1;
    }

    /// Acquire one permit within `timeout`. Returns false on timeout.
    pub(crate) fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut permits = self.permits.lock().unwrap();
        while *permits == 0 {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, result) = self.cond.wait_timeout(permits, deadline - now).unwrap();
            permits = guard;
            if result.timed_out() && *permits == 0 {
                return false;
            }
        }
        *permits -= 1;
        true
    }

    /// Discard all pending permits.
    pub(crate) fn reset(&self) {
        *self.permits.lock().unwrap() = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn post_then_wait_does_not_block() {
        let sem = Semaphore::new();
        sem.post();
        sem.wait();
    }

    #[test]
    fn wait_timeout_expires_without_permit() {
        let sem = Semaphore::new();
        assert!(!sem.wait_timeout(Duration::from_millis(20)));
    }

    #[test]
    fn wait_timeout_sees_cross_thread_post() {
        let sem = Arc::new(Semaphore::new());
        let poster = sem.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            poster.post();
        });
        assert!(sem.wait_timeout(Duration::from_secs(2)));
        handle.join().unwrap();
    }

    #[test]
    fn reset_discards_permits() {
        let sem = Semaphore::new();
        sem.post();
        sem.post();
        sem.reset();
        assert!(!sem.wait_timeout(Duration::from_millis(10)));
    }
}
