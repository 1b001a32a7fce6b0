//! Timer bookkeeping.
//!
//! The state machines (throttle polling, write coalescing) own plain timer
//! values; the server's event loop collects the earliest deadline and does
//! the actual sleeping.

use std::time::{Duration, Instant};

#[derive(Debug)]
pub(crate) struct Timer {
    running: bool,
    expiry: Instant,
}

impl Default for Timer {
    fn default() -> Self {
        Self {
            running: false,
            expiry: Instant::now(),
        }
    }
}

impl Timer {
    pub(crate) fn start(&mut self, v: Duration) {
        self.expiry = Instant::now() + v;
        self.running = true;
    }

    pub(crate) fn stop(&mut self) {
        self.running = false;
    }

    #[must_use]
    pub(crate) fn running(&self) -> bool {
        self.running
    }

    /// True once the deadline has passed. A stopped timer never expires.
    #[must_use]
    pub(crate) fn expired(&self) -> bool {
        self.running && Instant::now() >= self.expiry
    }

    #[must_use]
    pub(crate) fn deadline(&self) -> Option<Instant> {
        self.running.then_some(self.expiry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stopped_timer_never_expires() {
        let t = Timer::default();
        assert!(!t.expired());
        assert!(t.deadline().is_none());
    }

    #[test]
    fn start_and_stop() {
        let mut t = Timer::default();
        t.start(Duration::from_millis(0));
        assert!(t.running());
        assert!(t.expired());
        t.stop();
        assert!(!t.expired());
    }

    #[test]
    fn future_deadline_not_expired() {
        let mut t = Timer::default();
        t.start(Duration::from_secs(60));
        assert!(!t.expired());
        assert!(t.deadline().is_some());
    }
}
