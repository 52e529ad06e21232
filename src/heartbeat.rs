//! Main loop liveness for watchdog supervision
//!
//! The main loop records a [`Heartbeat`] on every iteration. A watchdog
//! running from a timer interrupt reads it and resets the device when the
//! loop has not run for the configured timeout.
//!
//! # Safety Model
//!
//! The loop writes and the interrupt reads, so the timestamp sits in a
//! [`critical_section::Mutex`]. Every access disables interrupts for the
//! duration of a single copy, which keeps the read from tearing a
//! half-written 64-bit value on 32-bit cores.
//!
//! # Example
//!
//! ```rust
//! use embassy_time::{Duration, Instant};
//! use luxmeter::heartbeat::Heartbeat;
//!
//! static HEARTBEAT: Heartbeat = Heartbeat::new(Instant::MIN);
//!
//! fn on_loop(now: Instant) {
//!     HEARTBEAT.beat(now);
//! }
//!
//! fn on_timer(now: Instant) -> bool {
//!     HEARTBEAT.stalled(now, Duration::from_secs(300))
//! }
//! ```

use core::cell::Cell;

use critical_section::Mutex;
use embassy_time::{Duration, Instant};

/// Timestamp of the last main loop iteration.
pub struct Heartbeat {
    last: Mutex<Cell<Instant>>,
}

impl Heartbeat {
    /// Creates a heartbeat last seen at `boot`.
    ///
    /// This is a `const fn`, so the heartbeat can live in a `static` that an
    /// interrupt handler can reach.
    #[inline]
    pub const fn new(boot: Instant) -> Self {
        Self {
            last: Mutex::new(Cell::new(boot)),
        }
    }

    /// Record a loop iteration at `now`.
    ///
    /// An older `now` is ignored, so the stored timestamp never moves
    /// backwards.
    #[inline]
    pub fn beat(&self, now: Instant) {
        critical_section::with(|cs| {
            let last = self.last.borrow(cs);
            if now > last.get() {
                last.set(now);
            }
        })
    }

    /// Timestamp of the last recorded iteration
    #[inline]
    pub fn last(&self) -> Instant {
        critical_section::with(|cs| self.last.borrow(cs).get())
    }

    /// Whether the loop has been silent for `timeout` or longer
    pub fn stalled(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last()) >= timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_at_boot() {
        let heartbeat = Heartbeat::new(Instant::from_millis(10));
        assert_eq!(heartbeat.last(), Instant::from_millis(10));
    }

    #[test]
    fn never_moves_backwards() {
        let heartbeat = Heartbeat::new(Instant::MIN);
        heartbeat.beat(Instant::from_millis(500));
        heartbeat.beat(Instant::from_millis(200));
        assert_eq!(heartbeat.last(), Instant::from_millis(500));
    }

    #[test]
    fn stalls_after_timeout() {
        let timeout = Duration::from_secs(300);
        let heartbeat = Heartbeat::new(Instant::MIN);
        heartbeat.beat(Instant::from_secs(10));

        assert!(!heartbeat.stalled(Instant::from_secs(309), timeout));
        assert!(heartbeat.stalled(Instant::from_secs(310), timeout));

        heartbeat.beat(Instant::from_secs(309));
        assert!(!heartbeat.stalled(Instant::from_secs(310), timeout));
    }

    #[test]
    fn can_be_static() {
        static HEARTBEAT: Heartbeat = Heartbeat::new(Instant::MIN);
        HEARTBEAT.beat(Instant::from_millis(1));
        assert!(HEARTBEAT.last() >= Instant::from_millis(1));
    }
}
