//! Connection liveness monitoring.
//!
//! The monitor tracks the last inbound and outbound activity on a
//! transport. When nothing has been written for half the negotiated
//! inactivity window, the I/O loop emits a keep-alive; when nothing has
//! been read for the full window, the peer is declared dead and the
//! transport fails. A zero window disables monitoring entirely.

use tokio::time::{Duration, Instant};

#[derive(Debug)]
pub(crate) struct InactivityMonitor {
    read_window: Duration,
    write_window: Duration,
    last_read: Instant,
    last_write: Instant,
    enabled: bool,
}

impl InactivityMonitor {
    pub(crate) fn new(max_inactivity: Duration) -> Self {
        let now = Instant::now();
        Self {
            read_window: max_inactivity,
            write_window: max_inactivity / 2,
            last_read: now,
            last_write: now,
            enabled: !max_inactivity.is_zero(),
        }
    }

    pub(crate) fn enabled(&self) -> bool {
        self.enabled
    }

    pub(crate) fn record_read(&mut self) {
        self.last_read = Instant::now();
    }

    pub(crate) fn record_write(&mut self) {
        self.last_write = Instant::now();
    }

    /// When the next keep-alive is due, assuming no further writes.
    pub(crate) fn write_check_at(&self) -> Instant {
        self.last_write + self.write_window
    }

    /// When the peer is considered dead, assuming no further reads.
    pub(crate) fn read_check_at(&self) -> Instant {
        self.last_read + self.read_window
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn write_check_fires_at_half_the_window() {
        let monitor = InactivityMonitor::new(Duration::from_millis(1000));
        let start = Instant::now();
        assert_eq!(monitor.write_check_at() - start, Duration::from_millis(500));
        assert_eq!(monitor.read_check_at() - start, Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn activity_pushes_the_deadlines_out() {
        let mut monitor = InactivityMonitor::new(Duration::from_millis(1000));
        tokio::time::advance(Duration::from_millis(400)).await;
        monitor.record_read();
        monitor.record_write();
        let now = Instant::now();
        assert_eq!(monitor.write_check_at() - now, Duration::from_millis(500));
        assert_eq!(monitor.read_check_at() - now, Duration::from_millis(1000));
    }

    #[test]
    fn zero_window_disables_monitoring() {
        let monitor = InactivityMonitor::new(Duration::ZERO);
        assert!(!monitor.enabled());
    }
}
