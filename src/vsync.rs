//! Vsync and frame-done notifier
//!
//! Interrupt handlers call [`VsyncNotifier::vsync`] and
//! [`VsyncNotifier::frame_done`]. Those only bump a counter, record a
//! timestamp, and wake waiters. Everything else happens on the waiting side.

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Refresh-cycle signal source for one pipeline
#[derive(Debug, Default)]
pub struct VsyncNotifier {
    vsync_seq: AtomicU64,
    frame_done_seq: AtomicU64,
    last_vsync: Mutex<Option<Instant>>,
    cond: Condvar,
}

impl VsyncNotifier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Vertical-sync interrupt
    pub fn vsync(&self) {
        let mut last = self.last_vsync.lock();
        *last = Some(Instant::now());
        self.vsync_seq.fetch_add(1, Ordering::Release);
        self.cond.notify_all();
    }

    /// Frame-done interrupt
    pub fn frame_done(&self) {
        let _guard = self.last_vsync.lock();
        self.frame_done_seq.fetch_add(1, Ordering::Release);
        self.cond.notify_all();
    }

    pub fn vsync_seq(&self) -> u64 {
        self.vsync_seq.load(Ordering::Acquire)
    }

    pub fn frame_done_seq(&self) -> u64 {
        self.frame_done_seq.load(Ordering::Acquire)
    }

    /// Time of the most recent vsync
    pub fn last_vsync(&self) -> Option<Instant> {
        *self.last_vsync.lock()
    }

    /// Block until a vsync newer than `seq` arrives. Returns its sequence
    /// number, or `None` at the deadline.
    pub fn wait_vsync_after(&self, seq: u64, deadline: Instant) -> Option<u64> {
        self.wait_counter(&self.vsync_seq, seq, deadline)
    }

    /// Block until a frame-done newer than `seq` arrives
    pub fn wait_frame_done_after(&self, seq: u64, deadline: Instant) -> Option<u64> {
        self.wait_counter(&self.frame_done_seq, seq, deadline)
    }

    /// Block until the next vsync
    pub fn wait_next_vsync(&self, timeout: Duration) -> Option<u64> {
        self.wait_vsync_after(self.vsync_seq(), Instant::now() + timeout)
    }

    fn wait_counter(&self, counter: &AtomicU64, seq: u64, deadline: Instant) -> Option<u64> {
        let mut guard = self.last_vsync.lock();
        loop {
            let now = counter.load(Ordering::Acquire);
            if now > seq {
                return Some(now);
            }
            if self.cond.wait_until(&mut guard, deadline).timed_out() {
                let now = counter.load(Ordering::Acquire);
                return (now > seq).then_some(now);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_wait_returns_on_vsync() {
        let notifier = VsyncNotifier::new();
        let n = Arc::clone(&notifier);
        let handle = thread::spawn(move || n.wait_next_vsync(Duration::from_secs(2)));
        thread::sleep(Duration::from_millis(10));
        notifier.vsync();
        assert_eq!(handle.join().unwrap(), Some(1));
        assert!(notifier.last_vsync().is_some());
    }

    #[test]
    fn test_wait_times_out_without_interrupt() {
        let notifier = VsyncNotifier::new();
        assert_eq!(notifier.wait_next_vsync(Duration::from_millis(5)), None);
        assert_eq!(notifier.last_vsync(), None);
    }

    #[test]
    fn test_already_passed_sequence_returns_immediately() {
        let notifier = VsyncNotifier::new();
        notifier.vsync();
        notifier.vsync();
        assert_eq!(notifier.wait_vsync_after(0, Instant::now()), Some(2));
    }

    #[test]
    fn test_frame_done_counter_is_separate() {
        let notifier = VsyncNotifier::new();
        notifier.frame_done();
        assert_eq!(notifier.vsync_seq(), 0);
        assert_eq!(
            notifier.wait_frame_done_after(0, Instant::now() + Duration::from_millis(1)),
            Some(1)
        );
    }
}
