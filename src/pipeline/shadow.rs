//! Shadow-update guard
//!
//! At most one armed latch may be outstanding per pipeline. Whoever arms the
//! latch holds the guard until the hardware confirms it.

use parking_lot::{Condvar, Mutex};
use std::time::Instant;

#[derive(Debug, Default)]
pub(crate) struct ShadowGuard {
    pending: Mutex<bool>,
    cond: Condvar,
}

impl ShadowGuard {
    /// Claim the guard without waiting
    pub(crate) fn try_begin(&self) -> bool {
        let mut pending = self.pending.lock();
        if *pending {
            return false;
        }
        *pending = true;
        true
    }

    /// Claim the guard, waiting for a pending update until `deadline`
    pub(crate) fn begin(&self, deadline: Instant) -> bool {
        let mut pending = self.pending.lock();
        while *pending {
            if self.cond.wait_until(&mut pending, deadline).timed_out() && *pending {
                return false;
            }
        }
        *pending = true;
        true
    }

    pub(crate) fn end(&self) {
        *self.pending.lock() = false;
        self.cond.notify_all();
    }

    pub(crate) fn is_pending(&self) -> bool {
        *self.pending.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_second_claim_refused_until_end() {
        let guard = ShadowGuard::default();
        assert!(guard.try_begin());
        assert!(!guard.try_begin());
        assert!(!guard.begin(Instant::now() + Duration::from_millis(5)));
        guard.end();
        assert!(guard.begin(Instant::now()));
        assert!(guard.is_pending());
    }
}
