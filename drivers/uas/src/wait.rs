//! Bounded wait for the active set to drain.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::transport::Clock;

/// Wake counter polled by the drain waiter
#[derive(Debug, Default)]
pub(crate) struct WaitQueue {
    wakeups: AtomicU64,
}

impl WaitQueue {
    pub(crate) const fn new() -> Self {
        Self { wakeups: AtomicU64::new(0) }
    }

    /// Signal any waiter
    pub(crate) fn wake(&self) {
        self.wakeups.fetch_add(1, Ordering::Release);
    }

    /// Wait until `condition` holds or `timeout_ms` elapses
    ///
    /// `condition` is re-evaluated only after a wake-up, so it may take the
    /// session lock without contending with the completion path.
    pub(crate) fn wait_timeout<C, F>(&self, clock: &C, timeout_ms: u64, mut condition: F) -> bool
    where
        C: Clock + ?Sized,
        F: FnMut() -> bool,
    {
        let deadline = clock.now_ms().saturating_add(timeout_ms);
        loop {
            let seen = self.wakeups.load(Ordering::Acquire);
            if condition() {
                return true;
            }
            while self.wakeups.load(Ordering::Acquire) == seen {
                if clock.now_ms() >= deadline {
                    return condition();
                }
                clock.relax();
            }
        }
    }
}
