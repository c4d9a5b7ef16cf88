use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;

/// A one-shot latch for tearing down cooperating tasks: accept loops, the
///  per-connection drivers, the tick task and the dispatch task all park on
///  [ShutdownLatch::wait] next to their regular work and stop when it trips.
///
/// Tripping is idempotent; `trigger` reports whether this call was the one
///  that actually tripped the latch so callers can make teardown side effects
///  run exactly once.
pub(crate) struct ShutdownLatch {
    triggered: AtomicBool,
    notify: Notify,
}

impl ShutdownLatch {
    pub fn new() -> ShutdownLatch {
        ShutdownLatch {
            triggered: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    /// Trip the latch, waking all waiters. Returns true iff the latch was not
    ///  tripped before.
    pub fn trigger(&self) -> bool {
        let was_first = !self.triggered.swap(true, Ordering::AcqRel);
        if was_first {
            self.notify.notify_waiters();
        }
        was_first
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::Acquire)
    }

    /// Completes when the latch is tripped (immediately if it already was).
    pub async fn wait(&self) {
        loop {
            if self.is_triggered() {
                return;
            }

            let notified = self.notify.notified();
            tokio::pin!(notified);
            // register as a waiter before the final check so a concurrent
            //  trigger() cannot slip between check and await
            notified.as_mut().enable();

            if self.is_triggered() {
                return;
            }
            notified.await;
        }
    }
}
