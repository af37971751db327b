//! Shared plumbing for the ping and trace drivers

use crate::manager::ProbeManager;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

/// Back-off while the manager's in-flight queue is above the concurrency cap.
pub(crate) const QUEUE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Poll interval while waiting for the in-flight queue to drain.
pub(crate) const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Ties a driver session to its manager: dropping the guard (normal return
/// or task cancellation at any suspend point) stops the manager, which
/// forces outstanding probes to `Timeout`, and releases the active flag.
pub(crate) struct SessionGuard<'a> {
    active: &'a AtomicBool,
    manager: Arc<ProbeManager>,
}

impl<'a> SessionGuard<'a> {
    pub(crate) fn new(active: &'a AtomicBool, manager: Arc<ProbeManager>) -> Self {
        Self { active, manager }
    }
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        self.manager.stop();
        self.active.store(false, Ordering::SeqCst);
    }
}

/// Releases an active flag on drop, for drivers without a manager of their
/// own to tear down.
pub(crate) struct ActiveGuard<'a> {
    active: &'a AtomicBool,
}

impl<'a> ActiveGuard<'a> {
    pub(crate) fn new(active: &'a AtomicBool) -> Self {
        Self { active }
    }
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.active.store(false, Ordering::SeqCst);
    }
}

/// Wait until the manager has no probes in flight.
pub(crate) async fn drain(manager: &ProbeManager) {
    while manager.queue_size() > 0 {
        sleep(DRAIN_POLL_INTERVAL).await;
    }
}
