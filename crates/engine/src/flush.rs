//! Deferred flush coalescing
//!
//! Every mutation on a block schedules a deferred flush unless one is
//! already pending; an explicit flush runs immediately. At most one
//! deferred flush exists per block at any time, executed by a short-lived
//! background thread after the configured delay.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use torus_store::Store;
use tracing::error;

/// Per-block deferred-flush state
#[derive(Debug)]
pub struct FlushScheduler {
    delay: Duration,
    pending: Arc<AtomicBool>,
}

impl FlushScheduler {
    /// Scheduler flushing `delay` after the first request of a batch.
    /// A zero delay makes every request flush immediately.
    pub fn new(delay: Duration) -> Self {
        FlushScheduler {
            delay,
            pending: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Request a deferred flush; coalesces into the pending one if any
    pub fn request(&self, store: &Arc<dyn Store>) {
        if self.delay.is_zero() {
            if let Err(e) = store.flush() {
                error!(error = %e, "flush failed");
            }
            return;
        }
        if self.pending.swap(true, Ordering::SeqCst) {
            return; // one deferred flush is already scheduled
        }
        let store = store.clone();
        let pending = self.pending.clone();
        let delay = self.delay;
        std::thread::spawn(move || {
            std::thread::sleep(delay);
            pending.store(false, Ordering::SeqCst);
            if let Err(e) = store.flush() {
                error!(error = %e, "deferred flush failed");
            }
        });
    }

    /// Flush immediately, regardless of pending deferred work
    pub fn flush_now(&self, store: &Arc<dyn Store>) -> torus_core::Result<()> {
        store.flush()
    }

    /// Whether a deferred flush is scheduled but not yet executed
    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::SeqCst)
    }
}
