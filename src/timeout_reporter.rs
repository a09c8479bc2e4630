// dedupe-coordinator: coalesced, rate-limited timeout reporting
//
// Every timeout increments a counter immediately; at most one deferred log
// line per `interval` summarizes however many accumulated in the meantime,
// so a timeout storm produces one line instead of thousands.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub(crate) struct TimeoutReporter {
    counter: AtomicU64,
    last_reported: AtomicU64,
    scheduled: AtomicBool,
    interval: Duration,
}

impl TimeoutReporter {
    pub(crate) fn new(interval: Duration) -> Arc<Self> {
        Arc::new(Self {
            counter: AtomicU64::new(0),
            last_reported: AtomicU64::new(0),
            scheduled: AtomicBool::new(false),
            interval,
        })
    }

    pub(crate) fn count(&self) -> u64 {
        self.counter.load(Ordering::Relaxed)
    }

    /// Record one more timeout and, if no report is already pending, arm a
    /// deferred one.
    pub(crate) fn increment(self: &Arc<Self>) {
        self.counter.fetch_add(1, Ordering::Relaxed);

        if self.scheduled.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_ok() {
            let this = Arc::clone(self);
            tokio::spawn(async move {
                tokio::time::sleep(this.interval).await;
                this.report();
            });
        }
    }

    fn report(&self) {
        self.scheduled.store(false, Ordering::Release);
        let total = self.counter.load(Ordering::Relaxed);
        let previous = self.last_reported.swap(total, Ordering::AcqRel);
        let diff = total.saturating_sub(previous);
        if diff != 0 {
            tracing::warn!("UDS index timeout on {diff} requests");
        }
    }

    /// Force an immediate report of whatever has accumulated, used on
    /// shutdown so no timeouts go unlogged.
    pub(crate) fn flush(&self) {
        self.report();
    }
}
