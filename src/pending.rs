// dedupe-coordinator: pending-request tracking and timeout detection
//
// The teacher's request table is pointer-intrusive (C struct embedding its
// own list links); we use an indexed slab instead, which keeps everything
// safe while preserving O(1) push/remove and in-order expiry scanning.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::request::{RequestContext, RequestId};

struct Slot {
    ctx: Arc<RequestContext>,
    submission_time: Instant,
    prev: Option<usize>,
    next: Option<usize>,
}

/// FIFO list of in-flight requests, indexed by [`RequestId`] for O(1)
/// removal on early completion.
struct SlabList {
    slots: Vec<Option<Slot>>,
    free: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
    index: HashMap<RequestId, usize>,
}

impl SlabList {
    fn new() -> Self {
        Self { slots: Vec::new(), free: Vec::new(), head: None, tail: None, index: HashMap::new() }
    }

    fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    fn push_back(&mut self, ctx: Arc<RequestContext>, submission_time: Instant) {
        let id = ctx.id;
        let slot = Slot { ctx, submission_time, prev: self.tail, next: None };
        let at = match self.free.pop() {
            Some(at) => {
                self.slots[at] = Some(slot);
                at
            }
            None => {
                self.slots.push(Some(slot));
                self.slots.len() - 1
            }
        };

        if let Some(tail) = self.tail {
            self.slots[tail].as_mut().expect("tail slot occupied").next = Some(at);
        } else {
            self.head = Some(at);
        }
        self.tail = Some(at);
        self.index.insert(id, at);
    }

    fn unlink(&mut self, at: usize) -> Slot {
        let slot = self.slots[at].take().expect("unlink of empty slot");
        match slot.prev {
            Some(prev) => self.slots[prev].as_mut().expect("prev slot occupied").next = slot.next,
            None => self.head = slot.next,
        }
        match slot.next {
            Some(next) => self.slots[next].as_mut().expect("next slot occupied").prev = slot.prev,
            None => self.tail = slot.prev,
        }
        self.free.push(at);
        self.index.remove(&slot.ctx.id);
        slot
    }

    /// Remove a request before it expires, e.g. on normal completion.
    fn remove(&mut self, id: RequestId) -> bool {
        match self.index.get(&id).copied() {
            Some(at) => {
                self.unlink(at);
                true
            }
            None => false,
        }
    }

    fn pop_front_if_expired(&mut self, cutoff: Instant) -> Option<Arc<RequestContext>> {
        let head = self.head?;
        let submission_time = self.slots[head].as_ref().expect("head slot occupied").submission_time;
        if submission_time > cutoff {
            return None;
        }
        Some(self.unlink(head).ctx)
    }

    fn front_deadline(&self, timeout_interval: Duration) -> Option<Instant> {
        let head = self.head?;
        Some(self.slots[head].as_ref().expect("head slot occupied").submission_time + timeout_interval)
    }
}

struct Inner {
    list: SlabList,
}

/// Tracks every in-flight request in submission order and fires the
/// dispatcher's timeout path for whatever has aged past
/// `timeout_interval` when the timer wakes.
pub(crate) struct PendingTracker {
    inner: Mutex<Inner>,
    notify: Notify,
    timeout_interval: Duration,
    min_timer_interval: Duration,
    dispatcher: Weak<crate::dispatcher::Dispatcher>,
}

impl PendingTracker {
    pub(crate) fn new(
        timeout_interval: Duration,
        min_timer_interval: Duration,
        dispatcher: Weak<crate::dispatcher::Dispatcher>,
    ) -> Arc<Self> {
        let tracker = Arc::new(Self {
            inner: Mutex::new(Inner { list: SlabList::new() }),
            notify: Notify::new(),
            timeout_interval,
            min_timer_interval,
            dispatcher,
        });
        tokio::spawn(Arc::clone(&tracker).timer_loop());
        tracker
    }

    pub(crate) fn add(&self, ctx: Arc<RequestContext>) {
        let was_empty = {
            let mut inner = self.inner.lock();
            let was_empty = inner.list.is_empty();
            inner.list.push_back(ctx, Instant::now());
            was_empty
        };
        if was_empty {
            self.notify.notify_one();
        }
    }

    pub(crate) fn remove(&self, id: RequestId) {
        self.inner.lock().list.remove(id);
    }

    async fn timer_loop(self: Arc<Self>) {
        loop {
            let deadline = {
                let inner = self.inner.lock();
                inner.list.front_deadline(self.timeout_interval)
            };

            match deadline {
                None => self.notify.notified().await,
                Some(deadline) => {
                    let wake_at = deadline.max(Instant::now() + self.min_timer_interval);
                    tokio::select! {
                        _ = tokio::time::sleep_until(wake_at.into()) => self.on_timer(),
                        _ = self.notify.notified() => {}
                    }
                }
            }
        }
    }

    fn on_timer(&self) {
        let cutoff = Instant::now() - self.timeout_interval;
        let mut expired = Vec::new();
        {
            let mut inner = self.inner.lock();
            while let Some(ctx) = inner.list.pop_front_if_expired(cutoff) {
                expired.push(ctx);
            }
        }

        if expired.is_empty() {
            return;
        }

        if let Some(dispatcher) = self.dispatcher.upgrade() {
            for ctx in expired {
                dispatcher.on_timeout(ctx);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::RequestContext;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn context() -> Arc<RequestContext> {
        RequestContext::for_test()
    }

    #[test]
    fn fifo_order_is_preserved_across_removal() {
        let mut list = SlabList::new();
        let now = Instant::now();
        let a = context();
        let b = context();
        let c = context();
        let (a_id, b_id, c_id) = (a.id, b.id, c.id);
        list.push_back(a, now);
        list.push_back(b, now);
        list.push_back(c, now);

        assert!(list.remove(b_id));
        let cutoff = now + Duration::from_secs(1);
        assert_eq!(list.pop_front_if_expired(cutoff).unwrap().id, a_id);
        assert_eq!(list.pop_front_if_expired(cutoff).unwrap().id, c_id);
        assert!(list.is_empty());
    }

    #[test]
    fn removing_twice_is_a_no_op() {
        let mut list = SlabList::new();
        let a = context();
        let a_id = a.id;
        list.push_back(a, Instant::now());
        assert!(list.remove(a_id));
        assert!(!list.remove(a_id));
    }

    #[test]
    fn reused_slots_do_not_confuse_the_index() {
        let mut list = SlabList::new();
        let now = Instant::now();
        let a = context();
        let a_id = a.id;
        list.push_back(a, now);
        list.remove(a_id);
        let b = context();
        let b_id = b.id;
        list.push_back(b, now);
        let cutoff = now + Duration::from_secs(1);
        assert_eq!(list.pop_front_if_expired(cutoff).unwrap().id, b_id);
    }

    #[tokio::test]
    async fn pending_without_dispatcher_does_not_panic_on_timeout() {
        // A tracker whose dispatcher has already been dropped must simply
        // drop expired entries rather than panic on `Weak::upgrade`.
        let tracker = PendingTracker::new(Duration::from_millis(5), Duration::from_millis(2), Weak::new());
        let fired = Arc::new(AtomicU32::new(0));
        let fired_clone = Arc::clone(&fired);
        let ctx = RequestContext::for_test();
        ctx.set_fields(
            crate::request::OperationType::Post,
            Arc::new(move |_| {
                fired_clone.fetch_add(1, Ordering::SeqCst);
            }),
        );
        tracker.add(ctx);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
