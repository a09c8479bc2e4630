// dedupe-coordinator: per-request state carried between the data path, the
// index queue, and the timeout path.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::advice::Advice;

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(0);

/// The content address of a data block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkName(pub [u8; 32]);

/// Identifies a [`RequestHandle`]; assigned once, at handle creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(pub(crate) u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationType {
    Post,
    Query,
    Update,
}

/// The authoritative request lifecycle. Only the owning dispatch call may
/// move a request `Idle -> Busy`; only the engine's completion callback may
/// move it out of `Busy`; only the timeout path may move `Busy -> TimedOut`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum RequestState {
    Idle = 0,
    Busy = 1,
    TimedOut = 2,
}

impl RequestState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => RequestState::Idle,
            1 => RequestState::Busy,
            2 => RequestState::TimedOut,
            other => unreachable!("invalid request state byte {other}"),
        }
    }
}

/// A CAS-only tri-state atomic; deliberately not a mutex, so the timeout
/// path stays wait-free.
pub(crate) struct AtomicRequestState(AtomicU8);

impl AtomicRequestState {
    fn new(state: RequestState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub(crate) fn compare_exchange(&self, current: RequestState, new: RequestState) -> Result<RequestState, RequestState> {
        self.0
            .compare_exchange(current as u8, new as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(RequestState::from_u8)
            .map_err(RequestState::from_u8)
    }

    #[cfg(test)]
    pub(crate) fn load(&self) -> RequestState {
        RequestState::from_u8(self.0.load(Ordering::Acquire))
    }
}

/// Outcome delivered to the data path exactly once per submitted request.
#[derive(Debug, Clone)]
pub enum RequestStatus {
    Success,
    Timeout,
    Error(String),
}

#[derive(Debug, Clone)]
pub struct RequestOutcome {
    pub status: RequestStatus,
    pub advice: Option<Advice>,
}

impl RequestOutcome {
    pub(crate) fn no_advice(status: RequestStatus) -> Self {
        Self { status, advice: None }
    }
}

/// The data-path completion capability. Invoked exactly once per submitted
/// `post`/`query`/`update`.
pub type DataPathCallback = Arc<dyn Fn(RequestOutcome) + Send + Sync>;

/// Everything about a submission that must survive from `dispatch()` until
/// the completion or timeout path delivers it. Stored behind a lock rather
/// than threaded through closures, since those two paths run independently
/// of the call that originally set them.
struct RequestFields {
    operation: OperationType,
    callback: DataPathCallback,
}

pub(crate) struct RequestContext {
    pub(crate) id: RequestId,
    pub(crate) state: AtomicRequestState,
    fields: Mutex<Option<RequestFields>>,
}

impl RequestContext {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            id: RequestId(NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)),
            state: AtomicRequestState::new(RequestState::Idle),
            fields: Mutex::new(None),
        })
    }

    /// Called by the dispatcher immediately after it wins the `Idle ->
    /// Busy` CAS, while it has exclusive right to populate this slot.
    pub(crate) fn set_fields(&self, operation: OperationType, callback: DataPathCallback) {
        *self.fields.lock() = Some(RequestFields { operation, callback });
    }

    /// Read back `operation` and the callback. Must be called before the
    /// caller transitions this context back to `Idle` — once that happens
    /// a racing dispatch may immediately reuse the slot and overwrite both.
    pub(crate) fn snapshot(&self) -> (OperationType, DataPathCallback) {
        match self.fields.lock().as_ref() {
            Some(fields) => (fields.operation, Arc::clone(&fields.callback)),
            None => unreachable!("request context read before fields were set"),
        }
    }

    pub(crate) fn deliver(&self, outcome: RequestOutcome) {
        let (_, callback) = self.snapshot();
        callback(outcome);
    }

    #[cfg(test)]
    pub(crate) fn for_test() -> Arc<Self> {
        let ctx = Self::new();
        ctx.state.compare_exchange(RequestState::Idle, RequestState::Busy).expect("fresh context starts idle");
        ctx.set_fields(OperationType::Query, Arc::new(|_| {}));
        ctx
    }
}

/// A reusable per-request slot owned by the data path. Typically pooled —
/// one per concurrent submission the caller wants outstanding — and reused
/// for the next `post`/`query`/`update` once the previous submission has
/// been delivered. Reusing a handle whose previous request hasn't yet been
/// reclaimed is the "stale context" case the dispatcher rejects via CAS.
#[derive(Clone)]
pub struct RequestHandle(pub(crate) Arc<RequestContext>);

impl RequestHandle {
    pub fn new() -> Self {
        Self(RequestContext::new())
    }
}

impl Default for RequestHandle {
    fn default() -> Self {
        Self::new()
    }
}
