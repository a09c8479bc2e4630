// dedupe-coordinator: request dispatch and completion
//
// Owns the inflight table and the atomic bookkeeping the data path relies
// on. Every method here must return without ever holding `state`/`pending`
// locks across an `.await` on the engine.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use dashmap::DashMap;

use crate::advice::{self, Advice};
use crate::engine::{ChunkCompletion, ChunkOutcome, ChunkRequest, EngineError, IndexEngine};
use crate::pending::PendingTracker;
use crate::queue::IndexQueueHandle;
use crate::request::{
    ChunkName, DataPathCallback, OperationType, RequestContext, RequestHandle, RequestId, RequestOutcome,
    RequestState, RequestStatus,
};
use crate::session::StateLock;

/// Counters the dispatcher tracks locally, independent of whatever the
/// engine reports back through `get_session_stats`: how many submissions
/// were rejected before ever reaching the engine.
#[derive(Default)]
pub(crate) struct Stats {
    pub(crate) context_busy: AtomicU64,
}

/// Brokers every `post`/`query`/`update` between the data path and the
/// index engine: assigns request ids, tracks in-flight state, and runs the
/// timeout and completion paths.
pub(crate) struct Dispatcher {
    state: StateLock,
    pending: Arc<PendingTracker>,
    queue: IndexQueueHandle,
    engine: Arc<dyn IndexEngine>,
    reporter: Arc<crate::timeout_reporter::TimeoutReporter>,
    inflight: DashMap<RequestId, Arc<RequestContext>>,
    active: AtomicU64,
    maximum: AtomicU64,
    stats: Stats,
}

impl Dispatcher {
    pub(crate) fn new(
        weak_self: Weak<Dispatcher>,
        state: StateLock,
        queue: IndexQueueHandle,
        engine: Arc<dyn IndexEngine>,
        reporter: Arc<crate::timeout_reporter::TimeoutReporter>,
        timeout_interval: std::time::Duration,
        min_timer_interval: std::time::Duration,
    ) -> Self {
        let pending = PendingTracker::new(timeout_interval, min_timer_interval, weak_self);
        Self {
            state,
            pending,
            queue,
            engine,
            reporter,
            inflight: DashMap::new(),
            active: AtomicU64::new(0),
            maximum: AtomicU64::new(0),
            stats: Stats::default(),
        }
    }

    pub(crate) fn stats(&self) -> &Stats {
        &self.stats
    }

    pub(crate) fn active(&self) -> u64 {
        self.active.load(Ordering::Relaxed)
    }

    pub(crate) fn maximum(&self) -> u64 {
        self.maximum.load(Ordering::Relaxed)
    }

    /// Submit one request against a caller-owned, reusable [`RequestHandle`].
    /// Returns immediately; `callback` fires exactly once, either here
    /// (stale handle / not deduping) or later from the queue worker, the
    /// timeout path, or the engine's completion.
    ///
    /// Algorithm (spec §4.4): CAS the handle `Idle -> Busy` first — failure
    /// means a previous submission on this handle hasn't been reclaimed yet
    /// ("stale context"), which is rejected here before the index is even
    /// consulted. Only once that CAS succeeds do we populate the request
    /// and check whether the index is actually accepting work.
    pub(crate) fn dispatch(
        self: &Arc<Self>,
        handle: &RequestHandle,
        operation: OperationType,
        chunk_name: ChunkName,
        outbound: Option<Advice>,
        callback: DataPathCallback,
    ) {
        let ctx = Arc::clone(&handle.0);

        if ctx.state.compare_exchange(RequestState::Idle, RequestState::Busy).is_err() {
            self.stats.context_busy.fetch_add(1, Ordering::Relaxed);
            callback(RequestOutcome::no_advice(RequestStatus::Error("context busy".to_string())));
            return;
        }
        ctx.set_fields(operation, callback);

        let (deduping, session) = {
            let state = self.state.lock();
            (state.deduping, state.session)
        };

        let session = match (deduping, session) {
            (true, Some(session)) => session,
            _ => {
                let _ = ctx.state.compare_exchange(RequestState::Busy, RequestState::Idle);
                ctx.deliver(RequestOutcome::no_advice(RequestStatus::Error("index not open".to_string())));
                return;
            }
        };

        self.inflight.insert(ctx.id, Arc::clone(&ctx));
        let active = self.active.fetch_add(1, Ordering::Relaxed) + 1;
        self.maximum.fetch_max(active, Ordering::Relaxed);

        let this = Arc::clone(self);
        let id = ctx.id;
        self.queue.submit(move || async move {
            this.pending.add(Arc::clone(&ctx));

            let outbound_bytes = outbound.map(advice::encode);
            let request = ChunkRequest {
                request_id: id,
                session,
                chunk_name,
                operation,
                update: matches!(operation, OperationType::Update),
                outbound: outbound_bytes,
                completion: Arc::clone(&this) as Arc<dyn ChunkCompletion>,
            };

            if let Err(error) = this.engine.start_chunk_operation(request).await {
                this.complete(id, Err(error)).await;
            }
        });
    }

    /// Called from the pending tracker's timer task when a request has
    /// aged past the timeout interval without completing.
    pub(crate) fn on_timeout(&self, ctx: Arc<RequestContext>) {
        if ctx.state.compare_exchange(RequestState::Busy, RequestState::TimedOut).is_err() {
            // Already completed by the engine between expiry scan and here.
            return;
        }

        self.inflight.remove(&ctx.id);
        self.active.fetch_sub(1, Ordering::Relaxed);
        ctx.deliver(RequestOutcome::no_advice(RequestStatus::Timeout));
        self.reporter.increment();
    }
}

#[async_trait]
impl ChunkCompletion for Dispatcher {
    async fn complete(&self, request_id: RequestId, result: Result<ChunkOutcome, EngineError>) {
        let ctx = match self.inflight.get(&request_id) {
            Some(entry) => Arc::clone(entry.value()),
            None => return,
        };

        // Snapshot before attempting to release the slot: once the CAS
        // below succeeds, a racing dispatch on the same handle may
        // immediately overwrite these fields.
        let (operation, callback) = ctx.snapshot();

        if ctx.state.compare_exchange(RequestState::Busy, RequestState::Idle).is_ok() {
            self.pending.remove(request_id);
            self.inflight.remove(&request_id);
            self.active.fetch_sub(1, Ordering::Relaxed);

            match result {
                Ok(outcome) => {
                    let advice = match operation {
                        OperationType::Update => None,
                        _ => advice::decode(outcome.found, true, &outcome.metadata),
                    };
                    callback(RequestOutcome { status: RequestStatus::Success, advice });
                }
                Err(error) => {
                    callback(RequestOutcome::no_advice(RequestStatus::Error(error.to_string())));
                }
            }
            return;
        }

        // Lost the race to the timeout path: the request already timed out
        // and was delivered. Reclaim the slot so it can be reused, but do
        // not call back twice.
        if ctx.state.compare_exchange(RequestState::TimedOut, RequestState::Idle).is_ok() {
            self.inflight.remove(&request_id);
        }
    }
}
