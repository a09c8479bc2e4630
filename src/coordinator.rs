// dedupe-coordinator: top-level facade
//
// Wires the dispatcher, session machine, pending tracker, and index queue
// together and exposes the narrow surface a data path actually needs.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex as PLMutex;
use tokio::task::JoinHandle;

use crate::advice::Advice;
use crate::config::CoordinatorConfig;
use crate::dispatcher::Dispatcher;
use crate::engine::{IndexEngine, SessionStats};
use crate::error::CoordinatorResult;
use crate::request::{ChunkName, DataPathCallback, OperationType, RequestHandle};
use crate::session::{SessionMachine, TargetState};
use crate::timeout_reporter::TimeoutReporter;

#[derive(Debug, Clone, Default)]
pub struct CoordinatorStats {
    pub current_queries: u64,
    pub max_queries: u64,
    pub timeout_count: u64,
    pub entries_indexed: u64,
    pub posts_found: u64,
    pub posts_not_found: u64,
    pub queries_found: u64,
    pub queries_not_found: u64,
    pub updates_found: u64,
    pub updates_not_found: u64,
    pub context_busy: u64,
}

/// Brokers dedup advice between a data path and an [`IndexEngine`],
/// tracking session lifecycle and per-request timeouts.
pub struct Coordinator {
    dispatcher: Arc<Dispatcher>,
    session: Arc<SessionMachine>,
    reporter: Arc<TimeoutReporter>,
    queue: crate::queue::IndexQueueHandle,
    queue_task: PLMutex<Option<JoinHandle<()>>>,
    entries_indexed: AtomicU64,
    session_stats: PLMutex<SessionStats>,
    engine: Arc<dyn IndexEngine>,
}

impl Coordinator {
    /// Build a coordinator. Purely in-memory: no engine I/O happens until
    /// [`Coordinator::start`] is called, so construction cannot fail.
    pub fn make(config: CoordinatorConfig, engine: Arc<dyn IndexEngine>) -> Arc<Self> {
        let (queue, queue_task) = crate::queue::spawn();
        let reporter = TimeoutReporter::new(config.reporting_interval());
        let session = SessionMachine::new(queue.clone(), Arc::clone(&engine), config.index_name(), config.nonce);

        let dispatcher = Arc::new_cyclic(|weak_self| {
            Dispatcher::new(
                weak_self.clone(),
                session.state_lock(),
                queue.clone(),
                Arc::clone(&engine),
                Arc::clone(&reporter),
                config.clamped_timeout_interval(),
                config.clamped_min_timer_interval(),
            )
        });

        Arc::new(Self {
            dispatcher,
            session,
            reporter,
            queue,
            queue_task: PLMutex::new(Some(queue_task)),
            entries_indexed: AtomicU64::new(0),
            session_stats: PLMutex::new(SessionStats::default()),
            engine,
        })
    }

    /// Request the index be opened, creating it fresh if `create` is set.
    pub fn start(self: &Arc<Self>, create: bool) {
        self.session.set_target_state(TargetState::Opened, Some(true), create);
    }

    /// Request the index be closed and wait until it settles into
    /// `closed` or `error`. Polls rather than waiting on a notification,
    /// which is adequate for the coarse granularity shutdown happens at.
    pub async fn stop(self: &Arc<Self>) {
        self.session.set_target_state(TargetState::Closed, None, false);
        loop {
            match self.session.status() {
                "closed" | "error" => break,
                _ => tokio::time::sleep(Duration::from_millis(5)).await,
            }
        }
    }

    /// Flush any pending timeout report and drain the index queue.
    pub async fn finish(self: &Arc<Self>) {
        self.reporter.flush();
        self.queue.shutdown();
        let handle = self.queue_task.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    pub fn message(self: &Arc<Self>, message: &str) -> CoordinatorResult<()> {
        self.session.handle_message(message)
    }

    pub fn status(&self) -> &'static str {
        self.session.status()
    }

    pub async fn suspend(self: &Arc<Self>, save: bool) {
        self.session.suspend(save).await;
    }

    pub fn post(self: &Arc<Self>, handle: &RequestHandle, chunk_name: ChunkName, advice: Advice, callback: DataPathCallback) {
        self.dispatcher.dispatch(handle, OperationType::Post, chunk_name, Some(advice), callback);
    }

    pub fn query(self: &Arc<Self>, handle: &RequestHandle, chunk_name: ChunkName, callback: DataPathCallback) {
        self.dispatcher.dispatch(handle, OperationType::Query, chunk_name, None, callback);
    }

    pub fn update(self: &Arc<Self>, handle: &RequestHandle, chunk_name: ChunkName, advice: Advice, callback: DataPathCallback) {
        self.dispatcher.dispatch(handle, OperationType::Update, chunk_name, Some(advice), callback);
    }

    /// Refresh the cached `entries_indexed` counter and the engine-reported
    /// per-operation hit/miss counters, if the index is currently open. A
    /// no-op otherwise. Mirrors `udsGetIndexStats`/`udsGetIndexSessionStats`
    /// in the original index engine.
    pub async fn refresh_index_stats(self: &Arc<Self>) {
        let session = self.session.state_lock().lock().session;
        if let Some(session) = session {
            if let Ok(stats) = self.engine.get_index_stats(session).await {
                self.entries_indexed.store(stats.entries_indexed, Ordering::Relaxed);
            }
            if let Ok(session_stats) = self.engine.get_session_stats(session).await {
                *self.session_stats.lock() = session_stats;
            }
        }
    }

    pub fn stats(&self) -> CoordinatorStats {
        let session_stats = *self.session_stats.lock();
        CoordinatorStats {
            current_queries: self.dispatcher.active(),
            max_queries: self.dispatcher.maximum(),
            timeout_count: self.reporter.count(),
            entries_indexed: self.entries_indexed.load(Ordering::Relaxed),
            posts_found: session_stats.posts_found,
            posts_not_found: session_stats.posts_not_found,
            queries_found: session_stats.queries_found,
            queries_not_found: session_stats.queries_not_found,
            updates_found: session_stats.updates_found,
            updates_not_found: session_stats.updates_not_found,
            context_busy: self.dispatcher.stats().context_busy.load(Ordering::Relaxed),
        }
    }
}
