// Shared test double for integration tests: an in-memory index engine with
// knobs for injecting the failure modes the session state machine needs to
// recover from (corrupt component, nonce mismatch, transient errors).

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dedupe_coordinator::{
    ChunkCompletion, ChunkOutcome, ChunkRequest, ChunkName, EngineError, IndexConfig, IndexEngine, IndexStats,
    OperationType, RequestId, Session, SessionStats, ADVICE_RECORD_LEN,
};
use tokio::sync::Mutex;

pub struct FakeEngine {
    pub seen: Mutex<HashSet<ChunkName>>,
    pub sessions: Mutex<HashMap<u64, u64>>,
    next_session: AtomicU64,
    pub fail_rebuild_corrupt: AtomicBool,
    pub configured_nonce: AtomicU64,
    pub reported_nonce: AtomicU64,
    pub drop_completions: AtomicBool,
    deferred: Mutex<Option<(RequestId, Arc<dyn ChunkCompletion>, ChunkOutcome)>>,
    posts_found: AtomicU64,
    posts_not_found: AtomicU64,
    queries_found: AtomicU64,
    queries_not_found: AtomicU64,
    updates_found: AtomicU64,
    updates_not_found: AtomicU64,
}

impl FakeEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            seen: Mutex::new(HashSet::new()),
            sessions: Mutex::new(HashMap::new()),
            next_session: AtomicU64::new(0),
            fail_rebuild_corrupt: AtomicBool::new(false),
            configured_nonce: AtomicU64::new(0),
            reported_nonce: AtomicU64::new(0),
            drop_completions: AtomicBool::new(false),
            deferred: Mutex::new(None),
            posts_found: AtomicU64::new(0),
            posts_not_found: AtomicU64::new(0),
            queries_found: AtomicU64::new(0),
            queries_not_found: AtomicU64::new(0),
            updates_found: AtomicU64::new(0),
            updates_not_found: AtomicU64::new(0),
        })
    }

    /// Actually deliver a completion that was swallowed earlier while
    /// `drop_completions` was set, exercising the coordinator's late-arrival
    /// handling instead of merely asserting it never fires.
    pub async fn fire_deferred_completion(&self) {
        let deferred = self.deferred.lock().await.take();
        if let Some((request_id, completion, outcome)) = deferred {
            completion.complete(request_id, Ok(outcome)).await;
        }
    }

    fn record(&self, operation: OperationType, found: bool) {
        let counter = match (operation, found) {
            (OperationType::Post, true) => &self.posts_found,
            (OperationType::Post, false) => &self.posts_not_found,
            (OperationType::Query, true) => &self.queries_found,
            (OperationType::Query, false) => &self.queries_not_found,
            (OperationType::Update, true) => &self.updates_found,
            (OperationType::Update, false) => &self.updates_not_found,
        };
        counter.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl IndexEngine for FakeEngine {
    async fn create_local_index(&self, _name: &str, config: &IndexConfig) -> Result<Session, EngineError> {
        let id = self.next_session.fetch_add(1, Ordering::SeqCst);
        self.sessions.lock().await.insert(id, config.nonce);
        self.configured_nonce.store(config.nonce, Ordering::SeqCst);
        self.reported_nonce.store(config.nonce, Ordering::SeqCst);
        Ok(Session(id))
    }

    async fn rebuild_local_index(&self, _name: &str) -> Result<Session, EngineError> {
        if self.fail_rebuild_corrupt.swap(false, Ordering::SeqCst) {
            return Err(EngineError::CorruptComponent);
        }
        let id = self.next_session.fetch_add(1, Ordering::SeqCst);
        self.sessions.lock().await.insert(id, self.reported_nonce.load(Ordering::SeqCst));
        Ok(Session(id))
    }

    async fn get_index_configuration(&self, _session: Session) -> Result<IndexConfig, EngineError> {
        Ok(IndexConfig { nonce: self.reported_nonce.load(Ordering::SeqCst) })
    }

    async fn close_index_session(&self, _session: Session) -> Result<(), EngineError> {
        Ok(())
    }

    async fn save_index(&self, _session: Session) -> Result<(), EngineError> {
        Ok(())
    }

    async fn flush_index_session(&self, _session: Session) -> Result<(), EngineError> {
        Ok(())
    }

    async fn start_chunk_operation(&self, request: ChunkRequest) -> Result<(), EngineError> {
        let mut seen = self.seen.lock().await;
        let found = seen.contains(&request.chunk_name);
        if matches!(request.operation, OperationType::Post) {
            seen.insert(request.chunk_name);
        }
        drop(seen);
        self.record(request.operation, found);

        let metadata: [u8; ADVICE_RECORD_LEN] = request.outbound.unwrap_or([0u8; ADVICE_RECORD_LEN]);
        let outcome = ChunkOutcome { found, metadata };

        if self.drop_completions.load(Ordering::SeqCst) {
            // Simulate a request the engine swallows until the timeout path
            // fires; the completion is stashed rather than discarded so a
            // test can later deliver it and observe it arrive too late.
            *self.deferred.lock().await = Some((request.request_id, request.completion, outcome));
            return Ok(());
        }

        request.completion.complete(request.request_id, Ok(outcome)).await;
        Ok(())
    }

    async fn get_index_stats(&self, _session: Session) -> Result<IndexStats, EngineError> {
        Ok(IndexStats { entries_indexed: self.seen.lock().await.len() as u64 })
    }

    async fn get_session_stats(&self, _session: Session) -> Result<SessionStats, EngineError> {
        Ok(SessionStats {
            requests_outstanding: 0,
            posts_found: self.posts_found.load(Ordering::SeqCst),
            posts_not_found: self.posts_not_found.load(Ordering::SeqCst),
            queries_found: self.queries_found.load(Ordering::SeqCst),
            queries_not_found: self.queries_not_found.load(Ordering::SeqCst),
            updates_found: self.updates_found.load(Ordering::SeqCst),
            updates_not_found: self.updates_not_found.load(Ordering::SeqCst),
        })
    }
}

pub fn chunk(byte: u8) -> ChunkName {
    let mut name = [0u8; 32];
    name[0] = byte;
    ChunkName(name)
}
