// dedupe-coordinator: the opaque content-address index engine surface
//
// Any equivalent backend satisfying this trait is acceptable; the
// coordinator never reaches past it into concrete storage. `tests/support`
// and `demos/` provide an in-memory `FakeEngine`.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::advice::ADVICE_RECORD_LEN;
use crate::request::{ChunkName, OperationType, RequestId};

/// An opened handle to the index. Valid only while the owning coordinator's
/// session state is `Opened`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Session(pub(crate) u64);

/// Engine-side configuration, read back after a rebuild to check the nonce.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexConfig {
    pub nonce: u64,
}

#[derive(Debug, Error)]
pub enum EngineError {
    /// Returned by `rebuild_local_index` when the on-disk index is damaged
    /// beyond repair; triggers an automatic retry as a fresh create.
    #[error("index component is corrupt")]
    CorruptComponent,
    /// Returned by `rebuild_local_index` when no index exists yet; also
    /// triggers an automatic retry as a fresh create.
    #[error("no index present")]
    NoIndex,
    /// Any other transient failure on a single call.
    #[error("index engine error: {0}")]
    Transient(String),
}

#[derive(Debug, Clone, Default)]
pub struct IndexStats {
    pub entries_indexed: u64,
}

/// Per-operation hit/miss counters the engine has observed for this
/// session, mirroring `udsGetIndexSessionStats`'s `postsFound`/
/// `postsNotFound`/`queriesFound`/`queriesNotFound`/`updatesFound`/
/// `updatesNotFound` in the original index engine.
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionStats {
    pub requests_outstanding: u64,
    pub posts_found: u64,
    pub posts_not_found: u64,
    pub queries_found: u64,
    pub queries_not_found: u64,
    pub updates_found: u64,
    pub updates_not_found: u64,
}

/// The result of a completed chunk operation, as reported by the engine.
#[derive(Debug, Clone)]
pub struct ChunkOutcome {
    pub found: bool,
    pub metadata: [u8; ADVICE_RECORD_LEN],
}

/// One outbound request to the engine. `completion` is the capability the
/// engine calls back into once the operation finishes, from any thread.
pub struct ChunkRequest {
    pub request_id: RequestId,
    pub session: Session,
    pub chunk_name: ChunkName,
    pub operation: OperationType,
    pub update: bool,
    pub outbound: Option<[u8; ADVICE_RECORD_LEN]>,
    pub completion: Arc<dyn ChunkCompletion>,
}

/// The callback capability buried in a [`ChunkRequest`]. Implementations
/// must be safe to call from any thread, synchronous or not.
#[async_trait]
pub trait ChunkCompletion: Send + Sync {
    async fn complete(&self, request_id: RequestId, result: Result<ChunkOutcome, EngineError>);
}

#[async_trait]
pub trait IndexEngine: Send + Sync + 'static {
    async fn create_local_index(&self, name: &str, config: &IndexConfig) -> Result<Session, EngineError>;
    async fn rebuild_local_index(&self, name: &str) -> Result<Session, EngineError>;
    async fn get_index_configuration(&self, session: Session) -> Result<IndexConfig, EngineError>;
    async fn close_index_session(&self, session: Session) -> Result<(), EngineError>;
    async fn save_index(&self, session: Session) -> Result<(), EngineError>;
    async fn flush_index_session(&self, session: Session) -> Result<(), EngineError>;
    /// Starts an async chunk operation. A synchronous `Err` here means the
    /// operation never started and `completion` will *not* be invoked by
    /// the engine; the caller is responsible for completing it directly.
    async fn start_chunk_operation(&self, request: ChunkRequest) -> Result<(), EngineError>;
    async fn get_index_stats(&self, session: Session) -> Result<IndexStats, EngineError>;
    async fn get_session_stats(&self, session: Session) -> Result<SessionStats, EngineError>;
}
