//! A concurrent request/session coordinator that brokers block-dedup
//! advice between a data path and an opaque content-address index engine.
//!
//! The coordinator itself never interprets chunk contents; it assigns
//! request identities, enforces a single in-flight request per submission
//! slot, detects and reports timeouts, and drives the index session
//! through its open/close lifecycle. Everything below [`IndexEngine`] is
//! swappable.

mod advice;
mod config;
mod coordinator;
mod dispatcher;
mod engine;
mod error;
mod pending;
mod queue;
mod request;
mod session;
mod timeout_reporter;

pub use advice::{decode, encode, Advice, ADVICE_RECORD_LEN};
pub use config::CoordinatorConfig;
pub use coordinator::{Coordinator, CoordinatorStats};
pub use engine::{
    ChunkCompletion, ChunkOutcome, ChunkRequest, EngineError, IndexConfig, IndexEngine, IndexStats, Session,
    SessionStats,
};
pub use error::{CoordinatorError, CoordinatorResult};
pub use request::{ChunkName, DataPathCallback, OperationType, RequestHandle, RequestId, RequestOutcome, RequestStatus};
