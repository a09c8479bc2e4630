// dedupe-coordinator: error types

use thiserror::Error;

use crate::engine::EngineError;

/// Result alias used throughout the coordinator's public API.
pub type CoordinatorResult<T> = Result<T, CoordinatorError>;

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("index engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("coordinator is shutting down")]
    ShuttingDown,
}
