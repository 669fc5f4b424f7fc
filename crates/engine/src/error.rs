//! Engine error types.

use std::time::Duration;

use haul_protocol::{ErrorClass, JobId};

use crate::object_store::StoreError;

/// Errors produced by the orchestrator and its chunk workers.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("object store error: {0}")]
    Store(#[from] StoreError),

    #[error("state error: {0}")]
    State(#[from] haul_state::StateError),

    #[error("transfer error: {0}")]
    Transfer(#[from] haul_transfer::TransferError),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("job not found: {0}")]
    JobNotFound(JobId),

    #[error("chunk timed out after {0:?}")]
    ChunkTimeout(Duration),

    #[error("integrity mismatch: expected {expected}, got {actual}")]
    IntegrityMismatch { expected: String, actual: String },

    #[error("worker task failed: {0}")]
    Worker(String),
}

impl EngineError {
    /// Maps the error onto the shared taxonomy.
    pub fn class(&self) -> ErrorClass {
        match self {
            EngineError::Io(e) => haul_transfer::classify_io(e),
            EngineError::Store(e) => e.class(),
            EngineError::Transfer(e) => e.class(),
            EngineError::State(_) | EngineError::Worker(_) => ErrorClass::Permanent,
            EngineError::InvalidRequest(_) | EngineError::JobNotFound(_) => {
                ErrorClass::InvalidRequest
            }
            EngineError::ChunkTimeout(_) => ErrorClass::Transient,
            EngineError::IntegrityMismatch { .. } => ErrorClass::IntegrityMismatch,
        }
    }
}
