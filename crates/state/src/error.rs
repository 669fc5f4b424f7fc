//! State store error types.

use haul_protocol::{JobId, JobStatus};

/// Errors produced by [`StateStore`](crate::StateStore) operations.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    /// File-system I/O failure.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// A persisted record could not be (de)serialized.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("job not found: {0}")]
    NotFound(JobId),

    #[error("job {job}: chunk {index} out of range")]
    ChunkOutOfRange { job: JobId, index: u32 },

    #[error("job {job}: invalid status transition {from} -> {to}")]
    InvalidTransition {
        job: JobId,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("job {job}: invalid chunk update: {reason}")]
    InvalidChunkUpdate { job: JobId, reason: String },

    /// The stored manifest violates its own invariants.
    #[error("corrupt manifest: {0}")]
    Corrupt(String),
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, StateError>;
