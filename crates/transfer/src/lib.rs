//! Chunk-level building blocks of the haul transfer engine: integrity
//! digests, bandwidth throttling, retry/backoff decisions, chunk planning
//! and progress coalescing.

pub mod chunked;
pub mod planner;
pub mod progress;
pub mod retry;
pub mod throttle;
pub mod validation;

pub use chunked::{
    LocalDigests, calculate_file_checksum, checksum_bytes, combine_chunk_digests, combine_ordered,
    combine_digests, digest_file_ranges, empty_digest, is_composite, read_range, stale_chunk_claims,
    verify, write_range,
};
pub use planner::{PlanRequest, chunk_size_for, coverage_check, plan};
pub use progress::{ProgressCallback, ProgressReporter};
pub use retry::{RetryController, RetryDecision, classify_io};
pub use throttle::Throttle;
pub use validation::ObjectLocator;

use haul_protocol::ErrorClass;

/// Errors produced by the transfer crate.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("integrity mismatch: expected {expected}, got {actual}")]
    IntegrityMismatch { expected: String, actual: String },

    #[error("chunk {0} has no digest")]
    MissingDigest(u32),

    #[error("manifest coverage error: {0}")]
    Coverage(String),
}

impl TransferError {
    /// Maps the error onto the shared taxonomy.
    pub fn class(&self) -> ErrorClass {
        match self {
            TransferError::Io(e) => classify_io(e),
            TransferError::InvalidRequest(_) => ErrorClass::InvalidRequest,
            TransferError::IntegrityMismatch { .. } | TransferError::MissingDigest(_) => {
                ErrorClass::IntegrityMismatch
            }
            TransferError::Coverage(_) => ErrorClass::Permanent,
        }
    }
}
