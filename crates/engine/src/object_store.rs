//! Remote object store boundary.
//!
//! The engine never talks to a cloud API directly. Callers hand it an
//! [`ObjectStore`] implementation; [`LocalObjectStore`](crate::LocalObjectStore)
//! is the filesystem-backed one used by the CLI and the tests.

use std::future::Future;
use std::io;
use std::pin::Pin;

use haul_protocol::ErrorClass;
use haul_transfer::ObjectLocator;
use serde::{Deserialize, Serialize};

/// Boxed future returned by [`ObjectStore`] methods.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send + 'a>>;

/// What the store knows about an object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub size: u64,
    /// Whole-object digest: plain hex SHA-256, or a `-N` composite for
    /// objects assembled from N parts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
    /// Part size the object was assembled with, if multipart.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub part_size: Option<u64>,
}

/// Acknowledgement of one uploaded part.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartReceipt {
    pub part_number: u32,
    /// Digest of the part as the store received it.
    pub digest: String,
}

/// Errors reported by an [`ObjectStore`].
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("request timed out")]
    Timeout,

    #[error("connection reset")]
    ConnectionReset,

    #[error("throttled by the store")]
    Throttled,

    #[error("server error (status {0})")]
    Server(u16),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("object not found: {0}")]
    NotFound(String),

    #[error("unknown multipart session: {0}")]
    InvalidSession(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("part {part} digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch {
        part: u32,
        expected: String,
        actual: String,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl StoreError {
    /// Maps the error onto the shared taxonomy.
    pub fn class(&self) -> ErrorClass {
        match self {
            StoreError::Timeout
            | StoreError::ConnectionReset
            | StoreError::Throttled
            | StoreError::Server(_) => ErrorClass::Transient,
            StoreError::Unauthorized(_) | StoreError::NotFound(_) | StoreError::InvalidSession(_) => {
                ErrorClass::Permanent
            }
            StoreError::InvalidRequest(_) => ErrorClass::InvalidRequest,
            StoreError::DigestMismatch { .. } => ErrorClass::IntegrityMismatch,
            StoreError::Io(e) => haul_transfer::classify_io(e),
        }
    }
}

/// Abstract connection to a remote object store.
///
/// Implementations must be cheap to share behind `Arc<dyn ObjectStore>`;
/// every method may be called concurrently.
pub trait ObjectStore: Send + Sync {
    /// Size and digest of an existing object.
    fn head_object<'a>(&'a self, object: &'a ObjectLocator) -> StoreFuture<'a, ObjectMeta>;

    /// Reads `length` bytes at `offset`.
    fn read_range<'a>(
        &'a self,
        object: &'a ObjectLocator,
        offset: u64,
        length: u64,
    ) -> StoreFuture<'a, Vec<u8>>;

    /// Opens a multipart upload and returns its session id.
    fn create_multipart<'a>(&'a self, object: &'a ObjectLocator) -> StoreFuture<'a, String>;

    /// Uploads one part. Re-uploading a part number replaces it.
    fn upload_part<'a>(
        &'a self,
        session: &'a str,
        part_number: u32,
        data: Vec<u8>,
    ) -> StoreFuture<'a, PartReceipt>;

    /// Assembles the parts in part-number order into the final object.
    fn complete_multipart<'a>(
        &'a self,
        session: &'a str,
        parts: Vec<PartReceipt>,
    ) -> StoreFuture<'a, ObjectMeta>;

    /// Discards a multipart session. Unknown sessions are not an error.
    fn abort_multipart<'a>(&'a self, session: &'a str) -> StoreFuture<'a, ()>;
}
