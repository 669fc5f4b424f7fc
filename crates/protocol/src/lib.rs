//! Shared types for the haul transfer engine.
//!
//! These types are persisted by the state store and emitted to the
//! monitoring layer, so their JSON layout is a compatibility surface.

pub mod events;
pub mod types;

pub use events::{ProgressEvent, TransferEvent};
pub use types::{
    ChunkBounds, ChunkEvent, ChunkRecord, ChunkStatus, ChunkSummary, Direction, ErrorClass,
    InvalidTransition, JobFailure, JobId, JobRecord, JobStatus, Manifest, RetryPolicy,
};
pub use types::duration_ms;
