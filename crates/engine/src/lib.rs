//! Transfer orchestration for haul.
//!
//! The [`Orchestrator`] accepts jobs, persists their manifests through a
//! [`StateStore`](haul_state::StateStore), drives a bounded pool of chunk
//! workers against an [`ObjectStore`] and reports progress as
//! [`TransferEvent`](haul_protocol::TransferEvent)s.

pub mod error;
pub mod local_store;
pub mod object_store;
pub mod orchestrator;
pub mod types;
pub mod worker;

pub use error::EngineError;
pub use local_store::LocalObjectStore;
pub use object_store::{ObjectMeta, ObjectStore, PartReceipt, StoreError, StoreFuture};
pub use orchestrator::Orchestrator;
pub use types::{EngineConfig, JobOptions, JobSnapshot, SubmitRequest};
