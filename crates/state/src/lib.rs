//! Transfer state persistence for the haul engine.
//!
//! Provides the [`StateStore`] trait plus an in-memory backend for tests
//! and a file backend that survives process restarts.

pub mod backend;
pub mod error;
pub mod file;
pub mod memory;

pub use backend::{ChunkUpdate, StateStore};
pub use error::StateError;
pub use file::FileStateStore;
pub use memory::MemoryStateStore;
