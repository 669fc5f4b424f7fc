//! State store trait definition.
//!
//! [`StateStore`] is the single owner of every job's [`Manifest`]. The
//! orchestrator and the worker pool only ever see snapshots.

use chrono::Utc;
use haul_protocol::{
    ChunkEvent, ChunkStatus, ErrorClass, JobFailure, JobId, JobStatus, Manifest,
};

use crate::error::{self, StateError};

/// A change to one chunk, applied through the chunk transition table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkUpdate {
    /// A worker picked the chunk up; counts one attempt.
    Dispatch,
    /// The attempt transferred and digested the range.
    Succeed { digest: String },
    /// The attempt failed with the given class.
    Fail { class: ErrorClass },
    /// The chunk must be transferred again; its digest is dropped.
    Reset,
}

impl ChunkUpdate {
    pub fn event(&self) -> ChunkEvent {
        match self {
            ChunkUpdate::Dispatch => ChunkEvent::Dispatch,
            ChunkUpdate::Succeed { .. } => ChunkEvent::Succeed,
            ChunkUpdate::Fail { .. } => ChunkEvent::Fail,
            ChunkUpdate::Reset => ChunkEvent::Reset,
        }
    }
}

/// Storage contract for transfer manifests.
///
/// Implementations must be `Send + Sync` for use behind `Arc<dyn StateStore>`.
/// Every successful write bumps [`Manifest::version`] and returns the
/// manifest as stored.
pub trait StateStore: Send + Sync {
    /// Persists `planned` unless a record for its job already exists, in
    /// which case the stored record is returned unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Corrupt`] if `planned` does not tile its job's
    /// byte range.
    fn create_or_load(&self, planned: &Manifest) -> error::Result<Manifest>;

    /// Applies `update` to chunk `index`.
    ///
    /// # Errors
    ///
    /// [`StateError::ChunkOutOfRange`] for an unknown index and
    /// [`StateError::InvalidChunkUpdate`] for a transition the table rejects.
    fn mark_chunk(&self, job: &JobId, index: u32, update: ChunkUpdate)
    -> error::Result<Manifest>;

    /// Moves the job to `status`. A `failure` is recorded only if the job
    /// has none yet; the first failure always wins.
    ///
    /// Re-marking the current non-terminal status is a no-op write.
    fn mark_job(
        &self,
        job: &JobId,
        status: JobStatus,
        failure: Option<JobFailure>,
    ) -> error::Result<Manifest>;

    /// Records (or clears) the remote multipart session of an upload.
    fn set_session(&self, job: &JobId, session_id: Option<String>) -> error::Result<Manifest>;

    /// Records the verified whole-object digest.
    fn set_final_digest(&self, job: &JobId, digest: String) -> error::Result<Manifest>;

    /// Resets the given chunks to Pending, dropping their digests.
    fn reset_chunks(&self, job: &JobId, indices: &[u32]) -> error::Result<Manifest>;

    /// Read-only copy of the current manifest.
    fn snapshot(&self, job: &JobId) -> error::Result<Manifest>;

    /// Every job with a stored record, sorted by id.
    fn list_jobs(&self) -> error::Result<Vec<JobId>>;
}

pub(crate) fn apply_chunk_update(
    manifest: &mut Manifest,
    index: u32,
    update: ChunkUpdate,
) -> error::Result<()> {
    let job = manifest.job.id.clone();
    let chunk = manifest
        .chunks
        .get_mut(index as usize)
        .ok_or_else(|| StateError::ChunkOutOfRange {
            job: job.clone(),
            index,
        })?;

    let next = chunk
        .status
        .apply(update.event())
        .map_err(|e| StateError::InvalidChunkUpdate {
            job,
            reason: format!("chunk {index}: {e}"),
        })?;

    match update {
        ChunkUpdate::Dispatch => chunk.attempts = chunk.attempts.saturating_add(1),
        ChunkUpdate::Succeed { digest } => chunk.digest = Some(digest),
        ChunkUpdate::Fail { class } => {
            if class == ErrorClass::IntegrityMismatch {
                chunk.mismatches = chunk.mismatches.saturating_add(1);
            }
            chunk.last_error = Some(class);
        }
        ChunkUpdate::Reset => chunk.digest = None,
    }
    chunk.status = next;
    touch(manifest);
    Ok(())
}

pub(crate) fn apply_job_status(
    manifest: &mut Manifest,
    status: JobStatus,
    failure: Option<JobFailure>,
) -> error::Result<()> {
    let current = manifest.job.status;
    if !current.can_transition_to(status) {
        return Err(StateError::InvalidTransition {
            job: manifest.job.id.clone(),
            from: current,
            to: status,
        });
    }
    manifest.job.status = status;
    if manifest.job.failure.is_none() {
        manifest.job.failure = failure;
    }
    touch(manifest);
    Ok(())
}

pub(crate) fn apply_reset(manifest: &mut Manifest, indices: &[u32]) -> error::Result<()> {
    for &index in indices {
        apply_chunk_update(manifest, index, ChunkUpdate::Reset)?;
    }
    if indices.is_empty() {
        touch(manifest);
    }
    Ok(())
}

/// Checks the chunk list tiles the job's byte range.
pub(crate) fn check_coverage(manifest: &Manifest) -> error::Result<()> {
    haul_transfer::coverage_check(&manifest.chunks, manifest.job.total_size).map_err(|e| {
        StateError::Corrupt(format!("job {}: {e}", manifest.job.id))
    })
}

/// Chunks left InFlight by a crashed process go back to Pending.
///
/// Returns how many were reset.
pub(crate) fn requeue_in_flight(manifest: &mut Manifest) -> usize {
    let mut reset = 0;
    for chunk in &mut manifest.chunks {
        if chunk.status == ChunkStatus::InFlight {
            chunk.status = ChunkStatus::Pending;
            reset += 1;
        }
    }
    reset
}

pub(crate) fn touch(manifest: &mut Manifest) {
    manifest.version += 1;
    manifest.job.updated_at = Utc::now();
}
