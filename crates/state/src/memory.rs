//! In-memory [`StateStore`] for tests and ephemeral runs.

use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};

use haul_protocol::{JobFailure, JobId, JobStatus, Manifest};

use crate::backend::{
    ChunkUpdate, StateStore, apply_chunk_update, apply_job_status, apply_reset, check_coverage,
    touch,
};
use crate::error::{self, StateError};

/// Keeps manifests in a map; nothing survives the process.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    jobs: Mutex<BTreeMap<JobId, Manifest>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn update<F>(&self, job: &JobId, f: F) -> error::Result<Manifest>
    where
        F: FnOnce(&mut Manifest) -> error::Result<()>,
    {
        let mut jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
        let stored = jobs
            .get_mut(job)
            .ok_or_else(|| StateError::NotFound(job.clone()))?;
        // Work on a copy so a rejected update leaves the record untouched.
        let mut next = stored.clone();
        f(&mut next)?;
        *stored = next.clone();
        Ok(next)
    }
}

impl StateStore for MemoryStateStore {
    fn create_or_load(&self, planned: &Manifest) -> error::Result<Manifest> {
        let mut jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = jobs.get(&planned.job.id) {
            return Ok(existing.clone());
        }
        check_coverage(planned)?;
        let mut stored = planned.clone();
        touch(&mut stored);
        jobs.insert(stored.job.id.clone(), stored.clone());
        Ok(stored)
    }

    fn mark_chunk(
        &self,
        job: &JobId,
        index: u32,
        update: ChunkUpdate,
    ) -> error::Result<Manifest> {
        self.update(job, |m| apply_chunk_update(m, index, update))
    }

    fn mark_job(
        &self,
        job: &JobId,
        status: JobStatus,
        failure: Option<JobFailure>,
    ) -> error::Result<Manifest> {
        self.update(job, |m| apply_job_status(m, status, failure))
    }

    fn set_session(&self, job: &JobId, session_id: Option<String>) -> error::Result<Manifest> {
        self.update(job, |m| {
            m.job.session_id = session_id;
            touch(m);
            Ok(())
        })
    }

    fn set_final_digest(&self, job: &JobId, digest: String) -> error::Result<Manifest> {
        self.update(job, |m| {
            m.job.final_digest = Some(digest);
            touch(m);
            Ok(())
        })
    }

    fn reset_chunks(&self, job: &JobId, indices: &[u32]) -> error::Result<Manifest> {
        self.update(job, |m| apply_reset(m, indices))
    }

    fn snapshot(&self, job: &JobId) -> error::Result<Manifest> {
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(job)
            .cloned()
            .ok_or_else(|| StateError::NotFound(job.clone()))
    }

    fn list_jobs(&self) -> error::Result<Vec<JobId>> {
        Ok(self
            .jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::tests::{exercise_store, manifest};

    #[test]
    fn shared_behaviour() {
        exercise_store(&MemoryStateStore::new());
    }

    #[test]
    fn rejected_update_leaves_record_untouched() {
        let store = MemoryStateStore::new();
        let id = JobId::from("x");
        store.create_or_load(&manifest("x")).unwrap();
        let before = store.snapshot(&id).unwrap();
        assert!(store
            .mark_chunk(&id, 0, ChunkUpdate::Succeed { digest: "d".into() })
            .is_err());
        assert_eq!(store.snapshot(&id).unwrap(), before);
    }

    #[test]
    fn rejects_uncovered_plan() {
        let store = MemoryStateStore::new();
        let mut m = manifest("gap");
        m.chunks.pop();
        assert!(matches!(
            store.create_or_load(&m),
            Err(StateError::Corrupt(_))
        ));
        assert!(store.list_jobs().unwrap().is_empty());
    }
}
