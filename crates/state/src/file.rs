//! Durable [`StateStore`] keeping one JSON record per job.
//!
//! Every write serializes the whole manifest to `<job>.json.tmp`, fsyncs it
//! and renames it over `<job>.json`. A crash therefore leaves either the old
//! or the new record on disk, never a torn one.
//!
//! All I/O here is blocking. The chunk pool, which writes on every chunk
//! transition, calls it through `spawn_blocking`.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use haul_protocol::{JobFailure, JobId, JobStatus, Manifest};
use tracing::{debug, info, warn};

use crate::backend::{
    ChunkUpdate, StateStore, apply_chunk_update, apply_job_status, apply_reset, check_coverage,
    requeue_in_flight, touch,
};
use crate::error::{self, StateError};

const RECORD_EXT: &str = "json";
const TEMP_SUFFIX: &str = ".json.tmp";

/// One cached manifest. Its mutex serializes writes to that job only.
type Entry = Arc<Mutex<Option<Manifest>>>;

/// Directory-backed manifest store.
#[derive(Debug)]
pub struct FileStateStore {
    dir: PathBuf,
    entries: Mutex<HashMap<JobId, Entry>>,
}

impl FileStateStore {
    /// Opens (creating if needed) a store rooted at `dir`.
    ///
    /// Leftover temp files from an interrupted write are removed.
    pub fn open(dir: impl Into<PathBuf>) -> error::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(TEMP_SUFFIX))
            {
                warn!(path = %path.display(), "removing interrupted manifest write");
                fs::remove_file(&path)?;
            }
        }
        info!(dir = %dir.display(), "opened manifest store");
        Ok(Self {
            dir,
            entries: Mutex::new(HashMap::new()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, job: &JobId) -> error::Result<PathBuf> {
        let id = job.as_str();
        let usable = !id.is_empty()
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !usable {
            return Err(StateError::Corrupt(format!(
                "job id {id:?} is not usable as a file name"
            )));
        }
        Ok(self.dir.join(format!("{id}.{RECORD_EXT}")))
    }

    fn entry(&self, job: &JobId) -> Entry {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(entries.entry(job.clone()).or_default())
    }

    /// Reads a record from disk, requeueing chunks a crash left InFlight.
    fn read_record(&self, job: &JobId) -> error::Result<Option<Manifest>> {
        let path = self.record_path(job)?;
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let mut manifest: Manifest = serde_json::from_slice(&bytes)?;
        if &manifest.job.id != job {
            return Err(StateError::Corrupt(format!(
                "{} holds job {}",
                path.display(),
                manifest.job.id
            )));
        }
        check_coverage(&manifest)?;
        let requeued = requeue_in_flight(&mut manifest);
        if requeued > 0 {
            debug!(job = %job, requeued, "requeued in-flight chunks from previous run");
        }
        Ok(Some(manifest))
    }

    fn write_record(&self, manifest: &Manifest) -> error::Result<()> {
        let path = self.record_path(&manifest.job.id)?;
        let tmp = path.with_extension(&TEMP_SUFFIX[1..]);
        let json = serde_json::to_vec_pretty(manifest)?;
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&json)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        sync_dir(&self.dir);
        Ok(())
    }

    /// Loads the cached manifest into `slot` if it is not there yet.
    fn ensure_loaded(&self, job: &JobId, slot: &mut Option<Manifest>) -> error::Result<()> {
        if slot.is_none() {
            *slot = self.read_record(job)?;
        }
        Ok(())
    }

    fn update<F>(&self, job: &JobId, f: F) -> error::Result<Manifest>
    where
        F: FnOnce(&mut Manifest) -> error::Result<()>,
    {
        let entry = self.entry(job);
        let mut slot = entry.lock().unwrap_or_else(PoisonError::into_inner);
        self.ensure_loaded(job, &mut slot)?;
        let Some(current) = slot.as_ref() else {
            return Err(StateError::NotFound(job.clone()));
        };
        let mut next = current.clone();
        f(&mut next)?;
        self.write_record(&next)?;
        *slot = Some(next.clone());
        Ok(next)
    }
}

#[cfg(unix)]
fn sync_dir(dir: &Path) {
    // Persists the rename itself; failure only weakens durability.
    if let Err(e) = fs::File::open(dir).and_then(|d| d.sync_all()) {
        debug!(dir = %dir.display(), error = %e, "directory fsync failed");
    }
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) {}

impl StateStore for FileStateStore {
    fn create_or_load(&self, planned: &Manifest) -> error::Result<Manifest> {
        let job = &planned.job.id;
        let entry = self.entry(job);
        let mut slot = entry.lock().unwrap_or_else(PoisonError::into_inner);
        self.ensure_loaded(job, &mut slot)?;
        if let Some(existing) = slot.as_ref() {
            debug!(job = %job, version = existing.version, "loaded existing manifest");
            return Ok(existing.clone());
        }

        check_coverage(planned)?;
        let mut stored = planned.clone();
        touch(&mut stored);
        self.write_record(&stored)?;
        debug!(job = %job, chunks = stored.chunks.len(), "persisted new manifest");
        *slot = Some(stored.clone());
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
        let entry = self.entry(job);
        let mut slot = entry.lock().unwrap_or_else(PoisonError::into_inner);
        self.ensure_loaded(job, &mut slot)?;
        slot.clone().ok_or_else(|| StateError::NotFound(job.clone()))
    }

    fn list_jobs(&self) -> error::Result<Vec<JobId>> {
        let mut jobs = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXT) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                jobs.push(JobId::from(stem));
            }
        }
        jobs.sort();
        Ok(jobs)
    }
}
