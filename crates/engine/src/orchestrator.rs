//! Transfer orchestrator.
//!
//! Accepts jobs, persists their manifests, runs one driver task per active
//! job and reports progress and lifecycle events on a bounded channel.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use haul_protocol::{
    ChunkRecord, ChunkStatus, Direction, ErrorClass, JobFailure, JobId, JobRecord, JobStatus,
    Manifest, TransferEvent,
};
use haul_state::{StateError, StateStore};
use haul_transfer::planner::{PlanRequest, plan, validate_plan_inputs};
use haul_transfer::validation::{
    validate_bandwidth_cap, validate_local_path, validate_size_hint,
};
use haul_transfer::{
    LocalDigests, ObjectLocator, ProgressReporter, RetryController, Throttle, combine_digests,
    digest_file_ranges, is_composite, stale_chunk_claims, verify,
};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::error::EngineError;
use crate::object_store::{ObjectStore, PartReceipt};
use crate::types::{EngineConfig, JobSnapshot, SubmitRequest};
use crate::worker::{ChunkIo, ChunkPool, Control, PoolExit, with_retries};

/// Coordinates transfer jobs against one object store and one state store.
pub struct Orchestrator {
    inner: Arc<Inner>,
    events_rx: Option<mpsc::Receiver<TransferEvent>>,
}

struct Inner {
    config: EngineConfig,
    store: Arc<dyn ObjectStore>,
    state: Arc<dyn StateStore>,
    throttle: Arc<Throttle>,
    events_tx: mpsc::Sender<TransferEvent>,
    jobs: Mutex<HashMap<JobId, Arc<JobHandle>>>,
}

/// In-process state of a job known to this orchestrator.
struct JobHandle {
    id: JobId,
    control: watch::Sender<Control>,
    status: watch::Sender<JobStatus>,
    /// Whether a driver task currently owns the job. Pause hand-off and
    /// resume both decide under this lock.
    running: Mutex<bool>,
    throttle: Arc<Throttle>,
    progress: Arc<ProgressReporter>,
}

enum Ended {
    Terminal,
    Parked,
}

enum Verdict {
    Verified(String),
    Mismatch(String),
    /// Cancel arrived before the upload was committed.
    Cancelled,
}

impl Orchestrator {
    /// Creates an orchestrator. The global bandwidth cap comes from `config`.
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn ObjectStore>,
        state: Arc<dyn StateStore>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel(config.event_capacity.max(1));
        let throttle = Arc::new(Throttle::from_cap(config.bandwidth_cap));
        Self {
            inner: Arc::new(Inner {
                config,
                store,
                state,
                throttle,
                events_tx,
                jobs: Mutex::new(HashMap::new()),
            }),
            events_rx: Some(events_rx),
        }
    }

    /// Takes the event receiver. Can only be called once.
    ///
    /// Events are dropped rather than blocking a job when the receiver
    /// falls behind or was never taken.
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<TransferEvent>> {
        self.events_rx.take()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Validates and plans a job, persists its manifest and starts it.
    ///
    /// Malformed requests fail before any remote call.
    pub async fn submit(&self, req: SubmitRequest) -> Result<JobId, EngineError> {
        self.inner.submit(req).await
    }

    /// Stops dispatching new chunks. In-flight chunks finish and are
    /// recorded, then the job becomes Paused.
    pub fn pause(&self, job: &JobId) -> Result<(), EngineError> {
        self.inner.pause(job)
    }

    /// Continues a paused job from its stored manifest.
    pub fn resume(&self, job: &JobId) -> Result<(), EngineError> {
        self.inner.resume(job)
    }

    /// Stops the job for good. In-flight results are discarded and an
    /// upload's multipart session is aborted.
    pub fn cancel(&self, job: &JobId) -> Result<(), EngineError> {
        self.inner.cancel(job)
    }

    /// Current view of a job, served from the state store.
    pub fn query(&self, job: &JobId) -> Result<JobSnapshot, EngineError> {
        self.inner.load(job).map(|m| JobSnapshot::from(&m))
    }

    /// Waits until the job is terminal or Paused.
    pub async fn wait(&self, job: &JobId) -> Result<JobSnapshot, EngineError> {
        let handle = self.inner.handle(job)?;
        let mut status = handle.status.subscribe();
        status
            .wait_for(|s| s.is_terminal() || *s == JobStatus::Paused)
            .await
            .map_err(|e| EngineError::Worker(e.to_string()))?;
        self.query(job)
    }

    /// Restarts every non-terminal job found in the state store.
    ///
    /// Paused jobs are loaded but left paused. Returns the jobs that were
    /// started.
    pub fn recover(&self) -> Result<Vec<JobId>, EngineError> {
        self.inner.recover()
    }

    /// Starts a new job that continues a Failed one.
    ///
    /// Completed chunks and the multipart session carry over; the failed
    /// job stays as it is.
    pub fn resubmit(&self, failed: &JobId) -> Result<JobId, EngineError> {
        self.inner.resubmit(failed)
    }
}

impl Inner {
    async fn submit(self: &Arc<Self>, req: SubmitRequest) -> Result<JobId, EngineError> {
        let (local_str, remote_str) = match req.direction {
            Direction::Upload => (&req.source, &req.destination),
            Direction::Download => (&req.destination, &req.source),
        };
        let local = validate_local_path(local_str)?;
        let remote = ObjectLocator::parse(remote_str)?;
        let hint = validate_size_hint(req.size_hint)?;

        let opts = req.options;
        validate_bandwidth_cap(opts.bandwidth_cap)?;
        let parallelism = opts.parallelism.unwrap_or(self.config.parallelism);
        let bounds = opts.chunk_bounds.unwrap_or(self.config.chunk_bounds);
        validate_plan_inputs(parallelism, bounds)?;
        let retry_policy = opts
            .retry_policy
            .unwrap_or_else(|| self.config.retry_policy.clone());

        let id = JobId::generate();
        let retry = RetryController::new(retry_policy.clone());
        let (total_size, part_size, remote_digest) = match req.direction {
            Direction::Upload => (local_file_size(&local).await?, None, None),
            Direction::Download => {
                let store = &*self.store;
                let remote = &remote;
                let meta =
                    with_retries(&retry, &id, "head_object", move || store.head_object(remote))
                        .await?;
                (meta.size, meta.part_size, meta.digest)
            }
        };
        if let Some(expected) = hint
            && expected != total_size
        {
            return Err(EngineError::InvalidRequest(format!(
                "size hint {expected} does not match actual size {total_size}"
            )));
        }

        let chunks = plan(&PlanRequest {
            total_size,
            parallelism,
            bounds,
            part_size,
        })?;

        let now = Utc::now();
        let manifest = Manifest {
            version: 0,
            job: JobRecord {
                id: id.clone(),
                direction: req.direction,
                source: req.source,
                destination: req.destination,
                total_size,
                parallelism,
                bandwidth_cap: opts.bandwidth_cap,
                chunk_bounds: bounds,
                retry_policy,
                status: JobStatus::Pending,
                session_id: None,
                expected_digest: opts.expected_digest.or(remote_digest),
                final_digest: None,
                failure: None,
                created_at: now,
                updated_at: now,
            },
            chunks,
        };
        let stored = self.state.create_or_load(&manifest)?;
        let handle = self.register(&stored);
        self.transition(&handle, JobStatus::Planning, None)?;
        info!(
            job = %id,
            direction = %stored.job.direction,
            size = total_size,
            chunks = stored.chunks.len(),
            parallelism,
            "job planned"
        );

        self.start(&handle, false)?;
        Ok(id)
    }

    fn pause(&self, job: &JobId) -> Result<(), EngineError> {
        let handle = self.handle(job)?;
        let running = handle.running.lock().unwrap_or_else(PoisonError::into_inner);
        let status = *handle.status.borrow();
        if status.is_terminal() || status == JobStatus::Paused {
            return Ok(());
        }
        handle.control.send_if_modified(|c| {
            let changed = *c == Control::Run;
            if changed {
                *c = Control::Pause;
            }
            changed
        });
        if !*running && status == JobStatus::InProgress {
            // Loaded from the store but never started in this process.
            self.transition(&handle, JobStatus::Paused, None)?;
        }
        info!(job = %job, "pause requested");
        Ok(())
    }

    fn resume(self: &Arc<Self>, job: &JobId) -> Result<(), EngineError> {
        let handle = self.handle(job)?;
        let mut running = handle.running.lock().unwrap_or_else(PoisonError::into_inner);
        let status = *handle.status.borrow();
        if status.is_terminal() {
            return Ok(());
        }
        handle.control.send_replace(Control::Run);
        if *running {
            // Still draining after a pause: the driver keeps dispatching.
            debug!(job = %job, "resume while draining");
            return Ok(());
        }

        self.advance_to_in_progress(&handle, status)?;
        *running = true;
        info!(job = %job, "job resumed");
        self.spawn_driver(Arc::clone(&handle), true);
        Ok(())
    }

    fn cancel(self: &Arc<Self>, job: &JobId) -> Result<(), EngineError> {
        let handle = self.handle(job)?;
        let mut running = handle.running.lock().unwrap_or_else(PoisonError::into_inner);
        if handle.status.borrow().is_terminal() {
            return Ok(());
        }
        handle.control.send_replace(Control::Cancel);
        info!(job = %job, "cancel requested");
        if !*running {
            // Paused or idle: a short-lived driver performs the cancellation.
            *running = true;
            self.spawn_driver(Arc::clone(&handle), false);
        }
        Ok(())
    }

    fn recover(self: &Arc<Self>) -> Result<Vec<JobId>, EngineError> {
        let mut started = Vec::new();
        for id in self.state.list_jobs()? {
            let manifest = match self.state.snapshot(&id) {
                Ok(m) => m,
                Err(e) => {
                    warn!(job = %id, error = %e, "skipping unreadable manifest");
                    continue;
                }
            };
            let status = manifest.job.status;
            if status.is_terminal() || self.is_registered(&id) {
                continue;
            }

            let handle = self.register(&manifest);
            if status == JobStatus::Paused {
                debug!(job = %id, "recovered paused job");
                continue;
            }
            let mut running = handle.running.lock().unwrap_or_else(PoisonError::into_inner);
            self.advance_to_in_progress(&handle, status)?;
            *running = true;
            self.spawn_driver(Arc::clone(&handle), true);
            drop(running);
            started.push(id);
        }
        info!(count = started.len(), "recovered jobs");
        Ok(started)
    }

    fn resubmit(self: &Arc<Self>, failed: &JobId) -> Result<JobId, EngineError> {
        let old = self.load(failed)?;
        if old.job.status != JobStatus::Failed {
            return Err(EngineError::InvalidRequest(format!(
                "job {failed} is {}, only failed jobs can be resubmitted",
                old.job.status
            )));
        }

        let id = JobId::generate();
        let now = Utc::now();
        let chunks: Vec<ChunkRecord> = old
            .chunks
            .iter()
            .map(|c| {
                let mut fresh = ChunkRecord::new(c.index, c.offset, c.length);
                if c.status == ChunkStatus::Completed {
                    fresh.status = ChunkStatus::Completed;
                    fresh.digest = c.digest.clone();
                }
                fresh
            })
            .collect();
        let seeded = chunks
            .iter()
            .filter(|c| c.status == ChunkStatus::Completed)
            .count();
        let manifest = Manifest {
            version: 0,
            job: JobRecord {
                id: id.clone(),
                status: JobStatus::Pending,
                final_digest: None,
                failure: None,
                created_at: now,
                updated_at: now,
                ..old.job.clone()
            },
            chunks,
        };

        let stored = self.state.create_or_load(&manifest)?;
        let handle = self.register(&stored);
        self.transition(&handle, JobStatus::Planning, None)?;
        info!(job = %id, from = %failed, seeded, "job resubmitted");
        self.start(&handle, true)?;
        Ok(id)
    }

    // -----------------------------------------------------------------------
    // Handles and bookkeeping
    // -----------------------------------------------------------------------

    fn load(&self, job: &JobId) -> Result<Manifest, EngineError> {
        self.state.snapshot(job).map_err(|e| match e {
            StateError::NotFound(id) => EngineError::JobNotFound(id),
            other => other.into(),
        })
    }

    fn is_registered(&self, job: &JobId) -> bool {
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(job)
    }

    /// Returns the live handle, loading the job from the state store if
    /// this process has not seen it yet.
    fn handle(&self, job: &JobId) -> Result<Arc<JobHandle>, EngineError> {
        if let Some(h) = self
            .jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(job)
        {
            return Ok(Arc::clone(h));
        }
        let manifest = self.load(job)?;
        Ok(self.register(&manifest))
    }

    fn register(&self, manifest: &Manifest) -> Arc<JobHandle> {
        let mut jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
        let job = &manifest.job;
        let handle = jobs.entry(job.id.clone()).or_insert_with(|| {
            let tx = self.events_tx.clone();
            let progress = ProgressReporter::new(
                job.id.clone(),
                job.total_size,
                Some(self.config.progress_interval),
                Box::new(move |ev| {
                    let _ = tx.try_send(TransferEvent::Progress(ev));
                }),
            );
            let control = if job.status == JobStatus::Paused {
                Control::Pause
            } else {
                Control::Run
            };
            Arc::new(JobHandle {
                id: job.id.clone(),
                control: watch::Sender::new(control),
                status: watch::Sender::new(job.status),
                running: Mutex::new(false),
                throttle: Arc::new(Throttle::from_cap(job.bandwidth_cap)),
                progress: Arc::new(progress),
            })
        });
        Arc::clone(handle)
    }

    fn emit(&self, event: TransferEvent) {
        if let Err(e) = self.events_tx.try_send(event) {
            debug!(error = %e, "dropping transfer event");
        }
    }

    fn transition(
        &self,
        handle: &JobHandle,
        status: JobStatus,
        failure: Option<JobFailure>,
    ) -> Result<Manifest, EngineError> {
        self.transition_then(handle, status, failure, |_| None)
    }

    /// Persists `status`, emits the change plus any follow-up event, and
    /// only then publishes the status to waiters.
    fn transition_then<F>(
        &self,
        handle: &JobHandle,
        status: JobStatus,
        failure: Option<JobFailure>,
        follow_up: F,
    ) -> Result<Manifest, EngineError>
    where
        F: FnOnce(&Manifest) -> Option<TransferEvent>,
    {
        let manifest = self.state.mark_job(&handle.id, status, failure)?;
        info!(job = %handle.id, status = %status, "job status changed");
        self.emit(TransferEvent::StatusChanged {
            job_id: handle.id.clone(),
            status,
        });
        if let Some(event) = follow_up(&manifest) {
            self.emit(event);
        }
        handle.status.send_replace(status);
        Ok(manifest)
    }

    /// Walks a not-yet-running job forward to InProgress.
    fn advance_to_in_progress(
        &self,
        handle: &JobHandle,
        mut status: JobStatus,
    ) -> Result<(), EngineError> {
        while status != JobStatus::InProgress {
            let next = match status {
                JobStatus::Pending => JobStatus::Planning,
                JobStatus::Planning | JobStatus::Paused => JobStatus::InProgress,
                other => {
                    return Err(EngineError::InvalidRequest(format!(
                        "job {} cannot run from {other}",
                        handle.id
                    )));
                }
            };
            self.transition(handle, next, None)?;
            status = next;
        }
        Ok(())
    }

    fn start(self: &Arc<Self>, handle: &Arc<JobHandle>, verify_claims: bool) -> Result<(), EngineError> {
        let mut running = handle.running.lock().unwrap_or_else(PoisonError::into_inner);
        self.transition(handle, JobStatus::InProgress, None)?;
        *running = true;
        self.spawn_driver(Arc::clone(handle), verify_claims);
        Ok(())
    }

    fn spawn_driver(self: &Arc<Self>, handle: Arc<JobHandle>, verify_claims: bool) {
        let inner = Arc::clone(self);
        tokio::spawn(async move { inner.drive(handle, verify_claims).await });
    }

    // -----------------------------------------------------------------------
    // Driver
    // -----------------------------------------------------------------------

    async fn drive(self: Arc<Self>, handle: Arc<JobHandle>, verify_claims: bool) {
        match self.run_job(&handle, verify_claims).await {
            Ok(Ended::Parked) => return,
            Ok(Ended::Terminal) => {}
            Err(err) => {
                error!(job = %handle.id, error = %err, "job driver failed");
                self.finish_failed(
                    &handle,
                    JobFailure {
                        class: err.class(),
                        message: err.to_string(),
                        chunk_index: None,
                    },
                );
            }
        }
        *handle.running.lock().unwrap_or_else(PoisonError::into_inner) = false;
    }

    async fn run_job(&self, handle: &JobHandle, verify_claims: bool) -> Result<Ended, EngineError> {
        let id = &handle.id;
        let mut control = handle.control.subscribe();
        let manifest = self.state.snapshot(id)?;
        let job = manifest.job.clone();
        let (local, remote) = locators(&job)?;
        let retry = RetryController::new(job.retry_policy.clone());

        if *control.borrow() != Control::Cancel {
            if job.direction == Direction::Download {
                haul_transfer::chunked::prepare_destination(&local, job.total_size).await?;
            }
            if verify_claims {
                let path = local.clone();
                let chunks = manifest.chunks.clone();
                let stale = tokio::task::spawn_blocking(move || stale_chunk_claims(&path, &chunks))
                    .await
                    .map_err(|e| EngineError::Worker(e.to_string()))?;
                if !stale.is_empty() {
                    warn!(
                        job = %id,
                        stale = stale.len(),
                        "completed chunks no longer match local bytes, re-transferring"
                    );
                    self.state.reset_chunks(id, &stale)?;
                }
            }
        }

        let mut refetched = false;
        loop {
            let mode = *control.borrow();
            let session = match job.direction {
                Direction::Upload if mode != Control::Cancel => {
                    Some(self.ensure_session(id, &remote, &retry).await?)
                }
                _ => None,
            };

            let pool = ChunkPool {
                io: Arc::new(ChunkIo {
                    job: id.clone(),
                    direction: job.direction,
                    local: local.clone(),
                    remote: remote.clone(),
                    session: session.clone(),
                    store: Arc::clone(&self.store),
                    global_throttle: Arc::clone(&self.throttle),
                    job_throttle: Arc::clone(&handle.throttle),
                    chunk_timeout: self.config.chunk_timeout,
                }),
                state: Arc::clone(&self.state),
                retry: retry.clone(),
                parallelism: job.parallelism as usize,
                progress: Arc::clone(&handle.progress),
            };

            match pool.run(&mut control).await? {
                PoolExit::Drained => {
                    let verdict = self
                        .finalize(&job, &local, session.as_deref(), &retry, &mut control)
                        .await?;
                    match verdict {
                        Verdict::Verified(digest) => {
                            if !self.complete_unless_cancelled(handle, digest)? {
                                self.finish_cancelled(handle).await;
                            }
                            return Ok(Ended::Terminal);
                        }
                        Verdict::Cancelled => {
                            self.finish_cancelled(handle).await;
                            return Ok(Ended::Terminal);
                        }
                        Verdict::Mismatch(reason) if !refetched => {
                            warn!(job = %id, reason = %reason, "whole-object verification failed, re-fetching every chunk");
                            refetched = true;
                            let all: Vec<u32> = manifest.chunks.iter().map(|c| c.index).collect();
                            self.state.reset_chunks(id, &all)?;
                        }
                        Verdict::Mismatch(reason) => {
                            self.finish_failed(
                                handle,
                                JobFailure {
                                    class: ErrorClass::IntegrityMismatch,
                                    message: format!("whole-object verification failed after re-fetch: {reason}"),
                                    chunk_index: None,
                                },
                            );
                            return Ok(Ended::Terminal);
                        }
                    }
                }
                PoolExit::Paused => {
                    if self.park(handle)? {
                        return Ok(Ended::Parked);
                    }
                    debug!(job = %id, "resumed during drain, continuing dispatch");
                }
                PoolExit::Cancelled => {
                    self.finish_cancelled(handle).await;
                    return Ok(Ended::Terminal);
                }
                PoolExit::Failed(failure) => {
                    self.finish_failed(handle, failure);
                    return Ok(Ended::Terminal);
                }
            }
        }
    }

    /// Marks the job Paused unless a resume or cancel arrived meanwhile.
    fn park(&self, handle: &JobHandle) -> Result<bool, EngineError> {
        let mut running = handle.running.lock().unwrap_or_else(PoisonError::into_inner);
        if *handle.control.borrow() != Control::Pause {
            return Ok(false);
        }
        self.transition(handle, JobStatus::Paused, None)?;
        *running = false;
        info!(job = %handle.id, "job paused");
        Ok(true)
    }

    async fn ensure_session(
        &self,
        id: &JobId,
        remote: &ObjectLocator,
        retry: &RetryController,
    ) -> Result<String, EngineError> {
        if let Some(session) = self.state.snapshot(id)?.job.session_id {
            return Ok(session);
        }
        let store = &*self.store;
        let session =
            with_retries(retry, id, "create_multipart", move || store.create_multipart(remote))
                .await?;
        self.state.set_session(id, Some(session.clone()))?;
        debug!(job = %id, session = %session, "multipart session opened");
        Ok(session)
    }

    async fn finalize(
        &self,
        job: &JobRecord,
        local: &Path,
        session: Option<&str>,
        retry: &RetryController,
        control: &mut watch::Receiver<Control>,
    ) -> Result<Verdict, EngineError> {
        let manifest = self.state.snapshot(&job.id)?;
        let combined = combine_digests(&manifest)?;

        match job.direction {
            Direction::Upload => {
                let session = session.ok_or_else(|| {
                    EngineError::InvalidRequest("upload has no multipart session".into())
                })?;
                let parts: Vec<PartReceipt> = manifest
                    .chunks
                    .iter()
                    .map(|c| PartReceipt {
                        part_number: c.index,
                        digest: c.digest.clone().unwrap_or_default(),
                    })
                    .collect();
                let store = &*self.store;
                let completed = tokio::select! {
                    biased;
                    () = cancel_requested(control) => {
                        debug!(job = %job.id, "cancel arrived before the upload was committed");
                        return Ok(Verdict::Cancelled);
                    }
                    completed = with_retries(retry, &job.id, "complete_multipart", move || {
                        store.complete_multipart(session, parts.clone())
                    }) => completed,
                };
                let meta = match completed {
                    Ok(meta) => meta,
                    Err(e) if e.class() == ErrorClass::IntegrityMismatch => {
                        if let Err(abort) = self.store.abort_multipart(session).await {
                            warn!(job = %job.id, error = %abort, "failed to abort multipart session");
                        }
                        self.state.set_session(&job.id, None)?;
                        return Ok(Verdict::Mismatch(e.to_string()));
                    }
                    Err(e) => return Err(e.into()),
                };
                self.state.set_session(&job.id, None)?;

                if let Some(reported) = &meta.digest
                    && !verify(reported, &combined)
                {
                    return Ok(Verdict::Mismatch(format!(
                        "store reports {reported}, chunks combine to {combined}"
                    )));
                }
                match &job.expected_digest {
                    Some(expected) if is_composite(expected) => {
                        if !verify(expected, &combined) {
                            return Ok(Verdict::Mismatch(format!(
                                "expected {expected}, chunks combine to {combined}"
                            )));
                        }
                    }
                    Some(expected) => {
                        let whole = local_digests(local, &manifest.chunks).await?.whole;
                        if !verify(expected, &whole) {
                            return Ok(Verdict::Mismatch(format!(
                                "expected {expected}, file digest is {whole}"
                            )));
                        }
                    }
                    None => {}
                }
                Ok(Verdict::Verified(combined))
            }
            Direction::Download => {
                let on_disk = local_digests(local, &manifest.chunks).await?;

                let differing = manifest
                    .chunks
                    .iter()
                    .zip(&on_disk.chunks)
                    .filter(|(c, actual)| !c.digest.as_deref().is_some_and(|d| verify(d, actual)))
                    .count();
                if differing > 0 {
                    return Ok(Verdict::Mismatch(format!(
                        "{differing} chunk(s) differ on disk from what was received"
                    )));
                }

                let digest = match &job.expected_digest {
                    Some(expected) if is_composite(expected) => {
                        if !verify(expected, &combined) {
                            return Ok(Verdict::Mismatch(format!(
                                "expected {expected}, chunks combine to {combined}"
                            )));
                        }
                        combined
                    }
                    Some(expected) => {
                        if !verify(expected, &on_disk.whole) {
                            return Ok(Verdict::Mismatch(format!(
                                "expected {expected}, file digest is {}",
                                on_disk.whole
                            )));
                        }
                        on_disk.whole
                    }
                    None => on_disk.whole,
                };
                Ok(Verdict::Verified(digest))
            }
        }
    }

    /// Completes the job unless a cancel got in first. Holding `running`
    /// orders this against [`cancel`](Self::cancel): a later cancel sees
    /// a terminal job and does nothing.
    fn complete_unless_cancelled(
        &self,
        handle: &JobHandle,
        digest: String,
    ) -> Result<bool, EngineError> {
        let _running = handle.running.lock().unwrap_or_else(PoisonError::into_inner);
        if *handle.control.borrow() == Control::Cancel {
            warn!(job = %handle.id, "cancel arrived after the last chunk, discarding the result");
            return Ok(false);
        }
        self.finish_completed(handle, digest)?;
        Ok(true)
    }

    fn finish_completed(&self, handle: &JobHandle, digest: String) -> Result<(), EngineError> {
        self.state.set_final_digest(&handle.id, digest.clone())?;
        handle.progress.flush();
        info!(
            job = %handle.id,
            bytes = handle.progress.completed(),
            digest = %digest,
            "job completed"
        );
        self.transition_then(handle, JobStatus::Completed, None, |_| {
            Some(TransferEvent::Completed {
                job_id: handle.id.clone(),
                digest,
            })
        })?;
        Ok(())
    }

    fn finish_failed(&self, handle: &JobHandle, failure: JobFailure) {
        let job_id = handle.id.clone();
        let fallback = failure.clone();
        let recorded = self.transition_then(handle, JobStatus::Failed, Some(failure), |m| {
            let first = m.job.failure.clone().unwrap_or_else(|| fallback.clone());
            error!(
                job = %job_id,
                class = %first.class,
                chunk = ?first.chunk_index,
                "job failed: {}",
                first.message
            );
            Some(TransferEvent::Failed {
                job_id: job_id.clone(),
                failure: first,
            })
        });
        if let Err(e) = recorded {
            error!(job = %handle.id, error = %e, "could not record job failure");
            self.emit(TransferEvent::Failed {
                job_id: handle.id.clone(),
                failure: fallback,
            });
            handle.status.send_replace(JobStatus::Failed);
        }
    }

    async fn finish_cancelled(&self, handle: &JobHandle) {
        let session = match self.state.snapshot(&handle.id) {
            Ok(m) => m.job.session_id,
            Err(e) => {
                warn!(job = %handle.id, error = %e, "could not read manifest while cancelling");
                None
            }
        };
        if let Some(session) = session {
            match self.store.abort_multipart(&session).await {
                Ok(()) => {
                    if let Err(e) = self.state.set_session(&handle.id, None) {
                        warn!(job = %handle.id, error = %e, "could not clear multipart session");
                    }
                }
                Err(e) => warn!(job = %handle.id, session = %session, error = %e, "failed to abort multipart session"),
            }
        }
        let cancelled = self.transition_then(handle, JobStatus::Cancelled, None, |_| {
            Some(TransferEvent::Cancelled {
                job_id: handle.id.clone(),
            })
        });
        match cancelled {
            Ok(_) => info!(job = %handle.id, "job cancelled"),
            Err(e) => {
                error!(job = %handle.id, error = %e, "could not record cancellation");
                handle.status.send_replace(JobStatus::Cancelled);
            }
        }
    }
}

/// Resolves once a cancel is requested. Never resolves if the control
/// channel closes first.
async fn cancel_requested(control: &mut watch::Receiver<Control>) {
    let closed = control.wait_for(|c| *c == Control::Cancel).await.is_err();
    if closed {
        std::future::pending::<()>().await;
    }
}

/// Digests every chunk range and the whole file off the runtime threads.
async fn local_digests(local: &Path, chunks: &[ChunkRecord]) -> Result<LocalDigests, EngineError> {
    let path = local.to_path_buf();
    let chunks = chunks.to_vec();
    tokio::task::spawn_blocking(move || digest_file_ranges(&path, &chunks))
        .await
        .map_err(|e| EngineError::Worker(e.to_string()))?
        .map_err(Into::into)
}

/// Splits a job's locators into its local path and remote object.
fn locators(job: &JobRecord) -> Result<(PathBuf, ObjectLocator), EngineError> {
    let (local, remote) = match job.direction {
        Direction::Upload => (&job.source, &job.destination),
        Direction::Download => (&job.destination, &job.source),
    };
    Ok((validate_local_path(local)?, ObjectLocator::parse(remote)?))
}

async fn local_file_size(path: &Path) -> Result<u64, EngineError> {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_file() => Ok(meta.len()),
        Ok(_) => Err(EngineError::InvalidRequest(format!(
            "{} is not a regular file",
            path.display()
        ))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(EngineError::InvalidRequest(
            format!("{} does not exist", path.display()),
        )),
        Err(e) => Err(e.into()),
    }
}
