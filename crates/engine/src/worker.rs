//! Chunk worker pool.
//!
//! [`ChunkPool::run`] dispatches every non-Completed chunk of a job with at
//! most `parallelism` attempts in flight, records each outcome in the state
//! store and schedules retries without holding a slot during the backoff.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, VecDeque};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use haul_protocol::{
    ChunkRecord, ChunkStatus, Direction, ErrorClass, JobFailure, JobId, JobStatus, Manifest,
};
use haul_state::{ChunkUpdate, StateStore};
use haul_transfer::{
    ObjectLocator, ProgressReporter, RetryController, RetryDecision, Throttle, checksum_bytes,
    read_range, verify, write_range,
};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::error::EngineError;
use crate::object_store::{ObjectStore, StoreError};

/// Signal from the orchestrator to a running pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Run,
    /// Stop dispatching, record in-flight results, then exit.
    Pause,
    /// Stop dispatching, discard in-flight results, then exit.
    Cancel,
}

/// How a pool run ended. In every case nothing is left in flight.
#[derive(Debug, Clone, PartialEq)]
pub enum PoolExit {
    /// Every chunk is Completed.
    Drained,
    Paused,
    Cancelled,
    /// A chunk gave up; carries the job's first failure.
    Failed(JobFailure),
}

/// What a single chunk attempt needs. Shared by all spawned attempts.
pub struct ChunkIo {
    pub job: JobId,
    pub direction: Direction,
    /// Source file for uploads, destination file for downloads.
    pub local: PathBuf,
    pub remote: ObjectLocator,
    /// Multipart session (uploads only).
    pub session: Option<String>,
    pub store: Arc<dyn ObjectStore>,
    pub global_throttle: Arc<Throttle>,
    pub job_throttle: Arc<Throttle>,
    pub chunk_timeout: Duration,
}

impl ChunkIo {
    /// Runs one attempt and returns the digest of the bytes moved.
    pub async fn execute(&self, chunk: &ChunkRecord) -> Result<String, EngineError> {
        self.job_throttle.acquire(chunk.length).await;
        self.global_throttle.acquire(chunk.length).await;

        tokio::time::timeout(self.chunk_timeout, self.transfer(chunk))
            .await
            .map_err(|_| EngineError::ChunkTimeout(self.chunk_timeout))?
    }

    async fn transfer(&self, chunk: &ChunkRecord) -> Result<String, EngineError> {
        match self.direction {
            Direction::Upload => {
                let session = self.session.as_deref().ok_or_else(|| {
                    EngineError::InvalidRequest("upload has no multipart session".into())
                })?;
                let data = read_range(&self.local, chunk.offset, chunk.length).await?;
                let digest = checksum_bytes(&data);
                let receipt = self.store.upload_part(session, chunk.index, data).await?;
                if !verify(&digest, &receipt.digest) {
                    return Err(EngineError::IntegrityMismatch {
                        expected: digest,
                        actual: receipt.digest,
                    });
                }
                Ok(digest)
            }
            Direction::Download => {
                let data = self
                    .store
                    .read_range(&self.remote, chunk.offset, chunk.length)
                    .await?;
                if data.len() as u64 != chunk.length {
                    return Err(EngineError::IntegrityMismatch {
                        expected: format!("{} bytes", chunk.length),
                        actual: format!("{} bytes", data.len()),
                    });
                }
                let digest = checksum_bytes(&data);
                write_range(&self.local, chunk.offset, &data).await?;
                Ok(digest)
            }
        }
    }
}

type Attempt = (ChunkRecord, Result<String, EngineError>);

/// Bounded executor for the chunks of one job.
pub struct ChunkPool {
    pub io: Arc<ChunkIo>,
    pub state: Arc<dyn StateStore>,
    pub retry: RetryController,
    pub parallelism: usize,
    pub progress: Arc<ProgressReporter>,
}

impl ChunkPool {
    /// Runs until every chunk is Completed, a chunk gives up, or `control`
    /// asks the pool to stop. In-flight attempts always drain first.
    pub async fn run(&self, control: &mut watch::Receiver<Control>) -> Result<PoolExit, EngineError> {
        let job = &self.io.job;
        let mut manifest = self.state.snapshot(job)?;

        let stuck: Vec<u32> = manifest
            .chunks
            .iter()
            .filter(|c| c.status == ChunkStatus::InFlight)
            .map(|c| c.index)
            .collect();
        if !stuck.is_empty() {
            manifest = self
                .persist(move |state, job| state.reset_chunks(job, &stuck))
                .await?;
        }
        self.progress.record(manifest.bytes_completed());

        let mut queue: VecDeque<u32> = manifest.pending_indices().into();
        let mut retries: BinaryHeap<Reverse<(Instant, u32)>> = BinaryHeap::new();
        let mut tasks: JoinSet<Attempt> = JoinSet::new();
        let mut failure: Option<JobFailure> = None;
        let mut control_open = true;
        let parallelism = self.parallelism.max(1);

        debug!(job = %job, pending = queue.len(), parallelism, "chunk pool started");

        loop {
            let mode = *control.borrow_and_update();
            let dispatching = mode == Control::Run && failure.is_none();

            if dispatching {
                let now = Instant::now();
                while let Some(&Reverse((due, _))) = retries.peek()
                    && due <= now
                {
                    if let Some(Reverse((_, index))) = retries.pop() {
                        queue.push_back(index);
                    }
                }
                while tasks.len() < parallelism {
                    let Some(index) = queue.pop_front() else { break };
                    self.dispatch(&mut tasks, index).await?;
                }
            }

            if tasks.is_empty() {
                // A recorded give-up outranks a pause but not a cancel.
                if mode == Control::Cancel {
                    return Ok(PoolExit::Cancelled);
                }
                if let Some(f) = failure {
                    return Ok(PoolExit::Failed(f));
                }
                if mode == Control::Pause {
                    return Ok(PoolExit::Paused);
                }
                if queue.is_empty() && retries.is_empty() {
                    return Ok(PoolExit::Drained);
                }
            }

            let next_retry = retries.peek().map(|Reverse((due, _))| *due);
            let wake_for_retry = dispatching && tasks.len() < parallelism && next_retry.is_some();

            tokio::select! {
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    let (chunk, outcome) = joined.map_err(|e| EngineError::Worker(e.to_string()))?;
                    let mode = *control.borrow();
                    self.settle(chunk, outcome, mode, &mut retries, &mut failure).await?;
                }
                changed = control.changed(), if control_open => {
                    if changed.is_err() {
                        control_open = false;
                    }
                }
                _ = tokio::time::sleep_until(next_retry.unwrap_or_else(Instant::now)), if wake_for_retry => {}
                else => {
                    return Err(EngineError::Worker("chunk pool has nothing to wait on".into()));
                }
            }
        }
    }

    /// Runs a state write on the blocking pool. The file backend fsyncs
    /// every record, which must not stall the runtime's worker threads.
    async fn persist<T, F>(&self, write: F) -> Result<T, EngineError>
    where
        F: FnOnce(&dyn StateStore, &JobId) -> haul_state::error::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let state = Arc::clone(&self.state);
        let job = self.io.job.clone();
        let written = tokio::task::spawn_blocking(move || write(&*state, &job))
            .await
            .map_err(|e| EngineError::Worker(e.to_string()))?;
        Ok(written?)
    }

    async fn mark(&self, index: u32, update: ChunkUpdate) -> Result<Manifest, EngineError> {
        self.persist(move |state, job| state.mark_chunk(job, index, update))
            .await
    }

    async fn dispatch(&self, tasks: &mut JoinSet<Attempt>, index: u32) -> Result<(), EngineError> {
        let job = &self.io.job;
        let manifest = self.mark(index, ChunkUpdate::Dispatch).await?;
        let chunk = manifest
            .chunk(index)
            .cloned()
            .ok_or_else(|| EngineError::Worker(format!("chunk {index} vanished from manifest")))?;
        debug!(
            job = %job,
            chunk = index,
            attempt = chunk.attempts,
            offset = chunk.offset,
            length = chunk.length,
            "dispatching chunk"
        );

        let io = Arc::clone(&self.io);
        tasks.spawn(async move {
            let outcome = io.execute(&chunk).await;
            (chunk, outcome)
        });
        Ok(())
    }

    async fn settle(
        &self,
        chunk: ChunkRecord,
        outcome: Result<String, EngineError>,
        mode: Control,
        retries: &mut BinaryHeap<Reverse<(Instant, u32)>>,
        failure: &mut Option<JobFailure>,
    ) -> Result<(), EngineError> {
        let job = &self.io.job;
        let index = chunk.index;

        if mode == Control::Cancel {
            self.mark(index, ChunkUpdate::Reset).await?;
            debug!(job = %job, chunk = index, "discarded chunk result after cancel");
            return Ok(());
        }

        let err = match outcome {
            Ok(digest) => {
                let manifest = self.mark(index, ChunkUpdate::Succeed { digest }).await?;
                debug!(job = %job, chunk = index, attempt = chunk.attempts, "chunk completed");
                self.progress.record(manifest.bytes_completed());
                return Ok(());
            }
            Err(err) => err,
        };

        let class = err.class();
        self.mark(index, ChunkUpdate::Fail { class }).await?;

        match self.retry.decide(&chunk, class) {
            RetryDecision::Retry(delay) if failure.is_none() => {
                warn!(
                    job = %job,
                    chunk = index,
                    attempt = chunk.attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "chunk attempt failed, retrying"
                );
                retries.push(Reverse((Instant::now() + delay, index)));
            }
            RetryDecision::Retry(_) => {
                debug!(job = %job, chunk = index, error = %err, "job already failing, not retrying chunk");
            }
            RetryDecision::GiveUp(reason) => {
                error!(
                    job = %job,
                    chunk = index,
                    attempt = chunk.attempts,
                    class = %class,
                    error = %err,
                    "chunk failed: {reason}"
                );
                let first = JobFailure {
                    class,
                    message: format!("{reason}: {err}"),
                    chunk_index: Some(index),
                };
                let recorded = first.clone();
                let manifest = self
                    .persist(move |state, job| {
                        state.mark_job(job, JobStatus::InProgress, Some(recorded))
                    })
                    .await?;
                if failure.is_none() {
                    *failure = Some(manifest.job.failure.unwrap_or(first));
                }
            }
        }
        Ok(())
    }
}

/// Runs a job-level remote call under the retry policy.
///
/// Chunk attempts are retried by the pool; this covers the calls around
/// them (multipart create/complete, metadata lookups).
pub async fn with_retries<T, F, Fut>(
    retry: &RetryController,
    job: &JobId,
    what: &str,
    mut op: F,
) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let mut attempts = 0u32;
    let mut mismatches = 0u32;
    loop {
        attempts += 1;
        let err = match op().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };
        let class = err.class();
        match retry.decide_attempt(attempts, mismatches, class) {
            RetryDecision::Retry(delay) => {
                warn!(
                    job = %job,
                    op = what,
                    attempt = attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "remote call failed, retrying"
                );
                tokio::time::sleep(delay).await;
                if class == ErrorClass::IntegrityMismatch {
                    mismatches += 1;
                }
            }
            RetryDecision::GiveUp(reason) => {
                error!(job = %job, op = what, error = %err, "remote call failed: {reason}");
                return Err(err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::LocalObjectStore;
    use haul_protocol::RetryPolicy;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn controller() -> RetryController {
        RetryController::new(RetryPolicy {
            max_attempts: 5,
            base_backoff: Duration::from_millis(100),
            multiplier: 2.0,
            max_backoff: Duration::from_secs(1),
            jitter: 0.0,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn with_retries_backs_off_between_transient_failures() {
        let calls = AtomicU32::new(0);
        let started = Instant::now();
        let value = with_retries(&controller(), &JobId::from("j"), "head_object", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 3 {
                    Err(StoreError::Timeout)
                } else {
                    Ok(n)
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(value, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(started.elapsed(), Duration::from_millis(700));
    }

    #[tokio::test(start_paused = true)]
    async fn with_retries_stops_on_permanent_error() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retries(&controller(), &JobId::from("j"), "head_object", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(StoreError::Unauthorized("denied".into())) }
        })
        .await;

        assert!(matches!(result, Err(StoreError::Unauthorized(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn download_attempt_writes_range_and_returns_digest() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(LocalObjectStore::new(dir.path().join("remote")));
        let remote = ObjectLocator::parse("bucket/obj.bin").unwrap();
        store.put_object(&remote, b"0123456789", None).await.unwrap();

        let local = dir.path().join("out.bin");
        haul_transfer::chunked::prepare_destination(&local, 10).await.unwrap();

        let io = ChunkIo {
            job: JobId::from("j"),
            direction: Direction::Download,
            local: local.clone(),
            remote,
            session: None,
            store,
            global_throttle: Arc::new(Throttle::unlimited()),
            job_throttle: Arc::new(Throttle::unlimited()),
            chunk_timeout: Duration::from_secs(5),
        };
        let chunk = ChunkRecord::new(1, 4, 6);
        let digest = io.execute(&chunk).await.unwrap();

        assert_eq!(digest, checksum_bytes(b"456789"));
        assert_eq!(&std::fs::read(&local).unwrap()[4..], b"456789");
    }

    #[tokio::test]
    async fn upload_without_session_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src.bin");
        std::fs::write(&src, b"abc").unwrap();

        let io = ChunkIo {
            job: JobId::from("j"),
            direction: Direction::Upload,
            local: src,
            remote: ObjectLocator::parse("bucket/obj").unwrap(),
            session: None,
            store: Arc::new(LocalObjectStore::new(dir.path())),
            global_throttle: Arc::new(Throttle::unlimited()),
            job_throttle: Arc::new(Throttle::unlimited()),
            chunk_timeout: Duration::from_secs(5),
        };
        let err = io.execute(&ChunkRecord::new(0, 0, 3)).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidRequest(_)));
    }
}
