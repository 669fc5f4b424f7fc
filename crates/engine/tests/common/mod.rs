//! Shared fixtures for the engine integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use haul_engine::{
    EngineConfig, LocalObjectStore, ObjectMeta, ObjectStore, Orchestrator, PartReceipt,
    StoreError, StoreFuture,
};
use haul_protocol::{ChunkBounds, RetryPolicy, TransferEvent};
use haul_state::{FileStateStore, StateStore};
use haul_transfer::ObjectLocator;
use tokio::sync::{Semaphore, mpsc, watch};
use tokio::time::Instant;

/// A failure the scripted store returns instead of doing the work.
#[derive(Debug, Clone, Copy)]
pub enum Fault {
    Timeout,
    Unauthorized,
    Server(u16),
}

impl Fault {
    fn into_error(self) -> StoreError {
        match self {
            Fault::Timeout => StoreError::Timeout,
            Fault::Unauthorized => StoreError::Unauthorized("access denied".into()),
            Fault::Server(code) => StoreError::Server(code),
        }
    }
}

/// One observed data-plane call.
#[derive(Debug, Clone, Copy)]
pub struct Call {
    /// Part number for uploads, offset for reads.
    pub key: u64,
    pub at: Instant,
}

/// [`LocalObjectStore`] with injectable faults, call logging and gates.
pub struct ScriptedStore {
    inner: LocalObjectStore,
    part_faults: Mutex<HashMap<u32, VecDeque<Fault>>>,
    read_faults: Mutex<HashMap<u64, VecDeque<Fault>>>,
    uploads: Mutex<Vec<Call>>,
    reads: Mutex<Vec<Call>>,
    gated_parts: Mutex<HashSet<u32>>,
    gated_complete: Mutex<bool>,
    gate: Semaphore,
    upload_delay: Mutex<Duration>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    started: watch::Sender<usize>,
    aborted: Mutex<Vec<String>>,
}

impl ScriptedStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            inner: LocalObjectStore::new(root),
            part_faults: Mutex::new(HashMap::new()),
            read_faults: Mutex::new(HashMap::new()),
            uploads: Mutex::new(Vec::new()),
            reads: Mutex::new(Vec::new()),
            gated_parts: Mutex::new(HashSet::new()),
            gated_complete: Mutex::new(false),
            gate: Semaphore::new(0),
            upload_delay: Mutex::new(Duration::ZERO),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
            started: watch::Sender::new(0),
            aborted: Mutex::new(Vec::new()),
        }
    }

    pub fn local(&self) -> &LocalObjectStore {
        &self.inner
    }

    pub fn fail_part(&self, part: u32, faults: &[Fault]) {
        self.part_faults
            .lock()
            .unwrap()
            .entry(part)
            .or_default()
            .extend(faults.iter().copied());
    }

    pub fn fail_read(&self, offset: u64, faults: &[Fault]) {
        self.read_faults
            .lock()
            .unwrap()
            .entry(offset)
            .or_default()
            .extend(faults.iter().copied());
    }

    pub fn clear_faults(&self) {
        self.part_faults.lock().unwrap().clear();
        self.read_faults.lock().unwrap().clear();
    }

    /// Uploads of these parts block until [`release`](Self::release).
    pub fn gate_parts(&self, parts: impl IntoIterator<Item = u32>) {
        self.gated_parts.lock().unwrap().extend(parts);
    }

    /// Later uploads pass straight through. Already blocked ones still
    /// need [`release`](Self::release).
    pub fn clear_gates(&self) {
        self.gated_parts.lock().unwrap().clear();
    }

    /// `complete_multipart` blocks on the same gate as gated parts.
    pub fn gate_complete(&self) {
        *self.gated_complete.lock().unwrap() = true;
    }

    /// Every part upload takes at least `delay`.
    pub fn slow_uploads(&self, delay: Duration) {
        *self.upload_delay.lock().unwrap() = delay;
    }

    /// Most part uploads that were ever running at the same time.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    pub fn release(&self, n: usize) {
        self.gate.add_permits(n);
    }

    /// Waits until `n` gated uploads are blocked on the gate.
    pub async fn wait_gated(&self, n: usize) {
        let mut rx = self.started.subscribe();
        rx.wait_for(|started| *started >= n).await.unwrap();
    }

    pub fn upload_calls(&self) -> Vec<Call> {
        self.uploads.lock().unwrap().clone()
    }

    pub fn uploads_of(&self, part: u32) -> Vec<Instant> {
        self.uploads
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.key == u64::from(part))
            .map(|c| c.at)
            .collect()
    }

    pub fn read_calls(&self) -> Vec<Call> {
        self.reads.lock().unwrap().clone()
    }

    pub fn aborted(&self) -> Vec<String> {
        self.aborted.lock().unwrap().clone()
    }

    fn take_part_fault(&self, part: u32) -> Option<Fault> {
        self.part_faults.lock().unwrap().get_mut(&part)?.pop_front()
    }

    fn take_read_fault(&self, offset: u64) -> Option<Fault> {
        self.read_faults.lock().unwrap().get_mut(&offset)?.pop_front()
    }

    async fn pass_gate(&self) {
        self.started.send_modify(|n| *n += 1);
        let permit = self.gate.acquire().await.unwrap();
        permit.forget();
    }

    async fn scripted_upload(
        &self,
        session: &str,
        part_number: u32,
        data: Vec<u8>,
    ) -> Result<PartReceipt, StoreError> {
        self.uploads.lock().unwrap().push(Call {
            key: u64::from(part_number),
            at: Instant::now(),
        });
        if let Some(fault) = self.take_part_fault(part_number) {
            return Err(fault.into_error());
        }
        let delay = *self.upload_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let gated = self.gated_parts.lock().unwrap().contains(&part_number);
        if gated {
            self.pass_gate().await;
        }
        self.inner.upload_part(session, part_number, data).await
    }
}

impl ObjectStore for ScriptedStore {
    fn head_object<'a>(&'a self, object: &'a ObjectLocator) -> StoreFuture<'a, ObjectMeta> {
        self.inner.head_object(object)
    }

    fn read_range<'a>(
        &'a self,
        object: &'a ObjectLocator,
        offset: u64,
        length: u64,
    ) -> StoreFuture<'a, Vec<u8>> {
        Box::pin(async move {
            self.reads.lock().unwrap().push(Call {
                key: offset,
                at: Instant::now(),
            });
            if let Some(fault) = self.take_read_fault(offset) {
                return Err(fault.into_error());
            }
            self.inner.read_range(object, offset, length).await
        })
    }

    fn create_multipart<'a>(&'a self, object: &'a ObjectLocator) -> StoreFuture<'a, String> {
        self.inner.create_multipart(object)
    }

    fn upload_part<'a>(
        &'a self,
        session: &'a str,
        part_number: u32,
        data: Vec<u8>,
    ) -> StoreFuture<'a, PartReceipt> {
        Box::pin(async move {
            let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak_in_flight.fetch_max(running, Ordering::SeqCst);
            let result = self.scripted_upload(session, part_number, data).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            result
        })
    }

    fn complete_multipart<'a>(
        &'a self,
        session: &'a str,
        parts: Vec<PartReceipt>,
    ) -> StoreFuture<'a, ObjectMeta> {
        Box::pin(async move {
            let gated = *self.gated_complete.lock().unwrap();
            if gated {
                self.pass_gate().await;
            }
            self.inner.complete_multipart(session, parts).await
        })
    }

    fn abort_multipart<'a>(&'a self, session: &'a str) -> StoreFuture<'a, ()> {
        self.aborted.lock().unwrap().push(session.to_string());
        self.inner.abort_multipart(session)
    }
}

/// Small chunks, fast retries, no jitter.
pub fn fast_config() -> EngineConfig {
    EngineConfig {
        parallelism: 4,
        chunk_bounds: ChunkBounds { min: 1, max: 1 << 20 },
        bandwidth_cap: None,
        retry_policy: RetryPolicy {
            max_attempts: 5,
            base_backoff: Duration::from_millis(10),
            multiplier: 2.0,
            max_backoff: Duration::from_millis(200),
            jitter: 0.0,
        },
        chunk_timeout: Duration::from_secs(10),
        progress_interval: Duration::ZERO,
        event_capacity: 4096,
    }
}

pub struct Harness {
    pub root: PathBuf,
    pub store: Arc<ScriptedStore>,
    pub state: Arc<FileStateStore>,
    pub orch: Orchestrator,
    pub events: mpsc::Receiver<TransferEvent>,
}

/// Builds an orchestrator over `<root>/remote` and `<root>/state`.
pub fn harness_at(root: &Path, config: EngineConfig) -> Harness {
    let store = Arc::new(ScriptedStore::new(root.join("remote")));
    let state = Arc::new(FileStateStore::open(root.join("state")).unwrap());
    let mut orch = Orchestrator::new(
        config,
        Arc::clone(&store) as Arc<dyn ObjectStore>,
        Arc::clone(&state) as Arc<dyn StateStore>,
    );
    let events = orch.take_events().unwrap();
    Harness {
        root: root.to_path_buf(),
        store,
        state,
        orch,
        events,
    }
}

/// Deterministic, non-repeating test payload.
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i.wrapping_mul(31) % 251) as u8).collect()
}

/// Writes `len` payload bytes to `<root>/<name>` and returns the path.
pub fn write_source(root: &Path, name: &str, len: usize) -> (PathBuf, Vec<u8>) {
    let data = payload(len);
    let path = root.join(name);
    std::fs::write(&path, &data).unwrap();
    (path, data)
}

pub fn path_str(path: &Path) -> String {
    path.to_str().unwrap().to_string()
}

/// Everything currently buffered on the event channel.
pub fn drain(events: &mut mpsc::Receiver<TransferEvent>) -> Vec<TransferEvent> {
    let mut out = Vec::new();
    while let Ok(ev) = events.try_recv() {
        out.push(ev);
    }
    out
}

pub fn progress_values(events: &[TransferEvent]) -> Vec<u64> {
    events
        .iter()
        .filter_map(|e| match e {
            TransferEvent::Progress(p) => Some(p.bytes_completed),
            _ => None,
        })
        .collect()
}
