use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Unique identifier of a transfer job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Generates a fresh random job ID.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which way bytes flow relative to the remote store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Upload,
    Download,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Upload => f.write_str("upload"),
            Direction::Download => f.write_str("download"),
        }
    }
}

// ---------------------------------------------------------------------------
// Job state machine
// ---------------------------------------------------------------------------

/// Lifecycle state of a transfer job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    #[serde(rename = "pending")]
    Pending,
    #[serde(rename = "planning")]
    Planning,
    #[serde(rename = "in_progress")]
    InProgress,
    #[serde(rename = "paused")]
    Paused,
    #[serde(rename = "completed")]
    Completed,
    #[serde(rename = "failed")]
    Failed,
    #[serde(rename = "cancelled")]
    Cancelled,
}

impl JobStatus {
    /// Completed, Failed and Cancelled never change again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Returns `true` if the job state machine allows `self -> next`.
    ///
    /// Staying in the same state is always allowed for non-terminal states.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        if self == next {
            return !self.is_terminal();
        }
        match (self, next) {
            (Pending, Planning) => true,
            (Planning, InProgress) => true,
            (InProgress, Paused) | (Paused, InProgress) => true,
            (InProgress, Completed) => true,
            (Pending | Planning | InProgress | Paused, Failed | Cancelled) => true,
            _ => false,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Pending => "pending",
            JobStatus::Planning => "planning",
            JobStatus::InProgress => "in_progress",
            JobStatus::Paused => "paused",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Chunk state machine
// ---------------------------------------------------------------------------

/// Status of a single chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChunkStatus {
    #[serde(rename = "pending")]
    Pending,
    #[serde(rename = "in_flight")]
    InFlight,
    #[serde(rename = "completed")]
    Completed,
    #[serde(rename = "failed")]
    Failed,
}

/// Input to the chunk transition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkEvent {
    /// A worker picked the chunk up.
    Dispatch,
    /// The transfer and digest succeeded.
    Succeed,
    /// The attempt failed (retry or give-up is decided separately).
    Fail,
    /// The chunk must be transferred again from scratch.
    Reset,
}

/// Rejected chunk transition.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid chunk transition: {from:?} on {event:?}")]
pub struct InvalidTransition {
    pub from: ChunkStatus,
    pub event: ChunkEvent,
}

impl ChunkStatus {
    /// Applies `event` to the current status.
    ///
    /// | from              | event    | to        |
    /// |-------------------|----------|-----------|
    /// | Pending, Failed   | Dispatch | InFlight  |
    /// | InFlight          | Succeed  | Completed |
    /// | InFlight          | Fail     | Failed    |
    /// | any               | Reset    | Pending   |
    pub fn apply(self, event: ChunkEvent) -> Result<ChunkStatus, InvalidTransition> {
        use ChunkStatus::*;
        match (self, event) {
            (Pending | Failed, ChunkEvent::Dispatch) => Ok(InFlight),
            (InFlight, ChunkEvent::Succeed) => Ok(Completed),
            (InFlight, ChunkEvent::Fail) => Ok(Failed),
            (_, ChunkEvent::Reset) => Ok(Pending),
            (from, event) => Err(InvalidTransition { from, event }),
        }
    }
}

// ---------------------------------------------------------------------------
// Errors and policies
// ---------------------------------------------------------------------------

/// Classification of a failure, shared by chunks and jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    InvalidRequest,
    Transient,
    Permanent,
    IntegrityMismatch,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorClass::InvalidRequest => "invalid_request",
            ErrorClass::Transient => "transient",
            ErrorClass::Permanent => "permanent",
            ErrorClass::IntegrityMismatch => "integrity_mismatch",
        };
        f.write_str(s)
    }
}

/// Retry configuration for chunk attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryPolicy {
    /// Total attempts per chunk, including the first one.
    pub max_attempts: u32,
    #[serde(with = "duration_ms")]
    pub base_backoff: Duration,
    pub multiplier: f64,
    #[serde(with = "duration_ms")]
    pub max_backoff: Duration,
    /// Jitter as a fraction of the computed delay (0.2 = ±20%).
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_backoff: Duration::from_millis(200),
            multiplier: 2.0,
            max_backoff: Duration::from_secs(30),
            jitter: 0.2,
        }
    }
}

/// Inclusive lower/upper bound for the planned chunk size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkBounds {
    pub min: u64,
    pub max: u64,
}

impl Default for ChunkBounds {
    fn default() -> Self {
        Self {
            min: 4 * 1024 * 1024,
            max: 64 * 1024 * 1024,
        }
    }
}

// ---------------------------------------------------------------------------
// Persisted records
// ---------------------------------------------------------------------------

/// One contiguous byte range of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkRecord {
    pub index: u32,
    pub offset: u64,
    pub length: u64,
    pub status: ChunkStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<ErrorClass>,
    /// Attempts that ended in an integrity mismatch.
    #[serde(default, skip_serializing_if = "is_zero_u32")]
    pub mismatches: u32,
}

fn is_zero_u32(n: &u32) -> bool {
    *n == 0
}

impl ChunkRecord {
    pub fn new(index: u32, offset: u64, length: u64) -> Self {
        Self {
            index,
            offset,
            length,
            status: ChunkStatus::Pending,
            digest: None,
            attempts: 0,
            last_error: None,
            mismatches: 0,
        }
    }

    /// Exclusive end offset.
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }
}

/// The first failure that terminated a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobFailure {
    pub class: ErrorClass,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_index: Option<u32>,
}

/// Job metadata persisted alongside the chunk list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub id: JobId,
    pub direction: Direction,
    pub source: String,
    pub destination: String,
    pub total_size: u64,
    pub parallelism: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bandwidth_cap: Option<u64>,
    pub chunk_bounds: ChunkBounds,
    pub retry_policy: RetryPolicy,
    pub status: JobStatus,
    /// Remote multipart session (uploads only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Whole-object digest the result must match, when known up front.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_digest: Option<String>,
    /// Whole-object digest verified at completion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_digest: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<JobFailure>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Per-status chunk counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkSummary {
    pub total: u32,
    pub pending: u32,
    pub in_flight: u32,
    pub completed: u32,
    pub failed: u32,
}

/// Ordered chunk list of a job plus its metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    /// Bumped by the state store on every write.
    pub version: u64,
    pub job: JobRecord,
    pub chunks: Vec<ChunkRecord>,
}

impl Manifest {
    /// Bytes covered by Completed chunks.
    pub fn bytes_completed(&self) -> u64 {
        self.chunks
            .iter()
            .filter(|c| c.status == ChunkStatus::Completed)
            .map(|c| c.length)
            .sum()
    }

    pub fn summary(&self) -> ChunkSummary {
        let mut s = ChunkSummary {
            total: self.chunks.len() as u32,
            ..ChunkSummary::default()
        };
        for chunk in &self.chunks {
            match chunk.status {
                ChunkStatus::Pending => s.pending += 1,
                ChunkStatus::InFlight => s.in_flight += 1,
                ChunkStatus::Completed => s.completed += 1,
                ChunkStatus::Failed => s.failed += 1,
            }
        }
        s
    }

    /// Indices of every chunk that still needs a transfer, in index order.
    pub fn pending_indices(&self) -> Vec<u32> {
        self.chunks
            .iter()
            .filter(|c| c.status != ChunkStatus::Completed)
            .map(|c| c.index)
            .collect()
    }

    /// Returns `true` once every chunk is Completed.
    pub fn all_completed(&self) -> bool {
        self.chunks.iter().all(|c| c.status == ChunkStatus::Completed)
    }

    /// Lowest and highest index of Failed chunks.
    pub fn failed_range(&self) -> Option<(u32, u32)> {
        let mut failed = self
            .chunks
            .iter()
            .filter(|c| c.status == ChunkStatus::Failed)
            .map(|c| c.index);
        let first = failed.next()?;
        let last = failed.last().unwrap_or(first);
        Some((first, last))
    }

    pub fn chunk(&self, index: u32) -> Option<&ChunkRecord> {
        self.chunks.get(index as usize)
    }
}

/// Serializes a [`Duration`] as whole milliseconds.
pub mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        (d.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}
