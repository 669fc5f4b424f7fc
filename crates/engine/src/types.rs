use std::time::Duration;

use haul_protocol::{
    ChunkBounds, ChunkSummary, Direction, JobFailure, JobId, JobStatus, Manifest, RetryPolicy,
    duration_ms,
};
use serde::{Deserialize, Serialize};

/// Engine-wide defaults and limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Chunks in flight per job unless the job asks for another value.
    pub parallelism: u32,
    pub chunk_bounds: ChunkBounds,
    /// Aggregate bytes/sec across all jobs; unset means unlimited.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bandwidth_cap: Option<u64>,
    pub retry_policy: RetryPolicy,
    #[serde(rename = "chunk_timeout_ms", with = "duration_ms")]
    pub chunk_timeout: Duration,
    #[serde(rename = "progress_interval_ms", with = "duration_ms")]
    pub progress_interval: Duration,
    pub event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            parallelism: 4,
            chunk_bounds: ChunkBounds::default(),
            bandwidth_cap: None,
            retry_policy: RetryPolicy::default(),
            chunk_timeout: Duration::from_secs(120),
            progress_interval: Duration::from_millis(500),
            event_capacity: 256,
        }
    }
}

/// Per-job overrides of [`EngineConfig`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct JobOptions {
    pub parallelism: Option<u32>,
    /// Per-job bytes/sec, enforced in addition to the global cap.
    pub bandwidth_cap: Option<u64>,
    pub chunk_bounds: Option<ChunkBounds>,
    pub retry_policy: Option<RetryPolicy>,
    /// Whole-object digest the result must match.
    pub expected_digest: Option<String>,
}

/// A transfer request.
///
/// Uploads read `source` as a local path and write `destination` as
/// `bucket/key`; downloads are the other way round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitRequest {
    pub direction: Direction,
    pub source: String,
    pub destination: String,
    /// Expected size in bytes; checked against the real size when given.
    #[serde(default)]
    pub size_hint: Option<i64>,
    #[serde(default)]
    pub options: JobOptions,
}

impl SubmitRequest {
    pub fn upload(local: impl Into<String>, object: impl Into<String>) -> Self {
        Self {
            direction: Direction::Upload,
            source: local.into(),
            destination: object.into(),
            size_hint: None,
            options: JobOptions::default(),
        }
    }

    pub fn download(object: impl Into<String>, local: impl Into<String>) -> Self {
        Self {
            direction: Direction::Download,
            source: object.into(),
            destination: local.into(),
            size_hint: None,
            options: JobOptions::default(),
        }
    }

    pub fn with_options(mut self, options: JobOptions) -> Self {
        self.options = options;
        self
    }
}

/// Point-in-time view of a job, as returned by `query`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSnapshot {
    pub job_id: JobId,
    pub direction: Direction,
    pub status: JobStatus,
    pub bytes_completed: u64,
    pub bytes_total: u64,
    pub chunk_summary: ChunkSummary,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<JobFailure>,
    /// Lowest and highest index of Failed chunks.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_range: Option<(u32, u32)>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_digest: Option<String>,
}

impl From<&Manifest> for JobSnapshot {
    fn from(m: &Manifest) -> Self {
        Self {
            job_id: m.job.id.clone(),
            direction: m.job.direction,
            status: m.job.status,
            bytes_completed: m.bytes_completed(),
            bytes_total: m.job.total_size,
            chunk_summary: m.summary(),
            failure: m.job.failure.clone(),
            failed_range: m.failed_range(),
            final_digest: m.job.final_digest.clone(),
        }
    }
}
