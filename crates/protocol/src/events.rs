use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{JobFailure, JobId, JobStatus};

/// Coalesced progress notification for the monitoring layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub job_id: JobId,
    pub bytes_completed: u64,
    pub bytes_total: u64,
    pub timestamp: DateTime<Utc>,
}

impl ProgressEvent {
    /// Returns progress as a percentage (0-100).
    ///
    /// A zero-byte job reports 100% once its only chunk is done.
    pub fn percentage(&self) -> f64 {
        if self.bytes_total == 0 {
            return 100.0;
        }
        self.bytes_completed as f64 / self.bytes_total as f64 * 100.0
    }
}

/// Everything the engine reports about a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum TransferEvent {
    Progress(ProgressEvent),
    StatusChanged {
        job_id: JobId,
        status: JobStatus,
    },
    Completed {
        job_id: JobId,
        digest: String,
    },
    Failed {
        job_id: JobId,
        failure: JobFailure,
    },
    Cancelled {
        job_id: JobId,
    },
}

impl TransferEvent {
    pub fn job_id(&self) -> &JobId {
        match self {
            TransferEvent::Progress(p) => &p.job_id,
            TransferEvent::StatusChanged { job_id, .. }
            | TransferEvent::Completed { job_id, .. }
            | TransferEvent::Failed { job_id, .. }
            | TransferEvent::Cancelled { job_id } => job_id,
        }
    }

    /// Returns `true` for events after which the job never changes again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferEvent::Completed { .. }
                | TransferEvent::Failed { .. }
                | TransferEvent::Cancelled { .. }
        )
    }
}
