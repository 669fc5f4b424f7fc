//! Chunk planning: splits a job's byte range into contiguous chunks.

use haul_protocol::{ChunkBounds, ChunkRecord};

use crate::TransferError;

/// Inputs for [`plan`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlanRequest {
    pub total_size: u64,
    pub parallelism: u32,
    pub bounds: ChunkBounds,
    /// Native part size of the remote object. When set it overrides the
    /// computed chunk size so per-part digests line up with the remote's.
    pub part_size: Option<u64>,
}

/// Validates chunk bounds and parallelism.
pub fn validate_plan_inputs(parallelism: u32, bounds: ChunkBounds) -> Result<(), TransferError> {
    if parallelism == 0 {
        return Err(TransferError::InvalidRequest(
            "parallelism must be at least 1".into(),
        ));
    }
    if bounds.min == 0 {
        return Err(TransferError::InvalidRequest(
            "minimum chunk size must be at least 1 byte".into(),
        ));
    }
    if bounds.min > bounds.max {
        return Err(TransferError::InvalidRequest(format!(
            "chunk bounds inverted: min {} > max {}",
            bounds.min, bounds.max
        )));
    }
    Ok(())
}

/// Largest chunk size such that `total / size >= parallelism`, clamped to
/// `bounds`.
pub fn chunk_size_for(total_size: u64, parallelism: u32, bounds: ChunkBounds) -> u64 {
    let ideal = total_size / u64::from(parallelism.max(1));
    ideal.clamp(bounds.min, bounds.max)
}

/// Builds the chunk list for a new job.
///
/// A zero-byte job gets a single zero-length chunk.
pub fn plan(req: &PlanRequest) -> Result<Vec<ChunkRecord>, TransferError> {
    validate_plan_inputs(req.parallelism, req.bounds)?;

    if req.total_size == 0 {
        return Ok(vec![ChunkRecord::new(0, 0, 0)]);
    }

    let chunk_size = match req.part_size {
        Some(p) if p > 0 => p,
        _ => chunk_size_for(req.total_size, req.parallelism, req.bounds),
    };

    let count = req.total_size.div_ceil(chunk_size);
    if count > u64::from(u32::MAX) {
        return Err(TransferError::InvalidRequest(format!(
            "{count} chunks exceed the manifest limit"
        )));
    }

    let chunks = (0..count)
        .map(|i| {
            let offset = i * chunk_size;
            let length = chunk_size.min(req.total_size - offset);
            ChunkRecord::new(i as u32, offset, length)
        })
        .collect();
    Ok(chunks)
}

/// Checks that `chunks` tile `[0, total_size)` exactly, with indices
/// `0..N` in order.
pub fn coverage_check(chunks: &[ChunkRecord], total_size: u64) -> Result<(), TransferError> {
    if chunks.is_empty() {
        return Err(TransferError::Coverage("manifest has no chunks".into()));
    }
    let mut expected_offset = 0u64;
    for (i, chunk) in chunks.iter().enumerate() {
        if chunk.index as usize != i {
            return Err(TransferError::Coverage(format!(
                "chunk at position {i} has index {}",
                chunk.index
            )));
        }
        if chunk.offset != expected_offset {
            return Err(TransferError::Coverage(format!(
                "chunk {} starts at {} but previous range ended at {expected_offset}",
                chunk.index, chunk.offset
            )));
        }
        expected_offset = chunk.end();
    }
    if expected_offset != total_size {
        return Err(TransferError::Coverage(format!(
            "chunks cover {expected_offset} bytes, job has {total_size}"
        )));
    }
    Ok(())
}
