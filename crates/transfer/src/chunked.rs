use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use haul_protocol::{ChunkRecord, ChunkStatus, Manifest};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use crate::TransferError;

/// Read buffer for whole-file digests.
const HASH_BUF_SIZE: usize = 256 * 1024;

// ---------------------------------------------------------------------------
// Digests
// ---------------------------------------------------------------------------

/// Computes SHA-256 of `data` and returns the hex-encoded digest.
pub fn checksum_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Digest of zero bytes.
pub fn empty_digest() -> String {
    checksum_bytes(&[])
}

/// Combines per-chunk digests into the whole-object digest.
///
/// Chunks are combined in index order regardless of the order they are
/// passed in. A single chunk's digest is the whole-object digest; for more
/// chunks the result is `sha256(raw digests in index order)` followed by
/// `-<chunk count>`.
pub fn combine_chunk_digests(chunks: &[ChunkRecord]) -> Result<String, TransferError> {
    let mut ordered: Vec<&ChunkRecord> = chunks.iter().collect();
    ordered.sort_by_key(|c| c.index);

    let digests = ordered
        .iter()
        .map(|c| c.digest.as_deref().ok_or(TransferError::MissingDigest(c.index)))
        .collect::<Result<Vec<&str>, _>>()?;
    combine_ordered(&digests)
}

/// Combines digests that are already in part order.
pub fn combine_ordered<S: AsRef<str>>(digests: &[S]) -> Result<String, TransferError> {
    if let [only] = digests {
        return Ok(only.as_ref().to_string());
    }

    let mut hasher = Sha256::new();
    for (i, digest) in digests.iter().enumerate() {
        let raw = hex::decode(digest.as_ref()).map_err(|_| TransferError::MissingDigest(i as u32))?;
        hasher.update(&raw);
    }
    Ok(format!("{}-{}", hex::encode(hasher.finalize()), digests.len()))
}

/// Whole-object digest of a manifest.
pub fn combine_digests(manifest: &Manifest) -> Result<String, TransferError> {
    combine_chunk_digests(&manifest.chunks)
}

/// Compares two hex digests (case-insensitive).
pub fn verify(expected: &str, actual: &str) -> bool {
    expected.eq_ignore_ascii_case(actual)
}

/// Returns `true` if `digest` is a combined multi-chunk digest.
pub fn is_composite(digest: &str) -> bool {
    digest.contains('-')
}

/// Computes SHA-256 of an entire file and returns the hex-encoded digest.
pub fn calculate_file_checksum(path: &Path) -> Result<String, TransferError> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; HASH_BUF_SIZE];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Digests of a local file as laid out by a manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalDigests {
    /// SHA-256 of the whole file.
    pub whole: String,
    /// Recomputed digest per chunk, in index order.
    pub chunks: Vec<String>,
}

/// Re-reads `path` once, digesting every chunk range and the whole file.
pub fn digest_file_ranges(path: &Path, chunks: &[ChunkRecord]) -> Result<LocalDigests, TransferError> {
    let mut ordered: Vec<&ChunkRecord> = chunks.iter().collect();
    ordered.sort_by_key(|c| c.index);

    let mut file = std::fs::File::open(path)?;
    let mut whole = Sha256::new();
    let mut digests = Vec::with_capacity(ordered.len());
    let mut buf = vec![0u8; HASH_BUF_SIZE];

    for chunk in ordered {
        file.seek(SeekFrom::Start(chunk.offset))?;
        let mut part = Sha256::new();
        let mut remaining = chunk.length;
        while remaining > 0 {
            let want = remaining.min(buf.len() as u64) as usize;
            file.read_exact(&mut buf[..want])?;
            part.update(&buf[..want]);
            whole.update(&buf[..want]);
            remaining -= want as u64;
        }
        digests.push(hex::encode(part.finalize()));
    }

    Ok(LocalDigests {
        whole: hex::encode(whole.finalize()),
        chunks: digests,
    })
}

/// Returns the indices of Completed chunks whose recorded digest no longer
/// matches the bytes at their range in `path`.
///
/// An unreadable file invalidates every Completed claim.
pub fn stale_chunk_claims(path: &Path, chunks: &[ChunkRecord]) -> Vec<u32> {
    let claimed = chunks
        .iter()
        .filter(|c| c.status == ChunkStatus::Completed);

    let mut file = match std::fs::File::open(path) {
        Ok(f) => f,
        Err(_) => return claimed.map(|c| c.index).collect(),
    };

    let mut stale = Vec::new();
    for chunk in claimed {
        let actual = digest_range(&mut file, chunk.offset, chunk.length).ok();
        let matches = match (chunk.digest.as_deref(), actual.as_deref()) {
            (Some(recorded), Some(actual)) => verify(recorded, actual),
            _ => false,
        };
        if !matches {
            stale.push(chunk.index);
        }
    }
    stale
}

fn digest_range(file: &mut std::fs::File, offset: u64, length: u64) -> std::io::Result<String> {
    file.seek(SeekFrom::Start(offset))?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; HASH_BUF_SIZE.min(length.max(1) as usize)];
    let mut remaining = length;
    while remaining > 0 {
        let want = remaining.min(buf.len() as u64) as usize;
        file.read_exact(&mut buf[..want])?;
        hasher.update(&buf[..want]);
        remaining -= want as u64;
    }
    Ok(hex::encode(hasher.finalize()))
}

// ---------------------------------------------------------------------------
// Local byte ranges
// ---------------------------------------------------------------------------

/// Reads exactly `length` bytes at `offset` from a local file.
pub async fn read_range(path: &Path, offset: u64, length: u64) -> Result<Vec<u8>, TransferError> {
    let mut file = tokio::fs::File::open(path).await?;
    file.seek(SeekFrom::Start(offset)).await?;
    let mut buf = vec![0u8; length as usize];
    file.read_exact(&mut buf).await?;
    Ok(buf)
}

/// Writes `data` at `offset` into an existing local file.
///
/// Re-writing the same range is idempotent.
pub async fn write_range(path: &Path, offset: u64, data: &[u8]) -> Result<(), TransferError> {
    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .open(path)
        .await?;
    file.seek(SeekFrom::Start(offset)).await?;
    file.write_all(data).await?;
    file.flush().await?;
    Ok(())
}

/// Creates (or keeps) the download target and sizes it to `size` bytes.
///
/// Existing content is preserved so completed ranges survive a resume.
pub async fn prepare_destination(path: &Path, size: u64) -> Result<(), TransferError> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent).await?;
    }
    let file = tokio::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(path)
        .await?;
    file.set_len(size).await?;
    file.sync_all().await?;
    Ok(())
}
