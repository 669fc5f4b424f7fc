use std::fmt;
use std::path::{Component, Path, PathBuf};

use crate::TransferError;

/// Longest object key the engine accepts, in bytes.
pub const MAX_KEY_LEN: usize = 1024;

/// A `bucket/key` reference to an object in the remote store.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectLocator {
    pub bucket: String,
    pub key: String,
}

impl ObjectLocator {
    /// Parses `bucket/key/with/slashes`.
    pub fn parse(locator: &str) -> Result<Self, TransferError> {
        let (bucket, key) = locator.split_once('/').ok_or_else(|| {
            TransferError::InvalidRequest(format!("object locator missing key: {locator}"))
        })?;
        validate_bucket(bucket)?;
        validate_object_key(key)?;
        Ok(Self {
            bucket: bucket.to_string(),
            key: key.to_string(),
        })
    }
}

impl fmt::Display for ObjectLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.bucket, self.key)
    }
}

/// Bucket names: 3-63 chars of lowercase ASCII letters, digits, `-` and `.`,
/// starting and ending with a letter or digit.
pub fn validate_bucket(bucket: &str) -> Result<(), TransferError> {
    let valid_chars = bucket
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '.');
    let valid_edges = bucket
        .chars()
        .next()
        .zip(bucket.chars().last())
        .is_some_and(|(first, last)| first.is_ascii_alphanumeric() && last.is_ascii_alphanumeric());

    if !(3..=63).contains(&bucket.len()) || !valid_chars || !valid_edges {
        return Err(TransferError::InvalidRequest(format!(
            "invalid bucket name: {bucket:?}"
        )));
    }
    Ok(())
}

/// Validates that an object key is relative and cannot escape its bucket.
///
/// Rejects:
/// - Empty keys and keys over [`MAX_KEY_LEN`] bytes
/// - Absolute keys (`/x`, `C:\x`)
/// - Parent directory traversal (`..`)
pub fn validate_object_key(key: &str) -> Result<(), TransferError> {
    if key.is_empty() {
        return Err(TransferError::InvalidRequest("empty object key".into()));
    }
    if key.len() > MAX_KEY_LEN {
        return Err(TransferError::InvalidRequest(format!(
            "object key longer than {MAX_KEY_LEN} bytes"
        )));
    }
    if key.contains('\0') {
        return Err(TransferError::InvalidRequest(
            "object key contains NUL".into(),
        ));
    }

    let path = Path::new(key);
    if path.is_absolute() {
        return Err(TransferError::InvalidRequest(format!(
            "absolute object key not allowed: {key}"
        )));
    }

    for component in path.components() {
        match component {
            Component::ParentDir => {
                return Err(TransferError::InvalidRequest(format!(
                    "parent directory traversal not allowed: {key}"
                )));
            }
            Component::Prefix(_) | Component::RootDir => {
                return Err(TransferError::InvalidRequest(format!(
                    "absolute object key not allowed: {key}"
                )));
            }
            Component::CurDir | Component::Normal(_) => {}
        }
    }

    Ok(())
}

/// Validates a local filesystem locator.
pub fn validate_local_path(path: &str) -> Result<PathBuf, TransferError> {
    if path.is_empty() {
        return Err(TransferError::InvalidRequest("empty local path".into()));
    }
    if path.contains('\0') {
        return Err(TransferError::InvalidRequest(
            "local path contains NUL".into(),
        ));
    }
    Ok(PathBuf::from(path))
}

/// Validates a caller-supplied size hint; negative sizes are rejected.
pub fn validate_size_hint(hint: Option<i64>) -> Result<Option<u64>, TransferError> {
    match hint {
        None => Ok(None),
        Some(n) if n < 0 => Err(TransferError::InvalidRequest(format!(
            "negative size: {n}"
        ))),
        Some(n) => Ok(Some(n as u64)),
    }
}

/// A bandwidth cap of zero would stall forever.
pub fn validate_bandwidth_cap(cap: Option<u64>) -> Result<(), TransferError> {
    if cap == Some(0) {
        return Err(TransferError::InvalidRequest(
            "bandwidth cap must be greater than zero".into(),
        ));
    }
    Ok(())
}
