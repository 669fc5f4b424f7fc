//! Filesystem-backed [`ObjectStore`].
//!
//! Layout under the root directory:
//!
//! ```text
//! <root>/<bucket>/<key>                 object bytes
//! <root>/.meta/<bucket>/<key>.json      ObjectMeta sidecar
//! <root>/.multipart/<session>/target    "bucket/key" being assembled
//! <root>/.multipart/<session>/<n>.part  uploaded parts
//! ```
//!
//! Sessions live on disk, so an upload can be resumed by a new process.

use std::path::{Path, PathBuf};

use haul_transfer::{ObjectLocator, TransferError, checksum_bytes, combine_ordered};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::object_store::{ObjectMeta, ObjectStore, PartReceipt, StoreError, StoreFuture};

const META_DIR: &str = ".meta";
const MULTIPART_DIR: &str = ".multipart";
const TARGET_FILE: &str = "target";

/// Object store rooted at a local directory.
#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Where the bytes of `object` live.
    pub fn object_path(&self, object: &ObjectLocator) -> PathBuf {
        self.root.join(&object.bucket).join(&object.key)
    }

    fn meta_path(&self, object: &ObjectLocator) -> PathBuf {
        self.root
            .join(META_DIR)
            .join(&object.bucket)
            .join(format!("{}.json", object.key))
    }

    fn session_dir(&self, session: &str) -> Result<PathBuf, StoreError> {
        let usable = !session.is_empty()
            && session
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-');
        if !usable {
            return Err(StoreError::InvalidSession(session.to_string()));
        }
        Ok(self.root.join(MULTIPART_DIR).join(session))
    }

    async fn existing_session_dir(&self, session: &str) -> Result<PathBuf, StoreError> {
        let dir = self.session_dir(session)?;
        if !tokio::fs::try_exists(dir.join(TARGET_FILE)).await? {
            return Err(StoreError::InvalidSession(session.to_string()));
        }
        Ok(dir)
    }

    /// Writes a whole object in one go, bypassing multipart.
    ///
    /// With `part_size` the recorded digest is the composite a multipart
    /// upload with that part size would have produced.
    pub async fn put_object(
        &self,
        object: &ObjectLocator,
        data: &[u8],
        part_size: Option<u64>,
    ) -> Result<ObjectMeta, StoreError> {
        let digest = match part_size {
            Some(p) if p > 0 && data.len() as u64 > p => {
                let parts: Vec<String> = data.chunks(p as usize).map(checksum_bytes).collect();
                combine_ordered(&parts).map_err(|e| StoreError::InvalidRequest(e.to_string()))?
            }
            _ => checksum_bytes(data),
        };
        let meta = ObjectMeta {
            size: data.len() as u64,
            digest: Some(digest),
            part_size: part_size.filter(|p| *p > 0 && data.len() as u64 > *p),
        };

        let path = self.object_path(object);
        write_atomic(&path, data).await?;
        self.write_meta(object, &meta).await?;
        Ok(meta)
    }

    async fn write_meta(&self, object: &ObjectLocator, meta: &ObjectMeta) -> Result<(), StoreError> {
        let json = serde_json::to_vec(meta).map_err(|e| StoreError::Io(e.into()))?;
        write_atomic(&self.meta_path(object), &json).await
    }

    async fn read_meta(&self, object: &ObjectLocator) -> Option<ObjectMeta> {
        let bytes = tokio::fs::read(self.meta_path(object)).await.ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    async fn head(&self, object: &ObjectLocator) -> Result<ObjectMeta, StoreError> {
        let path = self.object_path(object);
        let size = match tokio::fs::metadata(&path).await {
            Ok(m) if m.is_file() => m.len(),
            Ok(_) => return Err(StoreError::NotFound(object.to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(object.to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        if let Some(meta) = self.read_meta(object).await
            && meta.size == size
        {
            return Ok(meta);
        }

        // No usable sidecar: digest the bytes.
        let digest = tokio::task::spawn_blocking(move || haul_transfer::calculate_file_checksum(&path))
            .await
            .map_err(|e| StoreError::Io(std::io::Error::other(e)))?
            .map_err(|e| range_error(object, e))?;
        Ok(ObjectMeta {
            size,
            digest: Some(digest),
            part_size: None,
        })
    }

    async fn read(
        &self,
        object: &ObjectLocator,
        offset: u64,
        length: u64,
    ) -> Result<Vec<u8>, StoreError> {
        haul_transfer::read_range(&self.object_path(object), offset, length)
            .await
            .map_err(|e| range_error(object, e))
    }

    async fn create(&self, object: &ObjectLocator) -> Result<String, StoreError> {
        let session = uuid::Uuid::new_v4().to_string();
        let dir = self.session_dir(&session)?;
        tokio::fs::create_dir_all(&dir).await?;
        write_atomic(&dir.join(TARGET_FILE), object.to_string().as_bytes()).await?;
        debug!(session = %session, object = %object, "multipart session created");
        Ok(session)
    }

    async fn upload(
        &self,
        session: &str,
        part_number: u32,
        data: Vec<u8>,
    ) -> Result<PartReceipt, StoreError> {
        let dir = self.existing_session_dir(session).await?;
        let digest = checksum_bytes(&data);
        write_atomic(&dir.join(part_file(part_number)), &data).await?;
        Ok(PartReceipt {
            part_number,
            digest,
        })
    }

    async fn complete(
        &self,
        session: &str,
        mut parts: Vec<PartReceipt>,
    ) -> Result<ObjectMeta, StoreError> {
        let dir = self.existing_session_dir(session).await?;
        let target = tokio::fs::read_to_string(dir.join(TARGET_FILE)).await?;
        let object = ObjectLocator::parse(target.trim())
            .map_err(|e| StoreError::InvalidRequest(e.to_string()))?;

        if parts.is_empty() {
            return Err(StoreError::InvalidRequest("no parts to assemble".into()));
        }
        parts.sort_by_key(|p| p.part_number);

        let path = self.object_path(&object);
        let tmp = temp_path(&path);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut out = tokio::fs::File::create(&tmp).await?;
        let mut size = 0u64;
        let mut first_len = 0u64;
        let mut digests = Vec::with_capacity(parts.len());

        for (i, part) in parts.iter().enumerate() {
            let data = match tokio::fs::read(dir.join(part_file(part.part_number))).await {
                Ok(data) => data,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    return Err(StoreError::InvalidRequest(format!(
                        "part {} was never uploaded",
                        part.part_number
                    )));
                }
                Err(e) => return Err(e.into()),
            };
            let actual = checksum_bytes(&data);
            if !haul_transfer::verify(&part.digest, &actual) {
                return Err(StoreError::DigestMismatch {
                    part: part.part_number,
                    expected: part.digest.clone(),
                    actual,
                });
            }
            if i == 0 {
                first_len = data.len() as u64;
            }
            size += data.len() as u64;
            out.write_all(&data).await?;
            digests.push(actual);
        }
        out.sync_all().await?;
        drop(out);
        tokio::fs::rename(&tmp, &path).await?;

        let digest =
            combine_ordered(&digests).map_err(|e| StoreError::InvalidRequest(e.to_string()))?;
        let meta = ObjectMeta {
            size,
            digest: Some(digest),
            part_size: (parts.len() > 1).then_some(first_len),
        };
        self.write_meta(&object, &meta).await?;
        tokio::fs::remove_dir_all(&dir).await?;
        debug!(session = %session, object = %object, parts = parts.len(), "multipart session completed");
        Ok(meta)
    }

    async fn abort(&self, session: &str) -> Result<(), StoreError> {
        let dir = self.session_dir(session)?;
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {
                debug!(session = %session, "multipart session aborted");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl ObjectStore for LocalObjectStore {
    fn head_object<'a>(&'a self, object: &'a ObjectLocator) -> StoreFuture<'a, ObjectMeta> {
        Box::pin(self.head(object))
    }

    fn read_range<'a>(
        &'a self,
        object: &'a ObjectLocator,
        offset: u64,
        length: u64,
    ) -> StoreFuture<'a, Vec<u8>> {
        Box::pin(self.read(object, offset, length))
    }

    fn create_multipart<'a>(&'a self, object: &'a ObjectLocator) -> StoreFuture<'a, String> {
        Box::pin(self.create(object))
    }

    fn upload_part<'a>(
        &'a self,
        session: &'a str,
        part_number: u32,
        data: Vec<u8>,
    ) -> StoreFuture<'a, PartReceipt> {
        Box::pin(self.upload(session, part_number, data))
    }

    fn complete_multipart<'a>(
        &'a self,
        session: &'a str,
        parts: Vec<PartReceipt>,
    ) -> StoreFuture<'a, ObjectMeta> {
        Box::pin(self.complete(session, parts))
    }

    fn abort_multipart<'a>(&'a self, session: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(self.abort(session))
    }
}

fn part_file(part_number: u32) -> String {
    format!("{part_number:010}.part")
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".haul-tmp");
    path.with_file_name(name)
}

async fn write_atomic(path: &Path, data: &[u8]) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = temp_path(path);
    let mut file = tokio::fs::File::create(&tmp).await?;
    file.write_all(data).await?;
    file.sync_all().await?;
    drop(file);
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

fn range_error(object: &ObjectLocator, err: TransferError) -> StoreError {
    match err {
        TransferError::Io(e) if e.kind() == std::io::ErrorKind::NotFound => {
            StoreError::NotFound(object.to_string())
        }
        TransferError::Io(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            StoreError::InvalidRequest(format!("range past the end of {object}"))
        }
        TransferError::Io(e) => StoreError::Io(e),
        other => StoreError::InvalidRequest(other.to_string()),
    }
}
