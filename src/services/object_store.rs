//! src/services/object_store.rs
//!
//! Object store capability used by the file lifecycle orchestrators, plus a
//! local-disk implementation with S3-compatible semantics. Payloads are
//! sharded beneath `base_path/{bucket}/{shard}/{shard}/{key}` with a JSON
//! sidecar (`{key}.meta.json`) carrying size, etag and content type.

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{StreamExt, stream::BoxStream};
use hmac::{Hmac, Mac};
use md5::Context;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;
use tokio::{
    fs::{self, File},
    io::{AsyncRead, AsyncReadExt, AsyncWriteExt},
};
use tracing::debug;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

/// Incoming payload, consumed exactly once and in order.
pub type ByteStream = BoxStream<'static, io::Result<Bytes>>;

/// Live, single-pass reader over a stored object.
pub type ObjectReader = Box<dyn AsyncRead + Unpin + Send>;

const MAX_OBJECT_KEY_LEN: usize = 1024;
const SIDECAR_SUFFIX: &str = ".meta.json";

#[derive(Debug, Error)]
pub enum ObjectStoreError {
    #[error("object `{key}` not found in bucket `{bucket}`")]
    NotFound { bucket: String, key: String },
    #[error("invalid object key")]
    InvalidObjectKey,
    #[error("invalid bucket name `{0}`")]
    InvalidBucketName(String),
    #[error("declared size {declared} bytes but received {actual}")]
    SizeMismatch { declared: u64, actual: u64 },
    #[error("presigned url has expired")]
    PresignExpired,
    #[error("presigned url signature is invalid")]
    InvalidSignature,
    #[error("object metadata is corrupt: {0}")]
    CorruptMetadata(String),
    #[error("signing failed: {0}")]
    Signing(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type ObjectStoreResult<T> = Result<T, ObjectStoreError>;

/// Result of a confirmed write.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PutOutcome {
    pub etag: String,
    pub size: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ObjectStat {
    pub size: u64,
    pub etag: String,
    pub content_type: String,
    pub last_modified: DateTime<Utc>,
}

/// Capability over a bucketed, S3-compatible object store.
///
/// Implementations must be safe for concurrent use from many request tasks.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store `body` under `bucket/key`. Fails with `SizeMismatch` when the
    /// stream length differs from `size`; no object is left behind on failure.
    async fn put(
        &self,
        bucket: &str,
        key: &str,
        body: ByteStream,
        size: u64,
        content_type: &str,
    ) -> ObjectStoreResult<PutOutcome>;

    async fn get(&self, bucket: &str, key: &str) -> ObjectStoreResult<ObjectReader>;

    /// Deleting a missing key succeeds.
    async fn delete(&self, bucket: &str, key: &str) -> ObjectStoreResult<()>;

    async fn stat(&self, bucket: &str, key: &str) -> ObjectStoreResult<ObjectStat>;

    /// Mint a time-limited URL granting direct read access to the object.
    async fn presign(&self, bucket: &str, key: &str, ttl: Duration) -> ObjectStoreResult<String>;

    async fn check_ready(&self) -> ObjectStoreResult<()>;
}

/// Disk-backed object store.
#[derive(Clone)]
pub struct LocalObjectStore {
    /// Base directory on disk where object payloads are stored.
    base_path: PathBuf,

    /// Secret used to sign presigned URLs.
    signing_key: Vec<u8>,

    /// Public base URL presigned links are rooted at.
    public_url: String,
}

impl LocalObjectStore {
    pub fn new(
        base_path: impl Into<PathBuf>,
        signing_key: impl AsRef<[u8]>,
        public_url: impl Into<String>,
    ) -> Self {
        Self {
            base_path: base_path.into(),
            signing_key: signing_key.as_ref().to_vec(),
            public_url: public_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Basic key validation to avoid trivial path traversal vectors.
    fn ensure_key_safe(key: &str) -> ObjectStoreResult<()> {
        if key.is_empty() || key.len() > MAX_OBJECT_KEY_LEN {
            return Err(ObjectStoreError::InvalidObjectKey);
        }
        if key.starts_with('/') || key.contains("..") || key.ends_with(SIDECAR_SUFFIX) {
            return Err(ObjectStoreError::InvalidObjectKey);
        }
        if key
            .bytes()
            .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0')
        {
            return Err(ObjectStoreError::InvalidObjectKey);
        }
        Ok(())
    }

    /// Bucket names become directory names, so only lowercase letters,
    /// digits, dots and hyphens are accepted.
    fn ensure_bucket_safe(bucket: &str) -> ObjectStoreResult<()> {
        let valid = !bucket.is_empty()
            && !bucket.contains("..")
            && !bucket.starts_with('.')
            && bucket
                .chars()
                .all(|c| matches!(c, 'a'..='z' | '0'..='9' | '.' | '-'));
        if valid {
            Ok(())
        } else {
            Err(ObjectStoreError::InvalidBucketName(bucket.to_string()))
        }
    }

    fn bucket_root(&self, bucket: &str) -> PathBuf {
        self.base_path.join(bucket)
    }

    /// Two-level shard identifiers from MD5(bucket/key), as lowercase hex.
    fn object_shards(bucket: &str, key: &str) -> (String, String) {
        let digest = md5::compute(format!("{}/{}", bucket, key));
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    fn object_path(&self, bucket: &str, key: &str) -> PathBuf {
        let (shard_a, shard_b) = Self::object_shards(bucket, key);
        let mut path = self.bucket_root(bucket);
        path.push(shard_a);
        path.push(shard_b);
        path.push(key);
        path
    }

    fn sidecar_path(object_path: &Path) -> PathBuf {
        let mut raw = object_path.as_os_str().to_owned();
        raw.push(SIDECAR_SUFFIX);
        PathBuf::from(raw)
    }

    fn string_to_sign(bucket: &str, key: &str, expires: i64) -> String {
        format!("GET\n{}\n{}\n{}", bucket, key, expires)
    }

    fn signature_mac(
        &self,
        bucket: &str,
        key: &str,
        expires: i64,
    ) -> ObjectStoreResult<HmacSha256> {
        let mut mac = HmacSha256::new_from_slice(&self.signing_key)
            .map_err(|err| ObjectStoreError::Signing(err.to_string()))?;
        mac.update(Self::string_to_sign(bucket, key, expires).as_bytes());
        Ok(mac)
    }

    fn sign(&self, bucket: &str, key: &str, expires: i64) -> ObjectStoreResult<String> {
        let mac = self.signature_mac(bucket, key, expires)?;
        Ok(URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes()))
    }

    /// Verify a presigned link and open the object it points at.
    pub async fn open_presigned(
        &self,
        bucket: &str,
        key: &str,
        expires: i64,
        signature: &str,
    ) -> ObjectStoreResult<(ObjectStat, ObjectReader)> {
        Self::ensure_bucket_safe(bucket)?;
        Self::ensure_key_safe(key)?;

        let provided = URL_SAFE_NO_PAD
            .decode(signature)
            .map_err(|_| ObjectStoreError::InvalidSignature)?;
        self.signature_mac(bucket, key, expires)?
            .verify_slice(&provided)
            .map_err(|_| ObjectStoreError::InvalidSignature)?;

        if Utc::now().timestamp() > expires {
            return Err(ObjectStoreError::PresignExpired);
        }

        let stat = self.stat(bucket, key).await?;
        let reader = self.get(bucket, key).await?;
        Ok((stat, reader))
    }

    async fn write_sidecar(
        &self,
        object_path: &Path,
        stat: &ObjectStat,
    ) -> ObjectStoreResult<()> {
        let sidecar = Self::sidecar_path(object_path);
        let tmp = sidecar.with_extension(format!("tmp-{}", Uuid::new_v4()));
        let body = serde_json::to_vec(stat)
            .map_err(|err| ObjectStoreError::CorruptMetadata(err.to_string()))?;
        fs::write(&tmp, body).await?;
        if let Err(err) = fs::rename(&tmp, &sidecar).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(err.into());
        }
        Ok(())
    }

    /// Rebuild stat information from the payload when the sidecar is gone.
    async fn stat_from_payload(&self, object_path: &Path) -> ObjectStoreResult<ObjectStat> {
        let mut file = File::open(object_path).await?;
        let meta = file.metadata().await?;
        let mut digest = Context::new();
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let read = file.read(&mut buf).await?;
            if read == 0 {
                break;
            }
            digest.consume(&buf[..read]);
        }
        let last_modified = meta
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());

        Ok(ObjectStat {
            size: meta.len(),
            etag: format!("{:x}", digest.compute()),
            content_type: "application/octet-stream".into(),
            last_modified,
        })
    }

    /// Recursively remove empty directories up to the bucket root.
    async fn prune_empty_dirs(&self, start: &Path, stop: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(stop) && current != stop {
            match fs::remove_dir(&current).await {
                Ok(_) => match current.parent() {
                    Some(parent) => current = parent.to_path_buf(),
                    None => break,
                },
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }
}

/// A temp file that is removed on drop unless `persist` is called.
///
/// Covers cancellation too: a dropped `put` future still cleans up.
struct TempFile {
    path: PathBuf,
    armed: bool,
}

impl TempFile {
    fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    fn path(&self) -> &Path {
        &self.path
    }

    /// The file was renamed away; nothing left to remove.
    fn persist(mut self) {
        self.armed = false;
    }
}

impl Drop for TempFile {
    fn drop(&mut self) {
        if self.armed {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    /// Stream the payload into a temp file while hashing it, fsync, then
    /// rename into place. The temp file is removed on failure and when the
    /// write is cancelled.
    async fn put(
        &self,
        bucket: &str,
        key: &str,
        mut body: ByteStream,
        size: u64,
        content_type: &str,
    ) -> ObjectStoreResult<PutOutcome> {
        Self::ensure_bucket_safe(bucket)?;
        Self::ensure_key_safe(key)?;

        let file_path = self.object_path(bucket, key);
        let parent = file_path.parent().map(Path::to_path_buf).ok_or_else(|| {
            ObjectStoreError::Io(io::Error::other("object path missing parent directory"))
        })?;
        fs::create_dir_all(&parent).await?;
        let tmp = TempFile::new(parent.join(format!(".tmp-{}", Uuid::new_v4())));
        let mut file = File::create(tmp.path()).await?;

        let mut written: u64 = 0;
        let mut digest = Context::new();
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            written += chunk.len() as u64;
            if written > size {
                return Err(ObjectStoreError::SizeMismatch {
                    declared: size,
                    actual: written,
                });
            }
            digest.consume(&chunk);
            file.write_all(&chunk).await?;
        }

        if written != size {
            return Err(ObjectStoreError::SizeMismatch {
                declared: size,
                actual: written,
            });
        }
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        if let Err(err) = fs::rename(tmp.path(), &file_path).await {
            if err.kind() != ErrorKind::AlreadyExists {
                return Err(ObjectStoreError::Io(err));
            }
            fs::remove_file(&file_path).await?;
            fs::rename(tmp.path(), &file_path).await?;
        }
        tmp.persist();

        let stat = ObjectStat {
            size: written,
            etag: format!("{:x}", digest.compute()),
            content_type: content_type.to_string(),
            last_modified: Utc::now(),
        };
        if let Err(err) = self.write_sidecar(&file_path, &stat).await {
            let _ = fs::remove_file(&file_path).await;
            return Err(err);
        }

        debug!(bucket, key, size = written, "stored object");
        Ok(PutOutcome {
            etag: stat.etag,
            size: stat.size,
        })
    }

    async fn get(&self, bucket: &str, key: &str) -> ObjectStoreResult<ObjectReader> {
        Self::ensure_bucket_safe(bucket)?;
        Self::ensure_key_safe(key)?;

        let file_path = self.object_path(bucket, key);
        let file = File::open(&file_path).await.map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                ObjectStoreError::NotFound {
                    bucket: bucket.to_string(),
                    key: key.to_string(),
                }
            } else {
                ObjectStoreError::Io(err)
            }
        })?;

        Ok(Box::new(file))
    }

    async fn delete(&self, bucket: &str, key: &str) -> ObjectStoreResult<()> {
        Self::ensure_bucket_safe(bucket)?;
        Self::ensure_key_safe(key)?;

        let file_path = self.object_path(bucket, key);
        for path in [Self::sidecar_path(&file_path), file_path.clone()] {
            match fs::remove_file(&path).await {
                Ok(_) => debug!("removed {}", path.display()),
                Err(err) if err.kind() == ErrorKind::NotFound => {
                    debug!("{} already missing", path.display());
                }
                Err(err) => return Err(ObjectStoreError::Io(err)),
            }
        }

        if let Some(parent) = file_path.parent() {
            let bucket_root = self.bucket_root(bucket);
            self.prune_empty_dirs(parent, &bucket_root).await;
        }
        Ok(())
    }

    async fn stat(&self, bucket: &str, key: &str) -> ObjectStoreResult<ObjectStat> {
        Self::ensure_bucket_safe(bucket)?;
        Self::ensure_key_safe(key)?;

        let file_path = self.object_path(bucket, key);
        if !fs::try_exists(&file_path).await? {
            return Err(ObjectStoreError::NotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            });
        }

        match fs::read(Self::sidecar_path(&file_path)).await {
            Ok(raw) => serde_json::from_slice(&raw)
                .map_err(|err| ObjectStoreError::CorruptMetadata(err.to_string())),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!(bucket, key, "sidecar missing, hashing payload");
                self.stat_from_payload(&file_path).await
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn presign(&self, bucket: &str, key: &str, ttl: Duration) -> ObjectStoreResult<String> {
        Self::ensure_bucket_safe(bucket)?;
        Self::ensure_key_safe(key)?;

        let ttl_secs = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX);
        let expires = Utc::now().timestamp().saturating_add(ttl_secs);
        let signature = self.sign(bucket, key, expires)?;
        Ok(format!(
            "{}/storage/object/{}/{}?expires={}&signature={}",
            self.public_url, bucket, key, expires, signature
        ))
    }

    /// Best-effort write/read/delete of a temp file under `base_path`.
    async fn check_ready(&self) -> ObjectStoreResult<()> {
        fs::create_dir_all(&self.base_path).await?;
        let tmp_path = self.base_path.join(format!(".readyz-{}", Uuid::new_v4()));
        fs::write(&tmp_path, b"readyz").await?;
        let bytes = fs::read(&tmp_path).await;
        let _ = fs::remove_file(&tmp_path).await;
        if bytes? == b"readyz" {
            Ok(())
        } else {
            Err(ObjectStoreError::Io(io::Error::other("file content mismatch")))
        }
    }
}
