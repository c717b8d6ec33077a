//! src/services/file_service.rs
//!
//! FileService: the upload, download and delete lifecycles. Each one
//! sequences calls to the metadata store and the object store and owns the
//! consistency contract between them. Nothing here is transactional across
//! the two stores; every partial failure lands in one of these states:
//!
//! - pending record, no object (write failed or was cancelled)
//! - pending record, object present (crash between write and confirm)
//! - no record, object present (object delete failed after row delete)
//!
//! All of them are detectable: pending records through
//! `pending_uploads`, and stray objects because no record names them.

use crate::{
    models::{
        actor::ActorIdentity,
        bucket::Bucket,
        file::{ConfirmedUpload, FileRecord, NewFile},
    },
    services::{
        bucket_policy::{self, PolicyViolation},
        metadata_store::{FileAccess, MetadataError, MetadataStore},
        object_store::{ByteStream, ObjectReader, ObjectStore, ObjectStoreError},
    },
};
use std::{future::Future, sync::Arc, time::Duration};
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Upper bound on presigned-URL lifetime (seven days, as in S3).
pub const MAX_PRESIGN_EXPIRY_SECS: u64 = 7 * 24 * 60 * 60;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("bucket `{0}` not found")]
    BucketNotFound(String),
    #[error(transparent)]
    Policy(#[from] PolicyViolation),
    #[error("file `{0}` not found")]
    FileNotFound(Uuid),
    #[error("object for file `{id}` is missing from bucket `{bucket}`")]
    ObjectMissing { id: Uuid, bucket: String },
    #[error("{0}")]
    Forbidden(String),
    #[error("{0}")]
    InvalidRequest(String),
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },
    #[error("{0}")]
    Inconsistent(String),
    #[error(transparent)]
    Object(#[from] ObjectStoreError),
    #[error(transparent)]
    Metadata(#[from] MetadataError),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Bounds applied to every external call.
#[derive(Clone, Copy, Debug)]
pub struct Timeouts {
    /// Metadata calls and object-store control calls.
    pub call: Duration,
    /// Streaming object writes.
    pub transfer: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            call: Duration::from_secs(10),
            transfer: Duration::from_secs(300),
        }
    }
}

/// A validated upload waiting to be stored.
pub struct UploadRequest {
    pub bucket: String,
    pub name: String,
    pub mime_type: String,
    /// Declared length of `body`, in bytes.
    pub size: u64,
    pub body: ByteStream,
}

/// A readable file: its record, owning bucket, and a live body.
pub struct Download {
    pub record: FileRecord,
    pub bucket: Bucket,
    pub body: ObjectReader,
}

impl std::fmt::Debug for Download {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Download")
            .field("record", &self.record)
            .field("bucket", &self.bucket)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresignedUrl {
    pub url: String,
    pub expires_in: u64,
}

/// Orchestrates file lifecycles over the two stores.
///
/// Cheap to clone; the store handles are shared and never mutated.
#[derive(Clone)]
pub struct FileService {
    metadata: Arc<dyn MetadataStore>,
    objects: Arc<dyn ObjectStore>,
    timeouts: Timeouts,
}

impl FileService {
    pub fn new(
        metadata: Arc<dyn MetadataStore>,
        objects: Arc<dyn ObjectStore>,
        timeouts: Timeouts,
    ) -> Self {
        Self {
            metadata,
            objects,
            timeouts,
        }
    }

    /// Run `fut` under `limit`. Expiry is reported once and never retried.
    async fn bounded<T, E, F>(
        &self,
        operation: &'static str,
        limit: Duration,
        fut: F,
    ) -> StorageResult<T>
    where
        F: Future<Output = Result<T, E>>,
        StorageError: From<E>,
    {
        match tokio::time::timeout(limit, fut).await {
            Ok(result) => result.map_err(StorageError::from),
            Err(_) => Err(StorageError::Timeout {
                operation,
                after: limit,
            }),
        }
    }

    async fn call<T, E, F>(&self, operation: &'static str, fut: F) -> StorageResult<T>
    where
        F: Future<Output = Result<T, E>>,
        StorageError: From<E>,
    {
        self.bounded(operation, self.timeouts.call, fut).await
    }

    async fn bucket(&self, actor: &ActorIdentity, name: &str) -> StorageResult<Bucket> {
        self.call("get_bucket", self.metadata.get_bucket(actor, name))
            .await?
            .ok_or_else(|| StorageError::BucketNotFound(name.to_string()))
    }

    /// Absent and not-authorized are the same answer.
    async fn visible_file(
        &self,
        actor: &ActorIdentity,
        id: Uuid,
        access: FileAccess,
    ) -> StorageResult<FileRecord> {
        self.call("get_file", self.metadata.get_file(actor, id, access))
            .await?
            .ok_or(StorageError::FileNotFound(id))
    }

    /// Store a new file.
    ///
    /// 1. Load bucket policy and run the policy gate. Nothing is written on rejection.
    /// 2. Reserve a pending record; its id becomes the object key.
    /// 3. Stream the payload to the object store.
    /// 4. Confirm the record with the size and etag the store reported.
    ///
    /// A failure after step 2 leaves the record pending. It is not rolled back.
    pub async fn upload(
        &self,
        actor: &ActorIdentity,
        request: UploadRequest,
    ) -> StorageResult<FileRecord> {
        let UploadRequest {
            bucket: bucket_name,
            name,
            mime_type,
            size,
            body,
        } = request;

        let declared = i64::try_from(size)
            .map_err(|_| StorageError::InvalidRequest("declared size is too large".into()))?;

        let bucket = self.bucket(actor, &bucket_name).await?;
        bucket_policy::check(&bucket, declared, &mime_type)?;

        let record = self
            .call(
                "create_file",
                self.metadata.create_file(
                    actor,
                    NewFile {
                        bucket_id: bucket.id,
                        name,
                        size: declared,
                        mime_type: mime_type.clone(),
                    },
                ),
            )
            .await?;
        debug!(file_id = %record.id, bucket = %bucket.name, "reserved pending record");

        let key = record.object_key();
        let outcome = match self
            .bounded(
                "put_object",
                self.timeouts.transfer,
                self.objects.put(&bucket.name, &key, body, size, &mime_type),
            )
            .await
        {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(
                    file_id = %record.id,
                    bucket = %bucket.name,
                    operation = "put_object",
                    "object write failed, record left pending: {}",
                    err
                );
                return Err(err);
            }
        };

        let confirmed = ConfirmedUpload {
            size: i64::try_from(outcome.size).unwrap_or(i64::MAX),
            mime_type,
            etag: outcome.etag,
        };

        match self
            .call(
                "confirm_upload",
                self.metadata.confirm_upload(actor, record.id, confirmed),
            )
            .await
        {
            Ok(Some(confirmed)) => {
                info!(
                    file_id = %confirmed.id,
                    bucket = %bucket.name,
                    size = confirmed.size,
                    "upload confirmed"
                );
                Ok(confirmed)
            }
            Ok(None) => {
                error!(
                    file_id = %record.id,
                    bucket = %bucket.name,
                    operation = "confirm_upload",
                    "pending record was not confirmable, object stored without confirmation"
                );
                Err(StorageError::Inconsistent(format!(
                    "file `{}` could not be confirmed",
                    record.id
                )))
            }
            Err(err) => {
                error!(
                    file_id = %record.id,
                    bucket = %bucket.name,
                    operation = "confirm_upload",
                    "object stored but record left pending: {}",
                    err
                );
                Err(err)
            }
        }
    }

    /// Open a file for reading. Pending records are not downloadable.
    pub async fn download(&self, actor: &ActorIdentity, id: Uuid) -> StorageResult<Download> {
        let record = self.visible_file(actor, id, FileAccess::Read).await?;
        if !record.is_uploaded {
            debug!(file_id = %id, "download of pending record");
            return Err(StorageError::FileNotFound(id));
        }

        let bucket = self.bucket(actor, &record.bucket_name).await?;
        let body = match self
            .call(
                "get_object",
                self.objects.get(&record.bucket_name, &record.object_key()),
            )
            .await
        {
            Ok(body) => body,
            Err(StorageError::Object(ObjectStoreError::NotFound { .. })) => {
                warn!(
                    file_id = %id,
                    bucket = %record.bucket_name,
                    operation = "get_object",
                    "confirmed record has no object"
                );
                return Err(StorageError::ObjectMissing {
                    id,
                    bucket: record.bucket_name,
                });
            }
            Err(err) => {
                error!(
                    file_id = %id,
                    bucket = %record.bucket_name,
                    operation = "get_object",
                    "object read failed: {}",
                    err
                );
                return Err(err);
            }
        };

        Ok(Download {
            record,
            bucket,
            body,
        })
    }

    /// Delete a file: metadata row first, then the object.
    ///
    /// Anonymous callers are refused before any lookup. If the object delete
    /// fails the row is already gone and the bytes are orphaned.
    pub async fn delete(&self, actor: &ActorIdentity, id: Uuid) -> StorageResult<()> {
        if actor.user_id.is_none() {
            return Err(StorageError::Forbidden(
                "authentication is required to delete files".into(),
            ));
        }

        let record = self.visible_file(actor, id, FileAccess::Write).await?;

        if !self
            .call("delete_file", self.metadata.delete_file(actor, id))
            .await?
        {
            // Deleted by a concurrent request between lookup and delete.
            return Err(StorageError::FileNotFound(id));
        }

        if let Err(err) = self
            .call(
                "delete_object",
                self.objects.delete(&record.bucket_name, &record.object_key()),
            )
            .await
        {
            error!(
                file_id = %id,
                bucket = %record.bucket_name,
                operation = "delete_object",
                "record deleted but object remains: {}",
                err
            );
            return Err(err);
        }

        info!(file_id = %id, bucket = %record.bucket_name, "file deleted");
        Ok(())
    }

    /// Mint a direct-access URL. `expiry` defaults to the bucket's
    /// download expiration and must be within 1s..=7d.
    pub async fn presigned_url(
        &self,
        actor: &ActorIdentity,
        id: Uuid,
        expiry: Option<u64>,
    ) -> StorageResult<PresignedUrl> {
        let record = self.visible_file(actor, id, FileAccess::Read).await?;
        if !record.is_uploaded {
            return Err(StorageError::FileNotFound(id));
        }

        let bucket = self.bucket(actor, &record.bucket_name).await?;
        if !bucket.presigned_urls_enabled {
            return Err(StorageError::Forbidden(format!(
                "presigned URLs are disabled for bucket `{}`",
                bucket.name
            )));
        }

        let expires_in = match expiry {
            Some(secs) => secs,
            None => u64::try_from(bucket.download_expiration).unwrap_or(0),
        };
        if expires_in == 0 || expires_in > MAX_PRESIGN_EXPIRY_SECS {
            return Err(StorageError::InvalidRequest(format!(
                "expiry must be between 1 and {} seconds",
                MAX_PRESIGN_EXPIRY_SECS
            )));
        }

        let url = self
            .call(
                "presign_object",
                self.objects.presign(
                    &record.bucket_name,
                    &record.object_key(),
                    Duration::from_secs(expires_in),
                ),
            )
            .await?;

        Ok(PresignedUrl { url, expires_in })
    }

    /// Records still pending after `older_than`: uploads that never confirmed.
    pub async fn pending_uploads(
        &self,
        actor: &ActorIdentity,
        older_than: Duration,
    ) -> StorageResult<Vec<FileRecord>> {
        let age = chrono::Duration::from_std(older_than)
            .map_err(|_| StorageError::InvalidRequest("cutoff is out of range".into()))?;
        let cutoff = chrono::Utc::now() - age;
        self.call(
            "list_pending_uploads",
            self.metadata.list_pending_uploads(actor, cutoff),
        )
        .await
    }

    /// Readiness of both stores.
    pub async fn check_ready(&self) -> (StorageResult<()>, StorageResult<()>) {
        let metadata = self.call("metadata_ready", self.metadata.check_ready()).await;
        let objects = self.call("objects_ready", self.objects.check_ready()).await;
        (metadata, objects)
    }
}
