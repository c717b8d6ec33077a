//! Shared test harness for the lifecycle and HTTP tests.
//!
//! Builds real SQLite and disk-backed stores under a temp directory and
//! wraps them so tests can count calls and inject failures.

#![allow(dead_code)]

use async_trait::async_trait;
use axum::Router;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use file_storage::{
    models::{
        actor::ActorIdentity,
        bucket::{Bucket, BucketSettings},
        file::{ConfirmedUpload, FileRecord, NewFile},
    },
    routes::routes::routes,
    services::{
        actor_resolver::ActorResolver,
        file_service::{FileService, Timeouts, UploadRequest},
        metadata_store::{
            FileAccess, MetadataError, MetadataResult, MetadataStore, SqliteMetadataStore,
        },
        object_store::{
            ByteStream, LocalObjectStore, ObjectReader, ObjectStat, ObjectStore, ObjectStoreError,
            ObjectStoreResult, PutOutcome,
        },
    },
    state::AppState,
};
use futures::StreamExt;
use std::{
    io,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};
use tempfile::TempDir;
use uuid::Uuid;

pub const JWT_SECRET: &str = "test-jwt-secret";
pub const OBJECT_SECRET: &str = "test-object-secret";
pub const PUBLIC_URL: &str = "http://files.test";
pub const DEFAULT_BUCKET: &str = "default";

/// Object store wrapper that counts calls and can be told to fail.
pub struct InstrumentedObjectStore {
    inner: Arc<LocalObjectStore>,
    calls: AtomicUsize,
    pub fail_puts: AtomicBool,
    pub stall_puts: AtomicBool,
    pub fail_deletes: AtomicBool,
}

impl InstrumentedObjectStore {
    pub fn new(inner: Arc<LocalObjectStore>) -> Self {
        Self {
            inner,
            calls: AtomicUsize::new(0),
            fail_puts: AtomicBool::new(false),
            stall_puts: AtomicBool::new(false),
            fail_deletes: AtomicBool::new(false),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn record(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }
}

fn injected() -> ObjectStoreError {
    ObjectStoreError::Io(io::Error::other("injected failure"))
}

#[async_trait]
impl ObjectStore for InstrumentedObjectStore {
    async fn put(
        &self,
        bucket: &str,
        key: &str,
        body: ByteStream,
        size: u64,
        content_type: &str,
    ) -> ObjectStoreResult<PutOutcome> {
        self.record();
        if self.stall_puts.load(Ordering::SeqCst) {
            futures::future::pending::<()>().await;
        }
        if self.fail_puts.load(Ordering::SeqCst) {
            return Err(injected());
        }
        self.inner.put(bucket, key, body, size, content_type).await
    }

    async fn get(&self, bucket: &str, key: &str) -> ObjectStoreResult<ObjectReader> {
        self.record();
        self.inner.get(bucket, key).await
    }

    async fn delete(&self, bucket: &str, key: &str) -> ObjectStoreResult<()> {
        self.record();
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(injected());
        }
        self.inner.delete(bucket, key).await
    }

    async fn stat(&self, bucket: &str, key: &str) -> ObjectStoreResult<ObjectStat> {
        self.record();
        self.inner.stat(bucket, key).await
    }

    async fn presign(&self, bucket: &str, key: &str, ttl: Duration) -> ObjectStoreResult<String> {
        self.record();
        self.inner.presign(bucket, key, ttl).await
    }

    async fn check_ready(&self) -> ObjectStoreResult<()> {
        self.inner.check_ready().await
    }
}

/// Metadata store wrapper that counts calls and can sabotage confirmation.
pub struct CountingMetadataStore {
    inner: Arc<SqliteMetadataStore>,
    calls: AtomicUsize,
    /// `confirm_upload` fails with a database error.
    pub fail_confirms: AtomicBool,
    /// `confirm_upload` reports the record as not confirmable.
    pub reject_confirms: AtomicBool,
}

impl CountingMetadataStore {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn record(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl MetadataStore for CountingMetadataStore {
    async fn get_bucket(
        &self,
        actor: &ActorIdentity,
        name: &str,
    ) -> MetadataResult<Option<Bucket>> {
        self.record();
        self.inner.get_bucket(actor, name).await
    }

    async fn create_file(
        &self,
        actor: &ActorIdentity,
        file: NewFile,
    ) -> MetadataResult<FileRecord> {
        self.record();
        self.inner.create_file(actor, file).await
    }

    async fn get_file(
        &self,
        actor: &ActorIdentity,
        id: Uuid,
        access: FileAccess,
    ) -> MetadataResult<Option<FileRecord>> {
        self.record();
        self.inner.get_file(actor, id, access).await
    }

    async fn confirm_upload(
        &self,
        actor: &ActorIdentity,
        id: Uuid,
        confirmed: ConfirmedUpload,
    ) -> MetadataResult<Option<FileRecord>> {
        self.record();
        if self.fail_confirms.load(Ordering::SeqCst) {
            return Err(MetadataError::Database(sqlx::Error::PoolTimedOut));
        }
        if self.reject_confirms.load(Ordering::SeqCst) {
            return Ok(None);
        }
        self.inner.confirm_upload(actor, id, confirmed).await
    }

    async fn delete_file(&self, actor: &ActorIdentity, id: Uuid) -> MetadataResult<bool> {
        self.record();
        self.inner.delete_file(actor, id).await
    }

    async fn list_pending_uploads(
        &self,
        actor: &ActorIdentity,
        older_than: DateTime<Utc>,
    ) -> MetadataResult<Vec<FileRecord>> {
        self.record();
        self.inner.list_pending_uploads(actor, older_than).await
    }

    async fn check_ready(&self) -> MetadataResult<()> {
        self.inner.check_ready().await
    }
}

/// Real stores in a temp directory, wired into a `FileService`.
pub struct Harness {
    pub dir: TempDir,
    pub sqlite: Arc<SqliteMetadataStore>,
    pub metadata: Arc<CountingMetadataStore>,
    pub local: Arc<LocalObjectStore>,
    pub objects: Arc<InstrumentedObjectStore>,
    pub service: FileService,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_timeouts(Timeouts::default()).await
    }

    pub async fn with_timeouts(timeouts: Timeouts) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let url = format!("sqlite://{}", dir.path().join("meta.db").display());
        let sqlite = Arc::new(
            SqliteMetadataStore::connect(&url)
                .await
                .expect("connect metadata store"),
        );
        sqlite.migrate().await.expect("migrate");
        sqlite
            .ensure_bucket(&BucketSettings::named(DEFAULT_BUCKET))
            .await
            .expect("default bucket");

        let metadata = Arc::new(CountingMetadataStore {
            inner: sqlite.clone(),
            calls: AtomicUsize::new(0),
            fail_confirms: AtomicBool::new(false),
            reject_confirms: AtomicBool::new(false),
        });
        let local = Arc::new(LocalObjectStore::new(
            dir.path().join("objects"),
            OBJECT_SECRET,
            PUBLIC_URL,
        ));
        let objects = Arc::new(InstrumentedObjectStore::new(local.clone()));
        let service = FileService::new(metadata.clone(), objects.clone(), timeouts);

        Self {
            dir,
            sqlite,
            metadata,
            local,
            objects,
            service,
        }
    }

    pub async fn bucket(&self, settings: BucketSettings) -> Bucket {
        self.sqlite
            .ensure_bucket(&settings)
            .await
            .expect("provision bucket")
    }

    /// Router over the same stores, resolving actors from bearer tokens only.
    pub fn app(&self) -> Router {
        let state = AppState {
            files: self.service.clone(),
            resolver: Arc::new(ActorResolver::from_settings(
                JWT_SECRET,
                None,
                Duration::from_secs(1),
            )),
            objects: self.local.clone(),
            default_bucket: DEFAULT_BUCKET.into(),
            spool_dir: self.dir.path().join("spool"),
        };
        routes(state, 1024 * 1024)
    }

    pub async fn upload(
        &self,
        actor: &ActorIdentity,
        bucket: &str,
        name: &str,
        mime_type: &str,
        payload: &[u8],
    ) -> file_storage::services::file_service::StorageResult<FileRecord> {
        self.service
            .upload(actor, upload_request(bucket, name, mime_type, payload))
            .await
    }
}

pub fn upload_request(bucket: &str, name: &str, mime_type: &str, payload: &[u8]) -> UploadRequest {
    UploadRequest {
        bucket: bucket.into(),
        name: name.into(),
        mime_type: mime_type.into(),
        size: payload.len() as u64,
        body: body_of(payload),
    }
}

pub fn body_of(payload: &[u8]) -> ByteStream {
    let chunk = Bytes::copy_from_slice(payload);
    futures::stream::once(async move { Ok::<_, io::Error>(chunk) }).boxed()
}

pub fn alice() -> ActorIdentity {
    ActorIdentity::authenticated("alice", ["authenticated"])
}

pub fn bob() -> ActorIdentity {
    ActorIdentity::authenticated("bob", ["authenticated"])
}

pub async fn read_all(mut reader: ObjectReader) -> Vec<u8> {
    use tokio::io::AsyncReadExt;
    let mut buf = Vec::new();
    reader.read_to_end(&mut buf).await.expect("read object");
    buf
}

/// MD5 hex digest, the etag the disk store reports.
pub fn md5_hex(payload: &[u8]) -> String {
    format!("{:x}", md5::compute(payload))
}
