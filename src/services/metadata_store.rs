//! src/services/metadata_store.rs
//!
//! Metadata store capability and its SQLite implementation. Every call takes
//! the caller's `ActorIdentity`; the store applies row-level policy itself
//! and reports rows the actor may not see exactly like rows that don't exist.

use crate::models::{
    actor::ActorIdentity,
    bucket::{Bucket, BucketRow, BucketSettings},
    file::{ConfirmedUpload, FileRecord, NewFile},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{
    SqlitePool,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
};
use std::str::FromStr;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

const SCHEMA: &str = include_str!("../../migrations/0001_init.sql");

const BUCKET_NAME_MIN_LEN: usize = 3;
const BUCKET_NAME_MAX_LEN: usize = 63;

const FILE_COLUMNS: &str = "SELECT f.id, f.name, f.bucket_id, b.name AS bucket_name, f.size, \
     f.mime_type, f.etag, f.is_uploaded, f.uploaded_by_user_id, f.created_at, f.updated_at \
     FROM files f JOIN buckets b ON b.id = f.bucket_id";

/// Readers see their own rows, anonymous uploads, and anything in a public
/// bucket. Binds: elevated, user_id.
const READ_POLICY: &str =
    "(? = 1 OR f.uploaded_by_user_id IS NULL OR f.uploaded_by_user_id = ? OR b.public = 1)";

/// Writers must own the row. Binds: elevated, user_id.
const WRITE_POLICY: &str =
    "(? = 1 OR (uploaded_by_user_id IS NOT NULL AND uploaded_by_user_id = ?))";

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("bucket `{name}` invalid: {reason}")]
    InvalidBucketName { name: String, reason: String },
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

pub type MetadataResult<T> = Result<T, MetadataError>;

/// Which row-level rule a file lookup is evaluated under.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileAccess {
    Read,
    Write,
}

/// Capability over the relational metadata service.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Bucket policy is readable by every actor.
    async fn get_bucket(
        &self,
        actor: &ActorIdentity,
        name: &str,
    ) -> MetadataResult<Option<Bucket>>;

    /// Reserve a pending record. The store assigns the id and takes the
    /// uploader from `actor`.
    async fn create_file(
        &self,
        actor: &ActorIdentity,
        file: NewFile,
    ) -> MetadataResult<FileRecord>;

    async fn get_file(
        &self,
        actor: &ActorIdentity,
        id: Uuid,
        access: FileAccess,
    ) -> MetadataResult<Option<FileRecord>>;

    /// Move a pending record to uploaded. `None` when the record is not
    /// visible to `actor` or was already confirmed.
    async fn confirm_upload(
        &self,
        actor: &ActorIdentity,
        id: Uuid,
        confirmed: ConfirmedUpload,
    ) -> MetadataResult<Option<FileRecord>>;

    /// Returns false when no visible row was deleted.
    async fn delete_file(&self, actor: &ActorIdentity, id: Uuid) -> MetadataResult<bool>;

    /// Pending records created before `older_than`, oldest first.
    async fn list_pending_uploads(
        &self,
        actor: &ActorIdentity,
        older_than: DateTime<Utc>,
    ) -> MetadataResult<Vec<FileRecord>>;

    async fn check_ready(&self) -> MetadataResult<()>;
}

/// SQLite-backed metadata store.
#[derive(Clone)]
pub struct SqliteMetadataStore {
    pool: SqlitePool,
}

impl SqliteMetadataStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (creating if missing) the database at `url`.
    pub async fn connect(url: &str) -> MetadataResult<Self> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Apply the embedded schema statement by statement. Idempotent.
    pub async fn migrate(&self) -> MetadataResult<()> {
        let statements = SCHEMA
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();

        tracing::info!("Running {} migration statements...", statements.len());
        for stmt in statements {
            debug!("Executing migration SQL: {}", stmt);
            sqlx::query(stmt).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// Provision a bucket, or update the policy of an existing one.
    pub async fn ensure_bucket(&self, settings: &BucketSettings) -> MetadataResult<Bucket> {
        ensure_bucket_name_safe(&settings.name)?;
        let now = Utc::now();

        let row = sqlx::query_as::<_, BucketRow>(
            r#"
            INSERT INTO buckets (
                id, name, public, min_upload_size, max_upload_size, allowed_mime_types,
                cache_control, download_expiration, presigned_urls_enabled, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(name) DO UPDATE SET
                public = excluded.public,
                min_upload_size = excluded.min_upload_size,
                max_upload_size = excluded.max_upload_size,
                allowed_mime_types = excluded.allowed_mime_types,
                cache_control = excluded.cache_control,
                download_expiration = excluded.download_expiration,
                presigned_urls_enabled = excluded.presigned_urls_enabled,
                updated_at = excluded.updated_at
            RETURNING id, name, public, min_upload_size, max_upload_size, allowed_mime_types,
                      cache_control, download_expiration, presigned_urls_enabled,
                      created_at, updated_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&settings.name)
        .bind(settings.public)
        .bind(settings.min_upload_size)
        .bind(settings.max_upload_size)
        .bind(settings.mime_column())
        .bind(&settings.cache_control)
        .bind(settings.download_expiration)
        .bind(settings.presigned_urls_enabled)
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.into())
    }

    /// Unscoped lookup, only used after a scoped write has already succeeded.
    async fn fetch_file(&self, id: Uuid) -> MetadataResult<Option<FileRecord>> {
        let sql = format!("{} WHERE f.id = ?", FILE_COLUMNS);
        let record = sqlx::query_as::<_, FileRecord>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(record)
    }
}

#[async_trait]
impl MetadataStore for SqliteMetadataStore {
    async fn get_bucket(
        &self,
        _actor: &ActorIdentity,
        name: &str,
    ) -> MetadataResult<Option<Bucket>> {
        let row = sqlx::query_as::<_, BucketRow>(
            "SELECT id, name, public, min_upload_size, max_upload_size, allowed_mime_types,
                    cache_control, download_expiration, presigned_urls_enabled,
                    created_at, updated_at
             FROM buckets WHERE name = ?",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Bucket::from))
    }

    async fn create_file(
        &self,
        actor: &ActorIdentity,
        file: NewFile,
    ) -> MetadataResult<FileRecord> {
        let id = Uuid::new_v4();
        let now = Utc::now();

        sqlx::query(
            "INSERT INTO files (
                id, bucket_id, name, size, mime_type, etag, is_uploaded,
                uploaded_by_user_id, created_at, updated_at
             ) VALUES (?, ?, ?, ?, ?, NULL, 0, ?, ?, ?)",
        )
        .bind(id)
        .bind(file.bucket_id)
        .bind(&file.name)
        .bind(file.size)
        .bind(&file.mime_type)
        .bind(actor.user_id.as_deref())
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        self.fetch_file(id)
            .await?
            .ok_or(MetadataError::Database(sqlx::Error::RowNotFound))
    }

    async fn get_file(
        &self,
        actor: &ActorIdentity,
        id: Uuid,
        access: FileAccess,
    ) -> MetadataResult<Option<FileRecord>> {
        let policy = match access {
            FileAccess::Read => READ_POLICY.to_string(),
            FileAccess::Write => {
                WRITE_POLICY.replace("uploaded_by_user_id", "f.uploaded_by_user_id")
            }
        };
        let sql = format!("{} WHERE f.id = ? AND {}", FILE_COLUMNS, policy);

        let record = sqlx::query_as::<_, FileRecord>(&sql)
            .bind(id)
            .bind(actor.is_elevated())
            .bind(actor.user_id.as_deref())
            .fetch_optional(&self.pool)
            .await?;
        Ok(record)
    }

    async fn confirm_upload(
        &self,
        actor: &ActorIdentity,
        id: Uuid,
        confirmed: ConfirmedUpload,
    ) -> MetadataResult<Option<FileRecord>> {
        // The anonymous uploader may confirm its own anonymous row.
        let sql = format!(
            "UPDATE files
             SET is_uploaded = 1, size = ?, mime_type = ?, etag = ?, updated_at = ?
             WHERE id = ? AND is_uploaded = 0
               AND ({} OR (uploaded_by_user_id IS NULL AND ? IS NULL))",
            WRITE_POLICY
        );

        let result = sqlx::query(&sql)
            .bind(confirmed.size)
            .bind(&confirmed.mime_type)
            .bind(&confirmed.etag)
            .bind(Utc::now())
            .bind(id)
            .bind(actor.is_elevated())
            .bind(actor.user_id.as_deref())
            .bind(actor.user_id.as_deref())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }
        self.fetch_file(id).await
    }

    async fn delete_file(&self, actor: &ActorIdentity, id: Uuid) -> MetadataResult<bool> {
        let sql = format!("DELETE FROM files WHERE id = ? AND {}", WRITE_POLICY);
        let result = sqlx::query(&sql)
            .bind(id)
            .bind(actor.is_elevated())
            .bind(actor.user_id.as_deref())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_pending_uploads(
        &self,
        actor: &ActorIdentity,
        older_than: DateTime<Utc>,
    ) -> MetadataResult<Vec<FileRecord>> {
        let sql = format!(
            "{} WHERE f.is_uploaded = 0 AND f.created_at < ? AND {} ORDER BY f.created_at ASC",
            FILE_COLUMNS, READ_POLICY
        );

        let rows = sqlx::query_as::<_, FileRecord>(&sql)
            .bind(older_than)
            .bind(actor.is_elevated())
            .bind(actor.user_id.as_deref())
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    async fn check_ready(&self) -> MetadataResult<()> {
        let value = sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&self.pool)
            .await?;
        if value == 1 {
            Ok(())
        } else {
            Err(MetadataError::Database(sqlx::Error::Protocol(format!(
                "unexpected result: {}",
                value
            ))))
        }
    }
}

/// Validate bucket name format.
///
/// Enforces S3-like naming rules:
/// - 3–63 characters
/// - lowercase letters, digits, dots, hyphens only
/// - cannot start/end with dot or hyphen
/// - cannot contain consecutive dots or dot-hyphen patterns
/// - cannot look like an IPv4 address
fn ensure_bucket_name_safe(name: &str) -> MetadataResult<()> {
    let invalid = |reason: &str| MetadataError::InvalidBucketName {
        name: name.to_string(),
        reason: reason.to_string(),
    };

    let len = name.len();
    if !(BUCKET_NAME_MIN_LEN..=BUCKET_NAME_MAX_LEN).contains(&len) {
        return Err(invalid("must be between 3 and 63 characters"));
    }
    if !name
        .chars()
        .all(|c| matches!(c, 'a'..='z' | '0'..='9' | '.' | '-'))
    {
        return Err(invalid(
            "allowed characters are lowercase letters, digits, dots, and hyphens",
        ));
    }
    if name.starts_with('.') || name.ends_with('.') || name.starts_with('-') || name.ends_with('-')
    {
        return Err(invalid("must start and end with a lowercase letter or digit"));
    }
    if name.contains("..") || name.contains("-.") || name.contains(".-") {
        return Err(invalid(
            "cannot contain consecutive dots or dot-hyphen combinations",
        ));
    }
    if is_ipv4_like(name) {
        return Err(invalid("must not be formatted like an IP address"));
    }
    Ok(())
}

/// Check if a string matches IPv4-like dotted decimal form.
fn is_ipv4_like(name: &str) -> bool {
    let parts: Vec<&str> = name.split('.').collect();
    parts.len() == 4
        && parts.iter().all(|segment| {
            !segment.is_empty()
                && segment.len() <= 3
                && segment.chars().all(|c| c.is_ascii_digit())
                && segment.parse::<u8>().is_ok()
        })
}
