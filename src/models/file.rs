//! Represents a file record: the metadata half of a stored file.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// One row per object ever accepted for upload.
///
/// The record id doubles as the object key in the object store. A record
/// with `is_uploaded = false` is pending: the object write has not been
/// confirmed and the bytes may or may not exist. A confirmed record always
/// has an `etag` and an object whose size and etag match.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FileRecord {
    pub id: Uuid,

    /// Client-supplied display name. Never used as a storage key.
    pub name: String,

    pub bucket_id: Uuid,

    /// Name of the owning bucket, joined in from `buckets`.
    pub bucket_name: String,

    /// Declared size until confirmed, then the size the object store reported.
    pub size: i64,

    pub mime_type: String,

    pub etag: Option<String>,

    pub is_uploaded: bool,

    /// `None` for anonymous uploads.
    pub uploaded_by_user_id: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FileRecord {
    /// Key under which this record's bytes live in the object store.
    pub fn object_key(&self) -> String {
        self.id.to_string()
    }
}

/// Fields needed to reserve a pending record before the object write.
#[derive(Clone, Debug)]
pub struct NewFile {
    pub bucket_id: Uuid,
    pub name: String,
    pub size: i64,
    pub mime_type: String,
}

/// Values confirmed by the object store after a successful write.
#[derive(Clone, Debug)]
pub struct ConfirmedUpload {
    pub size: i64,
    pub mime_type: String,
    pub etag: String,
}
