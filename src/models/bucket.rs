//! Represents a bucket: the policy scope for a group of stored files.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Default presigned-URL lifetime in seconds when a bucket doesn't specify one.
pub const DEFAULT_DOWNLOAD_EXPIRATION_SECS: i64 = 30;

/// Default `Cache-Control` value served with downloads.
pub const DEFAULT_CACHE_CONTROL: &str = "max-age=3600";

/// A storage bucket and the upload/download policy attached to it.
///
/// Buckets are provisioned out of band and referenced by name. Size bounds
/// are inclusive; `None` means unbounded. An empty `allowed_mime_types`
/// means any type is accepted.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Bucket {
    pub id: Uuid,
    pub name: String,

    /// Files in a public bucket are readable by every actor.
    pub public: bool,

    pub min_upload_size: Option<i64>,
    pub max_upload_size: Option<i64>,
    pub allowed_mime_types: Vec<String>,

    /// `Cache-Control` header value for downloads.
    pub cache_control: String,

    /// Default presigned-URL lifetime, in seconds.
    pub download_expiration: i64,

    pub presigned_urls_enabled: bool,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Row shape of the `buckets` table. MIME types are stored comma-separated.
#[derive(FromRow, Debug)]
pub(crate) struct BucketRow {
    pub id: Uuid,
    pub name: String,
    pub public: bool,
    pub min_upload_size: Option<i64>,
    pub max_upload_size: Option<i64>,
    pub allowed_mime_types: Option<String>,
    pub cache_control: String,
    pub download_expiration: i64,
    pub presigned_urls_enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<BucketRow> for Bucket {
    fn from(row: BucketRow) -> Self {
        let allowed_mime_types = row
            .allowed_mime_types
            .as_deref()
            .map(split_mime_list)
            .unwrap_or_default();

        Self {
            id: row.id,
            name: row.name,
            public: row.public,
            min_upload_size: row.min_upload_size,
            max_upload_size: row.max_upload_size,
            allowed_mime_types,
            cache_control: row.cache_control,
            download_expiration: row.download_expiration,
            presigned_urls_enabled: row.presigned_urls_enabled,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

/// Settings used to provision a bucket.
#[derive(Clone, Debug)]
pub struct BucketSettings {
    pub name: String,
    pub public: bool,
    pub min_upload_size: Option<i64>,
    pub max_upload_size: Option<i64>,
    pub allowed_mime_types: Vec<String>,
    pub cache_control: String,
    pub download_expiration: i64,
    pub presigned_urls_enabled: bool,
}

impl BucketSettings {
    /// Unrestricted, private bucket with default download settings.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            public: false,
            min_upload_size: None,
            max_upload_size: None,
            allowed_mime_types: Vec::new(),
            cache_control: DEFAULT_CACHE_CONTROL.to_string(),
            download_expiration: DEFAULT_DOWNLOAD_EXPIRATION_SECS,
            presigned_urls_enabled: true,
        }
    }

    pub fn with_max_upload_size(mut self, max: i64) -> Self {
        self.max_upload_size = Some(max);
        self
    }

    pub fn with_min_upload_size(mut self, min: i64) -> Self {
        self.min_upload_size = Some(min);
        self
    }

    pub fn with_allowed_mime_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_mime_types = types.into_iter().map(Into::into).collect();
        self
    }

    pub fn public(mut self) -> Self {
        self.public = true;
        self
    }

    pub fn without_presigned_urls(mut self) -> Self {
        self.presigned_urls_enabled = false;
        self
    }

    /// Comma-joined MIME list for storage, `None` when unrestricted.
    pub(crate) fn mime_column(&self) -> Option<String> {
        if self.allowed_mime_types.is_empty() {
            None
        } else {
            Some(self.allowed_mime_types.join(","))
        }
    }
}

fn split_mime_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.to_ascii_lowercase())
        .collect()
}
