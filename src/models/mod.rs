//! Core data models for the file storage service.
//!
//! Buckets and file records map to database tables via `sqlx::FromRow` and
//! serialize as camelCase JSON via `serde`. Actor identities are transient
//! and live only for the duration of one request.

pub mod actor;
pub mod bucket;
pub mod file;
