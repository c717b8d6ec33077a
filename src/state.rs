//! Shared application state handed to every handler.

use crate::services::{
    actor_resolver::ActorResolver, file_service::FileService, object_store::LocalObjectStore,
};
use std::{path::PathBuf, sync::Arc};

/// Constructed once at startup and never mutated afterwards.
#[derive(Clone)]
pub struct AppState {
    pub files: FileService,
    pub resolver: Arc<ActorResolver>,

    /// Serves presigned links minted by `files`.
    pub objects: Arc<LocalObjectStore>,

    /// Bucket used when an upload doesn't name one.
    pub default_bucket: String,

    /// Where multipart file parts are spooled before upload.
    pub spool_dir: PathBuf,
}
