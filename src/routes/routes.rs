//! Defines routes for the file storage API.
//!
//! ## Structure
//! - **File lifecycle** (caller resolved by `resolve_actor` middleware)
//!   - `POST   /storage/upload`                  : multipart upload
//!   - `GET    /storage/download/{file_id}`      : stream file as attachment
//!   - `GET    /storage/presigned-url/{file_id}` : mint a direct-access link
//!   - `DELETE /storage/{file_id}`               : delete (identified callers only)
//!
//! - **Presigned links**
//!   - `GET    /storage/object/{bucket}/{key}`   : serve a signed link
//!
//! - **Probes**
//!   - `GET    /healthz`, `GET /readyz`

use crate::{
    handlers::{
        actor_middleware::resolve_actor,
        file_handlers::{delete_file, download_file, presigned_object, presigned_url, upload_file},
        health_handlers::{healthz, readyz},
    },
    state::AppState,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    middleware,
    routing::{delete, get, post},
};

/// Build the application router with `state` attached.
///
/// `max_request_bytes` caps request bodies, multipart uploads included.
pub fn routes(state: AppState, max_request_bytes: usize) -> Router {
    let lifecycle: Router<AppState> = Router::new()
        .route("/storage/upload", post(upload_file))
        .route("/storage/download/{file_id}", get(download_file))
        .route("/storage/presigned-url/{file_id}", get(presigned_url))
        .route("/storage/{file_id}", delete(delete_file))
        .layer(middleware::from_fn_with_state(
            state.resolver.clone(),
            resolve_actor,
        ));

    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/storage/object/{bucket}/{key}", get(presigned_object))
        .merge(lifecycle)
        .layer(DefaultBodyLimit::max(max_request_bytes))
        .with_state(state)
}
