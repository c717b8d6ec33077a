//! HTTP handlers for the file lifecycle.
//! Streams bodies in both directions and delegates storage concerns to
//! `FileService`. The caller's identity is resolved by middleware.

use crate::{
    errors::AppError,
    models::{actor::ActorIdentity, bucket::Bucket, file::FileRecord},
    services::{file_service::UploadRequest, object_store::ByteStream},
    state::AppState,
};
use axum::{
    Extension, Json,
    body::Body,
    extract::{Multipart, Path, Query, State, multipart::Field},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::{
    io,
    path::{Path as FsPath, PathBuf},
};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tokio_util::io::ReaderStream;
use uuid::Uuid;

const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

/// Query params accepted by the presigned-URL endpoint.
#[derive(Debug, Deserialize)]
pub struct PresignQuery {
    /// Lifetime in seconds; defaults to the bucket's download expiration.
    pub expiry: Option<u64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PresignedUrlResponse {
    pub url: String,
    pub expires_in: u64,
}

/// Query params carried by a presigned link.
#[derive(Debug, Deserialize)]
pub struct PresignedObjectQuery {
    pub expires: i64,
    pub signature: String,
}

/// A multipart file part written to local disk. Removed on drop.
struct SpooledFile {
    path: PathBuf,
    size: u64,
}

impl SpooledFile {
    async fn from_field(mut field: Field<'_>, dir: &FsPath) -> Result<Self, AppError> {
        fs::create_dir_all(dir).await.map_err(spool_error)?;
        let mut spool = Self {
            path: dir.join(format!(".upload-{}", Uuid::new_v4())),
            size: 0,
        };
        let mut file = File::create(&spool.path).await.map_err(spool_error)?;

        while let Some(chunk) = field.chunk().await? {
            spool.size += chunk.len() as u64;
            file.write_all(&chunk).await.map_err(spool_error)?;
        }
        file.flush().await.map_err(spool_error)?;

        Ok(spool)
    }

    async fn stream(&self) -> io::Result<ByteStream> {
        let file = File::open(&self.path).await?;
        Ok(ReaderStream::new(file).boxed())
    }
}

impl Drop for SpooledFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

fn spool_error(err: io::Error) -> AppError {
    tracing::error!("failed to spool upload: {}", err);
    AppError::internal("failed to receive upload")
}

/// Unparseable ids are reported like unknown ones.
fn parse_file_id(raw: &str) -> Result<Uuid, AppError> {
    Uuid::parse_str(raw).map_err(|_| AppError::not_found(format!("file `{}` not found", raw)))
}

/// `POST /storage/upload`: multipart with a required `file` part and
/// optional `bucket` and `name` text parts.
pub async fn upload_file(
    State(state): State<AppState>,
    Extension(actor): Extension<ActorIdentity>,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, AppError> {
    let mut bucket: Option<String> = None;
    let mut name: Option<String> = None;
    let mut upload: Option<(SpooledFile, Option<String>, Option<String>)> = None;

    while let Some(field) = multipart.next_field().await? {
        let field_name = field.name().map(str::to_string);
        match field_name.as_deref() {
            Some("file") => {
                if upload.is_some() {
                    return Err(AppError::bad_request("only one `file` part is accepted"));
                }
                let file_name = field.file_name().map(str::to_string);
                let content_type = field.content_type().map(str::to_string);
                let spool = SpooledFile::from_field(field, &state.spool_dir).await?;
                upload = Some((spool, file_name, content_type));
            }
            Some("bucket") => bucket = Some(field.text().await?),
            Some("name") => name = Some(field.text().await?),
            _ => {}
        }
    }

    let Some((spool, file_name, content_type)) = upload else {
        return Err(AppError::bad_request("missing `file` part"));
    };

    let name = name
        .or(file_name)
        .map(|n| n.trim().to_string())
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| "file".into());
    let mime_type = content_type
        .filter(|ct| !ct.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_MIME_TYPE.into());
    let bucket = bucket
        .map(|b| b.trim().to_string())
        .filter(|b| !b.is_empty())
        .unwrap_or_else(|| state.default_bucket.clone());

    let body = spool.stream().await.map_err(spool_error)?;
    let record = state
        .files
        .upload(
            &actor,
            UploadRequest {
                bucket,
                name,
                mime_type,
                size: spool.size,
                body,
            },
        )
        .await?;
    drop(spool);

    Ok((StatusCode::OK, Json(record)))
}

/// `GET /storage/download/{file_id}`: stream the file as an attachment.
pub async fn download_file(
    State(state): State<AppState>,
    Extension(actor): Extension<ActorIdentity>,
    Path(file_id): Path<String>,
) -> Result<Response, AppError> {
    let id = parse_file_id(&file_id)?;
    let download = state.files.download(&actor, id).await?;

    let body = Body::from_stream(ReaderStream::new(download.body));
    let mut response = Response::new(body);
    *response.status_mut() = StatusCode::OK;
    set_download_headers(response.headers_mut(), &download.record, &download.bucket);

    Ok(response)
}

/// `DELETE /storage/{file_id}`: anonymous callers get 403 from the service.
pub async fn delete_file(
    State(state): State<AppState>,
    Extension(actor): Extension<ActorIdentity>,
    Path(file_id): Path<String>,
) -> Result<StatusCode, AppError> {
    let id = parse_file_id(&file_id)?;
    state.files.delete(&actor, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `GET /storage/presigned-url/{file_id}?expiry=<seconds>`
pub async fn presigned_url(
    State(state): State<AppState>,
    Extension(actor): Extension<ActorIdentity>,
    Path(file_id): Path<String>,
    Query(q): Query<PresignQuery>,
) -> Result<Json<PresignedUrlResponse>, AppError> {
    let id = parse_file_id(&file_id)?;
    let presigned = state.files.presigned_url(&actor, id, q.expiry).await?;
    Ok(Json(PresignedUrlResponse {
        url: presigned.url,
        expires_in: presigned.expires_in,
    }))
}

/// `GET /storage/object/{bucket}/{key}?expires=&signature=`: serve a
/// presigned link. The signature is the only authorization.
pub async fn presigned_object(
    State(state): State<AppState>,
    Path((bucket, key)): Path<(String, String)>,
    Query(q): Query<PresignedObjectQuery>,
) -> Result<Response, AppError> {
    let (stat, reader) = state
        .objects
        .open_presigned(&bucket, &key, q.expires, &q.signature)
        .await?;

    let mut response = Response::new(Body::from_stream(ReaderStream::new(reader)));
    *response.status_mut() = StatusCode::OK;
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&stat.content_type)
            .unwrap_or_else(|_| HeaderValue::from_static(DEFAULT_MIME_TYPE)),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(stat.size));
    if let Ok(value) = HeaderValue::from_str(&format!("\"{}\"", stat.etag)) {
        headers.insert(header::ETAG, value);
    }

    Ok(response)
}

/// Content length comes from the record, not from how much has been read.
fn set_download_headers(headers: &mut HeaderMap, record: &FileRecord, bucket: &Bucket) {
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&record.mime_type)
            .unwrap_or_else(|_| HeaderValue::from_static(DEFAULT_MIME_TYPE)),
    );
    headers.insert(
        header::CONTENT_LENGTH,
        HeaderValue::from(record.size.max(0)),
    );
    headers.insert(header::CONTENT_DISPOSITION, content_disposition(&record.name));

    if let Some(etag) = record.etag.as_ref() {
        if let Ok(value) = HeaderValue::from_str(&format!("\"{}\"", etag)) {
            headers.insert(header::ETAG, value);
        }
    }
    if let Ok(value) = HeaderValue::from_str(&bucket.cache_control) {
        headers.insert(header::CACHE_CONTROL, value);
    }
    let last_modified = record.updated_at.format("%a, %d %b %Y %H:%M:%S GMT");
    if let Ok(value) = HeaderValue::from_str(&last_modified.to_string()) {
        headers.insert(header::LAST_MODIFIED, value);
    }
}

/// `attachment; filename="..."`, plus RFC 5987 `filename*` for non-ASCII names.
fn content_disposition(name: &str) -> HeaderValue {
    let mut ascii = String::with_capacity(name.len());
    for c in name.chars() {
        match c {
            '"' => ascii.push_str("\\\""),
            '\\' => ascii.push_str("\\\\"),
            c if c.is_ascii_graphic() || c == ' ' => ascii.push(c),
            _ => ascii.push('_'),
        }
    }

    let mut value = format!("attachment; filename=\"{}\"", ascii);
    if !name.is_ascii() {
        value.push_str("; filename*=UTF-8''");
        value.push_str(&percent_encode(name));
    }

    HeaderValue::from_str(&value).unwrap_or_else(|_| HeaderValue::from_static("attachment"))
}

fn percent_encode(value: &str) -> String {
    let mut out = String::with_capacity(value.len() * 3);
    for byte in value.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'.' | b'_' | b'~') {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{:02X}", byte));
        }
    }
    out
}
