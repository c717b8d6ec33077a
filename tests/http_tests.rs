//! End-to-end tests through the axum router.

mod common;

use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode, header},
    response::Response,
};
use common::*;
use file_storage::models::bucket::BucketSettings;
use http_body_util::BodyExt;
use jsonwebtoken::{EncodingKey, Header, encode};
use serde::Serialize;
use serde_json::Value;
use tower::ServiceExt;

const BOUNDARY: &str = "file-storage-test-boundary";

#[derive(Serialize)]
struct Claims<'a> {
    sub: &'a str,
    role: &'a str,
    exp: i64,
}

fn token_for(sub: &str, secret: &str) -> String {
    let claims = Claims {
        sub,
        role: "authenticated",
        exp: chrono::Utc::now().timestamp() + 3600,
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .unwrap()
}

fn bearer(sub: &str) -> String {
    format!("Bearer {}", token_for(sub, JWT_SECRET))
}

enum Part<'a> {
    Text(&'a str, &'a str),
    File {
        filename: &'a str,
        content_type: &'a str,
        data: &'a [u8],
    },
}

fn multipart_body(parts: &[Part<'_>]) -> Vec<u8> {
    let mut body = Vec::new();
    for part in parts {
        body.extend_from_slice(format!("--{}\r\n", BOUNDARY).as_bytes());
        match part {
            Part::Text(name, value) => {
                body.extend_from_slice(
                    format!("Content-Disposition: form-data; name=\"{}\"\r\n\r\n", name).as_bytes(),
                );
                body.extend_from_slice(value.as_bytes());
            }
            Part::File {
                filename,
                content_type,
                data,
            } => {
                body.extend_from_slice(
                    format!(
                        "Content-Disposition: form-data; name=\"file\"; filename=\"{}\"\r\n\
                         Content-Type: {}\r\n\r\n",
                        filename, content_type
                    )
                    .as_bytes(),
                );
                body.extend_from_slice(data);
            }
        }
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{}--\r\n", BOUNDARY).as_bytes());
    body
}

fn upload_request(auth: Option<&str>, parts: &[Part<'_>]) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/storage/upload")
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={}", BOUNDARY),
        );
    if let Some(auth) = auth {
        builder = builder.header(header::AUTHORIZATION, auth);
    }
    builder.body(Body::from(multipart_body(parts))).unwrap()
}

fn request(method: &str, uri: &str, auth: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(auth) = auth {
        builder = builder.header(header::AUTHORIZATION, auth);
    }
    builder.body(Body::empty()).unwrap()
}

async fn send(app: &Router, req: Request<Body>) -> Response {
    app.clone().oneshot(req).await.unwrap()
}

async fn body_bytes(response: Response) -> Vec<u8> {
    response
        .into_body()
        .collect()
        .await
        .unwrap()
        .to_bytes()
        .to_vec()
}

async fn body_json(response: Response) -> Value {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}

fn hello_file() -> Part<'static> {
    Part::File {
        filename: "hello.txt",
        content_type: "text/plain",
        data: b"hello",
    }
}

async fn docs_harness() -> Harness {
    let h = Harness::new().await;
    h.bucket(
        BucketSettings::named("docs")
            .with_allowed_mime_types(["text/plain"])
            .with_max_upload_size(100),
    )
    .await;
    h
}

#[tokio::test]
async fn upload_then_download_round_trip() {
    let h = docs_harness().await;
    let app = h.app();
    let auth = bearer("alice");

    let response = send(
        &app,
        upload_request(Some(&auth), &[Part::Text("bucket", "docs"), hello_file()]),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let record = body_json(response).await;
    assert_eq!(record["isUploaded"], true);
    assert_eq!(record["size"], 5);
    assert_eq!(record["name"], "hello.txt");
    assert_eq!(record["bucketName"], "docs");
    assert_eq!(record["uploadedByUserId"], "alice");
    let id = record["id"].as_str().unwrap().to_string();

    let response = send(
        &app,
        request("GET", &format!("/storage/download/{}", id), Some(&auth)),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let headers = response.headers().clone();
    assert_eq!(headers[header::CONTENT_TYPE], "text/plain");
    assert_eq!(headers[header::CONTENT_LENGTH], "5");
    assert_eq!(
        headers[header::CONTENT_DISPOSITION],
        "attachment; filename=\"hello.txt\""
    );
    assert_eq!(headers[header::CACHE_CONTROL], "max-age=3600");
    assert_eq!(
        headers[header::ETAG],
        format!("\"{}\"", md5_hex(b"hello")).as_str()
    );
    assert_eq!(body_bytes(response).await, b"hello");
}

#[tokio::test]
async fn oversized_upload_is_bad_request_without_object_calls() {
    let h = Harness::new().await;
    h.bucket(BucketSettings::named("small").with_max_upload_size(10))
        .await;
    let app = h.app();

    let response = send(
        &app,
        upload_request(
            Some(&bearer("alice")),
            &[
                Part::Text("bucket", "small"),
                Part::File {
                    filename: "big.bin",
                    content_type: "application/octet-stream",
                    data: b"01234567890",
                },
            ],
        ),
    )
    .await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert!(body["error"].as_str().unwrap().contains("exceeds"));
    assert_eq!(h.objects.calls(), 0);
}

#[tokio::test]
async fn invalid_token_falls_back_to_anonymous() {
    let h = docs_harness().await;
    let app = h.app();
    let forged = format!("Bearer {}", token_for("mallory", "wrong-secret"));

    let response = send(
        &app,
        upload_request(Some(&forged), &[Part::Text("bucket", "docs"), hello_file()]),
    )
    .await;

    assert_eq!(response.status(), StatusCode::OK);
    let record = body_json(response).await;
    assert_eq!(record["isUploaded"], true);
    assert!(record["uploadedByUserId"].is_null());
}

#[tokio::test]
async fn anonymous_delete_is_forbidden() {
    let h = docs_harness().await;
    let app = h.app();

    let response = send(
        &app,
        upload_request(None, &[Part::Text("bucket", "docs"), hello_file()]),
    )
    .await;
    let id = body_json(response).await["id"].as_str().unwrap().to_string();

    let response = send(&app, request("DELETE", &format!("/storage/{}", id), None)).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    // the file survives
    let response = send(
        &app,
        request("GET", &format!("/storage/download/{}", id), None),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn owner_delete_returns_no_content() {
    let h = docs_harness().await;
    let app = h.app();
    let auth = bearer("alice");

    let response = send(
        &app,
        upload_request(Some(&auth), &[Part::Text("bucket", "docs"), hello_file()]),
    )
    .await;
    let id = body_json(response).await["id"].as_str().unwrap().to_string();

    let response = send(
        &app,
        request("DELETE", &format!("/storage/{}", id), Some(&bearer("bob"))),
    )
    .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = send(
        &app,
        request("DELETE", &format!("/storage/{}", id), Some(&auth)),
    )
    .await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = send(
        &app,
        request("GET", &format!("/storage/download/{}", id), Some(&auth)),
    )
    .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn upload_without_file_part_is_bad_request() {
    let h = docs_harness().await;
    let app = h.app();

    let response = send(
        &app,
        upload_request(Some(&bearer("alice")), &[Part::Text("bucket", "docs")]),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(h.objects.calls(), 0);
}

#[tokio::test]
async fn upload_defaults_to_configured_bucket() {
    let h = Harness::new().await;
    let app = h.app();

    let response = send(&app, upload_request(Some(&bearer("alice")), &[hello_file()])).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["bucketName"], DEFAULT_BUCKET);
}

#[tokio::test]
async fn malformed_file_id_is_not_found() {
    let h = Harness::new().await;
    let app = h.app();

    let response = send(&app, request("GET", "/storage/download/not-a-uuid", None)).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn presigned_url_serves_object_until_tampered() {
    let h = docs_harness().await;
    let app = h.app();
    let auth = bearer("alice");

    let response = send(
        &app,
        upload_request(Some(&auth), &[Part::Text("bucket", "docs"), hello_file()]),
    )
    .await;
    let id = body_json(response).await["id"].as_str().unwrap().to_string();

    let response = send(
        &app,
        request(
            "GET",
            &format!("/storage/presigned-url/{}?expiry=120", id),
            Some(&auth),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let presigned = body_json(response).await;
    assert_eq!(presigned["expiresIn"], 120);
    let url = presigned["url"].as_str().unwrap();
    let path = url.strip_prefix(PUBLIC_URL).unwrap().to_string();

    // no credentials needed, the signature is the grant
    let response = send(&app, request("GET", &path, None)).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "text/plain");
    assert_eq!(body_bytes(response).await, b"hello");

    let tampered = path.replace("expires=", "expires=1");
    let response = send(&app, request("GET", &tampered, None)).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn presigned_url_out_of_range_expiry_is_bad_request() {
    let h = docs_harness().await;
    let app = h.app();
    let auth = bearer("alice");

    let response = send(
        &app,
        upload_request(Some(&auth), &[Part::Text("bucket", "docs"), hello_file()]),
    )
    .await;
    let id = body_json(response).await["id"].as_str().unwrap().to_string();

    let response = send(
        &app,
        request(
            "GET",
            &format!("/storage/presigned-url/{}?expiry=0", id),
            Some(&auth),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn probes_report_healthy() {
    let h = Harness::new().await;
    let app = h.app();

    let response = send(&app, request("GET", "/healthz", None)).await;
    assert_eq!(response.status(), StatusCode::OK);

    let response = send(&app, request("GET", "/readyz", None)).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["checks"]["metadata"]["ok"], true);
    assert_eq!(body["checks"]["objects"]["ok"], true);
}
