//! HTTP surface, exercised through the router without binding a socket.

use axum::body::{to_bytes, Body};
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use catalog_service::api::{create_router, AppState, JwtVerifier};
use catalog_service::config::ApiConfig;
use catalog_service::memory::{MemoryBlobStore, MemoryRecordStore, MemoryUrlSigner};
use catalog_service::perceptual_hash::BlockhashHasher;
use catalog_service::{Catalog, CatalogSettings, Collaborators};
use image::{DynamicImage, ImageFormat, RgbImage};
use jsonwebtoken::{encode, EncodingKey, Header};
use serde_json::{json, Value};
use std::io::Cursor;
use std::sync::Arc;
use tower::ServiceExt;

const SECRET: &str = "test-secret";
const BOUNDARY: &str = "catalog-test-boundary";

struct TestApp {
    router: Router,
    store: MemoryRecordStore,
}

fn app() -> TestApp {
    let store = MemoryRecordStore::new();
    let catalog = Catalog::new(
        Collaborators {
            store: Arc::new(store.clone()),
            blobs: Arc::new(MemoryBlobStore::new()),
            signer: Arc::new(MemoryUrlSigner::default()),
            hasher: Arc::new(BlockhashHasher::new()),
            dispatcher: None,
        },
        CatalogSettings::default(),
    );
    let state = AppState {
        catalog: Arc::new(catalog),
        auth: Arc::new(JwtVerifier::new(SECRET, "email")),
    };

    TestApp {
        router: create_router(state, &ApiConfig::default()),
        store,
    }
}

fn token(email: &str) -> String {
    encode(
        &Header::default(),
        &json!({ "email": email }),
        &EncodingKey::from_secret(SECRET.as_bytes()),
    )
    .unwrap()
}

fn jpeg() -> Vec<u8> {
    let img = RgbImage::from_fn(32, 32, |x, y| image::Rgb([x as u8 * 8, y as u8 * 8, 90]));
    let mut out = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(img)
        .write_to(&mut out, ImageFormat::Jpeg)
        .unwrap();
    out.into_inner()
}

fn multipart_body(field: &str, content_type: &str, bytes: &[u8]) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(format!("--{}\r\n", BOUNDARY).as_bytes());
    body.extend_from_slice(
        format!(
            "Content-Disposition: form-data; name=\"{}\"; filename=\"photo.jpg\"\r\n",
            field
        )
        .as_bytes(),
    );
    body.extend_from_slice(format!("Content-Type: {}\r\n\r\n", content_type).as_bytes());
    body.extend_from_slice(bytes);
    body.extend_from_slice(format!("\r\n--{}--\r\n", BOUNDARY).as_bytes());
    body
}

fn upload_request(auth: Option<&str>, field: &str, content_type: &str, bytes: &[u8]) -> Request<Body> {
    let mut builder = Request::builder()
        .method(Method::POST)
        .uri("/image-detections/create")
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={}", BOUNDARY),
        );
    if let Some(email) = auth {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token(email)));
    }
    builder
        .body(Body::from(multipart_body(field, content_type, bytes)))
        .unwrap()
}

fn get_request(uri: &str, email: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Bearer {}", token(email)))
        .body(Body::empty())
        .unwrap()
}

fn update_request(form: &str) -> Request<Body> {
    Request::builder()
        .method(Method::PUT)
        .uri("/image-detections/update")
        .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
        .body(Body::from(form.to_string()))
        .unwrap()
}

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

async fn uploaded_id(router: &Router, email: &str) -> String {
    let (status, body) = send(router, upload_request(Some(email), "image", "image/jpeg", &jpeg())).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    body["id"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn health_and_readiness() {
    let app = app();

    let (status, body) = send(&app.router, Request::get("/health").body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");

    let (status, _) = send(&app.router, Request::get("/ready").body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::OK);

    app.store.fail("ping");
    let (status, body) = send(&app.router, Request::get("/ready").body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["status"], "not_ready");
}

#[tokio::test]
async fn upload_returns_pending_record_with_link() {
    let app = app();

    let (status, body) = send(
        &app.router,
        upload_request(Some("a@x.com"), "image", "image/jpeg", &jpeg()),
    )
    .await;

    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["ownerIdentity"], "a@x.com");
    assert_eq!(body["isDetected"], false);
    assert_eq!(body["label"], "");
    assert!(body["fileUrl"].as_str().unwrap().starts_with("memory://local/images/"));
    assert!(body["createdAt"].as_i64().unwrap() > 0);
}

#[tokio::test]
async fn upload_requires_bearer_token() {
    let app = app();

    let (status, body) = send(&app.router, upload_request(None, "image", "image/jpeg", &jpeg())).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "UNAUTHORIZED");

    let forged = Request::builder()
        .method(Method::POST)
        .uri("/image-detections/create")
        .header(header::AUTHORIZATION, "Bearer not.a.token")
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(&app.router, forged).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(app.store.is_empty());
}

#[tokio::test]
async fn upload_rejects_bad_parts() {
    let app = app();

    let (status, body) = send(
        &app.router,
        upload_request(Some("a@x.com"), "image", "image/png", &jpeg()),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "INVALID_INPUT");

    let (status, _) = send(
        &app.router,
        upload_request(Some("a@x.com"), "picture", "image/jpeg", &jpeg()),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    assert!(app.store.is_empty());
}

#[tokio::test]
async fn fetch_lists_only_the_callers_records() {
    let app = app();
    let mine = uploaded_id(&app.router, "a@x.com").await;
    uploaded_id(&app.router, "b@x.com").await;

    let (status, body) = send(&app.router, get_request("/image-detections/fetch", "a@x.com")).await;
    assert_eq!(status, StatusCode::OK);

    let records = body["records"].as_array().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["id"], mine.as_str());
    assert!(body.get("nextCursor").is_none());
}

#[tokio::test]
async fn fetch_paginates_with_cursor() {
    let app = app();
    for _ in 0..3 {
        uploaded_id(&app.router, "a@x.com").await;
    }

    let (_, first) = send(
        &app.router,
        get_request("/image-detections/fetch?perPage=2", "a@x.com"),
    )
    .await;
    assert_eq!(first["records"].as_array().unwrap().len(), 2);
    let cursor = first["nextCursor"].as_str().unwrap().to_string();

    let (_, second) = send(
        &app.router,
        get_request(&format!("/image-detections/fetch?perPage=2&after={}", cursor), "a@x.com"),
    )
    .await;
    let second = second["records"].as_array().unwrap();
    assert_eq!(second.len(), 1);
    assert!(first["records"]
        .as_array()
        .unwrap()
        .iter()
        .all(|r| r["id"] != second[0]["id"]));
}

#[tokio::test]
async fn fetch_rejects_bad_filters() {
    let app = app();
    uploaded_id(&app.router, "a@x.com").await;

    let (status, body) = send(
        &app.router,
        get_request("/image-detections/fetch?after=not-a-uuid", "a@x.com"),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "INVALID_CURSOR");

    let (status, _) = send(
        &app.router,
        get_request("/image-detections/fetch?startDate=20&endDate=10", "a@x.com"),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(
        &app.router,
        get_request("/image-detections/fetch?startDate=yesterday", "a@x.com"),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn fetch_one_hides_other_owners() {
    let app = app();
    let id = uploaded_id(&app.router, "a@x.com").await;

    let (status, body) = send(
        &app.router,
        get_request(&format!("/image-detections/fetch/{}", id), "a@x.com"),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["id"], id.as_str());

    let (status, body) = send(
        &app.router,
        get_request(&format!("/image-detections/fetch/{}", id), "b@x.com"),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "NOT_FOUND");
}

#[tokio::test]
async fn update_marks_record_detected() {
    let app = app();
    let id = uploaded_id(&app.router, "a@x.com").await;

    let form = format!(
        "filename={}&label=%20cat%20&inferenceTime=12.5&detectedAt=1700000000000.0&confidence=0.9",
        id
    );
    let (status, body) = send(&app.router, update_request(&form)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "updated");
    assert_eq!(body["id"], id.as_str());

    let (_, body) = send(
        &app.router,
        get_request("/image-detections/fetch?labels=cat", "a@x.com"),
    )
    .await;
    let records = body["records"].as_array().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["isDetected"], true);
    assert_eq!(records[0]["confidence"], 0.9);
    assert_eq!(records[0]["label"], "cat");
    assert_eq!(records[0]["detectedAt"], 1_700_000_000_000i64);
}

#[tokio::test]
async fn update_validates_and_reports_missing_records() {
    let app = app();

    let (status, body) = send(
        &app.router,
        update_request("label=cat&inferenceTime=1&detectedAt=5&confidence=0.5"),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "INVALID_INPUT");

    let (status, _) = send(
        &app.router,
        update_request(
            "filename=550e8400-e29b-41d4-a716-446655440000&label=cat&inferenceTime=1&detectedAt=5&confidence=0.5",
        ),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(
        &app.router,
        update_request(
            "filename=550e8400-e29b-41d4-a716-446655440000&label=cat&inferenceTime=1&detectedAt=5&confidence=1.5",
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}
