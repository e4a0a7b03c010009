use crate::catalog::{Catalog, Upload};
use crate::config::{ApiConfig, AuthConfig};
use crate::error::CatalogError;
use crate::filter::{parse_labels, FilterRequest};
use crate::record::{DetectionResult, RecordView};
use anyhow::{Context, Result};
use axum::{
    extract::{
        multipart::MultipartError,
        multipart::MultipartRejection,
        rejection::{FormRejection, QueryRejection},
        DefaultBodyLimit, FromRequestParts, Multipart, Path, Query, State,
    },
    http::{header::AUTHORIZATION, request::Parts, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Form, Json, Router,
};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument, warn};

/// Multipart framing allowance on top of the image size limit
const MULTIPART_OVERHEAD_BYTES: usize = 64 * 1024;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub catalog: Arc<Catalog>,
    pub auth: Arc<JwtVerifier>,
}

/// Verifies HS256 bearer tokens and extracts the caller identity
pub struct JwtVerifier {
    key: DecodingKey,
    validation: Validation,
    identity_claim: String,
}

impl JwtVerifier {
    pub fn new(secret: &str, identity_claim: impl Into<String>) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        // `exp` is checked when present but not required; `aud` is not checked.
        validation.required_spec_claims = HashSet::new();
        validation.validate_aud = false;

        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
            identity_claim: identity_claim.into(),
        }
    }

    pub fn from_config(config: &AuthConfig) -> Self {
        Self::new(&config.jwt_secret, config.identity_claim.clone())
    }

    /// Identity named by a token; an absent or blank claim is rejected
    pub fn verify(&self, token: &str) -> Result<String, ApiError> {
        let data = decode::<HashMap<String, serde_json::Value>>(token, &self.key, &self.validation)
            .map_err(|e| {
                warn!(error = %e, "Rejected bearer token");
                ApiError::Unauthorized("invalid token".to_string())
            })?;

        data.claims
            .get(&self.identity_claim)
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|identity| !identity.is_empty())
            .map(str::to_string)
            .ok_or_else(|| ApiError::Unauthorized(format!("{} should be filled", self.identity_claim)))
    }
}

/// Verified caller identity taken from the `Authorization: Bearer` header
#[derive(Debug, Clone)]
pub struct CallerIdentity(pub String);

#[axum::async_trait]
impl FromRequestParts<AppState> for CallerIdentity {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| ApiError::Unauthorized("missing bearer token".to_string()))?;

        let token = header
            .strip_prefix("Bearer ")
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ApiError::Unauthorized("missing bearer token".to_string()))?;

        state.auth.verify(token).map(CallerIdentity)
    }
}

/// Error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

/// Failures of an HTTP request
#[derive(Debug)]
pub enum ApiError {
    Catalog(CatalogError),
    BadRequest(String),
    PayloadTooLarge(String),
    Unauthorized(String),
}

impl From<CatalogError> for ApiError {
    fn from(e: CatalogError) -> Self {
        Self::Catalog(e)
    }
}

impl From<QueryRejection> for ApiError {
    fn from(e: QueryRejection) -> Self {
        Self::BadRequest(e.body_text())
    }
}

impl From<FormRejection> for ApiError {
    fn from(e: FormRejection) -> Self {
        Self::BadRequest(e.body_text())
    }
}

impl From<MultipartRejection> for ApiError {
    fn from(e: MultipartRejection) -> Self {
        Self::BadRequest(e.body_text())
    }
}

impl From<MultipartError> for ApiError {
    fn from(e: MultipartError) -> Self {
        if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
            Self::PayloadTooLarge(e.body_text())
        } else {
            Self::BadRequest(e.body_text())
        }
    }
}

impl ApiError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            Self::BadRequest(_) => (StatusCode::BAD_REQUEST, "INVALID_INPUT"),
            Self::PayloadTooLarge(_) => (StatusCode::PAYLOAD_TOO_LARGE, "PAYLOAD_TOO_LARGE"),
            Self::Unauthorized(_) => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED"),
            Self::Catalog(e) => match e {
                CatalogError::Validation(_) => (StatusCode::BAD_REQUEST, "INVALID_INPUT"),
                CatalogError::NotFound { .. } => (StatusCode::NOT_FOUND, "NOT_FOUND"),
                CatalogError::InvalidCursor { .. } => (StatusCode::BAD_REQUEST, "INVALID_CURSOR"),
                CatalogError::Store { .. } => (StatusCode::SERVICE_UNAVAILABLE, "STORE_UNAVAILABLE"),
                CatalogError::Blob { .. } => (StatusCode::BAD_GATEWAY, "BLOB_ERROR"),
                CatalogError::Signing { .. } => (StatusCode::BAD_GATEWAY, "SIGNING_ERROR"),
                CatalogError::Timeout { .. } => (StatusCode::GATEWAY_TIMEOUT, "TIMEOUT"),
                CatalogError::Internal { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
            },
        }
    }

    /// Message safe to show a client. Collaborator failures are only logged.
    fn public_message(&self) -> String {
        match self {
            Self::BadRequest(m) | Self::PayloadTooLarge(m) | Self::Unauthorized(m) => m.clone(),
            Self::Catalog(e @ (CatalogError::Validation(_)
            | CatalogError::NotFound { .. }
            | CatalogError::InvalidCursor { .. })) => e.to_string(),
            Self::Catalog(CatalogError::Store { .. }) => "record store unavailable".to_string(),
            Self::Catalog(CatalogError::Blob { .. }) => "failed to store image".to_string(),
            Self::Catalog(CatalogError::Signing { .. }) => "failed to sign image URL".to_string(),
            Self::Catalog(CatalogError::Timeout { .. }) => "upstream call timed out".to_string(),
            Self::Catalog(CatalogError::Internal { .. }) => "internal error".to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        if status.is_server_error() {
            error!(error = ?self, code, "Request failed");
        }

        (
            status,
            Json(ErrorResponse {
                error: self.public_message(),
                code: code.to_string(),
            }),
        )
            .into_response()
    }
}

/// Query parameters of the listing route
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchParams {
    /// Inclusive lower bound on creation time (epoch ms), 0 means unset
    pub start_date: Option<i64>,
    /// Inclusive upper bound on creation time (epoch ms), 0 means unset
    pub end_date: Option<i64>,
    /// Comma-separated labels
    pub labels: Option<String>,
    /// Id of the last record of the previous page
    pub after: Option<String>,
    pub per_page: Option<usize>,
    /// `asc` or `desc` (default)
    pub order: Option<String>,
}

impl FetchParams {
    fn into_filter(self, owner_identity: String) -> Result<FilterRequest, ApiError> {
        let ascending = match self.order.as_deref().map(str::trim) {
            None | Some("") => false,
            Some(o) if o.eq_ignore_ascii_case("desc") => false,
            Some(o) if o.eq_ignore_ascii_case("asc") => true,
            Some(o) => return Err(ApiError::BadRequest(format!("unknown order {:?}", o))),
        };

        Ok(FilterRequest {
            owner_identity,
            start_date: self.start_date.filter(|d| *d != 0),
            end_date: self.end_date.filter(|d| *d != 0),
            labels: self.labels.as_deref().map(parse_labels).unwrap_or_default(),
            cursor: self.after,
            page_size: self.per_page,
            ascending,
        })
    }
}

/// Listing response
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchResponse {
    pub records: Vec<RecordView>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

/// Form fields posted by the inference process
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateForm {
    /// Record id
    #[serde(default)]
    pub filename: String,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub inference_time: f64,
    /// Epoch milliseconds; float-formatted values are accepted
    #[serde(default)]
    pub detected_at: f64,
    #[serde(default)]
    pub confidence: f64,
}

impl UpdateForm {
    fn into_parts(self) -> Result<(String, DetectionResult), ApiError> {
        if !self.detected_at.is_finite() {
            return Err(ApiError::BadRequest("detectedAt must be a number".to_string()));
        }

        Ok((
            self.filename,
            DetectionResult {
                label: self.label,
                inference_time_ms: self.inference_time,
                // Saturating; out-of-range and non-positive values fail validation.
                detected_at: self.detected_at.trunc() as i64,
                confidence: self.confidence,
            },
        ))
    }
}

/// Create the API router
pub fn create_router(state: AppState, config: &ApiConfig) -> Router {
    let cors = if config.cors_enabled {
        if config.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<_> = config
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    } else {
        CorsLayer::new()
    };

    let body_limit = state.catalog.settings().max_upload_bytes + MULTIPART_OVERHEAD_BYTES;

    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route(
            "/image-detections/create",
            post(upload_image).layer(DefaultBodyLimit::max(body_limit)),
        )
        .route("/image-detections/fetch", get(fetch_records))
        .route("/image-detections/fetch/:id", get(fetch_record))
        .route("/image-detections/update", put(update_result))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "catalog-service"
    }))
}

/// Readiness check endpoint
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.catalog.ready().await {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ready",
                "store": "connected"
            })),
        ),
        Err(e) => {
            warn!(error = %e, "Readiness check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({
                    "status": "not_ready",
                    "store": "disconnected"
                })),
            )
        }
    }
}

/// Accept a JPEG in the multipart field `image`
#[instrument(skip_all, fields(owner = %identity.0))]
async fn upload_image(
    State(state): State<AppState>,
    identity: CallerIdentity,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<(StatusCode, Json<RecordView>), ApiError> {
    let mut multipart = multipart?;

    let mut image = None;
    while let Some(field) = multipart.next_field().await? {
        if field.name() == Some("image") {
            let content_type = field.content_type().map(str::to_string);
            let bytes = field.bytes().await?;
            image = Some((content_type, bytes.to_vec()));
            break;
        }
    }

    let (content_type, image) =
        image.ok_or_else(|| ApiError::BadRequest("multipart field `image` is required".to_string()))?;
    let size = image.len();

    let view = state
        .catalog
        .upload(Upload {
            owner_identity: identity.0,
            content_type,
            image,
        })
        .await?;

    info!(record_id = %view.record.id, size_bytes = size, "Image accepted");

    Ok((StatusCode::ACCEPTED, Json(view)))
}

/// List the caller's records
#[instrument(skip_all, fields(owner = %identity.0))]
async fn fetch_records(
    State(state): State<AppState>,
    identity: CallerIdentity,
    params: Result<Query<FetchParams>, QueryRejection>,
) -> Result<Json<FetchResponse>, ApiError> {
    let Query(params) = params?;
    let filter = params.into_filter(identity.0)?;

    let page = state.catalog.query(filter).await?;

    Ok(Json(FetchResponse {
        records: page.items,
        next_cursor: page.next_cursor,
    }))
}

/// Fetch one of the caller's records
#[instrument(skip_all, fields(owner = %identity.0))]
async fn fetch_record(
    State(state): State<AppState>,
    identity: CallerIdentity,
    Path(id): Path<String>,
) -> Result<Json<RecordView>, ApiError> {
    let view = state.catalog.get_one(&identity.0, &id).await?;
    Ok(Json(view))
}

/// Apply an inference result
#[instrument(skip_all)]
async fn update_result(
    State(state): State<AppState>,
    form: Result<Form<UpdateForm>, FormRejection>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let Form(form) = form?;
    let (filename, result) = form.into_parts()?;

    state.catalog.update_result(&filename, result).await?;

    Ok(Json(serde_json::json!({
        "status": "updated",
        "id": filename.trim()
    })))
}

/// Serve the API until `shutdown` is cancelled
pub async fn start_api_server(state: AppState, config: &ApiConfig, shutdown: CancellationToken) -> Result<()> {
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting catalog API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("API server error")?;

    Ok(())
}
