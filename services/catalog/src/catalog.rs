//! Catalog facade: the four operations offered to transports.
//!
//! Performs argument validation only; everything else is delegated to the
//! lifecycle manager and the query engine.

use crate::error::{with_deadline, CatalogError, CatalogResult};
use crate::filter::{FilterCompiler, FilterRequest, DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE};
use crate::lifecycle::{LifecycleManager, MonotonicClock};
use crate::ports::{BlobStore, InferenceDispatcher, PerceptualHasher, RecordStore, UrlSigner};
use crate::query_engine::{Page, QueryEngine};
use crate::record::{DetectionResult, RecordView};
use crate::url_issuer::{UrlIssuer, DEFAULT_SIGNED_URL_TTL};
use std::sync::Arc;
use std::time::Duration;
use tracing::instrument;
use uuid::Uuid;

/// Content types accepted for uploads
pub const ACCEPTED_CONTENT_TYPES: &[&str] = &["image/jpeg", "image/jpg"];

/// Default upload size limit (20 MiB)
pub const DEFAULT_MAX_UPLOAD_BYTES: usize = 20 * 1024 * 1024;

/// Tunables of the catalog core
#[derive(Debug, Clone)]
pub struct CatalogSettings {
    /// Blob key prefix, records are stored at `{object_prefix}/{id}`
    pub object_prefix: String,
    pub signed_url_ttl: Duration,
    pub default_page_size: usize,
    pub max_page_size: usize,
    /// Deadline applied to every collaborator call
    pub call_timeout: Duration,
    pub max_upload_bytes: usize,
}

impl Default for CatalogSettings {
    fn default() -> Self {
        Self {
            object_prefix: "images".to_string(),
            signed_url_ttl: DEFAULT_SIGNED_URL_TTL,
            default_page_size: DEFAULT_PAGE_SIZE,
            max_page_size: MAX_PAGE_SIZE,
            call_timeout: Duration::from_secs(10),
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
        }
    }
}

/// External services the catalog is built on
#[derive(Clone)]
pub struct Collaborators {
    pub store: Arc<dyn RecordStore>,
    pub blobs: Arc<dyn BlobStore>,
    pub signer: Arc<dyn UrlSigner>,
    pub hasher: Arc<dyn PerceptualHasher>,
    pub dispatcher: Option<Arc<dyn InferenceDispatcher>>,
}

/// An image upload as received from a transport
#[derive(Debug, Clone)]
pub struct Upload {
    pub owner_identity: String,
    /// Declared content type of the image part
    pub content_type: Option<String>,
    pub image: Vec<u8>,
}

pub struct Catalog {
    store: Arc<dyn RecordStore>,
    lifecycle: LifecycleManager,
    queries: QueryEngine,
    settings: CatalogSettings,
}

impl Catalog {
    pub fn new(collaborators: Collaborators, settings: CatalogSettings) -> Self {
        Self::with_clock(collaborators, settings, MonotonicClock::new())
    }

    pub fn with_clock(collaborators: Collaborators, settings: CatalogSettings, clock: MonotonicClock) -> Self {
        let urls = UrlIssuer::new(
            collaborators.signer.clone(),
            settings.object_prefix.clone(),
            settings.signed_url_ttl,
            settings.call_timeout,
        );

        let mut lifecycle = LifecycleManager::new(
            collaborators.store.clone(),
            collaborators.blobs.clone(),
            collaborators.hasher.clone(),
            urls.clone(),
            settings.call_timeout,
        )
        .with_clock(clock);
        if let Some(dispatcher) = collaborators.dispatcher.clone() {
            lifecycle = lifecycle.with_dispatcher(dispatcher);
        }

        let compiler = FilterCompiler::new(
            collaborators.store.clone(),
            settings.default_page_size,
            settings.max_page_size,
            settings.call_timeout,
        );
        let queries = QueryEngine::new(collaborators.store.clone(), compiler, urls, settings.call_timeout);

        Self {
            store: collaborators.store,
            lifecycle,
            queries,
            settings,
        }
    }

    pub fn settings(&self) -> &CatalogSettings {
        &self.settings
    }

    /// Store a JPEG image and create its pending record
    #[instrument(skip(self, upload), fields(owner = %upload.owner_identity))]
    pub async fn upload(&self, upload: Upload) -> CatalogResult<RecordView> {
        if upload.owner_identity.trim().is_empty() {
            return Err(CatalogError::validation("email should be filled"));
        }
        validate_content_type(upload.content_type.as_deref())?;
        if upload.image.is_empty() {
            return Err(CatalogError::validation("image must not be empty"));
        }
        if upload.image.len() > self.settings.max_upload_bytes {
            return Err(CatalogError::validation(format!(
                "image of {} bytes exceeds the limit of {} bytes",
                upload.image.len(),
                self.settings.max_upload_bytes
            )));
        }

        self.lifecycle.create(&upload.owner_identity, upload.image).await
    }

    /// List the caller's records, newest first unless asked otherwise
    pub async fn query(&self, filter: FilterRequest) -> CatalogResult<Page> {
        self.queries.list(&filter).await
    }

    /// Apply an inference result to the record named by `id`
    #[instrument(skip(self, result))]
    pub async fn update_result(&self, id: &str, result: DetectionResult) -> CatalogResult<()> {
        let id = id.trim();
        if id.is_empty() {
            return Err(CatalogError::validation("filename should be filled"));
        }
        result.validate()?;
        let Ok(uuid) = Uuid::parse_str(id) else {
            return Err(CatalogError::not_found(id));
        };

        self.lifecycle.apply_result(uuid, &result).await
    }

    /// Fetch one of the caller's records
    pub async fn get_one(&self, owner_identity: &str, id: &str) -> CatalogResult<RecordView> {
        if owner_identity.trim().is_empty() {
            return Err(CatalogError::validation("email should be filled"));
        }
        self.queries.get(owner_identity, id).await
    }

    /// Readiness of the document store
    pub async fn ready(&self) -> CatalogResult<()> {
        with_deadline("record.ping", self.settings.call_timeout, async {
            self.store
                .ping()
                .await
                .map_err(|e| CatalogError::store("ping", e))
        })
        .await
    }
}

/// Accept only JPEG uploads; parameters such as `; charset=` are ignored
pub fn validate_content_type(content_type: Option<&str>) -> CatalogResult<()> {
    let essence = content_type
        .and_then(|ct| ct.split(';').next())
        .map(|ct| ct.trim().to_ascii_lowercase());

    match essence {
        Some(ct) if ACCEPTED_CONTENT_TYPES.contains(&ct.as_str()) => Ok(()),
        _ => Err(CatalogError::validation(
            "Content-Type must be image/jpg or image/jpeg",
        )),
    }
}
