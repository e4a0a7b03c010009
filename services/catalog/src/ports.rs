//! Collaborator interfaces consumed by the catalog core.
//!
//! Implementations return `anyhow::Result`; the core decides the error kind
//! at the call site. Production implementations live in `metadata_store`,
//! `s3_store`, `dispatch` and `perceptual_hash`, in-memory ones in `memory`.

use crate::filter::PageRequest;
use crate::record::{DetectionResult, Record};
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Document store holding one record per uploaded image
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Persist a new record. Fails if the id already exists.
    async fn insert(&self, record: &Record) -> Result<()>;

    /// Point lookup by primary key, regardless of owner
    async fn get(&self, id: Uuid) -> Result<Option<Record>>;

    /// Overwrite the detection fields of one record and mark it detected.
    ///
    /// Returns `false` when no record with `id` exists.
    async fn apply_result(&self, id: Uuid, result: &DetectionResult) -> Result<bool>;

    /// Execute a compiled page request, returning at most `request.limit`
    /// records in the request's sort order.
    async fn query(&self, request: &PageRequest) -> Result<Vec<Record>>;

    /// Connectivity check used by readiness probes
    async fn ping(&self) -> Result<()>;
}

/// Object storage for the raw image bytes
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<()>;
}

/// Issues time-limited download links for stored objects
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait UrlSigner: Send + Sync {
    async fn sign(&self, key: &str, ttl: Duration) -> Result<String>;
}

/// Work item sent to the inference pipeline for a newly created record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InferenceRequest {
    pub id: Uuid,
    pub object_key: String,
    pub owner_identity: String,
    pub created_at: i64,
}

/// Fire-and-forget notification channel towards the inference pipeline
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait InferenceDispatcher: Send + Sync {
    async fn publish(&self, request: &InferenceRequest) -> Result<()>;
}

/// Computes the perceptual hash stored alongside each record
#[cfg_attr(test, mockall::automock)]
pub trait PerceptualHasher: Send + Sync {
    fn hash(&self, image: &[u8]) -> Result<String>;
}
