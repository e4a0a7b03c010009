//! In-memory collaborators.
//!
//! Used for local runs without cloud dependencies and as fakes in tests.
//! Every implementation supports failure injection and simulated latency.
//! Records are held as JSON documents and decoded through [`RecordDocument`],
//! the same boundary the persistent stores go through.

use crate::filter::PageRequest;
use crate::ports::{BlobStore, InferenceDispatcher, InferenceRequest, RecordStore, UrlSigner};
use crate::record::{DetectionResult, Record, RecordDocument};
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Failure and latency switches shared by the in-memory collaborators
#[derive(Debug, Default)]
struct Faults {
    failing: Mutex<HashSet<&'static str>>,
    latency: Mutex<Option<Duration>>,
}

impl Faults {
    async fn enter(&self, operation: &'static str) -> Result<()> {
        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if self.failing.lock().contains(operation) {
            bail!("injected failure in {}", operation);
        }
        Ok(())
    }

    fn fail(&self, operation: &'static str) {
        self.failing.lock().insert(operation);
    }

    fn heal(&self) {
        self.failing.lock().clear();
    }

    fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock() = latency;
    }
}

/// Document store keeping one JSON document per record
#[derive(Debug, Clone, Default)]
pub struct MemoryRecordStore {
    documents: Arc<RwLock<HashMap<Uuid, serde_json::Value>>>,
    faults: Arc<Faults>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `operation` (`insert`, `get`, `apply_result`, `query`, `ping`) fail until [`Self::heal`]
    pub fn fail(&self, operation: &'static str) {
        self.faults.fail(operation);
    }

    pub fn heal(&self) {
        self.faults.heal();
    }

    pub fn set_latency(&self, latency: Option<Duration>) {
        self.faults.set_latency(latency);
    }

    pub fn len(&self) -> usize {
        self.documents.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.read().is_empty()
    }

    /// Store a raw document as-is, bypassing the typed insert path
    pub fn insert_document(&self, id: Uuid, document: serde_json::Value) {
        self.documents.write().insert(id, document);
    }

    fn decode(value: &serde_json::Value) -> Result<Record> {
        let document: RecordDocument =
            serde_json::from_value(value.clone()).context("Malformed record document")?;
        Ok(document.into_record())
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn insert(&self, record: &Record) -> Result<()> {
        self.faults.enter("insert").await?;
        let document = serde_json::to_value(RecordDocument::from(record))?;

        let mut documents = self.documents.write();
        if documents.contains_key(&record.id) {
            bail!("record {} already exists", record.id);
        }
        documents.insert(record.id, document);
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Record>> {
        self.faults.enter("get").await?;
        let documents = self.documents.read();
        documents.get(&id).map(Self::decode).transpose()
    }

    async fn apply_result(&self, id: Uuid, result: &DetectionResult) -> Result<bool> {
        self.faults.enter("apply_result").await?;

        let mut documents = self.documents.write();
        let Some(value) = documents.get_mut(&id) else {
            return Ok(false);
        };
        let mut record = Self::decode(value)?;
        record.apply(result);
        *value = serde_json::to_value(RecordDocument::from(&record))?;
        Ok(true)
    }

    async fn query(&self, request: &PageRequest) -> Result<Vec<Record>> {
        self.faults.enter("query").await?;

        let documents = self.documents.read();
        let mut matched = Vec::new();
        for value in documents.values() {
            let record = Self::decode(value)?;
            if request.matches(&record) {
                matched.push(record);
            }
        }
        drop(documents);

        matched.sort_by(|a, b| request.direction.compare(a, b));
        matched.truncate(request.limit);
        Ok(matched)
    }

    async fn ping(&self) -> Result<()> {
        self.faults.enter("ping").await
    }
}

/// Blob store keeping object bytes by key
#[derive(Debug, Clone, Default)]
pub struct MemoryBlobStore {
    objects: Arc<RwLock<HashMap<String, StoredObject>>>,
    faults: Arc<Faults>,
}

#[derive(Debug, Clone)]
pub struct StoredObject {
    pub bytes: Vec<u8>,
    pub content_type: String,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `put` fail until [`Self::heal`]
    pub fn fail(&self) {
        self.faults.fail("put");
    }

    pub fn heal(&self) {
        self.faults.heal();
    }

    pub fn set_latency(&self, latency: Option<Duration>) {
        self.faults.set_latency(latency);
    }

    pub fn object(&self, key: &str) -> Option<StoredObject> {
        self.objects.read().get(key).cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects.read().keys().cloned().collect()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<()> {
        self.faults.enter("put").await?;
        self.objects.write().insert(
            key.to_string(),
            StoredObject {
                bytes,
                content_type: content_type.to_string(),
            },
        );
        Ok(())
    }
}

/// Signer producing `memory://{bucket}/{key}?expires_in=..&nonce=..` links.
///
/// The nonce changes on every call, so repeated signing yields distinct URLs
/// for the same key, like real presigned URLs do.
#[derive(Debug, Clone)]
pub struct MemoryUrlSigner {
    bucket: String,
    nonce: Arc<AtomicU64>,
    faults: Arc<Faults>,
}

impl MemoryUrlSigner {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            nonce: Arc::new(AtomicU64::new(0)),
            faults: Arc::new(Faults::default()),
        }
    }

    /// Make `sign` fail until [`Self::heal`]
    pub fn fail(&self) {
        self.faults.fail("sign");
    }

    pub fn heal(&self) {
        self.faults.heal();
    }

    /// Object key a signed link points at
    pub fn object_key_of(&self, url: &str) -> Option<String> {
        let prefix = format!("memory://{}/", self.bucket);
        let rest = url.strip_prefix(&prefix)?;
        Some(rest.split('?').next().unwrap_or(rest).to_string())
    }
}

impl Default for MemoryUrlSigner {
    fn default() -> Self {
        Self::new("local")
    }
}

#[async_trait]
impl UrlSigner for MemoryUrlSigner {
    async fn sign(&self, key: &str, ttl: Duration) -> Result<String> {
        self.faults.enter("sign").await?;
        let nonce = self.nonce.fetch_add(1, Ordering::Relaxed);
        Ok(format!(
            "memory://{}/{}?expires_in={}&nonce={}",
            self.bucket,
            key,
            ttl.as_secs(),
            nonce
        ))
    }
}

/// Dispatcher that records every published request
#[derive(Debug, Clone, Default)]
pub struct MemoryDispatcher {
    published: Arc<Mutex<Vec<InferenceRequest>>>,
    faults: Arc<Faults>,
}

impl MemoryDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `publish` fail until [`Self::heal`]
    pub fn fail(&self) {
        self.faults.fail("publish");
    }

    pub fn heal(&self) {
        self.faults.heal();
    }

    pub fn published(&self) -> Vec<InferenceRequest> {
        self.published.lock().clone()
    }
}

#[async_trait]
impl InferenceDispatcher for MemoryDispatcher {
    async fn publish(&self, request: &InferenceRequest) -> Result<()> {
        self.faults
            .enter("publish")
            .await
            .map_err(|e| anyhow!("dispatch of {} failed: {}", request.id, e))?;
        self.published.lock().push(request.clone());
        Ok(())
    }
}
