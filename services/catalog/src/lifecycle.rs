//! Record lifecycle: creation in the pending state and the one-way
//! transition to detected.

use crate::error::{with_deadline, CatalogError, CatalogResult};
use crate::ports::{BlobStore, InferenceDispatcher, InferenceRequest, PerceptualHasher, RecordStore};
use crate::record::{DetectionResult, Record, RecordView};
use crate::url_issuer::UrlIssuer;
use chrono::Utc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Content type recorded for every stored image
pub const IMAGE_CONTENT_TYPE: &str = "image/jpeg";

type TimeSource = Box<dyn Fn() -> i64 + Send + Sync>;

/// Millisecond clock whose readings strictly increase across calls.
///
/// If the wall clock stalls or steps backwards, readings continue from the
/// last value plus one.
pub struct MonotonicClock {
    source: TimeSource,
    last: AtomicI64,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self::with_source(Box::new(|| Utc::now().timestamp_millis()))
    }

    pub fn with_source(source: TimeSource) -> Self {
        Self {
            source,
            last: AtomicI64::new(i64::MIN),
        }
    }

    pub fn now_millis(&self) -> i64 {
        let wall = (self.source)();
        let previous = self
            .last
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(wall.max(last.saturating_add(1)))
            })
            .unwrap_or(i64::MIN);
        wall.max(previous.saturating_add(1))
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Creates records and applies detection results
pub struct LifecycleManager {
    store: Arc<dyn RecordStore>,
    blobs: Arc<dyn BlobStore>,
    hasher: Arc<dyn PerceptualHasher>,
    dispatcher: Option<Arc<dyn InferenceDispatcher>>,
    urls: UrlIssuer,
    clock: MonotonicClock,
    call_timeout: Duration,
}

impl LifecycleManager {
    pub fn new(
        store: Arc<dyn RecordStore>,
        blobs: Arc<dyn BlobStore>,
        hasher: Arc<dyn PerceptualHasher>,
        urls: UrlIssuer,
        call_timeout: Duration,
    ) -> Self {
        Self {
            store,
            blobs,
            hasher,
            dispatcher: None,
            urls,
            clock: MonotonicClock::new(),
            call_timeout,
        }
    }

    pub fn with_dispatcher(mut self, dispatcher: Arc<dyn InferenceDispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub fn with_clock(mut self, clock: MonotonicClock) -> Self {
        self.clock = clock;
        self
    }

    /// Store the image, then persist a pending record pointing at it.
    ///
    /// The blob write always precedes the record write, so a record never
    /// references a missing object. If the record write fails after the blob
    /// write succeeded the object is left behind and logged as orphaned.
    #[instrument(skip(self, image), fields(owner = %owner_identity, size_bytes = image.len()))]
    pub async fn create(&self, owner_identity: &str, image: Vec<u8>) -> CatalogResult<RecordView> {
        let owner = owner_identity.trim();
        if owner.is_empty() {
            return Err(CatalogError::validation("email should be filled"));
        }
        if image.is_empty() {
            return Err(CatalogError::validation("image must not be empty"));
        }

        let started = Instant::now();
        let size_bytes = image.len();
        let (image, perceptual_hash) = self.perceptual_hash(image).await?;

        let id = Uuid::new_v4();
        let object_key = self.urls.object_key(id);

        with_deadline("blob.put", self.call_timeout, async {
            self.blobs
                .put(&object_key, image, IMAGE_CONTENT_TYPE)
                .await
                .map_err(|e| CatalogError::blob("create", e.context(format!("object {}", object_key))))
        })
        .await?;

        debug!(record_id = %id, object_key = %object_key, "Image stored");

        let record = Record::pending(id, owner.to_string(), self.clock.now_millis(), perceptual_hash);

        let inserted = with_deadline("record.insert", self.call_timeout, async {
            self.store
                .insert(&record)
                .await
                .map_err(|e| CatalogError::store("create", e.context(format!("record {}", id))))
        })
        .await;

        if let Err(e) = inserted {
            warn!(
                record_id = %id,
                object_key = %object_key,
                error = %e,
                "Record write failed after blob write; object is orphaned"
            );
            metrics::counter!("catalog.blobs.orphaned").increment(1);
            return Err(e);
        }

        metrics::counter!("catalog.records.created").increment(1);
        metrics::counter!("catalog.upload.bytes").increment(size_bytes as u64);
        metrics::histogram!("catalog.upload.duration_seconds").record(started.elapsed().as_secs_f64());

        info!(record_id = %id, object_key = %object_key, created_at = record.created_at, "Record created");

        self.dispatch(&record, object_key).await;

        self.urls.view(record).await
    }

    /// Overwrite the detection fields of `id` and mark it detected.
    ///
    /// Repeating the same result leaves the record unchanged; a later result
    /// replaces an earlier one field by field. The detected flag never reverts.
    #[instrument(skip(self, result), fields(record_id = %id, label = %result.label))]
    pub async fn apply_result(&self, id: Uuid, result: &DetectionResult) -> CatalogResult<()> {
        result.validate()?;

        let updated = with_deadline("record.apply_result", self.call_timeout, async {
            self.store
                .apply_result(id, result)
                .await
                .map_err(|e| CatalogError::store("apply_result", e.context(format!("record {}", id))))
        })
        .await?;

        if !updated {
            return Err(CatalogError::not_found(id));
        }

        metrics::counter!("catalog.results.applied").increment(1);
        info!(record_id = %id, confidence = result.confidence, "Detection result applied");

        Ok(())
    }

    /// Hash on the blocking pool, handing the image bytes back afterwards
    async fn perceptual_hash(&self, image: Vec<u8>) -> CatalogResult<(Vec<u8>, String)> {
        let hasher = self.hasher.clone();
        let (image, hash) = tokio::task::spawn_blocking(move || {
            let hash = hasher.hash(&image);
            (image, hash)
        })
        .await
        .map_err(|e| CatalogError::internal("perceptual_hash", e.to_string()))?;

        let hash = hash.map_err(|e| {
            CatalogError::validation(format!("image could not be decoded: {:#}", e))
        })?;
        Ok((image, hash))
    }

    /// Notify the inference pipeline. Failures are logged, never returned.
    async fn dispatch(&self, record: &Record, object_key: String) {
        let Some(dispatcher) = &self.dispatcher else {
            return;
        };

        let request = InferenceRequest {
            id: record.id,
            object_key,
            owner_identity: record.owner_identity.clone(),
            created_at: record.created_at,
        };

        match tokio::time::timeout(self.call_timeout, dispatcher.publish(&request)).await {
            Ok(Ok(())) => debug!(record_id = %record.id, "Record dispatched for inference"),
            Ok(Err(e)) => {
                warn!(record_id = %record.id, error = %format!("{:#}", e), "Failed to dispatch record for inference");
                metrics::counter!("catalog.dispatch.failed").increment(1);
            }
            Err(_) => {
                warn!(record_id = %record.id, after = ?self.call_timeout, "Dispatch timed out");
                metrics::counter!("catalog.dispatch.failed").increment(1);
            }
        }
    }
}
