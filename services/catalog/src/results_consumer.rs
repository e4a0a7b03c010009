use crate::catalog::Catalog;
use crate::config::KafkaConfig;
use crate::record::DetectionResult;
use anyhow::{Context, Result};
use futures::StreamExt;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Message};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

const INITIAL_BACKOFF: Duration = Duration::from_millis(200);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Inference result as published by the inference process
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultMessage {
    /// Record id; older producers call it `filename`
    #[serde(alias = "filename")]
    pub id: String,
    pub label: String,
    #[serde(alias = "inferenceTime")]
    pub inference_time_ms: f64,
    pub detected_at: i64,
    pub confidence: f64,
}

impl ResultMessage {
    fn into_parts(self) -> (String, DetectionResult) {
        (
            self.id,
            DetectionResult {
                label: self.label,
                inference_time_ms: self.inference_time_ms,
                detected_at: self.detected_at,
                confidence: self.confidence,
            },
        )
    }
}

/// What to do with a message offset after handling it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Handled, or can never succeed
    Commit,
    /// Transient failure, handle the same message again
    Retry,
}

/// Apply one result payload through the catalog
pub async fn handle_payload(catalog: &Catalog, payload: Option<&[u8]>) -> Disposition {
    let Some(payload) = payload else {
        warn!("Result message has no payload");
        metrics::counter!("catalog.results.rejected").increment(1);
        return Disposition::Commit;
    };

    let message: ResultMessage = match serde_json::from_slice(payload) {
        Ok(message) => message,
        Err(e) => {
            warn!(error = %e, "Malformed result message");
            metrics::counter!("catalog.results.rejected").increment(1);
            return Disposition::Commit;
        }
    };

    let (id, result) = message.into_parts();
    match catalog.update_result(&id, result).await {
        Ok(()) => {
            debug!(record_id = %id, "Result applied from Kafka");
            Disposition::Commit
        }
        Err(e) if e.is_permanent() => {
            warn!(record_id = %id, error = %e, kind = e.kind(), "Dropping unappliable result");
            metrics::counter!("catalog.results.rejected").increment(1);
            Disposition::Commit
        }
        Err(e) => {
            error!(record_id = %id, error = %e, kind = e.kind(), "Failed to apply result");
            Disposition::Retry
        }
    }
}

/// Kafka consumer applying inference results to records
pub struct ResultsConsumer {
    consumer: StreamConsumer,
    catalog: Arc<Catalog>,
}

impl ResultsConsumer {
    pub fn new(config: &KafkaConfig, catalog: Arc<Catalog>) -> Result<Self> {
        let mut client_config = config.client_config();
        client_config
            .set("group.id", &config.consumer_group)
            .set("auto.offset.reset", &config.auto_offset_reset)
            .set("enable.auto.commit", "false")
            .set("session.timeout.ms", config.session_timeout_ms.to_string());

        let consumer: StreamConsumer = client_config
            .create()
            .context("Failed to create Kafka consumer")?;

        consumer
            .subscribe(&[&config.results_topic])
            .context("Failed to subscribe to results topic")?;

        info!(
            topic = %config.results_topic,
            group = %config.consumer_group,
            "Subscribed to Kafka topic"
        );

        Ok(Self { consumer, catalog })
    }

    /// Consume until `shutdown` is cancelled
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        info!("Starting results consumer");

        let mut message_stream = self.consumer.stream();

        loop {
            let next = tokio::select! {
                _ = shutdown.cancelled() => break,
                next = message_stream.next() => next,
            };

            match next {
                Some(Ok(message)) => {
                    if !self.process_message(&message, &shutdown).await {
                        break;
                    }
                }
                Some(Err(e)) => {
                    error!(error = %e, "Kafka consumer error");
                    metrics::counter!("catalog.kafka.errors").increment(1);
                }
                None => break,
            }
        }

        info!("Results consumer stopped");
        Ok(())
    }

    /// Handle one message, retrying transient failures in place so the offset
    /// never moves past an unapplied result. Returns false on shutdown.
    #[instrument(skip(self, message, shutdown), fields(partition = message.partition(), offset = message.offset()))]
    async fn process_message(&self, message: &BorrowedMessage<'_>, shutdown: &CancellationToken) -> bool {
        let mut backoff = INITIAL_BACKOFF;

        loop {
            match handle_payload(&self.catalog, message.payload()).await {
                Disposition::Commit => {
                    if let Err(e) = self.consumer.commit_message(message, CommitMode::Async) {
                        warn!(error = %e, "Failed to commit offset");
                    }
                    return true;
                }
                Disposition::Retry => {
                    metrics::counter!("catalog.results.retried").increment(1);
                    tokio::select! {
                        _ = shutdown.cancelled() => return false,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = next_backoff(backoff);
                }
            }
        }
    }
}

fn next_backoff(current: Duration) -> Duration {
    (current * 2).min(MAX_BACKOFF)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{CatalogSettings, Collaborators};
    use crate::memory::{MemoryBlobStore, MemoryRecordStore, MemoryUrlSigner};
    use crate::perceptual_hash::BlockhashHasher;
    use crate::ports::RecordStore;
    use crate::record::Record;
    use uuid::Uuid;

    fn catalog(store: &MemoryRecordStore) -> Catalog {
        Catalog::new(
            Collaborators {
                store: Arc::new(store.clone()),
                blobs: Arc::new(MemoryBlobStore::new()),
                signer: Arc::new(MemoryUrlSigner::default()),
                hasher: Arc::new(BlockhashHasher::new()),
                dispatcher: None,
            },
            CatalogSettings::default(),
        )
    }

    async fn seeded(store: &MemoryRecordStore) -> Uuid {
        let record = Record::pending(Uuid::new_v4(), "a@x.com".to_string(), 1, String::new());
        store.insert(&record).await.unwrap();
        record.id
    }

    #[test]
    fn test_message_accepts_original_field_names() {
        let message: ResultMessage = serde_json::from_str(
            r#"{"filename":"abc","label":"cat","inferenceTime":12.5,"detectedAt":99,"confidence":1}"#,
        )
        .unwrap();
        assert_eq!(message.id, "abc");
        assert_eq!(message.inference_time_ms, 12.5);
        assert_eq!(message.confidence, 1.0);
    }

    #[tokio::test]
    async fn test_applied_result_is_committed() {
        let store = MemoryRecordStore::new();
        let id = seeded(&store).await;
        let payload = serde_json::json!({
            "id": id,
            "label": "cat",
            "inferenceTimeMs": 3.0,
            "detectedAt": 10,
            "confidence": 0.8
        })
        .to_string();

        let disposition = handle_payload(&catalog(&store), Some(payload.as_bytes())).await;
        assert_eq!(disposition, Disposition::Commit);

        let record = store.get(id).await.unwrap().unwrap();
        assert!(record.is_detected);
        assert_eq!(record.label, "cat");
    }

    #[tokio::test]
    async fn test_permanent_failures_are_committed() {
        let store = MemoryRecordStore::new();
        let catalog = catalog(&store);

        assert_eq!(handle_payload(&catalog, None).await, Disposition::Commit);
        assert_eq!(handle_payload(&catalog, Some(b"{not json")).await, Disposition::Commit);

        let unknown = serde_json::json!({
            "id": Uuid::new_v4(),
            "label": "cat",
            "inferenceTimeMs": 3.0,
            "detectedAt": 10,
            "confidence": 0.8
        })
        .to_string();
        assert_eq!(handle_payload(&catalog, Some(unknown.as_bytes())).await, Disposition::Commit);
    }

    #[tokio::test]
    async fn test_store_outage_is_retried() {
        let store = MemoryRecordStore::new();
        let id = seeded(&store).await;
        store.fail("apply_result");

        let payload = serde_json::json!({
            "id": id,
            "label": "cat",
            "inferenceTimeMs": 3.0,
            "detectedAt": 10,
            "confidence": 0.8
        })
        .to_string();
        let catalog = catalog(&store);
        assert_eq!(handle_payload(&catalog, Some(payload.as_bytes())).await, Disposition::Retry);

        store.heal();
        assert_eq!(handle_payload(&catalog, Some(payload.as_bytes())).await, Disposition::Commit);
    }

    #[test]
    fn test_backoff_is_capped() {
        let mut backoff = INITIAL_BACKOFF;
        for _ in 0..20 {
            backoff = next_backoff(backoff);
        }
        assert_eq!(backoff, MAX_BACKOFF);
    }
}
