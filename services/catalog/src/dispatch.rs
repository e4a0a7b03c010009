//! Announces freshly stored images to the inference service.

use crate::config::KafkaConfig;
use crate::ports::{InferenceDispatcher, InferenceRequest};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use std::time::Duration;
use tracing::{debug, info, instrument};

/// Value of the `message-type` header on dispatched requests
pub const MESSAGE_TYPE: &str = "image.pending";

/// Publishes [`InferenceRequest`]s as JSON, keyed by record id
pub struct KafkaDispatcher {
    producer: FutureProducer,
    topic: String,
    timeout: Duration,
}

impl KafkaDispatcher {
    pub fn new(config: &KafkaConfig) -> Result<Self> {
        let mut client_config = config.client_config();
        client_config
            .set("acks", "all")
            .set("message.timeout.ms", config.message_timeout_ms.to_string());

        let producer: FutureProducer = client_config
            .create()
            .context("Failed to create Kafka producer")?;

        info!(topic = %config.dispatch_topic, "Inference dispatcher ready");

        Ok(Self {
            producer,
            topic: config.dispatch_topic.clone(),
            timeout: Duration::from_millis(u64::from(config.message_timeout_ms)),
        })
    }
}

/// Serialized payload of a dispatch message
pub fn encode_request(request: &InferenceRequest) -> Result<Vec<u8>> {
    serde_json::to_vec(request).context("Failed to serialize inference request")
}

#[async_trait]
impl InferenceDispatcher for KafkaDispatcher {
    #[instrument(skip(self, request), fields(record_id = %request.id, topic = %self.topic))]
    async fn publish(&self, request: &InferenceRequest) -> Result<()> {
        let payload = encode_request(request)?;
        let key = request.id.to_string();

        let record = FutureRecord::to(&self.topic)
            .payload(&payload)
            .key(&key)
            .headers(OwnedHeaders::new().insert(Header {
                key: "message-type",
                value: Some(MESSAGE_TYPE),
            }));

        let (partition, offset) = self
            .producer
            .send(record, Timeout::After(self.timeout))
            .await
            .map_err(|(e, _)| anyhow!("Failed to send to topic {}: {}", self.topic, e))?;

        debug!(partition, offset, "Inference request delivered");
        Ok(())
    }
}
