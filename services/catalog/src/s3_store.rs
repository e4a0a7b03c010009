use crate::config::S3Config;
use crate::ports::{BlobStore, UrlSigner};
use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client as S3Client;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// S3 backed image storage. Also signs time-limited GET links.
#[derive(Clone)]
pub struct S3BlobStore {
    client: S3Client,
    bucket: String,
    multipart_threshold_bytes: usize,
    part_size_bytes: usize,
}

impl S3BlobStore {
    /// Create a new S3 blob store
    pub async fn new(config: &S3Config) -> Result<Self> {
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .load()
            .await;

        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

        // Configure custom endpoint for MinIO/LocalStack
        if let Some(ref endpoint_url) = config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        // Force path-style access for MinIO compatibility
        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = S3Client::from_conf(s3_config_builder.build());

        info!(
            bucket = %config.bucket,
            region = %config.region,
            "S3 blob store initialized"
        );

        Ok(Self {
            client,
            bucket: config.bucket.clone(),
            multipart_threshold_bytes: config.multipart_threshold_bytes,
            part_size_bytes: part_size(config.part_size_bytes),
        })
    }

    async fn simple_upload(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(bytes))
            .content_type(content_type)
            .send()
            .await
            .context("Failed to upload image to S3")?;

        Ok(())
    }

    async fn multipart_upload(&self, key: &str, bytes: &[u8], content_type: &str) -> Result<()> {
        let create_response = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .send()
            .await
            .context("Failed to create multipart upload")?;

        let upload_id = create_response
            .upload_id()
            .context("No upload ID in response")?
            .to_string();

        match self.upload_parts(key, &upload_id, bytes).await {
            Ok(parts) => {
                let completed_upload = CompletedMultipartUpload::builder()
                    .set_parts(Some(parts))
                    .build();

                self.client
                    .complete_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .multipart_upload(completed_upload)
                    .send()
                    .await
                    .context("Failed to complete multipart upload")?;
                Ok(())
            }
            Err(e) => {
                // Leave no dangling parts behind.
                if let Err(abort_err) = self
                    .client
                    .abort_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .send()
                    .await
                {
                    warn!(key = %key, error = %abort_err, "Failed to abort multipart upload");
                }
                Err(e)
            }
        }
    }

    async fn upload_parts(&self, key: &str, upload_id: &str, bytes: &[u8]) -> Result<Vec<CompletedPart>> {
        let mut completed_parts = Vec::new();

        for (index, chunk) in bytes.chunks(self.part_size_bytes).enumerate() {
            let part_number = i32::try_from(index + 1).context("Too many upload parts")?;

            let response = self
                .client
                .upload_part()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(ByteStream::from(chunk.to_vec()))
                .send()
                .await
                .with_context(|| format!("Failed to upload part {}", part_number))?;

            completed_parts.push(
                CompletedPart::builder()
                    .part_number(part_number)
                    .e_tag(response.e_tag().unwrap_or_default())
                    .build(),
            );
        }

        Ok(completed_parts)
    }
}

/// S3 rejects multipart parts smaller than 5MB (except the last one)
const MIN_PART_SIZE: usize = 5 * 1024 * 1024;

#[async_trait]
impl BlobStore for S3BlobStore {
    #[instrument(skip(self, bytes), fields(size_bytes = bytes.len()))]
    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<()> {
        debug!(key = %key, "Uploading image to S3");

        if uses_multipart(bytes.len(), self.multipart_threshold_bytes) {
            self.multipart_upload(key, &bytes, content_type).await?;
        } else {
            self.simple_upload(key, bytes, content_type).await?;
        }

        debug!(key = %key, "Image uploaded");
        Ok(())
    }
}

#[async_trait]
impl UrlSigner for S3BlobStore {
    async fn sign(&self, key: &str, ttl: Duration) -> Result<String> {
        let presigning_config =
            PresigningConfig::expires_in(ttl).context("Failed to create presigning config")?;

        let presigned = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(presigning_config)
            .await
            .context("Failed to generate presigned URL")?;

        Ok(presigned.uri().to_string())
    }
}

fn uses_multipart(size: usize, threshold: usize) -> bool {
    size > threshold
}

fn part_size(configured: usize) -> usize {
    configured.max(MIN_PART_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_multipart_threshold() {
        let threshold = 5 * 1024 * 1024;
        assert!(!uses_multipart(1024, threshold));
        assert!(!uses_multipart(threshold, threshold));
        assert!(uses_multipart(threshold + 1, threshold));
    }

    #[test]
    fn test_part_size_is_raised_to_s3_minimum() {
        assert_eq!(part_size(1024), MIN_PART_SIZE);
        assert_eq!(part_size(8 * 1024 * 1024), 8 * 1024 * 1024);
    }
}
