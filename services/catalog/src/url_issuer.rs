use crate::error::{with_deadline, CatalogError, CatalogResult};
use crate::ports::UrlSigner;
use crate::record::{Record, RecordView};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

/// Default lifetime of issued download links (7 days)
pub const DEFAULT_SIGNED_URL_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// A freshly signed download link
#[derive(Debug, Clone, PartialEq)]
pub struct SignedUrl {
    pub url: String,
    pub object_key: String,
    /// Epoch milliseconds
    pub expires_at: i64,
}

/// Derives object keys from record ids and signs download links for them.
///
/// Stateless: every call signs again, so two links for the same record may
/// differ while pointing at the same object.
#[derive(Clone)]
pub struct UrlIssuer {
    signer: Arc<dyn UrlSigner>,
    object_prefix: String,
    ttl: Duration,
    call_timeout: Duration,
}

impl UrlIssuer {
    pub fn new(
        signer: Arc<dyn UrlSigner>,
        object_prefix: impl Into<String>,
        ttl: Duration,
        call_timeout: Duration,
    ) -> Self {
        Self {
            signer,
            object_prefix: object_prefix.into().trim_matches('/').to_string(),
            ttl,
            call_timeout,
        }
    }

    /// Blob store key for a record: `{prefix}/{id}`
    pub fn object_key(&self, id: Uuid) -> String {
        if self.object_prefix.is_empty() {
            id.to_string()
        } else {
            format!("{}/{}", self.object_prefix, id)
        }
    }

    pub async fn issue(&self, id: Uuid) -> CatalogResult<SignedUrl> {
        let object_key = self.object_key(id);
        let issued_at = Utc::now().timestamp_millis();

        let url = with_deadline("url.sign", self.call_timeout, async {
            self.signer
                .sign(&object_key, self.ttl)
                .await
                .map_err(|e| CatalogError::signing(object_key.clone(), e.context(format!("record {}", id))))
        })
        .await?;

        debug!(object_key = %object_key, "Signed download URL");

        Ok(SignedUrl {
            url,
            object_key,
            expires_at: issued_at.saturating_add(i64::try_from(self.ttl.as_millis()).unwrap_or(i64::MAX)),
        })
    }

    /// Attach a freshly signed link to a record
    pub async fn view(&self, record: Record) -> CatalogResult<RecordView> {
        let signed = self.issue(record.id).await?;
        Ok(RecordView {
            record,
            file_url: signed.url,
            file_url_expires_at: signed.expires_at,
        })
    }
}
