use crate::error::{with_deadline, CatalogError, CatalogResult};
use crate::filter::{FilterCompiler, FilterRequest};
use crate::ports::RecordStore;
use crate::record::RecordView;
use crate::url_issuer::UrlIssuer;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};
use uuid::Uuid;

/// One page of a listing
#[derive(Debug, Clone)]
pub struct Page {
    pub items: Vec<RecordView>,
    /// Cursor for the following page, absent on the last page
    pub next_cursor: Option<String>,
}

/// Executes compiled filters and attaches signed links to every result
pub struct QueryEngine {
    store: Arc<dyn RecordStore>,
    compiler: FilterCompiler,
    urls: UrlIssuer,
    call_timeout: Duration,
}

impl QueryEngine {
    pub fn new(
        store: Arc<dyn RecordStore>,
        compiler: FilterCompiler,
        urls: UrlIssuer,
        call_timeout: Duration,
    ) -> Self {
        Self {
            store,
            compiler,
            urls,
            call_timeout,
        }
    }

    /// Fetch one page. A signing failure fails the whole page.
    #[instrument(skip(self, filter), fields(owner = %filter.owner_identity))]
    pub async fn list(&self, filter: &FilterRequest) -> CatalogResult<Page> {
        let request = self.compiler.compile(filter).await?;
        let page_size = request.limit;

        // One extra row tells whether another page exists.
        let mut probe = request.clone();
        probe.limit = page_size + 1;

        let mut records = with_deadline("record.query", self.call_timeout, async {
            self.store
                .query(&probe)
                .await
                .map_err(|e| CatalogError::store("list", e))
        })
        .await?;

        let has_more = records.len() > page_size;
        records.truncate(page_size);

        let next_cursor = if has_more {
            records.last().map(|r| r.id.to_string())
        } else {
            None
        };

        let mut items = Vec::with_capacity(records.len());
        for record in records {
            items.push(self.urls.view(record).await?);
        }

        metrics::counter!("catalog.queries.executed").increment(1);
        debug!(returned = items.len(), has_more, "Listed records");

        Ok(Page { items, next_cursor })
    }

    /// Point lookup scoped to the owner. Records of other owners are reported
    /// exactly like missing ones.
    #[instrument(skip(self))]
    pub async fn get(&self, owner_identity: &str, id: &str) -> CatalogResult<RecordView> {
        let Ok(uuid) = Uuid::parse_str(id.trim()) else {
            return Err(CatalogError::not_found(id));
        };

        let record = with_deadline("record.get", self.call_timeout, async {
            self.store
                .get(uuid)
                .await
                .map_err(|e| CatalogError::store("get", e.context(format!("record {}", uuid))))
        })
        .await?;

        match record {
            Some(r) if r.owner_identity == owner_identity.trim() => self.urls.view(r).await,
            _ => Err(CatalogError::not_found(id)),
        }
    }
}
