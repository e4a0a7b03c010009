//! Filter compilation.
//!
//! Turns a client filter request into a [`PageRequest`]: the mandatory owner
//! predicate, an ordered list of optional predicates, a sort direction and a
//! row limit. Stores execute page requests; they never see client input.

use crate::error::{with_deadline, CatalogError, CatalogResult};
use crate::ports::RecordStore;
use crate::record::Record;
use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

/// Page size used when the client sends none (or zero)
pub const DEFAULT_PAGE_SIZE: usize = 20;
/// Upper bound applied to client-requested page sizes
pub const MAX_PAGE_SIZE: usize = 100;

/// Client-supplied filter for listing records
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FilterRequest {
    /// Caller identity; only this owner's records are visible
    pub owner_identity: String,
    /// Inclusive lower bound on `createdAt`, epoch milliseconds
    pub start_date: Option<i64>,
    /// Inclusive upper bound on `createdAt`, epoch milliseconds
    pub end_date: Option<i64>,
    /// Label set; empty means no label filter
    pub labels: Vec<String>,
    /// Id of the last record of the previous page
    pub cursor: Option<String>,
    /// Requested page size; zero or absent means the default
    pub page_size: Option<usize>,
    /// Oldest first instead of the default newest first
    pub ascending: bool,
}

/// Sort order over `(createdAt, id)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortDirection {
    #[default]
    Descending,
    Ascending,
}

impl SortDirection {
    /// Compare two records in this direction. Ties on `createdAt` fall back to `id`.
    pub fn compare(&self, a: &Record, b: &Record) -> Ordering {
        let natural = (a.created_at, a.id).cmp(&(b.created_at, b.id));
        match self {
            SortDirection::Ascending => natural,
            SortDirection::Descending => natural.reverse(),
        }
    }

    pub fn as_sql(&self) -> &'static str {
        match self {
            SortDirection::Ascending => "ASC",
            SortDirection::Descending => "DESC",
        }
    }
}

/// Resume point of a paginated listing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CursorPosition {
    pub created_at: i64,
    pub id: Uuid,
}

impl CursorPosition {
    pub fn of(record: &Record) -> Self {
        Self {
            created_at: record.created_at,
            id: record.id,
        }
    }

    /// Whether `record` sorts strictly after this position
    pub fn is_before(&self, record: &Record, direction: SortDirection) -> bool {
        let position = (record.created_at, record.id);
        match direction {
            SortDirection::Descending => position < (self.created_at, self.id),
            SortDirection::Ascending => position > (self.created_at, self.id),
        }
    }
}

/// Optional predicates, applied in order after the owner predicate
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    /// Inclusive range on `createdAt`; a missing bound is open
    CreatedBetween { start: Option<i64>, end: Option<i64> },
    /// `label` is one of the given values (never empty)
    LabelIn(Vec<String>),
    /// Strictly after the cursor position in the request's sort order
    After(CursorPosition),
}

impl Predicate {
    pub fn matches(&self, record: &Record, direction: SortDirection) -> bool {
        match self {
            Predicate::CreatedBetween { start, end } => {
                start.map_or(true, |s| record.created_at >= s)
                    && end.map_or(true, |e| record.created_at <= e)
            }
            Predicate::LabelIn(labels) => labels.iter().any(|l| *l == record.label),
            Predicate::After(position) => position.is_before(record, direction),
        }
    }
}

/// A compiled listing request, ready for a [`RecordStore`]
#[derive(Debug, Clone, PartialEq)]
pub struct PageRequest {
    pub owner_identity: String,
    pub predicates: Vec<Predicate>,
    pub direction: SortDirection,
    pub limit: usize,
}

impl PageRequest {
    /// Reference evaluation of the whole predicate program against one record
    pub fn matches(&self, record: &Record) -> bool {
        record.owner_identity == self.owner_identity
            && self
                .predicates
                .iter()
                .all(|p| p.matches(record, self.direction))
    }
}

/// Split a comma-separated label list, dropping blanks and duplicates
pub fn parse_labels(raw: &str) -> Vec<String> {
    normalize_labels(raw.split(','))
}

fn normalize_labels<I, S>(labels: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut out: Vec<String> = Vec::new();
    for label in labels {
        let label = label.as_ref().trim();
        if !label.is_empty() && !out.iter().any(|l| l == label) {
            out.push(label.to_string());
        }
    }
    out
}

/// Compiles [`FilterRequest`]s, resolving cursors against the record store
#[derive(Clone)]
pub struct FilterCompiler {
    store: Arc<dyn RecordStore>,
    default_page_size: usize,
    max_page_size: usize,
    call_timeout: Duration,
}

impl FilterCompiler {
    pub fn new(
        store: Arc<dyn RecordStore>,
        default_page_size: usize,
        max_page_size: usize,
        call_timeout: Duration,
    ) -> Self {
        let max_page_size = max_page_size.max(1);
        Self {
            store,
            default_page_size: default_page_size.clamp(1, max_page_size),
            max_page_size,
            call_timeout,
        }
    }

    /// Effective page size for a requested one
    pub fn page_size(&self, requested: Option<usize>) -> usize {
        match requested {
            None | Some(0) => self.default_page_size,
            Some(n) => n.min(self.max_page_size),
        }
    }

    pub async fn compile(&self, request: &FilterRequest) -> CatalogResult<PageRequest> {
        let owner = request.owner_identity.trim();
        if owner.is_empty() {
            return Err(CatalogError::validation("caller identity is required"));
        }

        let direction = if request.ascending {
            SortDirection::Ascending
        } else {
            SortDirection::Descending
        };

        let mut predicates = Vec::new();

        if let (Some(start), Some(end)) = (request.start_date, request.end_date) {
            if start > end {
                return Err(CatalogError::validation(format!(
                    "startDate {} is after endDate {}",
                    start, end
                )));
            }
        }
        if request.start_date.is_some() || request.end_date.is_some() {
            predicates.push(Predicate::CreatedBetween {
                start: request.start_date,
                end: request.end_date,
            });
        }

        let labels = normalize_labels(&request.labels);
        if !labels.is_empty() {
            predicates.push(Predicate::LabelIn(labels));
        }

        if let Some(cursor) = request.cursor.as_deref().filter(|c| !c.trim().is_empty()) {
            let position = self.resolve_cursor(owner, cursor.trim()).await?;
            predicates.push(Predicate::After(position));
        }

        let compiled = PageRequest {
            owner_identity: owner.to_string(),
            predicates,
            direction,
            limit: self.page_size(request.page_size),
        };

        debug!(owner = %compiled.owner_identity, predicates = ?compiled.predicates, limit = compiled.limit, "Compiled filter");

        Ok(compiled)
    }

    /// Look up the record a cursor names. Records of other owners do not resolve.
    async fn resolve_cursor(&self, owner: &str, cursor: &str) -> CatalogResult<CursorPosition> {
        let id = Uuid::parse_str(cursor).map_err(|_| CatalogError::invalid_cursor(cursor))?;

        let record = with_deadline("record.get", self.call_timeout, async {
            self.store
                .get(id)
                .await
                .map_err(|e| CatalogError::store("resolve_cursor", e.context(format!("cursor {}", id))))
        })
        .await?;

        match record {
            Some(r) if r.owner_identity == owner => Ok(CursorPosition::of(&r)),
            _ => Err(CatalogError::invalid_cursor(cursor)),
        }
    }
}
