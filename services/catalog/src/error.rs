use std::future::Future;
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by the catalog core.
///
/// The kind is decided where a collaborator call fails and is never changed
/// afterwards; transport layers map kinds to their own status codes.
#[derive(Debug, Error)]
pub enum CatalogError {
    /// Malformed or missing input, rejected before any I/O
    #[error("{0}")]
    Validation(String),

    /// Record does not exist or belongs to another owner
    #[error("record not found: {id}")]
    NotFound { id: String },

    /// Pagination cursor does not resolve to a visible record
    #[error("invalid cursor: {cursor}")]
    InvalidCursor { cursor: String },

    #[error("document store failure during {operation}: {source:#}")]
    Store {
        operation: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error("blob store failure during {operation}: {source:#}")]
    Blob {
        operation: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to sign URL for {object_key}: {source:#}")]
    Signing {
        object_key: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    /// Failure inside the service itself, such as an aborted worker task
    #[error("internal failure during {operation}: {message}")]
    Internal {
        operation: &'static str,
        message: String,
    },
}

impl CatalogError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn not_found(id: impl ToString) -> Self {
        Self::NotFound { id: id.to_string() }
    }

    pub fn invalid_cursor(cursor: impl Into<String>) -> Self {
        Self::InvalidCursor {
            cursor: cursor.into(),
        }
    }

    pub fn store(operation: &'static str, source: anyhow::Error) -> Self {
        Self::Store { operation, source }
    }

    pub fn blob(operation: &'static str, source: anyhow::Error) -> Self {
        Self::Blob { operation, source }
    }

    pub fn signing(object_key: impl Into<String>, source: anyhow::Error) -> Self {
        Self::Signing {
            object_key: object_key.into(),
            source,
        }
    }

    pub fn internal(operation: &'static str, message: impl Into<String>) -> Self {
        Self::Internal {
            operation,
            message: message.into(),
        }
    }

    /// Short stable name of the error kind, used as a log and metric label
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::NotFound { .. } => "not_found",
            Self::InvalidCursor { .. } => "invalid_cursor",
            Self::Store { .. } => "store",
            Self::Blob { .. } => "blob",
            Self::Signing { .. } => "signing",
            Self::Timeout { .. } => "timeout",
            Self::Internal { .. } => "internal",
        }
    }

    /// Whether repeating the same request can never succeed
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            Self::Validation(_) | Self::NotFound { .. } | Self::InvalidCursor { .. }
        )
    }
}

pub type CatalogResult<T> = Result<T, CatalogError>;

/// Bound a collaborator call by `limit`.
///
/// An elapsed deadline is reported as [`CatalogError::Timeout`]; the call is
/// treated as failed even if the collaborator later completes.
pub async fn with_deadline<T, F>(operation: &'static str, limit: Duration, fut: F) -> CatalogResult<T>
where
    F: Future<Output = CatalogResult<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(CatalogError::Timeout {
            operation,
            after: limit,
        }),
    }
}
