use crate::config::DatabaseConfig;
use crate::filter::{PageRequest, Predicate, SortDirection};
use crate::ports::RecordStore;
use crate::record::{DetectionResult, Record, RecordDocument};
use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::{debug, info, instrument};
use uuid::Uuid;

const RECORD_COLUMNS: &str = r#"
    SELECT id, owner_identity, created_at, label, inference_time_ms,
           detected_at, confidence, is_detected, perceptual_hash
    FROM image_records
"#;

/// Image record store in PostgreSQL
pub struct MetadataStore {
    pool: PgPool,
}

impl MetadataStore {
    /// Create a new metadata store with connection pool
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .idle_timeout(Some(Duration::from_secs(config.idle_timeout_secs)))
            .connect(&config.url)
            .await
            .context("Failed to connect to PostgreSQL")?;

        info!("Connected to PostgreSQL database");

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run migrations")?;

        info!("Database migrations completed");
        Ok(())
    }
}

/// Render the listing statement for a compiled page request.
///
/// Parameters are numbered in predicate order: `$1` is always the owner,
/// the limit comes last.
pub fn build_page_query(request: &PageRequest) -> String {
    let mut sql = String::from(RECORD_COLUMNS);
    sql.push_str(" WHERE owner_identity = $1");
    let mut param_count = 1;

    for predicate in &request.predicates {
        match predicate {
            Predicate::CreatedBetween { start, end } => {
                if start.is_some() {
                    param_count += 1;
                    sql.push_str(&format!(" AND created_at >= ${}", param_count));
                }
                if end.is_some() {
                    param_count += 1;
                    sql.push_str(&format!(" AND created_at <= ${}", param_count));
                }
            }
            Predicate::LabelIn(_) => {
                param_count += 1;
                sql.push_str(&format!(" AND label = ANY(${})", param_count));
            }
            Predicate::After(_) => {
                let op = match request.direction {
                    SortDirection::Ascending => ">",
                    SortDirection::Descending => "<",
                };
                sql.push_str(&format!(
                    " AND (created_at, id) {} (${}, ${})",
                    op,
                    param_count + 1,
                    param_count + 2
                ));
                param_count += 2;
            }
        }
    }

    let dir = request.direction.as_sql();
    sql.push_str(&format!(" ORDER BY created_at {}, id {}", dir, dir));

    param_count += 1;
    sql.push_str(&format!(" LIMIT ${}", param_count));

    sql
}

#[async_trait]
impl RecordStore for MetadataStore {
    #[instrument(skip(self, record), fields(record_id = %record.id))]
    async fn insert(&self, record: &Record) -> Result<()> {
        let document = RecordDocument::from(record);

        sqlx::query(
            r#"
            INSERT INTO image_records (
                id, owner_identity, created_at, label, inference_time_ms,
                detected_at, confidence, is_detected, perceptual_hash
            ) VALUES (
                $1, $2, $3, $4, $5,
                $6, $7, $8, $9
            )
            "#,
        )
        .bind(document.id)
        .bind(&document.owner_identity)
        .bind(document.created_at)
        .bind(&document.label)
        .bind(document.inference_time_ms)
        .bind(document.detected_at)
        .bind(document.confidence)
        .bind(document.is_detected)
        .bind(&document.perceptual_hash)
        .execute(&self.pool)
        .await
        .context("Failed to insert image record")?;

        debug!("Image record inserted");
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Record>> {
        let document = sqlx::query_as::<_, RecordDocument>(&format!("{} WHERE id = $1", RECORD_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to query image record")?;

        Ok(document.map(RecordDocument::into_record))
    }

    #[instrument(skip(self, result))]
    async fn apply_result(&self, id: Uuid, result: &DetectionResult) -> Result<bool> {
        let outcome = sqlx::query(
            r#"
            UPDATE image_records
            SET label = $2,
                inference_time_ms = $3,
                detected_at = $4,
                confidence = $5,
                is_detected = TRUE
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(result.label.trim())
        .bind(result.inference_time_ms)
        .bind(result.detected_at)
        .bind(result.confidence)
        .execute(&self.pool)
        .await
        .context("Failed to update image record")?;

        Ok(outcome.rows_affected() > 0)
    }

    #[instrument(skip(self, request), fields(owner = %request.owner_identity, limit = request.limit))]
    async fn query(&self, request: &PageRequest) -> Result<Vec<Record>> {
        let sql = build_page_query(request);

        // Bind in the same order build_page_query numbered the parameters.
        let mut query_builder = sqlx::query_as::<_, RecordDocument>(&sql).bind(&request.owner_identity);

        for predicate in &request.predicates {
            match predicate {
                Predicate::CreatedBetween { start, end } => {
                    if let Some(start) = start {
                        query_builder = query_builder.bind(*start);
                    }
                    if let Some(end) = end {
                        query_builder = query_builder.bind(*end);
                    }
                }
                Predicate::LabelIn(labels) => {
                    query_builder = query_builder.bind(labels.clone());
                }
                Predicate::After(position) => {
                    query_builder = query_builder.bind(position.created_at).bind(position.id);
                }
            }
        }

        let limit = i64::try_from(request.limit).context("Page limit out of range")?;
        let documents = query_builder
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .context("Failed to query image records")?;

        Ok(documents.into_iter().map(RecordDocument::into_record).collect())
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .context("Database is not reachable")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::CursorPosition;

    fn request(predicates: Vec<Predicate>, direction: SortDirection) -> PageRequest {
        PageRequest {
            owner_identity: "a@x.com".to_string(),
            predicates,
            direction,
            limit: 21,
        }
    }

    #[test]
    fn test_minimal_query_scopes_owner_and_orders() {
        let sql = build_page_query(&request(Vec::new(), SortDirection::Descending));
        assert!(sql.contains("WHERE owner_identity = $1"));
        assert!(sql.contains("ORDER BY created_at DESC, id DESC"));
        assert!(sql.ends_with("LIMIT $2"));
    }

    #[test]
    fn test_parameters_are_numbered_in_predicate_order() {
        let sql = build_page_query(&request(
            vec![
                Predicate::CreatedBetween {
                    start: Some(1),
                    end: Some(9),
                },
                Predicate::LabelIn(vec!["cat".into()]),
                Predicate::After(CursorPosition {
                    created_at: 5,
                    id: Uuid::nil(),
                }),
            ],
            SortDirection::Descending,
        ));

        assert!(sql.contains("created_at >= $2"));
        assert!(sql.contains("created_at <= $3"));
        assert!(sql.contains("label = ANY($4)"));
        assert!(sql.contains("(created_at, id) < ($5, $6)"));
        assert!(sql.ends_with("LIMIT $7"));
    }

    #[test]
    fn test_ascending_cursor_compares_greater() {
        let sql = build_page_query(&request(
            vec![
                Predicate::CreatedBetween {
                    start: None,
                    end: Some(9),
                },
                Predicate::After(CursorPosition {
                    created_at: 5,
                    id: Uuid::nil(),
                }),
            ],
            SortDirection::Ascending,
        ));

        assert!(sql.contains("created_at <= $2"));
        assert!(!sql.contains(">= $"));
        assert!(sql.contains("(created_at, id) > ($3, $4)"));
        assert!(sql.contains("ORDER BY created_at ASC, id ASC"));
    }
}
