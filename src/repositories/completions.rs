use async_trait::async_trait;
use sqlx::PgPool;

use crate::db::models::CompletionRecord;
use crate::db::types::{Category, WorkflowKind};
use crate::services::ports::{CompletionStore, StoreError};

pub(crate) const COLUMNS: &str = "\
    id, subject_id, workflow, level, language, payload, score, criterion_scores, provenance, \
    completed_at";

const UNIQUE_VIOLATION: &str = "23505";

#[derive(Clone)]
pub(crate) struct PgCompletionStore {
    pool: PgPool,
}

impl PgCompletionStore {
    pub(crate) fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CompletionStore for PgCompletionStore {
    async fn find_latest(
        &self,
        subject_id: &str,
        workflow: WorkflowKind,
        category: &Category,
    ) -> Result<Option<CompletionRecord>, StoreError> {
        let record = sqlx::query_as::<_, CompletionRecord>(&format!(
            "SELECT {COLUMNS} FROM completion_records
             WHERE subject_id = $1 AND workflow = $2 AND level = $3 AND language = $4
             ORDER BY completed_at DESC
             LIMIT 1"
        ))
        .bind(subject_id)
        .bind(workflow)
        .bind(category.level)
        .bind(&category.language)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn find_any(
        &self,
        subject_id: &str,
        workflow: WorkflowKind,
    ) -> Result<Option<CompletionRecord>, StoreError> {
        let record = sqlx::query_as::<_, CompletionRecord>(&format!(
            "SELECT {COLUMNS} FROM completion_records
             WHERE subject_id = $1 AND workflow = $2
             ORDER BY completed_at DESC
             LIMIT 1"
        ))
        .bind(subject_id)
        .bind(workflow)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn insert(&self, record: &CompletionRecord) -> Result<(), StoreError> {
        let result = sqlx::query(
            "INSERT INTO completion_records (
                id, subject_id, workflow, level, language, payload, score, criterion_scores,
                provenance, completed_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
        )
        .bind(&record.id)
        .bind(&record.subject_id)
        .bind(record.workflow)
        .bind(record.level)
        .bind(&record.language)
        .bind(&record.payload)
        .bind(record.score)
        .bind(&record.criterion_scores)
        .bind(record.provenance)
        .bind(record.completed_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(err)) if err.code().as_deref() == Some(UNIQUE_VIOLATION) => {
                Err(StoreError::Conflict)
            }
            Err(err) => Err(StoreError::Database(err)),
        }
    }

    async fn list_for_subject(
        &self,
        subject_id: &str,
        limit: i64,
    ) -> Result<Vec<CompletionRecord>, StoreError> {
        let records = sqlx::query_as::<_, CompletionRecord>(&format!(
            "SELECT {COLUMNS} FROM completion_records
             WHERE subject_id = $1
             ORDER BY completed_at DESC
             LIMIT $2"
        ))
        .bind(subject_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }
}
