//! Contracts of the external collaborators the orchestration core talks to.
//!
//! Production implementations live next to this module (`text_generation`,
//! `storage`, `document_storage`, `repositories::completions`); tests swap in the
//! in-memory fakes from `test_support`.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::db::models::CompletionRecord;
use crate::db::types::{Category, WorkflowKind};
use crate::services::scratch::ScratchFile;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub(crate) enum UpstreamError {
    #[error("text generation service is rate limited")]
    RateLimited,
    #[error("text generation failed: {0}")]
    Failed(String),
    #[error("text generation timed out after {0:?}")]
    TimedOut(Duration),
}

impl UpstreamError {
    pub(crate) fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited)
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Prompt {
    pub(crate) system: String,
    pub(crate) user: String,
}

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct CompletionParams {
    pub(crate) max_tokens: Option<u32>,
    pub(crate) temperature: Option<f64>,
}

#[async_trait]
pub(crate) trait TextGenerator: Send + Sync {
    async fn complete(
        &self,
        prompt: &Prompt,
        params: CompletionParams,
    ) -> Result<String, UpstreamError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct StoredVideo {
    pub(crate) id: String,
    pub(crate) url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct StoredDocument {
    pub(crate) id: String,
    pub(crate) url: String,
    pub(crate) view_link: String,
}

/// Builds the id an upload is stored under: `{folder}/{uuid}_{filename}`.
///
/// Ids are chosen by the caller before the upload starts, so an upload that lands
/// after its timeout fired can still be deleted. Deleting an id that was never
/// stored succeeds.
pub(crate) fn object_id(folder_hint: &str, file: &ScratchFile) -> String {
    format!("{}/{}_{}", folder_hint.trim_matches('/'), Uuid::new_v4(), file.filename())
}

#[async_trait]
pub(crate) trait VideoStore: Send + Sync {
    async fn upload(&self, file: &ScratchFile, object_id: &str) -> anyhow::Result<StoredVideo>;
    async fn delete(&self, id: &str) -> anyhow::Result<()>;
}

#[async_trait]
pub(crate) trait DocumentStore: Send + Sync {
    async fn upload(&self, file: &ScratchFile, object_id: &str) -> anyhow::Result<StoredDocument>;
    async fn delete(&self, id: &str) -> anyhow::Result<()>;
}

#[derive(Debug, Error)]
pub(crate) enum StoreError {
    #[error("a record already exists for this subject")]
    Conflict,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[async_trait]
pub(crate) trait CompletionStore: Send + Sync {
    async fn find_latest(
        &self,
        subject_id: &str,
        workflow: WorkflowKind,
        category: &Category,
    ) -> Result<Option<CompletionRecord>, StoreError>;

    async fn find_any(
        &self,
        subject_id: &str,
        workflow: WorkflowKind,
    ) -> Result<Option<CompletionRecord>, StoreError>;

    async fn insert(&self, record: &CompletionRecord) -> Result<(), StoreError>;

    async fn list_for_subject(
        &self,
        subject_id: &str,
        limit: i64,
    ) -> Result<Vec<CompletionRecord>, StoreError>;
}
