use sqlx::types::Json;
use sqlx::FromRow;
use time::OffsetDateTime;

use crate::db::types::{CefrLevel, Category, Provenance, WorkflowKind};
use crate::schemas::assessment::CriterionScore;

/// Immutable outcome of one successful submission.
#[derive(Debug, Clone, PartialEq, FromRow)]
pub(crate) struct CompletionRecord {
    pub(crate) id: String,
    pub(crate) subject_id: String,
    pub(crate) workflow: WorkflowKind,
    pub(crate) level: CefrLevel,
    pub(crate) language: String,
    pub(crate) payload: Json<serde_json::Value>,
    pub(crate) score: Option<f64>,
    pub(crate) criterion_scores: Json<Vec<CriterionScore>>,
    pub(crate) provenance: Option<Provenance>,
    pub(crate) completed_at: OffsetDateTime,
}

impl CompletionRecord {
    pub(crate) fn category(&self) -> Category {
        Category { level: self.level, language: self.language.clone() }
    }
}
