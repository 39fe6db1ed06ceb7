use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::core::time::format_offset;
use crate::db::models::CompletionRecord;
use crate::db::types::{CefrLevel, Provenance, WorkflowKind};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct CriterionScore {
    pub(crate) name: String,
    pub(crate) score: f64,
    pub(crate) feedback: String,
}

/// Structured evaluation produced from one generation call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct GenerationResult {
    pub(crate) task: Option<String>,
    pub(crate) criterion_scores: Vec<CriterionScore>,
    pub(crate) overall_score: f64,
    pub(crate) overall_feedback: String,
    pub(crate) recommendations: Vec<String>,
    pub(crate) provenance: Provenance,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum ServedFrom {
    Upstream,
    Cache,
    InFlight,
}

#[derive(Debug, Serialize)]
pub(crate) struct GenerationResponse {
    pub(crate) level: CefrLevel,
    pub(crate) language: String,
    pub(crate) served_from: ServedFrom,
    #[serde(flatten)]
    pub(crate) result: GenerationResult,
}

#[derive(Debug, Deserialize)]
pub(crate) struct EligibilityQuery {
    pub(crate) workflow: WorkflowKind,
    pub(crate) level: String,
    pub(crate) language: String,
}

#[derive(Debug, Serialize)]
pub(crate) struct EligibilityResponse {
    pub(crate) subject_id: String,
    pub(crate) workflow: WorkflowKind,
    pub(crate) available: bool,
    pub(crate) next_available_at: Option<String>,
    pub(crate) days_remaining: Option<i64>,
    pub(crate) last_completed_at: Option<String>,
}

#[derive(Debug, Deserialize, Validate)]
pub(crate) struct SubmitResponseRequest {
    pub(crate) level: String,
    pub(crate) language: String,
    #[validate(length(min = 1, message = "response must not be empty"))]
    pub(crate) response: String,
}

#[derive(Debug, Deserialize, Validate)]
pub(crate) struct HistoryQuery {
    #[serde(default = "default_history_limit")]
    #[validate(range(min = 1, max = 100, message = "limit must be between 1 and 100"))]
    pub(crate) limit: i64,
}

fn default_history_limit() -> i64 {
    20
}

#[derive(Debug, Serialize)]
pub(crate) struct CompletionRecordResponse {
    pub(crate) id: String,
    pub(crate) subject_id: String,
    pub(crate) workflow: WorkflowKind,
    pub(crate) level: CefrLevel,
    pub(crate) language: String,
    pub(crate) payload: serde_json::Value,
    pub(crate) score: Option<f64>,
    pub(crate) criterion_scores: Vec<CriterionScore>,
    pub(crate) provenance: Option<Provenance>,
    pub(crate) completed_at: String,
}

impl From<CompletionRecord> for CompletionRecordResponse {
    fn from(record: CompletionRecord) -> Self {
        Self {
            id: record.id,
            subject_id: record.subject_id,
            workflow: record.workflow,
            level: record.level,
            language: record.language,
            payload: record.payload.0,
            score: record.score,
            criterion_scores: record.criterion_scores.0,
            provenance: record.provenance,
            completed_at: format_offset(record.completed_at),
        }
    }
}

/// Committed presentation plus any cleanup that could not be completed.
#[derive(Debug, Serialize)]
pub(crate) struct PresentationResponse {
    #[serde(flatten)]
    pub(crate) record: CompletionRecordResponse,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub(crate) warnings: Vec<String>,
}
