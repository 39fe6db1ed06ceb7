use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use sqlx::types::Json;
use thiserror::Error;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::core::config::AssessmentSettings;
use crate::core::time::{format_offset, now_utc};
use crate::db::models::CompletionRecord;
use crate::db::types::{Category, Provenance, WorkflowKind};
use crate::services::eligibility::EligibilityTracker;
use crate::services::normalizer::{self, CRITERIA};
use crate::services::ports::{CompletionParams, CompletionStore, Prompt, TextGenerator, UpstreamError};
use crate::services::retry::RetryPolicy;

const EVALUATION_SYSTEM_PROMPT: &str = "You are an experienced language examiner. \
Evaluate the learner's written response for the stated CEFR level and language. Be fair \
and specific, and score against the expectations of that level.

Answer in plain text using exactly this layout:
Grammar: <score>/20 - <one sentence of feedback>
Vocabulary: <score>/20 - <one sentence of feedback>
Coherence: <score>/20 - <one sentence of feedback>
Task Achievement: <score>/20 - <one sentence of feedback>
Fluency: <score>/20 - <one sentence of feedback>
Overall: <percentage>%
Feedback: <two or three sentences of overall feedback>
Recommendations:
1. <recommendation>
2. <recommendation>
3. <recommendation>";

const MAX_HISTORY_LIMIT: i64 = 100;

#[derive(Debug, Clone, PartialEq, Error)]
pub(crate) enum EvaluationError {
    #[error("{0}")]
    Invalid(String),
    #[error("the next written response can be submitted at {}", format_offset(*next_available_at))]
    NotEligible { next_available_at: OffsetDateTime },
    #[error("evaluation is temporarily unavailable: {0}")]
    Upstream(#[from] UpstreamError),
    #[error("saving the evaluation failed: {0}")]
    Persist(String),
}

/// Written-response workflow: gate, evaluate, normalize, persist.
#[derive(Clone)]
pub(crate) struct EvaluationService {
    generator: Arc<dyn TextGenerator>,
    retry: RetryPolicy,
    params: CompletionParams,
    store: Arc<dyn CompletionStore>,
    eligibility: EligibilityTracker,
    max_response_chars: usize,
    persist_timeout: Duration,
}

impl EvaluationService {
    pub(crate) fn new(
        generator: Arc<dyn TextGenerator>,
        retry: RetryPolicy,
        params: CompletionParams,
        store: Arc<dyn CompletionStore>,
        eligibility: EligibilityTracker,
        settings: &AssessmentSettings,
    ) -> Self {
        Self {
            generator,
            retry,
            params,
            store,
            eligibility,
            max_response_chars: settings.max_response_chars,
            persist_timeout: settings.persist_timeout(),
        }
    }

    pub(crate) async fn submit_response(
        &self,
        subject_id: &str,
        category: &Category,
        response: &str,
    ) -> Result<CompletionRecord, EvaluationError> {
        let response = response.trim();
        if response.is_empty() {
            return Err(EvaluationError::Invalid("response must not be empty".to_string()));
        }
        if response.chars().count() > self.max_response_chars {
            return Err(EvaluationError::Invalid(format!(
                "response must be at most {} characters",
                self.max_response_chars
            )));
        }

        let eligibility = self.eligibility.check(subject_id, WorkflowKind::Writing, category).await;
        if let (false, Some(next_available_at)) =
            (eligibility.available, eligibility.next_available_at)
        {
            return Err(EvaluationError::NotEligible { next_available_at });
        }

        let prompt = Prompt {
            system: EVALUATION_SYSTEM_PROMPT.to_string(),
            user: format!(
                "Level: {}\nLanguage: {}\nCriteria: {}\n\nLearner response:\n{}",
                category.level.as_str().to_ascii_uppercase(),
                category.language,
                CRITERIA.join(", "),
                response
            ),
        };

        let raw = self
            .retry
            .run(|attempt| {
                tracing::debug!(subject_id, category = %category, attempt, "Requesting evaluation");
                self.generator.complete(&prompt, self.params)
            })
            .await
            .map_err(|err| {
                tracing::warn!(subject_id, category = %category, error = %err, "Evaluation failed");
                EvaluationError::from(err)
            })?;

        let evaluation = normalizer::normalize(&raw);
        let evaluation_provenance = evaluation.provenance;
        let record = CompletionRecord {
            id: Uuid::new_v4().to_string(),
            subject_id: subject_id.to_string(),
            workflow: WorkflowKind::Writing,
            level: category.level,
            language: category.language.clone(),
            payload: Json(json!({
                "response": response,
                "overall_feedback": evaluation.overall_feedback,
                "recommendations": evaluation.recommendations,
            })),
            score: Some(evaluation.overall_score),
            criterion_scores: Json(evaluation.criterion_scores),
            provenance: Some(evaluation.provenance),
            completed_at: now_utc(),
        };

        match tokio::time::timeout(self.persist_timeout, self.store.insert(&record)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(EvaluationError::Persist(err.to_string())),
            Err(_) => {
                return Err(EvaluationError::Persist(format!(
                    "record insert timed out after {:?}",
                    self.persist_timeout
                )))
            }
        }

        let provenance = match evaluation_provenance {
            Provenance::Generated => "generated",
            Provenance::Fallback => "fallback",
        };
        metrics::counter!("writing_evaluations_total", "provenance" => provenance).increment(1);
        tracing::info!(
            subject_id,
            category = %category,
            record_id = %record.id,
            score = record.score,
            "Written response evaluated"
        );

        Ok(record)
    }

    /// Newest first.
    pub(crate) async fn history(
        &self,
        subject_id: &str,
        limit: i64,
    ) -> Result<Vec<CompletionRecord>, EvaluationError> {
        let limit = limit.clamp(1, MAX_HISTORY_LIMIT);
        match tokio::time::timeout(self.persist_timeout, self.store.list_for_subject(subject_id, limit))
            .await
        {
            Ok(Ok(records)) => Ok(records),
            Ok(Err(err)) => Err(EvaluationError::Persist(err.to_string())),
            Err(_) => Err(EvaluationError::Persist("history lookup timed out".to_string())),
        }
    }
}
