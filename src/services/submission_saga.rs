//! Presentation submissions: two independent uploads and one record, all or nothing.
//!
//! The saga moves through `Start -> GuardChecked -> VideoUploaded -> DocumentUploaded ->
//! RecordPersisted`. A failure after an upload deletes what was uploaded before the
//! error is returned. Object ids are picked before each upload starts, so an upload
//! that timed out is deleted too in case the store committed it late. Deletes are
//! best effort: a failed delete becomes a warning on the result and never replaces
//! the error that triggered it.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use serde_json::{json, Value};
use sqlx::types::Json;
use thiserror::Error;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::core::config::AssessmentSettings;
use crate::core::time::{format_offset, now_utc};
use crate::db::models::CompletionRecord;
use crate::db::types::{Category, WorkflowKind};
use crate::services::eligibility::EligibilityTracker;
use crate::services::ports::{object_id, CompletionStore, DocumentStore, StoreError, VideoStore};
use crate::services::scratch::ScratchFile;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SagaStep {
    Start,
    GuardChecked,
    VideoUploaded,
    DocumentUploaded,
    RecordPersisted,
}

impl SagaStep {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::GuardChecked => "guard_checked",
            Self::VideoUploaded => "video_uploaded",
            Self::DocumentUploaded => "document_uploaded",
            Self::RecordPersisted => "record_persisted",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub(crate) enum SubmissionError {
    #[error("a presentation has already been submitted for this subject")]
    AlreadySubmitted,
    #[error("the next presentation can be submitted at {}", format_offset(*next_available_at))]
    NotEligible { next_available_at: OffsetDateTime },
    #[error("video upload failed: {0}")]
    VideoUploadFailed(String),
    #[error("document upload failed: {0}")]
    DocumentUploadFailed(String),
    #[error("saving the submission failed: {0}")]
    PersistFailed(String),
    #[error("submission was interrupted: {0}")]
    Aborted(String),
}

impl SubmissionError {
    pub(crate) fn code(&self) -> &'static str {
        match self {
            Self::AlreadySubmitted => "already_submitted",
            Self::NotEligible { .. } => "not_eligible",
            Self::VideoUploadFailed(_) => "video_upload_failed",
            Self::DocumentUploadFailed(_) => "document_upload_failed",
            Self::PersistFailed(_) => "persist_failed",
            Self::Aborted(_) => "aborted",
        }
    }
}

/// A failed saga: the primary error plus anything compensation could not undo.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{error}")]
pub(crate) struct SagaFailure {
    pub(crate) error: SubmissionError,
    pub(crate) warnings: Vec<String>,
}

impl SagaFailure {
    fn new(error: SubmissionError) -> Self {
        Self { error, warnings: Vec::new() }
    }
}

#[derive(Debug)]
pub(crate) struct PresentationSubmission {
    pub(crate) subject_id: String,
    pub(crate) category: Category,
    pub(crate) video: ScratchFile,
    pub(crate) document: ScratchFile,
    pub(crate) metadata: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Committed {
    pub(crate) record: CompletionRecord,
    pub(crate) warnings: Vec<String>,
}

/// Object ids the saga may have to delete, in upload order.
enum Uploaded {
    Video(String),
    Document(String),
}

/// A bounded step that did not succeed. A timed out upload may still be committed
/// by the store after the saga stopped waiting, so its object has to be deleted
/// like a finished one.
struct StepFailure {
    message: String,
    timed_out: bool,
}

#[derive(Clone)]
pub(crate) struct SubmissionSaga {
    videos: Arc<dyn VideoStore>,
    documents: Arc<dyn DocumentStore>,
    store: Arc<dyn CompletionStore>,
    eligibility: EligibilityTracker,
    upload_timeout: Duration,
    persist_timeout: Duration,
}

impl SubmissionSaga {
    pub(crate) fn new(
        videos: Arc<dyn VideoStore>,
        documents: Arc<dyn DocumentStore>,
        store: Arc<dyn CompletionStore>,
        eligibility: EligibilityTracker,
        settings: &AssessmentSettings,
    ) -> Self {
        Self {
            videos,
            documents,
            store,
            eligibility,
            upload_timeout: settings.upload_timeout(),
            persist_timeout: settings.persist_timeout(),
        }
    }

    /// Runs the saga on its own task, so the caller going away cannot interrupt an
    /// upload or a compensation half way.
    pub(crate) async fn submit(
        &self,
        submission: PresentationSubmission,
    ) -> Result<Committed, SagaFailure> {
        let saga = self.clone();
        let outcome = tokio::spawn(async move { saga.run(submission).await }).await;

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(join_err) => {
                tracing::error!(error = %join_err, "Submission task did not complete");
                Err(SagaFailure::new(SubmissionError::Aborted(join_err.to_string())))
            }
        };

        let label = match &outcome {
            Ok(_) => "committed",
            Err(failure) => failure.error.code(),
        };
        metrics::counter!("submission_sagas_total", "outcome" => label).increment(1);
        outcome
    }

    async fn run(&self, submission: PresentationSubmission) -> Result<Committed, SagaFailure> {
        let PresentationSubmission { subject_id, category, video, document, metadata } =
            submission;
        let span_subject = subject_id.as_str();
        let mut uploaded: Vec<Uploaded> = Vec::with_capacity(2);
        log_step(span_subject, SagaStep::Start);

        self.check_guard(&subject_id, &category).await.map_err(SagaFailure::new)?;
        log_step(span_subject, SagaStep::GuardChecked);

        let folder = format!("presentations/{subject_id}");
        let video_id = object_id(&folder, &video);
        let document_id = object_id(&folder, &document);

        let video_outcome =
            bounded_step(self.upload_timeout, "video upload", self.videos.upload(&video, &video_id))
                .await;
        let stored_video = match video_outcome {
            Ok(stored) => stored,
            Err(failure) => {
                tracing::warn!(
                    subject_id = span_subject,
                    error = %failure.message,
                    timed_out = failure.timed_out,
                    "Video upload failed"
                );
                if failure.timed_out {
                    uploaded.push(Uploaded::Video(video_id));
                }
                let warnings = self.compensate(span_subject, uploaded).await;
                return Err(SagaFailure {
                    error: SubmissionError::VideoUploadFailed(failure.message),
                    warnings,
                });
            }
        };
        uploaded.push(Uploaded::Video(stored_video.id.clone()));
        log_step(span_subject, SagaStep::VideoUploaded);

        let document_outcome = bounded_step(
            self.upload_timeout,
            "document upload",
            self.documents.upload(&document, &document_id),
        )
        .await;
        let stored_document = match document_outcome {
            Ok(stored) => stored,
            Err(failure) => {
                tracing::warn!(
                    subject_id = span_subject,
                    error = %failure.message,
                    timed_out = failure.timed_out,
                    "Document upload failed"
                );
                if failure.timed_out {
                    uploaded.push(Uploaded::Document(document_id));
                }
                let warnings = self.compensate(span_subject, uploaded).await;
                return Err(SagaFailure {
                    error: SubmissionError::DocumentUploadFailed(failure.message),
                    warnings,
                });
            }
        };
        uploaded.push(Uploaded::Document(stored_document.id.clone()));
        log_step(span_subject, SagaStep::DocumentUploaded);

        let record = CompletionRecord {
            id: Uuid::new_v4().to_string(),
            subject_id: subject_id.clone(),
            workflow: WorkflowKind::Presentation,
            level: category.level,
            language: category.language.clone(),
            payload: Json(json!({
                "video": {
                    "id": stored_video.id,
                    "url": stored_video.url,
                    "filename": video.filename(),
                    "content_type": video.content_type(),
                    "size": video.size(),
                    "sha256": video.sha256(),
                },
                "document": {
                    "id": stored_document.id,
                    "url": stored_document.url,
                    "view_link": stored_document.view_link,
                    "filename": document.filename(),
                    "content_type": document.content_type(),
                    "size": document.size(),
                    "sha256": document.sha256(),
                },
                "metadata": metadata,
            })),
            score: None,
            criterion_scores: Json(Vec::new()),
            provenance: None,
            completed_at: now_utc(),
        };

        let error = match tokio::time::timeout(self.persist_timeout, self.store.insert(&record)).await
        {
            Ok(Ok(())) => {
                log_step(span_subject, SagaStep::RecordPersisted);
                return Ok(Committed { record, warnings: Vec::new() });
            }
            Ok(Err(StoreError::Conflict)) => SubmissionError::AlreadySubmitted,
            Ok(Err(err)) => SubmissionError::PersistFailed(err.to_string()),
            Err(_) => SubmissionError::PersistFailed(format!(
                "record insert timed out after {:?}",
                self.persist_timeout
            )),
        };

        tracing::warn!(subject_id = span_subject, error = %error, "Persisting submission failed");
        let warnings = self.compensate(span_subject, uploaded).await;
        Err(SagaFailure { error, warnings })
    }

    async fn check_guard(&self, subject_id: &str, category: &Category) -> Result<(), SubmissionError> {
        let existing = tokio::time::timeout(
            self.persist_timeout,
            self.store.find_any(subject_id, WorkflowKind::Presentation),
        )
        .await;

        match existing {
            Ok(Ok(Some(_))) => return Err(SubmissionError::AlreadySubmitted),
            Ok(Ok(None)) => {}
            // The unique index still rejects a duplicate at insert time.
            Ok(Err(err)) => {
                tracing::warn!(subject_id, error = %err, "Duplicate submission lookup failed");
            }
            Err(_) => {
                tracing::warn!(subject_id, "Duplicate submission lookup timed out");
            }
        }

        let eligibility =
            self.eligibility.check(subject_id, WorkflowKind::Presentation, category).await;
        match (eligibility.available, eligibility.next_available_at) {
            (false, Some(next_available_at)) => Err(SubmissionError::NotEligible { next_available_at }),
            _ => Ok(()),
        }
    }

    /// Deletes uploads newest first. Returns one warning per delete that did not succeed.
    async fn compensate(&self, subject_id: &str, uploaded: Vec<Uploaded>) -> Vec<String> {
        let mut warnings = Vec::new();

        for item in uploaded.into_iter().rev() {
            let (kind, id, outcome) = match &item {
                Uploaded::Video(id) => (
                    "video",
                    id.as_str(),
                    bounded(self.upload_timeout, "video delete", self.videos.delete(id)).await,
                ),
                Uploaded::Document(id) => (
                    "document",
                    id.as_str(),
                    bounded(self.upload_timeout, "document delete", self.documents.delete(id))
                        .await,
                ),
            };

            match outcome {
                Ok(()) => {
                    tracing::info!(subject_id, kind, object_id = id, "Compensated upload");
                    metrics::counter!("submission_compensations_total", "target" => kind, "outcome" => "deleted")
                        .increment(1);
                }
                Err(err) => {
                    tracing::error!(
                        subject_id,
                        kind,
                        object_id = id,
                        error = %err,
                        "Failed to delete upload during compensation"
                    );
                    metrics::counter!("submission_compensations_total", "target" => kind, "outcome" => "failed")
                        .increment(1);
                    warnings.push(format!("uploaded {kind} {id} could not be deleted: {err}"));
                }
            }
        }

        warnings
    }
}

fn log_step(subject_id: &str, step: SagaStep) {
    tracing::info!(subject_id, step = step.as_str(), "Submission saga advanced");
}

async fn bounded<T>(
    limit: Duration,
    action: &str,
    operation: impl Future<Output = anyhow::Result<T>>,
) -> anyhow::Result<T> {
    match tokio::time::timeout(limit, operation).await {
        Ok(outcome) => outcome,
        Err(_) => Err(anyhow!("{action} timed out after {limit:?}")),
    }
}

async fn bounded_step<T>(
    limit: Duration,
    action: &str,
    operation: impl Future<Output = anyhow::Result<T>>,
) -> Result<T, StepFailure> {
    match tokio::time::timeout(limit, operation).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(StepFailure { message: err.to_string(), timed_out: false }),
        Err(_) => Err(StepFailure {
            message: format!("{action} timed out after {limit:?}"),
            timed_out: true,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{self, FakeObjectStore, InMemoryCompletionStore};

    struct Harness {
        videos: Arc<FakeObjectStore>,
        documents: Arc<FakeObjectStore>,
        store: Arc<InMemoryCompletionStore>,
        saga: SubmissionSaga,
    }

    fn harness() -> Harness {
        let videos = Arc::new(FakeObjectStore::new("video"));
        let documents = Arc::new(FakeObjectStore::new("document"));
        let store = Arc::new(InMemoryCompletionStore::default());
        let settings = test_support::assessment_settings();
        let eligibility = EligibilityTracker::new(store.clone(), &settings);
        let saga = SubmissionSaga::new(
            videos.clone(),
            documents.clone(),
            store.clone(),
            eligibility,
            &settings,
        );
        Harness { videos, documents, store, saga }
    }

    async fn submission(subject_id: &str) -> PresentationSubmission {
        PresentationSubmission {
            subject_id: subject_id.to_string(),
            category: Category::parse("b2", "de").expect("category"),
            video: ScratchFile::from_bytes("talk.mp4", "video/mp4", b"video-bytes")
                .await
                .expect("video"),
            document: ScratchFile::from_bytes("slides.pdf", "application/pdf", b"%PDF-1.7")
                .await
                .expect("document"),
            metadata: json!({"title": "Meine Stadt"}),
        }
    }

    #[tokio::test]
    async fn successful_submission_persists_one_record() {
        let h = harness();
        let input = submission("learner-1").await;
        let scratch = [input.video.path().to_path_buf(), input.document.path().to_path_buf()];

        let committed = h.saga.submit(input).await.expect("committed");

        assert!(committed.warnings.is_empty());
        assert_eq!(committed.record.workflow, WorkflowKind::Presentation);
        assert_eq!(committed.record.score, None);
        assert_eq!(committed.record.payload.0["metadata"]["title"], "Meine Stadt");
        assert_eq!(committed.record.payload.0["video"]["size"], 11);
        let video_id = committed.record.payload.0["video"]["id"].as_str().expect("video id");
        assert!(video_id.starts_with("presentations/learner-1/"));
        assert!(video_id.ends_with("_talk.mp4"));
        assert!(committed.record.payload.0["document"]["view_link"].is_string());
        assert_eq!(h.videos.live_objects(), 1);
        assert_eq!(h.documents.live_objects(), 1);
        assert_eq!(h.store.records().len(), 1);
        assert!(scratch.iter().all(|path| !path.exists()));
    }

    #[tokio::test]
    async fn video_failure_leaves_nothing_behind() {
        let h = harness();
        h.videos.fail_uploads(true);

        let failure = h.saga.submit(submission("learner-1").await).await.expect_err("fails");

        assert!(matches!(failure.error, SubmissionError::VideoUploadFailed(_)));
        assert!(failure.warnings.is_empty());
        assert_eq!(h.videos.live_objects(), 0);
        assert_eq!(h.documents.upload_count(), 0);
        assert!(h.store.records().is_empty());
    }

    #[tokio::test]
    async fn document_failure_deletes_video() {
        let h = harness();
        h.documents.fail_uploads(true);
        let input = submission("learner-1").await;
        let scratch = input.video.path().to_path_buf();

        let failure = h.saga.submit(input).await.expect_err("fails");

        assert!(matches!(failure.error, SubmissionError::DocumentUploadFailed(_)));
        assert!(failure.warnings.is_empty());
        assert_eq!(h.videos.upload_count(), 1);
        assert_eq!(h.videos.live_objects(), 0);
        assert_eq!(h.documents.live_objects(), 0);
        assert!(h.store.records().is_empty());
        assert!(!scratch.exists());
    }

    #[tokio::test]
    async fn persist_failure_deletes_both_uploads() {
        let h = harness();
        h.store.fail_inserts(true);

        let failure = h.saga.submit(submission("learner-1").await).await.expect_err("fails");

        assert!(matches!(failure.error, SubmissionError::PersistFailed(_)));
        assert_eq!(failure.error.code(), "persist_failed");
        assert!(failure.warnings.is_empty());
        assert_eq!(h.videos.live_objects(), 0);
        assert_eq!(h.documents.live_objects(), 0);
        assert!(h.store.records().is_empty());
    }

    #[tokio::test]
    async fn persist_conflict_reports_already_submitted_after_cleanup() {
        let h = harness();
        h.store.conflict_on_insert(true);

        let failure = h.saga.submit(submission("learner-1").await).await.expect_err("fails");

        assert_eq!(failure.error, SubmissionError::AlreadySubmitted);
        assert_eq!(h.videos.live_objects(), 0);
        assert_eq!(h.documents.live_objects(), 0);
    }

    #[tokio::test]
    async fn second_submission_is_rejected_without_uploading() {
        let h = harness();
        h.saga.submit(submission("learner-1").await).await.expect("first");

        let failure = h.saga.submit(submission("learner-1").await).await.expect_err("second");

        assert_eq!(failure.error, SubmissionError::AlreadySubmitted);
        assert_eq!(h.videos.upload_count(), 1);
        assert_eq!(h.documents.upload_count(), 1);
        assert_eq!(h.store.records().len(), 1);
    }

    #[tokio::test]
    async fn other_subjects_are_not_blocked() {
        let h = harness();
        h.saga.submit(submission("learner-1").await).await.expect("first");
        h.saga.submit(submission("learner-2").await).await.expect("other subject");
        assert_eq!(h.store.records().len(), 2);
    }

    #[tokio::test]
    async fn failed_compensation_is_a_warning_not_the_error() {
        let h = harness();
        h.documents.fail_uploads(true);
        h.videos.fail_deletes(true);

        let failure = h.saga.submit(submission("learner-1").await).await.expect_err("fails");

        assert!(matches!(failure.error, SubmissionError::DocumentUploadFailed(_)));
        assert_eq!(failure.warnings.len(), 1);
        assert!(failure.warnings[0].contains("video"));
        assert_eq!(h.videos.live_objects(), 1);
    }

    #[tokio::test]
    async fn every_failed_delete_is_reported() {
        let h = harness();
        h.store.fail_inserts(true);
        h.videos.fail_deletes(true);
        h.documents.fail_deletes(true);

        let failure = h.saga.submit(submission("learner-1").await).await.expect_err("fails");

        assert!(matches!(failure.error, SubmissionError::PersistFailed(_)));
        assert_eq!(failure.warnings.len(), 2);
        assert!(failure.warnings[0].contains("document"));
        assert!(failure.warnings[1].contains("video"));
    }

    #[tokio::test(start_paused = true)]
    async fn upload_timeout_is_a_step_failure() {
        let h = harness();
        h.documents.delay_uploads(Duration::from_secs(600));

        let failure = h.saga.submit(submission("learner-1").await).await.expect_err("fails");

        match failure.error {
            SubmissionError::DocumentUploadFailed(message) => assert!(message.contains("timed out")),
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(failure.warnings.is_empty());
        assert_eq!(h.videos.live_objects(), 0);
        assert_eq!(h.documents.live_objects(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn video_stored_after_timeout_is_deleted() {
        let h = harness();
        h.videos.delay_acknowledgements(Duration::from_secs(3600));

        let failure = h.saga.submit(submission("learner-1").await).await.expect_err("fails");

        match failure.error {
            SubmissionError::VideoUploadFailed(message) => assert!(message.contains("timed out")),
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(failure.warnings.is_empty());
        assert_eq!(h.videos.upload_count(), 1);
        assert_eq!(h.videos.live_objects(), 0);
        assert_eq!(h.documents.upload_count(), 0);
        assert!(h.store.records().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn document_stored_after_timeout_is_deleted() {
        let h = harness();
        h.documents.delay_acknowledgements(Duration::from_secs(3600));

        let failure = h.saga.submit(submission("learner-1").await).await.expect_err("fails");

        assert!(matches!(failure.error, SubmissionError::DocumentUploadFailed(_)));
        assert!(failure.warnings.is_empty());
        assert_eq!(h.documents.upload_count(), 1);
        assert_eq!(h.documents.live_objects(), 0);
        assert_eq!(h.videos.live_objects(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn persist_timeout_deletes_both_uploads() {
        let h = harness();
        h.store.delay_inserts(Duration::from_secs(60));

        let failure = h.saga.submit(submission("learner-1").await).await.expect_err("fails");

        match failure.error {
            SubmissionError::PersistFailed(message) => assert!(message.contains("timed out")),
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(failure.warnings.is_empty());
        assert_eq!(h.videos.live_objects(), 0);
        assert_eq!(h.documents.live_objects(), 0);
        assert!(h.store.records().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_request_still_compensates() {
        let h = harness();
        h.documents.delay_uploads(Duration::from_secs(5));
        h.documents.fail_uploads(true);

        let abandoned = tokio::time::timeout(
            Duration::from_secs(1),
            h.saga.submit(submission("learner-1").await),
        )
        .await;
        assert!(abandoned.is_err());
        assert_eq!(h.videos.live_objects(), 1);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(h.videos.live_objects(), 0);
        assert!(h.store.records().is_empty());
    }

    #[tokio::test]
    async fn guard_lookup_failure_does_not_block_submission() {
        let h = harness();
        h.store.fail_lookups(true);

        let committed = h.saga.submit(submission("learner-1").await).await.expect("committed");
        assert_eq!(committed.record.subject_id, "learner-1");
    }
}
