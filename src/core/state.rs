use std::sync::Arc;

use sqlx::PgPool;

use crate::core::{config::Settings, redis::RedisHandle};
use crate::services::eligibility::EligibilityTracker;
use crate::services::evaluation::EvaluationService;
use crate::services::generation::GenerationDeduplicator;
use crate::services::ports::{
    CompletionParams, CompletionStore, DocumentStore, TextGenerator, VideoStore,
};
use crate::services::retry::RetryPolicy;
use crate::services::submission_saga::SubmissionSaga;

/// External collaborators the services are wired to.
pub(crate) struct Collaborators {
    pub(crate) generator: Arc<dyn TextGenerator>,
    pub(crate) videos: Arc<dyn VideoStore>,
    pub(crate) documents: Arc<dyn DocumentStore>,
    pub(crate) completions: Arc<dyn CompletionStore>,
}

#[derive(Clone)]
pub(crate) struct AppState {
    inner: Arc<InnerState>,
}

struct InnerState {
    settings: Settings,
    db: PgPool,
    redis: RedisHandle,
    generation: GenerationDeduplicator,
    eligibility: EligibilityTracker,
    submissions: SubmissionSaga,
    evaluation: EvaluationService,
}

impl AppState {
    pub(crate) fn new(
        settings: Settings,
        db: PgPool,
        redis: RedisHandle,
        collaborators: Collaborators,
    ) -> Self {
        let Collaborators { generator, videos, documents, completions } = collaborators;
        let assessment = settings.assessment();
        let retry = RetryPolicy::from_settings(assessment);
        let params = CompletionParams::default();

        let eligibility = EligibilityTracker::new(Arc::clone(&completions), assessment);
        let generation = GenerationDeduplicator::new(
            Arc::clone(&generator),
            retry,
            assessment.generation_cache_ttl(),
            params,
        );
        let submissions = SubmissionSaga::new(
            videos,
            documents,
            Arc::clone(&completions),
            eligibility.clone(),
            assessment,
        );
        let evaluation = EvaluationService::new(
            generator,
            retry,
            params,
            completions,
            eligibility.clone(),
            assessment,
        );

        Self {
            inner: Arc::new(InnerState {
                settings,
                db,
                redis,
                generation,
                eligibility,
                submissions,
                evaluation,
            }),
        }
    }

    pub(crate) fn settings(&self) -> &Settings {
        &self.inner.settings
    }

    pub(crate) fn db(&self) -> &PgPool {
        &self.inner.db
    }

    pub(crate) fn redis(&self) -> &RedisHandle {
        &self.inner.redis
    }

    pub(crate) fn generation(&self) -> &GenerationDeduplicator {
        &self.inner.generation
    }

    pub(crate) fn eligibility(&self) -> &EligibilityTracker {
        &self.inner.eligibility
    }

    pub(crate) fn submissions(&self) -> &SubmissionSaga {
        &self.inner.submissions
    }

    pub(crate) fn evaluation(&self) -> &EvaluationService {
        &self.inner.evaluation
    }
}
