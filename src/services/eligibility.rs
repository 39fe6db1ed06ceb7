use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;

use crate::core::config::AssessmentSettings;
use crate::core::time::{days_until, now_utc};
use crate::db::models::CompletionRecord;
use crate::db::types::{Category, WorkflowKind};
use crate::services::ports::CompletionStore;

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Eligibility {
    pub(crate) available: bool,
    pub(crate) next_available_at: Option<OffsetDateTime>,
    pub(crate) last_record: Option<CompletionRecord>,
}

impl Eligibility {
    fn open() -> Self {
        Self { available: true, next_available_at: None, last_record: None }
    }

    pub(crate) fn days_remaining(&self, now: OffsetDateTime) -> Option<i64> {
        if self.available {
            return None;
        }
        self.next_available_at.map(|until| days_until(now, until))
    }
}

/// Decides whether a subject may act in a category, from its latest completion.
#[derive(Clone)]
pub(crate) struct EligibilityTracker {
    store: Arc<dyn CompletionStore>,
    writing_cooldown: time::Duration,
    presentation_cooldown: time::Duration,
    lookup_timeout: Duration,
}

impl EligibilityTracker {
    pub(crate) fn new(store: Arc<dyn CompletionStore>, settings: &AssessmentSettings) -> Self {
        Self {
            store,
            writing_cooldown: settings.writing_cooldown(),
            presentation_cooldown: settings.presentation_cooldown(),
            lookup_timeout: settings.persist_timeout(),
        }
    }

    pub(crate) fn cooldown(&self, workflow: WorkflowKind) -> time::Duration {
        match workflow {
            WorkflowKind::Writing => self.writing_cooldown,
            WorkflowKind::Presentation => self.presentation_cooldown,
        }
    }

    pub(crate) async fn check(
        &self,
        subject_id: &str,
        workflow: WorkflowKind,
        category: &Category,
    ) -> Eligibility {
        self.check_at(subject_id, workflow, category, now_utc()).await
    }

    /// Lookup failures fail open: a broken store must not lock learners out.
    pub(crate) async fn check_at(
        &self,
        subject_id: &str,
        workflow: WorkflowKind,
        category: &Category,
        now: OffsetDateTime,
    ) -> Eligibility {
        let lookup = self.store.find_latest(subject_id, workflow, category);
        let latest = match tokio::time::timeout(self.lookup_timeout, lookup).await {
            Ok(Ok(latest)) => latest,
            Ok(Err(err)) => {
                tracing::warn!(
                    subject_id,
                    workflow = workflow.as_str(),
                    category = %category,
                    error = %err,
                    "Eligibility lookup failed; allowing attempt"
                );
                metrics::counter!("eligibility_lookup_failures_total").increment(1);
                return Eligibility::open();
            }
            Err(_) => {
                tracing::warn!(
                    subject_id,
                    workflow = workflow.as_str(),
                    category = %category,
                    timeout_ms = self.lookup_timeout.as_millis() as u64,
                    "Eligibility lookup timed out; allowing attempt"
                );
                metrics::counter!("eligibility_lookup_failures_total").increment(1);
                return Eligibility::open();
            }
        };

        let Some(record) = latest else {
            return Eligibility::open();
        };

        let next_available_at = record.completed_at + self.cooldown(workflow);
        Eligibility {
            available: now >= next_available_at,
            next_available_at: Some(next_available_at),
            last_record: Some(record),
        }
    }
}
