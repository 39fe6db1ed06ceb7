//! Single-flight, briefly cached generation of assessment tasks per category.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

use crate::db::types::Category;
use crate::schemas::assessment::{GenerationResult, ServedFrom};
use crate::services::normalizer::{self, CRITERIA};
use crate::services::ports::{CompletionParams, Prompt, TextGenerator, UpstreamError};
use crate::services::retry::RetryPolicy;

const GENERATION_SYSTEM_PROMPT: &str = "You are an experienced language examiner. \
You write one assessment task for the requested CEFR level and language, then evaluate a \
model answer written by a typical learner at that level so the learner sees how scoring works.

Answer in plain text using exactly this layout:
Task: <the task the learner must complete, written in the target language>
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

type Settled = Option<Result<GenerationResult, UpstreamError>>;

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Generated {
    pub(crate) result: GenerationResult,
    pub(crate) served_from: ServedFrom,
}

struct CacheEntry {
    result: GenerationResult,
    expires_at: Instant,
}

#[derive(Default)]
struct DedupState {
    cache: HashMap<Category, CacheEntry>,
    in_flight: HashMap<Category, watch::Receiver<Settled>>,
}

struct Inner {
    generator: Arc<dyn TextGenerator>,
    retry: RetryPolicy,
    ttl: Duration,
    params: CompletionParams,
    state: Mutex<DedupState>,
}

impl Inner {
    // Never held across an await.
    fn state(&self) -> MutexGuard<'_, DedupState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Clone)]
pub(crate) struct GenerationDeduplicator {
    inner: Arc<Inner>,
}

impl GenerationDeduplicator {
    pub(crate) fn new(
        generator: Arc<dyn TextGenerator>,
        retry: RetryPolicy,
        ttl: Duration,
        params: CompletionParams,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                generator,
                retry,
                ttl,
                params,
                state: Mutex::new(DedupState::default()),
            }),
        }
    }

    pub(crate) async fn generate(&self, category: &Category) -> Result<Generated, UpstreamError> {
        let (mut receiver, served_from) = {
            let mut state = self.inner.state();
            let now = Instant::now();

            let fresh = state
                .cache
                .get(category)
                .filter(|entry| entry.expires_at > now)
                .map(|entry| entry.result.clone());
            if let Some(result) = fresh {
                tracing::debug!(category = %category, "Generation served from cache");
                metrics::counter!("generation_cache_hits_total").increment(1);
                return Ok(Generated { result, served_from: ServedFrom::Cache });
            }
            state.cache.remove(category);

            match state.in_flight.get(category).cloned() {
                Some(receiver) => {
                    tracing::debug!(category = %category, "Joining in-flight generation");
                    metrics::counter!("generation_joined_total").increment(1);
                    (receiver, ServedFrom::InFlight)
                }
                None => {
                    let (sender, receiver) = watch::channel(None);
                    state.in_flight.insert(category.clone(), receiver.clone());
                    self.spawn_generation(category.clone(), sender);
                    (receiver, ServedFrom::Upstream)
                }
            }
        };

        let settled = match receiver.wait_for(Option::is_some).await {
            Ok(value) => (*value).clone(),
            Err(_) => None,
        };

        match settled {
            Some(Ok(result)) => Ok(Generated { result, served_from }),
            Some(Err(err)) => Err(err),
            None => Err(UpstreamError::Failed("generation task aborted".to_string())),
        }
    }

    /// Drops expired cache entries and returns how many were removed.
    pub(crate) fn purge_expired(&self) -> usize {
        let mut state = self.inner.state();
        let now = Instant::now();
        let before = state.cache.len();
        state.cache.retain(|_, entry| entry.expires_at > now);
        before - state.cache.len()
    }

    #[cfg(test)]
    pub(crate) fn in_flight_count(&self) -> usize {
        self.inner.state().in_flight.len()
    }

    #[cfg(test)]
    pub(crate) fn cached_count(&self) -> usize {
        self.inner.state().cache.len()
    }

    fn spawn_generation(&self, category: Category, sender: watch::Sender<Settled>) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let flight = InFlight { inner: Arc::clone(&inner), category, sender: Some(sender) };
            let prompt = build_prompt(&flight.category);
            let started = Instant::now();

            let outcome = inner
                .retry
                .run(|attempt| {
                    tracing::debug!(category = %flight.category, attempt, "Calling text generator");
                    metrics::counter!("generation_upstream_calls_total").increment(1);
                    inner.generator.complete(&prompt, inner.params)
                })
                .await
                .map(|raw| normalizer::normalize(&raw));

            match &outcome {
                Ok(result) => tracing::info!(
                    category = %flight.category,
                    provenance = ?result.provenance,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Generation settled"
                ),
                Err(err) => {
                    metrics::counter!("generation_failures_total").increment(1);
                    tracing::warn!(
                        category = %flight.category,
                        error = %err,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "Generation failed"
                    );
                }
            }

            flight.settle(outcome);
        });
    }
}

/// Owns the in-flight marker of one generation. The marker is removed when the
/// generation settles, or when the task unwinds before settling.
struct InFlight {
    inner: Arc<Inner>,
    category: Category,
    sender: Option<watch::Sender<Settled>>,
}

impl InFlight {
    fn settle(mut self, outcome: Result<GenerationResult, UpstreamError>) {
        {
            let mut state = self.inner.state();
            state.in_flight.remove(&self.category);
            if let Ok(result) = &outcome {
                state.cache.insert(
                    self.category.clone(),
                    CacheEntry { result: result.clone(), expires_at: Instant::now() + self.inner.ttl },
                );
            }
        }

        if let Some(sender) = self.sender.take() {
            // No receivers left is fine: the result is cached for the next caller.
            let _ = sender.send(Some(outcome));
        }
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if self.sender.is_some() {
            tracing::error!(category = %self.category, "Generation task ended without settling");
            self.inner.state().in_flight.remove(&self.category);
        }
    }
}

pub(crate) fn build_prompt(category: &Category) -> Prompt {
    Prompt {
        system: GENERATION_SYSTEM_PROMPT.to_string(),
        user: format!(
            "Level: {}\nLanguage: {}\nCriteria: {}\nWrite the task and the reference evaluation.",
            category.level.as_str().to_ascii_uppercase(),
            category.language,
            CRITERIA.join(", ")
        ),
    }
}
