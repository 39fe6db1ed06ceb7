use std::future::Future;
use std::time::Duration;

use crate::core::config::AssessmentSettings;
use crate::services::ports::UpstreamError;

/// Retry rules for calls to the text generation service.
///
/// Only [`UpstreamError::RateLimited`] is retried. Every attempt runs under its own
/// timeout and a timed-out attempt is final.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RetryPolicy {
    pub(crate) max_attempts: u32,
    pub(crate) backoff_base: Duration,
    pub(crate) attempt_timeout: Duration,
}

impl RetryPolicy {
    pub(crate) fn from_settings(settings: &AssessmentSettings) -> Self {
        Self {
            max_attempts: settings.generation_max_attempts.max(1),
            backoff_base: settings.generation_backoff(),
            attempt_timeout: settings.generation_timeout(),
        }
    }

    /// Wait before the attempt following `attempt` (1-based).
    pub(crate) fn backoff_for(&self, attempt: u32) -> Duration {
        self.backoff_base.saturating_mul(attempt)
    }

    pub(crate) async fn run<T, F, Fut>(&self, mut operation: F) -> Result<T, UpstreamError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, UpstreamError>>,
    {
        let mut attempt = 1;
        loop {
            let outcome = match tokio::time::timeout(self.attempt_timeout, operation(attempt)).await {
                Ok(outcome) => outcome,
                Err(_) => Err(UpstreamError::TimedOut(self.attempt_timeout)),
            };

            match outcome {
                Ok(value) => return Ok(value),
                Err(err) if err.is_rate_limited() && attempt < self.max_attempts => {
                    let wait = self.backoff_for(attempt);
                    tracing::warn!(
                        attempt,
                        max_attempts = self.max_attempts,
                        wait_ms = wait.as_millis() as u64,
                        "Text generation rate limited, backing off"
                    );
                    metrics::counter!("generation_retries_total").increment(1);
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            backoff_base: Duration::from_millis(2000),
            attempt_timeout: Duration::from_secs(20),
        }
    }
}
